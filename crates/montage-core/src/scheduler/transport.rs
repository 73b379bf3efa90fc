//! Transport contract
//!
//! The transport is owned by the host editor; the engine only reads it and
//! reacts to its notifications. [`ManualTransport`] is the concrete
//! implementation the editor (and the tests) drive.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Read-only view of the host transport
pub trait Transport: Send + Sync {
    fn is_playing(&self) -> bool;
    /// Current playhead in timeline seconds.
    fn current_time(&self) -> f64;
    /// Master volume in [0, 1].
    fn volume(&self) -> f32;
}

/// Lock-free transport state driven by the editor shell
#[derive(Debug)]
pub struct ManualTransport {
    playing: AtomicBool,
    time_bits: AtomicU64,
    volume_bits: AtomicU32,
}

impl ManualTransport {
    pub fn new() -> Self {
        Self {
            playing: AtomicBool::new(false),
            time_bits: AtomicU64::new(0f64.to_bits()),
            volume_bits: AtomicU32::new(1f32.to_bits()),
        }
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Relaxed);
    }

    pub fn set_time(&self, t: f64) {
        self.time_bits.store(t.to_bits(), Ordering::Relaxed);
    }

    pub fn set_volume(&self, v: f32) {
        self.volume_bits.store(v.to_bits(), Ordering::Relaxed);
    }
}

impl Default for ManualTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for ManualTransport {
    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Relaxed)
    }

    fn current_time(&self) -> f64 {
        f64::from_bits(self.time_bits.load(Ordering::Relaxed))
    }

    fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }
}
