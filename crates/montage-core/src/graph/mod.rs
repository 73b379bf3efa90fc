//! Audio graph abstraction
//!
//! The scheduler never talks to a platform audio API directly. It sees a
//! graph clock, per-clip gain nodes feeding a master gain, and the ability
//! to schedule future-timestamped PCM source nodes into a gain node. The
//! real-time mixing itself belongs to the backend:
//!
//! - [`cpal_backend::CpalGraph`] drives a cpal output stream
//! - [`offline::OfflineGraph`] records scheduling for tests and tools
//!
//! Gain writes are live (the callback reads atomics); everything else is
//! message-passed, so the audio thread never blocks on the scheduler.

pub mod cpal_backend;
pub mod offline;

use std::sync::Arc;

use crate::error::EngineResult;
use crate::media::AudioData;

/// Handle to a gain node feeding the master bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u64);

/// Handle to a scheduled source node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u64);

/// The contract between the scheduler and a playback backend
pub trait AudioGraph: Send + Sync {
    /// The graph's monotonic clock ("now"), in seconds.
    fn context_time(&self) -> f64;

    fn master_gain(&self) -> f32;
    fn set_master_gain(&self, gain: f32);

    /// Create a gain node connected to master. Initial gain is 1.0.
    fn create_gain_node(&self) -> NodeId;

    /// Live-write a gain node's value.
    fn set_gain(&self, node: NodeId, gain: f32);

    /// Disconnect a gain node (sources already scheduled into it finish
    /// with the last written gain).
    fn remove_gain_node(&self, node: NodeId);

    /// Schedule PCM to start at context time `when`, reading the source
    /// from `source_offset` seconds for `duration` seconds, through `node`.
    ///
    /// A `when` already in the past starts immediately at the equivalent
    /// in-source offset; a start past the end of the data is dropped.
    fn schedule_source(
        &self,
        node: NodeId,
        pcm: Arc<AudioData>,
        when: f64,
        source_offset: f64,
        duration: f64,
    ) -> EngineResult<SourceId>;

    /// Stop and disconnect one scheduled source.
    fn stop_source(&self, source: SourceId);

    /// Stop and disconnect every queued and playing source.
    fn clear(&self);
}
