//! Offline graph backend
//!
//! Records every scheduling decision against a manually advanced clock.
//! Integration tests drive the scheduler against this backend and assert
//! on the exact source nodes it queued.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{AudioGraph, NodeId, SourceId};
use crate::error::EngineResult;
use crate::media::AudioData;

/// A recorded `schedule_source` call
#[derive(Debug, Clone)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub node: NodeId,
    pub when: f64,
    pub source_offset: f64,
    pub duration: f64,
    pub frames: usize,
    pub stopped: bool,
}

#[derive(Default)]
struct OfflineState {
    clock: f64,
    master_gain: f32,
    gains: HashMap<NodeId, f32>,
    sources: Vec<ScheduledSource>,
}

/// Recording backend with a manual clock
pub struct OfflineGraph {
    state: Mutex<OfflineState>,
    next_id: AtomicU64,
}

impl OfflineGraph {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OfflineState {
                master_gain: 1.0,
                ..Default::default()
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Advance the graph clock by `dt` seconds.
    pub fn advance(&self, dt: f64) {
        self.state.lock().unwrap().clock += dt;
    }

    pub fn set_time(&self, t: f64) {
        self.state.lock().unwrap().clock = t;
    }

    /// Every source scheduled so far, including stopped ones.
    pub fn scheduled(&self) -> Vec<ScheduledSource> {
        self.state.lock().unwrap().sources.clone()
    }

    /// Sources still queued or playing.
    pub fn live_sources(&self) -> Vec<ScheduledSource> {
        self.state
            .lock()
            .unwrap()
            .sources
            .iter()
            .filter(|s| !s.stopped)
            .cloned()
            .collect()
    }

    /// Last written value of a gain node.
    pub fn gain_of(&self, node: NodeId) -> Option<f32> {
        self.state.lock().unwrap().gains.get(&node).copied()
    }
}

impl Default for OfflineGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioGraph for OfflineGraph {
    fn context_time(&self) -> f64 {
        self.state.lock().unwrap().clock
    }

    fn master_gain(&self) -> f32 {
        self.state.lock().unwrap().master_gain
    }

    fn set_master_gain(&self, gain: f32) {
        self.state.lock().unwrap().master_gain = gain;
    }

    fn create_gain_node(&self) -> NodeId {
        let node = NodeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.state.lock().unwrap().gains.insert(node, 1.0);
        node
    }

    fn set_gain(&self, node: NodeId, gain: f32) {
        self.state.lock().unwrap().gains.insert(node, gain);
    }

    fn remove_gain_node(&self, node: NodeId) {
        self.state.lock().unwrap().gains.remove(&node);
    }

    fn schedule_source(
        &self,
        node: NodeId,
        pcm: Arc<AudioData>,
        when: f64,
        source_offset: f64,
        duration: f64,
    ) -> EngineResult<SourceId> {
        let id = SourceId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.state.lock().unwrap().sources.push(ScheduledSource {
            id,
            node,
            when,
            source_offset,
            duration,
            frames: pcm.frames(),
            stopped: false,
        });
        Ok(id)
    }

    fn stop_source(&self, source: SourceId) {
        let mut state = self.state.lock().unwrap();
        if let Some(s) = state.sources.iter_mut().find(|s| s.id == source) {
            s.stopped = true;
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        for s in &mut state.sources {
            s.stopped = true;
        }
    }
}
