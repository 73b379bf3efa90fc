//! Playback scheduler
//!
//! Drives the audio graph from the scene: collects clips at play start,
//! pre-schedules look-ahead audio through per-clip iterators, schedules
//! one-shot markers, and live-writes gains from the automation and
//! sidechain managers on a fixed tick.
//!
//! The session model is cooperative: a monotonically increasing session id
//! tags every play request, and the driver thread re-checks it after every
//! step. Stop, seek and timeline edits invalidate the session; whatever
//! the driver was doing becomes a no-op.

pub mod clip;
pub mod transport;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use uuid::Uuid;

use crate::automation::AutomationManager;
use crate::graph::{AudioGraph, NodeId};
use crate::media::DecodedBufferCache;
use crate::oneshot::OneshotManager;
use crate::scene::store::SceneManager;
use crate::sidechain::SidechainManager;

use clip::{collect_clips, ClipIterator, ScheduledClip, SinkPool};

/// Scheduler timing knobs
///
/// Defaults match production behavior; tests shrink the ticks.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// How far past "now" audio is pre-scheduled
    pub lookahead: f64,
    /// Period of the look-ahead scan
    pub lookahead_tick: Duration,
    /// Period of the gain tick (and of iterator pumping)
    pub gain_tick: Duration,
    /// Per-clip cap on audio buffered ahead of the playhead, seconds
    pub backpressure: f64,
    /// Small backward grace for one-shots whose onset just passed, seconds
    pub backward_grace: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lookahead: 2.0,
            lookahead_tick: Duration::from_millis(500),
            gain_tick: Duration::from_millis(100),
            backpressure: 1.0,
            backward_grace: 0.1,
        }
    }
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Preparing,
    Running,
    /// Timeline edit landed mid-session; restarting
    Suspended,
}

/// A clip with a live iterator and its gain node
struct ClipRuntime {
    clip: ScheduledClip,
    node: NodeId,
    iterator: ClipIterator,
    sink: Arc<clip::AudioSink>,
}

/// A scheduled one-shot's modulation handle
struct OneshotNode {
    node: NodeId,
    definition_id: Uuid,
    base_volume: f32,
}

/// Mutable state of one play session
struct SessionRuntime {
    session: u64,
    /// Timeline second playback started at
    start_time: f64,
    /// Graph context time at the anchor
    start_ctx: f64,
    timeline_total: f64,
    pending: Vec<ScheduledClip>,
    active: HashMap<Uuid, ClipRuntime>,
    /// Elements that finished or failed; never revisited this session
    finished: HashSet<Uuid>,
    scheduled_markers: HashSet<Uuid>,
    oneshot_nodes: HashMap<Uuid, OneshotNode>,
}

/// The playback scheduler
pub struct PlaybackScheduler {
    graph: Arc<dyn AudioGraph>,
    scene: Arc<SceneManager>,
    oneshot: Arc<OneshotManager>,
    automation: Arc<AutomationManager>,
    sidechain: Arc<SidechainManager>,
    sinks: Arc<SinkPool>,
    config: SchedulerConfig,
    session: Arc<AtomicU64>,
    state: Arc<Mutex<PlaybackState>>,
    runtime: Arc<Mutex<Option<SessionRuntime>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackScheduler {
    pub fn new(
        graph: Arc<dyn AudioGraph>,
        scene: Arc<SceneManager>,
        oneshot: Arc<OneshotManager>,
        automation: Arc<AutomationManager>,
        sidechain: Arc<SidechainManager>,
        buffers: Arc<DecodedBufferCache>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            graph,
            scene,
            oneshot,
            automation,
            sidechain,
            sinks: Arc::new(SinkPool::new(buffers)),
            config,
            session: Arc::new(AtomicU64::new(0)),
            state: Arc::new(Mutex::new(PlaybackState::Idle)),
            runtime: Arc::new(Mutex::new(None)),
            driver: Mutex::new(None),
        }
    }

    pub fn state(&self) -> PlaybackState {
        *self.state.lock().unwrap()
    }

    pub fn session_id(&self) -> u64 {
        self.session.load(Ordering::SeqCst)
    }

    /// Current playhead in timeline seconds, while a session is live.
    pub fn playback_position(&self) -> Option<f64> {
        let runtime = self.runtime.lock().unwrap();
        let rt = runtime.as_ref()?;
        Some(rt.start_time + (self.graph.context_time() - rt.start_ctx))
    }

    /// Transport volume notifications land on the master gain.
    pub fn set_volume(&self, volume: f32) {
        self.graph.set_master_gain(volume);
    }

    /// Start playback from timeline second `t`.
    pub fn play(&self, t: f64) {
        self.teardown_session();

        let session = self.session.fetch_add(1, Ordering::SeqCst) + 1;
        *self.state.lock().unwrap() = PlaybackState::Preparing;

        // Snapshot the timeline and warm every manager cache before any
        // audio is queued.
        let clips = self
            .scene
            .with_active_scene(collect_clips)
            .unwrap_or_default();
        let timeline_total = self.scene.total_duration();
        self.oneshot.prepare_for_playback();
        self.sidechain.prepare_for_playback(&self.oneshot);

        if self.session.load(Ordering::SeqCst) != session {
            return; // superseded while preparing
        }

        let runtime = SessionRuntime {
            session,
            start_time: t,
            start_ctx: self.graph.context_time(),
            timeline_total,
            pending: clips,
            active: HashMap::new(),
            finished: HashSet::new(),
            scheduled_markers: HashSet::new(),
            oneshot_nodes: HashMap::new(),
        };
        *self.runtime.lock().unwrap() = Some(runtime);
        *self.state.lock().unwrap() = PlaybackState::Running;

        let driver = DriverContext {
            graph: self.graph.clone(),
            oneshot: self.oneshot.clone(),
            automation: self.automation.clone(),
            sidechain: self.sidechain.clone(),
            sinks: self.sinks.clone(),
            config: self.config.clone(),
            session_counter: self.session.clone(),
            session,
            runtime: self.runtime.clone(),
        };
        let handle = std::thread::Builder::new()
            .name("montage-scheduler".into())
            .spawn(move || driver.run())
            .expect("spawn scheduler driver");
        *self.driver.lock().unwrap() = Some(handle);
    }

    /// Stop playback. Idempotent; clears every queued node and timer.
    pub fn stop(&self) {
        self.teardown_session();
        *self.state.lock().unwrap() = PlaybackState::Idle;
    }

    /// Seek: stop-then-start at `t` when playing, otherwise just stop.
    pub fn seek(&self, t: f64) {
        let was_running = matches!(
            self.state(),
            PlaybackState::Running | PlaybackState::Suspended | PlaybackState::Preparing
        );
        self.stop();
        if was_running {
            self.play(t);
        }
    }

    /// Timeline or media mutated mid-session: dispose sinks and iterators,
    /// then restart at the current playhead.
    pub fn on_timeline_changed(&self) {
        let resume_at = {
            let state = self.state();
            if !matches!(state, PlaybackState::Running | PlaybackState::Suspended) {
                self.sinks.dispose_all();
                return;
            }
            *self.state.lock().unwrap() = PlaybackState::Suspended;
            self.playback_position().unwrap_or(0.0)
        };

        self.sinks.dispose_all();
        self.teardown_session();
        self.play(resume_at);
    }

    /// Invalidate the session, clear the graph and drop the runtime.
    fn teardown_session(&self) {
        self.session.fetch_add(1, Ordering::SeqCst);

        // Join the driver so no stale thread races the next session. The
        // driver checks the session counter every tick and exits promptly.
        if let Some(handle) = self.driver.lock().unwrap().take() {
            let _ = handle.join();
        }

        if let Some(runtime) = self.runtime.lock().unwrap().take() {
            for rt in runtime.active.values() {
                self.graph.remove_gain_node(rt.node);
            }
            for node in runtime.oneshot_nodes.values() {
                self.graph.remove_gain_node(node.node);
            }
        }
        self.graph.clear();
        self.oneshot.release_playback_index();
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything the driver thread needs, cloned out of the scheduler
struct DriverContext {
    graph: Arc<dyn AudioGraph>,
    oneshot: Arc<OneshotManager>,
    automation: Arc<AutomationManager>,
    sidechain: Arc<SidechainManager>,
    sinks: Arc<SinkPool>,
    config: SchedulerConfig,
    session_counter: Arc<AtomicU64>,
    session: u64,
    runtime: Arc<Mutex<Option<SessionRuntime>>>,
}

impl DriverContext {
    fn cancelled(&self) -> bool {
        self.session_counter.load(Ordering::SeqCst) != self.session
    }

    fn run(self) {
        let ticks_per_scan = (self.config.lookahead_tick.as_secs_f64()
            / self.config.gain_tick.as_secs_f64())
        .round()
        .max(1.0) as u64;

        let mut tick: u64 = 0;
        loop {
            if self.cancelled() {
                return;
            }

            {
                let mut guard = self.runtime.lock().unwrap();
                let Some(rt) = guard.as_mut() else { return };
                if rt.session != self.session {
                    return;
                }

                let now = rt.start_time + (self.graph.context_time() - rt.start_ctx);
                if tick % ticks_per_scan == 0 {
                    self.lookahead_scan(rt, now);
                }
                self.pump_iterators(rt, now);
                self.gain_tick(rt, now);
            }

            tick += 1;
            std::thread::sleep(self.config.gain_tick);
        }
    }

    /// Start clip iterators and schedule one-shots entering the window.
    fn lookahead_scan(&self, rt: &mut SessionRuntime, now: f64) {
        let horizon = now + self.config.lookahead;

        // Clips whose audible span intersects [now, horizon).
        let entering: Vec<ScheduledClip> = rt
            .pending
            .iter()
            .filter(|c| {
                !rt.active.contains_key(&c.element_id)
                    && !rt.finished.contains(&c.element_id)
                    && c.start_time < horizon
                    && c.effective_end(rt.timeline_total) > now
            })
            .cloned()
            .collect();

        for clip in entering {
            match self.sinks.sink_for(&clip.source_key) {
                Ok(sink) => {
                    let node = self.graph.create_gain_node();
                    let iter_start = now.max(clip.start_time);
                    let iterator =
                        ClipIterator::new(clip.clone(), sink.clone(), iter_start, rt.timeline_total);
                    rt.active.insert(
                        clip.element_id,
                        ClipRuntime {
                            clip,
                            node,
                            iterator,
                            sink,
                        },
                    );
                }
                Err(err) => {
                    // Skip this source for the session; playback continues.
                    log::warn!("sink init failed for {}: {}", clip.source_key, err);
                    rt.finished.insert(clip.element_id);
                }
            }
        }

        // One-shots in (now, horizon), with a small backward grace for
        // onsets the previous scan just missed.
        for hit in self.oneshot.markers_in_window(now, horizon) {
            if rt.scheduled_markers.contains(&hit.marker.id) {
                continue;
            }
            if hit.audio_start_time < now - self.config.backward_grace {
                continue;
            }
            let Some(buffer) = self.oneshot.buffer_for(&hit.definition) else {
                rt.scheduled_markers.insert(hit.marker.id);
                continue;
            };

            let node = self.graph.create_gain_node();
            let base_volume = hit.marker.volume.unwrap_or(1.0);
            let when = rt.start_ctx + (hit.audio_start_time - rt.start_time);
            let scheduled = self.graph.schedule_source(
                node,
                buffer,
                when,
                hit.definition.trim_start,
                hit.definition.slice_duration(),
            );
            match scheduled {
                Ok(_) => {
                    self.graph.set_gain(
                        node,
                        base_volume
                            * self
                                .sidechain
                                .gain_for_oneshot(hit.definition.id, hit.audio_start_time),
                    );
                    rt.oneshot_nodes.insert(
                        hit.marker.id,
                        OneshotNode {
                            node,
                            definition_id: hit.definition.id,
                            base_volume,
                        },
                    );
                }
                Err(err) => {
                    log::warn!("one-shot schedule failed: {}", err);
                    self.graph.remove_gain_node(node);
                }
            }
            rt.scheduled_markers.insert(hit.marker.id);
        }
    }

    /// Feed each active clip iterator, bounded by the backpressure window.
    fn pump_iterators(&self, rt: &mut SessionRuntime, now: f64) {
        let mut done: Vec<Uuid> = Vec::new();

        for (element_id, clip_rt) in rt.active.iter_mut() {
            loop {
                if self.cancelled() {
                    return;
                }
                // No more than ~1 s of audio queued ahead per clip; the
                // next tick picks up where this one left off.
                match clip_rt.iterator.peek_timeline_time() {
                    Some(t) if t - now < self.config.backpressure => {}
                    Some(_) => break,
                    None => {
                        done.push(*element_id);
                        break;
                    }
                }
                let Some(chunk) = clip_rt.iterator.next_chunk() else {
                    done.push(*element_id);
                    break;
                };

                let when = rt.start_ctx + (chunk.timeline_time - rt.start_time);
                if let Err(err) = self.graph.schedule_source(
                    clip_rt.node,
                    clip_rt.sink.data.clone(),
                    when,
                    chunk.source_offset,
                    chunk.duration,
                ) {
                    log::warn!("chunk schedule failed: {}", err);
                }
            }
        }

        // A drained iterator's clip stays active (its gain node keeps
        // modulating queued audio) until the playhead passes its end.
        for element_id in done {
            let past_end = rt
                .active
                .get(&element_id)
                .map(|c| now >= c.clip.effective_end(rt.timeline_total))
                .unwrap_or(true);
            if past_end {
                if let Some(clip_rt) = rt.active.remove(&element_id) {
                    self.graph.remove_gain_node(clip_rt.node);
                    rt.finished.insert(element_id);
                }
            }
        }
    }

    /// Write effective gains for every active clip and live one-shot.
    fn gain_tick(&self, rt: &SessionRuntime, now: f64) {
        for clip_rt in rt.active.values() {
            let clip = &clip_rt.clip;
            let automated = self.automation.effective_volume(
                clip.track_id,
                clip.element_id,
                now,
                clip.base_volume * 100.0,
            ) / 100.0;
            let duck = self.sidechain.gain_for_track(clip.track_id, now);
            self.graph.set_gain(clip_rt.node, automated * duck);
        }

        for one in rt.oneshot_nodes.values() {
            let duck = self.sidechain.gain_for_oneshot(one.definition_id, now);
            self.graph.set_gain(one.node, one.base_volume * duck);
        }
    }
}
