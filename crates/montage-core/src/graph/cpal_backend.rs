//! Live graph backend on a cpal output stream
//!
//! The scheduler thread talks to the audio callback exclusively through a
//! lock-free ring buffer (scheduling events) and atomics (gain values and
//! the frame clock), so the callback never blocks:
//!
//! - schedule/stop/clear land as [`GraphEvent`]s, drained at the top of
//!   each callback
//! - gain nodes are `Arc<AtomicU32>` f32 bit patterns, written live
//! - the context clock is a frame counter advanced by the callback
//!
//! The `cpal::Stream` itself is owned by a dedicated worker thread (it is
//! not `Send`), which parks until the graph is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{AudioGraph, NodeId, SourceId};
use crate::error::{EngineError, EngineResult};
use crate::media::AudioData;
use crate::types::StereoSample;

/// Capacity of the scheduler → callback event queue
const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Events crossing from the scheduler thread into the audio callback
enum GraphEvent {
    AddSource {
        id: u64,
        gain: Arc<AtomicU32>,
        pcm: Arc<AudioData>,
        when: f64,
        offset: f64,
        duration: f64,
    },
    StopSource(u64),
    Clear,
}

/// State shared between the graph handle and the audio callback
struct Shared {
    sample_rate: u32,
    clock_frames: Arc<AtomicU64>,
    master_gain: Arc<AtomicU32>,
}

impl Shared {
    fn master(&self) -> f32 {
        f32::from_bits(self.master_gain.load(Ordering::Relaxed))
    }
}

/// A source the callback is currently rendering
struct ActiveSource {
    id: u64,
    gain: Arc<AtomicU32>,
    pcm: Arc<AudioData>,
    when: f64,
    offset: f64,
    duration: f64,
}

impl ActiveSource {
    /// Seconds of audio this source can actually produce.
    fn playable_len(&self) -> f64 {
        let available = (self.pcm.duration_seconds() - self.offset).max(0.0);
        self.duration.min(available)
    }
}

/// The callback-side mixer
struct MixState {
    active: Vec<ActiveSource>,
}

impl MixState {
    fn new() -> Self {
        Self { active: Vec::new() }
    }

    fn apply_event(&mut self, event: GraphEvent) {
        match event {
            GraphEvent::AddSource {
                id,
                gain,
                pcm,
                when,
                offset,
                duration,
            } => self.active.push(ActiveSource {
                id,
                gain,
                pcm,
                when,
                offset,
                duration,
            }),
            GraphEvent::StopSource(id) => self.active.retain(|s| s.id != id),
            GraphEvent::Clear => self.active.clear(),
        }
    }

    /// Mix every active source into an interleaved output buffer.
    ///
    /// `clock_frames` is the graph time of the buffer's first frame.
    fn render(
        &mut self,
        data: &mut [f32],
        channels: usize,
        sample_rate: u32,
        clock_frames: u64,
        master: f32,
    ) {
        let frames = data.len() / channels;
        data.fill(0.0);

        for frame in 0..frames {
            let t = (clock_frames + frame as u64) as f64 / sample_rate as f64;
            let mut mix = StereoSample::silence();
            for source in &self.active {
                if t < source.when {
                    continue;
                }
                let pos = source.offset + (t - source.when);
                if pos >= source.offset + source.playable_len() {
                    continue;
                }
                let idx = (pos * source.pcm.sample_rate as f64) as usize;
                let gain = f32::from_bits(source.gain.load(Ordering::Relaxed));
                mix += source.pcm.stereo_frame(idx) * (gain * master);
            }

            let base = frame * channels;
            match channels {
                1 => data[base] = 0.5 * (mix.left + mix.right),
                _ => {
                    data[base] = mix.left;
                    data[base + 1] = mix.right;
                }
            }
        }

        // Drop sources that finished before this buffer's end.
        let end_t = (clock_frames + frames as u64) as f64 / sample_rate as f64;
        self.active
            .retain(|s| end_t < s.when + s.playable_len());
    }
}

/// Live audio graph on the default cpal output device
pub struct CpalGraph {
    shared: Arc<Shared>,
    events: Mutex<rtrb::Producer<GraphEvent>>,
    gains: Mutex<HashMap<u64, Arc<AtomicU32>>>,
    next_id: AtomicU64,
    shutdown: Option<mpsc::Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

impl CpalGraph {
    /// Build the output stream and start the graph clock.
    pub fn new() -> EngineResult<Self> {
        let (event_tx, event_rx) = rtrb::RingBuffer::<GraphEvent>::new(EVENT_QUEUE_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<u32, String>>();

        let clock_frames = Arc::new(AtomicU64::new(0));
        let master_gain = Arc::new(AtomicU32::new(1.0f32.to_bits()));

        // The stream is not Send; a worker thread owns it for its lifetime.
        let cb_clock = clock_frames.clone();
        let cb_master = master_gain.clone();
        let worker = std::thread::Builder::new()
            .name("montage-graph".into())
            .spawn(move || run_stream(event_rx, shutdown_rx, ready_tx, cb_clock, cb_master))
            .map_err(|e| EngineError::Graph(e.to_string()))?;

        let sample_rate = ready_rx
            .recv()
            .map_err(|_| EngineError::Graph("audio worker died during startup".into()))?
            .map_err(EngineError::Graph)?;

        Ok(Self {
            shared: Arc::new(Shared {
                sample_rate,
                clock_frames,
                master_gain,
            }),
            events: Mutex::new(event_tx),
            gains: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown: Some(shutdown_tx),
            worker: Some(worker),
        })
    }

    fn push_event(&self, event: GraphEvent) -> EngineResult<()> {
        self.events
            .lock()
            .unwrap()
            .push(event)
            .map_err(|_| EngineError::Graph("graph event queue full".into()))
    }
}

/// Worker-thread body: owns the cpal stream until shutdown.
fn run_stream(
    mut events: rtrb::Consumer<GraphEvent>,
    shutdown: mpsc::Receiver<()>,
    ready: mpsc::Sender<Result<u32, String>>,
    cb_clock: Arc<AtomicU64>,
    cb_master: Arc<AtomicU32>,
) {
    let host = cpal::default_host();
    let Some(device) = host.default_output_device() else {
        let _ = ready.send(Err("no output device".into()));
        return;
    };
    let config = match device.default_output_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = ready.send(Err(format!("no output config: {}", e)));
            return;
        }
    };

    let sample_rate = config.sample_rate().0;
    let channels = config.channels() as usize;
    let stream_config: cpal::StreamConfig = config.into();

    let mut mixer = MixState::new();
    let stream = device.build_output_stream(
        &stream_config,
        move |data: &mut [f32], _| {
            while let Ok(event) = events.pop() {
                mixer.apply_event(event);
            }
            let frames_before = cb_clock.load(Ordering::Relaxed);
            mixer.render(
                data,
                channels,
                sample_rate,
                frames_before,
                f32::from_bits(cb_master.load(Ordering::Relaxed)),
            );
            cb_clock.fetch_add((data.len() / channels) as u64, Ordering::Relaxed);
        },
        |err| log::error!("audio stream error: {}", err),
        None,
    );

    let stream = match stream {
        Ok(s) => s,
        Err(e) => {
            let _ = ready.send(Err(format!("stream build failed: {}", e)));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = ready.send(Err(format!("stream start failed: {}", e)));
        return;
    }
    let _ = ready.send(Ok(sample_rate));

    // Park until the graph handle drops.
    let _ = shutdown.recv();
    drop(stream);
}

impl AudioGraph for CpalGraph {
    fn context_time(&self) -> f64 {
        self.shared.clock_frames.load(Ordering::Relaxed) as f64 / self.shared.sample_rate as f64
    }

    fn master_gain(&self) -> f32 {
        self.shared.master()
    }

    fn set_master_gain(&self, gain: f32) {
        self.shared
            .master_gain
            .store(gain.to_bits(), Ordering::Relaxed);
    }

    fn create_gain_node(&self) -> NodeId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.gains
            .lock()
            .unwrap()
            .insert(id, Arc::new(AtomicU32::new(1.0f32.to_bits())));
        NodeId(id)
    }

    fn set_gain(&self, node: NodeId, gain: f32) {
        if let Some(atomic) = self.gains.lock().unwrap().get(&node.0) {
            atomic.store(gain.to_bits(), Ordering::Relaxed);
        }
    }

    fn remove_gain_node(&self, node: NodeId) {
        self.gains.lock().unwrap().remove(&node.0);
    }

    fn schedule_source(
        &self,
        node: NodeId,
        pcm: Arc<AudioData>,
        when: f64,
        source_offset: f64,
        duration: f64,
    ) -> EngineResult<SourceId> {
        let gain = self
            .gains
            .lock()
            .unwrap()
            .get(&node.0)
            .cloned()
            .ok_or_else(|| EngineError::Graph(format!("unknown gain node {:?}", node)))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.push_event(GraphEvent::AddSource {
            id,
            gain,
            pcm,
            when,
            offset: source_offset,
            duration,
        })?;
        Ok(SourceId(id))
    }

    fn stop_source(&self, source: SourceId) {
        let _ = self.push_event(GraphEvent::StopSource(source.0));
    }

    fn clear(&self) {
        let _ = self.push_event(GraphEvent::Clear);
    }
}

impl Drop for CpalGraph {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm(value: f32, frames: usize, rate: u32) -> Arc<AudioData> {
        Arc::new(AudioData::from_mono(vec![value; frames], rate))
    }

    fn gain(value: f32) -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(value.to_bits()))
    }

    #[test]
    fn test_mixer_renders_scheduled_source() {
        let mut mixer = MixState::new();
        mixer.apply_event(GraphEvent::AddSource {
            id: 1,
            gain: gain(1.0),
            pcm: pcm(0.5, 48_000, 48_000),
            when: 0.0,
            offset: 0.0,
            duration: 1.0,
        });

        let mut data = vec![0.0f32; 64 * 2];
        mixer.render(&mut data, 2, 48_000, 0, 1.0);
        assert!((data[0] - 0.5).abs() < 1e-6);
        assert!((data[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_mixer_waits_for_start_time() {
        let mut mixer = MixState::new();
        mixer.apply_event(GraphEvent::AddSource {
            id: 1,
            gain: gain(1.0),
            pcm: pcm(0.5, 48_000, 48_000),
            when: 1.0,
            offset: 0.0,
            duration: 1.0,
        });

        // Clock at 0: nothing yet.
        let mut data = vec![0.0f32; 32];
        mixer.render(&mut data, 2, 48_000, 0, 1.0);
        assert!(data.iter().all(|&s| s == 0.0));

        // Clock at exactly 1 s: sound.
        mixer.render(&mut data, 2, 48_000, 48_000, 1.0);
        assert!((data[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_mixer_applies_gains_live() {
        let g = gain(1.0);
        let mut mixer = MixState::new();
        mixer.apply_event(GraphEvent::AddSource {
            id: 1,
            gain: g.clone(),
            pcm: pcm(1.0, 48_000, 48_000),
            when: 0.0,
            offset: 0.0,
            duration: 1.0,
        });

        let mut data = vec![0.0f32; 8];
        g.store(0.25f32.to_bits(), Ordering::Relaxed);
        mixer.render(&mut data, 2, 48_000, 0, 0.5);
        // node gain 0.25 * master 0.5
        assert!((data[0] - 0.125).abs() < 1e-6);
    }

    #[test]
    fn test_mixer_drops_finished_sources() {
        let mut mixer = MixState::new();
        mixer.apply_event(GraphEvent::AddSource {
            id: 1,
            gain: gain(1.0),
            pcm: pcm(0.5, 100, 48_000),
            when: 0.0,
            offset: 0.0,
            duration: 1.0,
        });

        let mut data = vec![0.0f32; 512];
        mixer.render(&mut data, 2, 48_000, 0, 1.0);
        assert!(mixer.active.is_empty(), "exhausted source should be dropped");
    }

    #[test]
    fn test_mixer_clear() {
        let mut mixer = MixState::new();
        mixer.apply_event(GraphEvent::AddSource {
            id: 1,
            gain: gain(1.0),
            pcm: pcm(0.5, 48_000, 48_000),
            when: 5.0,
            offset: 0.0,
            duration: 1.0,
        });
        mixer.apply_event(GraphEvent::Clear);
        assert!(mixer.active.is_empty());
    }
}
