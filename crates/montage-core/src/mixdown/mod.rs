//! Offline time-remapped mixdown
//!
//! Renders the timeline into a synthetic stereo buffer at an alternate
//! time scale. Element start times are remapped by `t / time_scale`; what
//! happens within each element is chosen per track: rate-stretch,
//! pitch-preserving WSOLA, natural-rate looping, or a single fixed pass.
//! One-shot markers follow their own trigger/playback remap modes.
//!
//! Container/codec and file naming are the caller's concern; this module
//! produces PCM, reports progress on [0, 1] and polls cancellation
//! between work items.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dsp::TimeStretcher;
use crate::media::{AudioData, DecodedBufferCache};
use crate::oneshot::{audio_start_time, OneshotManager};
use crate::scene::Scene;
use crate::types::{StereoBuffer, DEFAULT_EXPORT_RATE};

/// Per-track behavior under time remap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackRemapBehavior {
    /// Resample with the timeline: duration scales, pitch shifts
    Stretch,
    /// WSOLA time-stretch: duration scales, pitch preserved
    PitchPreserve,
    /// Natural rate, tiled to the new timeline end
    Loop,
    /// Natural rate, exactly one pass
    Fixed,
}

/// How one-shot markers follow the remap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemapMode {
    Stretch,
    Original,
}

/// Time-remap export settings
#[derive(Debug, Clone)]
pub struct TimeRemapConfig {
    /// Timeline rate multiplier: 0.5 doubles the duration, 2.0 halves it.
    /// Non-positive values render the timeline unchanged.
    pub time_scale: f64,
    pub track_behaviors: HashMap<Uuid, TrackRemapBehavior>,
    pub default_behavior: TrackRemapBehavior,
    pub marker_trigger: RemapMode,
    pub marker_playback: RemapMode,
}

impl Default for TimeRemapConfig {
    fn default() -> Self {
        Self {
            time_scale: 1.0,
            track_behaviors: HashMap::new(),
            default_behavior: TrackRemapBehavior::Stretch,
            marker_trigger: RemapMode::Stretch,
            marker_playback: RemapMode::Stretch,
        }
    }
}

impl TimeRemapConfig {
    pub fn behavior_for(&self, track_id: Uuid) -> TrackRemapBehavior {
        self.track_behaviors
            .get(&track_id)
            .copied()
            .unwrap_or(self.default_behavior)
    }

    /// The scale actually applied: non-positive collapses to identity.
    pub fn effective_scale(&self) -> f64 {
        if self.time_scale > 0.0 {
            self.time_scale
        } else {
            1.0
        }
    }
}

/// Progress of a running mixdown
#[derive(Debug, Clone)]
pub enum MixdownProgress {
    Started { total_items: usize },
    Item { done: usize, total: usize },
    Complete,
    Cancelled,
}

impl MixdownProgress {
    pub fn description(&self) -> String {
        match self {
            Self::Started { total_items } => format!("Rendering {} sources", total_items),
            Self::Item { done, total } => format!("Rendered {}/{}", done, total),
            Self::Complete => "Mixdown complete".to_string(),
            Self::Cancelled => "Mixdown cancelled".to_string(),
        }
    }

    /// Progress on [0, 1].
    pub fn progress_fraction(&self) -> f32 {
        match self {
            Self::Started { .. } => 0.0,
            Self::Item { done, total } => {
                if *total == 0 {
                    1.0
                } else {
                    *done as f32 / *total as f32
                }
            }
            Self::Complete | Self::Cancelled => 1.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled)
    }
}

/// Result of a mixdown run
pub enum MixdownOutcome {
    Complete(StereoBuffer),
    Cancelled,
}

/// Render the scene's audio at the configured time scale.
///
/// One-shot buffers come from the one-shot manager's cache; clip buffers
/// from the shared decode cache. A source that fails to decode drops out
/// of the mix (logged), it does not fail the render.
pub fn render_mixdown(
    scene: &Scene,
    buffers: &DecodedBufferCache,
    oneshot: &OneshotManager,
    config: &TimeRemapConfig,
    sample_rate: Option<u32>,
    mut progress: Option<&mut dyn FnMut(MixdownProgress)>,
    cancel: &AtomicBool,
) -> MixdownOutcome {
    let rate = sample_rate.unwrap_or(DEFAULT_EXPORT_RATE);
    let scale = config.effective_scale();

    let orig_duration = scene.total_duration();
    let new_duration = orig_duration / scale;
    let out_len = (new_duration * rate as f64).ceil() as usize;
    let mut out = StereoBuffer::silence(out_len);

    struct ClipItem {
        track_id: Uuid,
        media_id: Uuid,
        start_time: f64,
        duration: f64,
        trim_start: f64,
        trim_end: f64,
        base_volume: f32,
    }

    let clips: Vec<ClipItem> = scene
        .tracks
        .iter()
        .filter(|t| !t.hidden)
        .flat_map(|track| {
            track.elements.iter().filter_map(move |e| {
                let a = e.as_audio()?;
                if a.placement.hidden {
                    return None;
                }
                Some(ClipItem {
                    track_id: track.id,
                    media_id: a.media_id,
                    start_time: a.placement.start_time,
                    duration: a.placement.duration,
                    trim_start: a.placement.trim_start,
                    trim_end: a.placement.trim_end,
                    base_volume: a.base_volume,
                })
            })
        })
        .collect();

    let total_items = clips.len() + scene.oneshot_markers.len();
    if let Some(cb) = progress.as_mut() {
        cb(MixdownProgress::Started { total_items });
    }

    let mut done = 0usize;
    for item in &clips {
        if cancel.load(Ordering::Relaxed) {
            if let Some(cb) = progress.as_mut() {
                cb(MixdownProgress::Cancelled);
            }
            return MixdownOutcome::Cancelled;
        }

        let Some(data) = buffers.get_or_decode(&crate::media::SourceKey::Asset(item.media_id))
        else {
            done += 1;
            continue;
        };

        let slice = {
            let trim = item.trim_end - item.trim_start;
            if trim > 0.0 {
                trim.min(item.duration)
            } else {
                item.duration
            }
        };
        let out_start = ((item.start_time / scale) * rate as f64).floor() as usize;

        match config.behavior_for(item.track_id) {
            TrackRemapBehavior::Stretch => mix_stretch(
                &mut out,
                &data,
                out_start,
                item.trim_start,
                slice,
                scale,
                rate,
                item.base_volume,
            ),
            TrackRemapBehavior::PitchPreserve => mix_pitch_preserve(
                &mut out,
                &data,
                out_start,
                item.trim_start,
                slice,
                scale,
                rate,
                item.base_volume,
            ),
            TrackRemapBehavior::Loop => mix_loop(
                &mut out,
                &data,
                out_start,
                item.trim_start,
                slice,
                rate,
                item.base_volume,
            ),
            TrackRemapBehavior::Fixed => mix_fixed(
                &mut out,
                &data,
                out_start,
                item.trim_start,
                slice,
                rate,
                item.base_volume,
            ),
        }

        done += 1;
        if let Some(cb) = progress.as_mut() {
            cb(MixdownProgress::Item { done, total: total_items });
        }
    }

    // One-shot markers follow their own trigger and playback modes.
    for marker in &scene.oneshot_markers {
        if cancel.load(Ordering::Relaxed) {
            if let Some(cb) = progress.as_mut() {
                cb(MixdownProgress::Cancelled);
            }
            return MixdownOutcome::Cancelled;
        }

        let Some(def) = scene.definition_by_id(marker.oneshot_id) else {
            done += 1;
            continue;
        };
        let Some(data) = oneshot.buffer_for(def) else {
            done += 1;
            continue;
        };

        let onset = audio_start_time(marker, def);
        let trigger_time = match config.marker_trigger {
            RemapMode::Stretch => onset / scale,
            RemapMode::Original => onset,
        };
        let playback_rate = match config.marker_playback {
            RemapMode::Stretch => scale,
            RemapMode::Original => 1.0,
        };
        let out_start = (trigger_time * rate as f64).floor() as usize;
        let volume = marker.volume.unwrap_or(1.0);

        mix_stretch(
            &mut out,
            &data,
            out_start,
            def.trim_start,
            def.slice_duration(),
            playback_rate,
            rate,
            volume,
        );

        done += 1;
        if let Some(cb) = progress.as_mut() {
            cb(MixdownProgress::Item { done, total: total_items });
        }
    }

    if let Some(cb) = progress.as_mut() {
        cb(MixdownProgress::Complete);
    }
    MixdownOutcome::Complete(out)
}

/// Rate-stretch: read the source `playback_rate` times faster than the
/// output advances. Pitch follows the rate.
#[allow(clippy::too_many_arguments)]
fn mix_stretch(
    out: &mut StereoBuffer,
    data: &AudioData,
    out_start: usize,
    trim_start: f64,
    slice: f64,
    playback_rate: f64,
    rate: u32,
    volume: f32,
) {
    let out_count = ((slice / playback_rate) * rate as f64).floor() as usize;
    let src_rate = data.sample_rate as f64;
    let src_base = (trim_start * src_rate) as usize;
    let slice_frames = (slice * src_rate).floor() as usize;
    // Advance through the source `playback_rate` frames per output frame
    // (exactly 1.0 at identity, keeping that path bit-exact).
    let step = playback_rate * src_rate / rate as f64;
    for i in 0..out_count {
        let out_idx = out_start + i;
        if out_idx >= out.len() {
            break;
        }
        let rel = (i as f64 * step) as usize;
        if rel >= slice_frames {
            break;
        }
        let src_idx = src_base + rel;
        if src_idx >= data.frames() {
            break;
        }
        out[out_idx] += data.stereo_frame(src_idx) * volume;
    }
}

/// WSOLA: duration scales with the timeline, pitch stays put.
#[allow(clippy::too_many_arguments)]
fn mix_pitch_preserve(
    out: &mut StereoBuffer,
    data: &AudioData,
    out_start: usize,
    trim_start: f64,
    slice: f64,
    tempo: f64,
    rate: u32,
    volume: f32,
) {
    let src_rate = data.sample_rate;
    let src_start = (trim_start * src_rate as f64) as usize;
    let src_len = ((slice * src_rate as f64) as usize).min(data.frames().saturating_sub(src_start));
    if src_len == 0 {
        return;
    }

    let source = data.stereo_slice(src_start, src_len);
    let stretched = TimeStretcher::new(src_rate).process(&source, tempo);

    // Nearest-sample rate conversion from the source rate to the output.
    let ratio = rate as f64 / src_rate as f64;
    let out_count = (stretched.len() as f64 * ratio).floor() as usize;
    for i in 0..out_count {
        let out_idx = out_start + i;
        if out_idx >= out.len() {
            break;
        }
        let src_idx = ((i as f64 / ratio) as usize).min(stretched.len() - 1);
        out[out_idx] += stretched[src_idx] * volume;
    }
}

/// Natural-rate tile over the remainder of the output.
fn mix_loop(
    out: &mut StereoBuffer,
    data: &AudioData,
    out_start: usize,
    trim_start: f64,
    slice: f64,
    rate: u32,
    volume: f32,
) {
    let src_rate = data.sample_rate as f64;
    let resampled_len = (slice * rate as f64).floor() as usize;
    if resampled_len == 0 || out_start >= out.len() {
        return;
    }

    let src_base = (trim_start * src_rate) as usize;
    let step = src_rate / rate as f64;
    let samples_to_fill = out.len() - out_start;
    for i in 0..samples_to_fill {
        let wrapped = i % resampled_len;
        let src_idx = src_base + (wrapped as f64 * step) as usize;
        if src_idx >= data.frames() {
            continue;
        }
        out[out_start + i] += data.stereo_frame(src_idx) * volume;
    }
}

/// Natural-rate single pass.
fn mix_fixed(
    out: &mut StereoBuffer,
    data: &AudioData,
    out_start: usize,
    trim_start: f64,
    slice: f64,
    rate: u32,
    volume: f32,
) {
    let src_rate = data.sample_rate as f64;
    let resampled_len = (slice * rate as f64).floor() as usize;
    let src_base = (trim_start * src_rate) as usize;
    let step = src_rate / rate as f64;
    for i in 0..resampled_len {
        let out_idx = out_start + i;
        if out_idx >= out.len() {
            break;
        }
        let src_idx = src_base + (i as f64 * step) as usize;
        if src_idx >= data.frames() {
            break;
        }
        out[out_idx] += data.stereo_frame(src_idx) * volume;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MemoryMediaProvider, SourceKey};
    use crate::scene::store::SceneManager;
    use crate::scene::{AudioElement, Element, Placement, Track, TrackKind};
    use std::sync::Arc;

    const RATE: u32 = 44_100;

    fn ramp(seconds: f64) -> AudioData {
        let n = (seconds * RATE as f64) as usize;
        let samples: Vec<f32> = (0..n).map(|i| (i % 1000) as f32 / 1000.0).collect();
        AudioData::from_mono(samples, RATE)
    }

    struct Fixture {
        scene: Scene,
        buffers: Arc<DecodedBufferCache>,
        oneshot: OneshotManager,
        track_id: Uuid,
    }

    fn fixture(source_seconds: f64, element_duration: f64, looped: bool) -> Fixture {
        let provider = Arc::new(MemoryMediaProvider::new());
        let media_id = Uuid::new_v4();
        provider.insert(SourceKey::Asset(media_id), ramp(source_seconds));

        let mut scene = Scene::new("export");
        let mut track = Track::new(TrackKind::Audio, "audio");
        let mut placement = Placement::new(0.0, element_duration);
        placement.trim_end = source_seconds.min(element_duration);
        track.elements.push(Element::Audio(AudioElement {
            placement,
            media_id,
            base_volume: 1.0,
            looped,
        }));
        let track_id = track.id;
        scene.tracks.push(track);

        let scene_mgr = Arc::new(SceneManager::new());
        scene_mgr.add_scene(scene.clone());
        let buffers = Arc::new(DecodedBufferCache::new(provider));
        let oneshot = OneshotManager::new(scene_mgr, buffers.clone());
        Fixture {
            scene,
            buffers,
            oneshot,
            track_id,
        }
    }

    fn render(f: &Fixture, config: &TimeRemapConfig) -> StereoBuffer {
        match render_mixdown(
            &f.scene,
            &f.buffers,
            &f.oneshot,
            config,
            Some(RATE),
            None,
            &AtomicBool::new(false),
        ) {
            MixdownOutcome::Complete(buffer) => buffer,
            MixdownOutcome::Cancelled => panic!("unexpected cancel"),
        }
    }

    #[test]
    fn test_identity_stretch_is_superposition() {
        // time_scale 1 with stretch behavior reproduces the source.
        let f = fixture(4.0, 4.0, false);
        let out = render(&f, &TimeRemapConfig::default());

        assert_eq!(out.len(), 4 * RATE as usize);
        let source = ramp(4.0);
        for &i in &[0usize, 1000, 44_100, 100_000] {
            assert_eq!(out[i].left, source.channels[0][i], "sample {}", i);
        }
    }

    #[test]
    fn test_half_scale_loop_tiles_twice() {
        // 4 s source, loop behavior, scale 0.5: 8 s output, two tiles at
        // natural rate.
        let f = fixture(4.0, 4.0, true);
        let config = TimeRemapConfig {
            time_scale: 0.5,
            track_behaviors: [(f.track_id, TrackRemapBehavior::Loop)].into_iter().collect(),
            ..Default::default()
        };
        let out = render(&f, &config);

        assert_eq!(out.len(), 8 * RATE as usize);
        let tile = 4 * RATE as usize;
        for &i in &[0usize, 12_345, 170_000] {
            assert_eq!(out[i], out[i + tile], "second tile mirrors the first at {}", i);
        }
    }

    #[test]
    fn test_fixed_writes_once() {
        let f = fixture(2.0, 2.0, false);
        let config = TimeRemapConfig {
            time_scale: 0.5,
            track_behaviors: [(f.track_id, TrackRemapBehavior::Fixed)].into_iter().collect(),
            ..Default::default()
        };
        let out = render(&f, &config);

        // 4 s output, but only the first 2 s carry audio.
        assert_eq!(out.len(), 4 * RATE as usize);
        let silent_tail = &out.as_slice()[2 * RATE as usize + 1..];
        assert!(silent_tail.iter().all(|s| s.left == 0.0 && s.right == 0.0));
    }

    #[test]
    fn test_stretch_halves_at_double_scale() {
        // scale 2.0: output is half as long and reads the source twice as
        // fast.
        let f = fixture(4.0, 4.0, false);
        let config = TimeRemapConfig {
            time_scale: 2.0,
            ..Default::default()
        };
        let out = render(&f, &config);

        assert_eq!(out.len(), 2 * RATE as usize);
        let source = ramp(4.0);
        // Output sample i reads source sample 2i.
        assert_eq!(out[500].left, source.channels[0][1000]);
    }

    #[test]
    fn test_nonpositive_scale_is_identity() {
        let f = fixture(1.0, 1.0, false);
        let config = TimeRemapConfig {
            time_scale: 0.0,
            ..Default::default()
        };
        let out = render(&f, &config);
        assert_eq!(out.len(), RATE as usize);
    }

    #[test]
    fn test_pitch_preserve_keeps_length_contract() {
        let f = fixture(2.0, 2.0, false);
        let config = TimeRemapConfig {
            time_scale: 0.5,
            track_behaviors: [(f.track_id, TrackRemapBehavior::PitchPreserve)]
                .into_iter()
                .collect(),
            ..Default::default()
        };
        let out = render(&f, &config);

        // 4 s of output; the stretched clip fills it (within a frame).
        assert_eq!(out.len(), 4 * RATE as usize);
        let tail = &out.as_slice()[out.len() - 4410..];
        assert!(tail.iter().any(|s| s.left != 0.0), "stretched audio reaches the tail");
    }

    #[test]
    fn test_cancellation_between_items() {
        let f = fixture(1.0, 1.0, false);
        let cancel = AtomicBool::new(true);
        let outcome = render_mixdown(
            &f.scene,
            &f.buffers,
            &f.oneshot,
            &TimeRemapConfig::default(),
            Some(RATE),
            None,
            &cancel,
        );
        assert!(matches!(outcome, MixdownOutcome::Cancelled));
    }

    #[test]
    fn test_progress_reaches_one() {
        let f = fixture(1.0, 1.0, false);
        let mut fractions = Vec::new();
        let mut cb = |p: MixdownProgress| fractions.push(p.progress_fraction());
        let _ = render_mixdown(
            &f.scene,
            &f.buffers,
            &f.oneshot,
            &TimeRemapConfig::default(),
            Some(RATE),
            Some(&mut cb),
            &AtomicBool::new(false),
        );
        assert_eq!(*fractions.first().unwrap(), 0.0);
        assert_eq!(*fractions.last().unwrap(), 1.0);
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
    }
}
