//! Timeline clips, per-source sinks and the chunked clip iterator
//!
//! A clip is the playback-relevant snapshot of an audio element taken at
//! play start. Each distinct source file is decoded once into a shared
//! [`AudioSink`]; every clip referencing it reads from that sink through
//! its own [`ClipIterator`], which produces source-time chunks the
//! scheduler maps back onto timeline time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::media::{AudioData, DecodedBufferCache, SourceKey};
use crate::scene::Scene;

/// Seconds of audio per produced chunk.
pub const CHUNK_SECONDS: f64 = 0.25;

/// Playback snapshot of one audio element
#[derive(Debug, Clone)]
pub struct ScheduledClip {
    pub element_id: Uuid,
    pub track_id: Uuid,
    pub source_key: SourceKey,
    pub start_time: f64,
    pub duration: f64,
    pub trim_start: f64,
    pub trim_end: f64,
    pub base_volume: f32,
    pub looped: bool,
}

impl ScheduledClip {
    /// Length of one pass over the source slice, in seconds.
    pub fn slice_duration(&self) -> f64 {
        let trim = self.trim_end - self.trim_start;
        if trim > 0.0 {
            trim
        } else {
            self.duration
        }
    }

    /// Timeline second the clip stops sounding: looped clips run to the
    /// timeline end, others to their own end.
    pub fn effective_end(&self, timeline_total: f64) -> f64 {
        if self.looped {
            timeline_total
        } else {
            self.start_time + self.duration
        }
    }
}

/// Collect the playable audio clips of a scene (hidden tracks and
/// elements are muted and skipped).
pub fn collect_clips(scene: &Scene) -> Vec<ScheduledClip> {
    scene
        .tracks
        .iter()
        .filter(|t| !t.hidden)
        .flat_map(|track| {
            track.elements.iter().filter_map(move |e| {
                let audio = e.as_audio()?;
                if audio.placement.hidden {
                    return None;
                }
                Some(ScheduledClip {
                    element_id: audio.placement.id,
                    track_id: track.id,
                    source_key: SourceKey::Asset(audio.media_id),
                    start_time: audio.placement.start_time,
                    duration: audio.placement.duration,
                    trim_start: audio.placement.trim_start,
                    trim_end: audio.placement.trim_end,
                    base_volume: audio.base_volume,
                    looped: audio.looped,
                })
            })
        })
        .collect()
}

/// Decoded input shared by every clip on the same source file
pub struct AudioSink {
    pub key: SourceKey,
    pub data: Arc<AudioData>,
}

/// One sink per source key, kept across play sessions
///
/// Sinks are disposed when the tracks/media set changes, not on stop, so
/// transport stutters don't re-open files.
pub struct SinkPool {
    cache: Arc<DecodedBufferCache>,
    sinks: Mutex<HashMap<SourceKey, Arc<AudioSink>>>,
}

impl SinkPool {
    pub fn new(cache: Arc<DecodedBufferCache>) -> Self {
        Self {
            cache,
            sinks: Mutex::new(HashMap::new()),
        }
    }

    /// The shared sink for a source, initializing it on first use.
    pub fn sink_for(&self, key: &SourceKey) -> EngineResult<Arc<AudioSink>> {
        if let Some(hit) = self.sinks.lock().unwrap().get(key) {
            return Ok(hit.clone());
        }
        let data = self
            .cache
            .get_or_decode(key)
            .ok_or_else(|| EngineError::SinkInit(format!("no audio for {}", key)))?;
        let sink = Arc::new(AudioSink {
            key: key.clone(),
            data,
        });
        self.sinks.lock().unwrap().insert(key.clone(), sink.clone());
        Ok(sink)
    }

    /// Release every sink (timeline or media set changed).
    pub fn dispose_all(&self) {
        self.sinks.lock().unwrap().clear();
    }
}

/// One chunk of source audio with its timeline placement
#[derive(Debug, Clone, PartialEq)]
pub struct PcmChunk {
    /// Timeline second this chunk starts at
    pub timeline_time: f64,
    /// Seconds into the source data
    pub source_offset: f64,
    /// Chunk length in seconds
    pub duration: f64,
}

/// Chunked producer of one clip's audio
///
/// Walks the source slice in `CHUNK_SECONDS` steps; looped clips wrap back
/// to the trim start and bump the loop iteration until the timeline end.
pub struct ClipIterator {
    clip: ScheduledClip,
    sink: Arc<AudioSink>,
    timeline_end: f64,
    slice: f64,
    loop_iteration: u64,
    /// Read position in source seconds, within [trim_start, slice end)
    position: f64,
    done: bool,
}

impl ClipIterator {
    /// Start iterating at timeline second `iter_start`.
    pub fn new(
        clip: ScheduledClip,
        sink: Arc<AudioSink>,
        iter_start: f64,
        timeline_total: f64,
    ) -> Self {
        let slice = clip.slice_duration();
        let timeline_end = clip.effective_end(timeline_total).min(timeline_total);

        let elapsed = (iter_start - clip.start_time).max(0.0);
        let (loop_iteration, position) = if clip.looped && slice > 0.0 {
            let iteration = (elapsed / slice).floor();
            (iteration as u64, clip.trim_start + (elapsed - iteration * slice))
        } else {
            (0, clip.trim_start + elapsed)
        };

        let mut iter = Self {
            clip,
            sink,
            timeline_end,
            slice,
            loop_iteration,
            position,
            done: false,
        };
        iter.normalize();
        iter
    }

    /// End of the readable slice in source seconds, bounded by the data.
    fn slice_end(&self) -> f64 {
        (self.clip.trim_start + self.slice).min(self.sink.data.duration_seconds())
    }

    /// Timeline second of the next sample this iterator would produce.
    fn timeline_position(&self) -> f64 {
        self.clip.start_time
            + self.loop_iteration as f64 * self.slice
            + (self.position - self.clip.trim_start)
    }

    /// Wrap exhausted loop passes and detect the end of the clip, so that
    /// `peek_timeline_time` is a pure read.
    fn normalize(&mut self) {
        const EPS: f64 = 1e-9;
        loop {
            if self.done {
                return;
            }
            if self.slice <= 0.0 || self.slice_end() <= self.clip.trim_start {
                self.done = true;
                return;
            }
            if self.timeline_position() >= self.timeline_end - EPS {
                self.done = true;
                return;
            }
            if self.position >= self.slice_end() - EPS {
                if self.clip.looped {
                    self.loop_iteration += 1;
                    self.position = self.clip.trim_start;
                    continue;
                }
                self.done = true;
                return;
            }
            return;
        }
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Timeline time of the next chunk without consuming it.
    pub fn peek_timeline_time(&self) -> Option<f64> {
        if self.done {
            None
        } else {
            Some(self.timeline_position())
        }
    }

    /// Produce the next chunk, or `None` when the clip is exhausted.
    pub fn next_chunk(&mut self) -> Option<PcmChunk> {
        if self.done {
            return None;
        }

        let timeline_time = self.timeline_position();
        let remaining_source = self.slice_end() - self.position;
        let remaining_timeline = self.timeline_end - timeline_time;
        let duration = remaining_source.min(CHUNK_SECONDS).min(remaining_timeline);
        if duration <= 0.0 {
            self.done = true;
            return None;
        }

        let chunk = PcmChunk {
            timeline_time,
            source_offset: self.position,
            duration,
        };
        self.position += duration;
        self.normalize();
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink(seconds: f64, rate: u32) -> Arc<AudioSink> {
        let frames = (seconds * rate as f64) as usize;
        Arc::new(AudioSink {
            key: SourceKey::Url("test://tone".into()),
            data: Arc::new(AudioData::from_mono(vec![0.5; frames], rate)),
        })
    }

    fn clip(start: f64, duration: f64, trim_start: f64, trim_end: f64, looped: bool) -> ScheduledClip {
        ScheduledClip {
            element_id: Uuid::new_v4(),
            track_id: Uuid::new_v4(),
            source_key: SourceKey::Url("test://tone".into()),
            start_time: start,
            duration,
            trim_start,
            trim_end,
            base_volume: 1.0,
            looped,
        }
    }

    #[test]
    fn test_simple_clip_chunks() {
        let mut iter = ClipIterator::new(clip(1.0, 0.6, 0.2, 0.8, false), sink(2.0, 44_100), 1.0, 10.0);

        let mut chunks = Vec::new();
        while let Some(c) = iter.next_chunk() {
            chunks.push(c);
        }
        assert_eq!(chunks.len(), 3); // 0.25 + 0.25 + 0.1
        assert_eq!(chunks[0].timeline_time, 1.0);
        assert_eq!(chunks[0].source_offset, 0.2);
        let total: f64 = chunks.iter().map(|c| c.duration).sum();
        assert!((total - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_loop_clip_five_iterations() {
        // 2 s slice looped under a 10 s element on a 10 s timeline:
        // five passes, contiguous coverage of [0, 10), then stop.
        let mut iter = ClipIterator::new(clip(0.0, 10.0, 0.0, 2.0, true), sink(4.0, 44_100), 0.0, 10.0);

        let mut chunks = Vec::new();
        while let Some(c) = iter.next_chunk() {
            chunks.push(c);
        }

        let max_iteration = (chunks.last().unwrap().timeline_time / 2.0).floor();
        assert_eq!(max_iteration, 4.0, "expected five loop passes (0..=4)");

        // Contiguous: each chunk starts where the previous ended, within
        // [0, 10), and no chunk exceeds the chunk size.
        let mut cursor = 0.0;
        for c in &chunks {
            assert!((c.timeline_time - cursor).abs() < 1e-9, "gap at {}", cursor);
            assert!(c.duration <= CHUNK_SECONDS + 1e-9);
            assert!(c.timeline_time < 10.0);
            cursor = c.timeline_time + c.duration;
        }
        assert!((cursor - 10.0).abs() < 1e-9, "loop must stop at the timeline end");
    }

    #[test]
    fn test_iterator_starts_mid_loop() {
        // Seeking to t=5 in a 2 s loop lands in iteration 2, 1 s in.
        let iter = ClipIterator::new(clip(0.0, 10.0, 0.0, 2.0, true), sink(4.0, 44_100), 5.0, 10.0);
        assert_eq!(iter.peek_timeline_time(), Some(5.0));

        let mut iter = iter;
        let chunk = iter.next_chunk().unwrap();
        assert!((chunk.source_offset - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_trim_offsets_respected_mid_clip() {
        // Iterating from 1.5 into a clip at 1.0 with trim_start 0.1 reads
        // the source at 0.6.
        let mut iter = ClipIterator::new(clip(1.0, 1.0, 0.1, 1.1, false), sink(2.0, 44_100), 1.5, 10.0);
        let chunk = iter.next_chunk().unwrap();
        assert!((chunk.timeline_time - 1.5).abs() < 1e-9);
        assert!((chunk.source_offset - 0.6).abs() < 1e-9);
    }

    #[test]
    fn test_short_source_ends_iterator() {
        // Source data shorter than the trim window: iterator drains at the
        // data end instead of reading silence forever.
        let mut iter = ClipIterator::new(clip(0.0, 4.0, 0.0, 4.0, false), sink(1.0, 44_100), 0.0, 10.0);
        let mut total = 0.0;
        while let Some(c) = iter.next_chunk() {
            total += c.duration;
        }
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_collect_clips_skips_hidden() {
        use crate::scene::{AudioElement, Element, Placement, Scene, Track, TrackKind};

        let mut scene = Scene::new("s");
        let mut track = Track::new(TrackKind::Audio, "a");
        let mut visible = AudioElement {
            placement: Placement::new(0.0, 1.0),
            media_id: Uuid::new_v4(),
            base_volume: 1.0,
            looped: false,
        };
        let mut hidden = visible.clone();
        hidden.placement = Placement::new(2.0, 1.0);
        hidden.placement.hidden = true;
        visible.placement.trim_end = 1.0;
        track.elements.push(Element::Audio(visible));
        track.elements.push(Element::Audio(hidden));
        scene.tracks.push(track);

        let clips = collect_clips(&scene);
        assert_eq!(clips.len(), 1);
        assert_eq!(clips[0].start_time, 0.0);
    }
}
