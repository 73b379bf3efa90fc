//! One-shot samples: definitions, markers and the playback index
//!
//! A one-shot definition is a trimmed slice of a sound with a cue point;
//! a marker drops that sound onto the timeline so the cue point lands on
//! the marker time. The manager resolves derived timing, answers window
//! queries for the scheduler's look-ahead, and caches decoded buffers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::media::{AudioData, DecodedBufferCache, SourceKey};
use crate::scene::store::{SceneEvent, SceneManager};

/// Where a one-shot's audio comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OneshotAudioSource {
    /// A sound from the shared library, addressed by URL
    Library { sound_id: String, url: String },
    /// A user upload backed by a project media asset
    Upload { asset_id: Uuid, url: String },
}

impl OneshotAudioSource {
    /// The cache/provider key for this source.
    pub fn source_key(&self) -> SourceKey {
        match self {
            OneshotAudioSource::Library { url, .. } => SourceKey::Url(url.clone()),
            OneshotAudioSource::Upload { asset_id, .. } => SourceKey::Asset(*asset_id),
        }
    }
}

/// A reusable one-shot sound definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneshotDefinition {
    pub id: Uuid,
    pub name: String,
    pub color: String,
    pub audio_source: OneshotAudioSource,
    /// Slice start within the source, seconds
    pub trim_start: f64,
    /// Slice end within the source, seconds
    pub trim_end: f64,
    /// Position within the trim window that aligns with marker time
    pub cue_point: f64,
    /// Natural duration of the source audio, seconds
    pub audio_duration: f64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OneshotDefinition {
    /// Length of the playable slice in seconds.
    pub fn slice_duration(&self) -> f64 {
        self.trim_end - self.trim_start
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.trim_start < 0.0
            || self.trim_start > self.cue_point
            || self.cue_point > self.trim_end
        {
            return Err(EngineError::invariant(format!(
                "one-shot {}: trim/cue out of order ({} <= {} <= {})",
                self.id, self.trim_start, self.cue_point, self.trim_end
            )));
        }
        if self.trim_end > self.audio_duration + 1e-9 {
            return Err(EngineError::invariant(format!(
                "one-shot {}: trim end {} exceeds audio duration {}",
                self.id, self.trim_end, self.audio_duration
            )));
        }
        Ok(())
    }
}

/// A timeline trigger of a one-shot definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneshotMarker {
    pub id: Uuid,
    pub oneshot_id: Uuid,
    /// Timeline second the definition's cue point aligns with
    pub time: f64,
    /// Per-trigger volume override in [0, 1]
    #[serde(default)]
    pub volume: Option<f32>,
    pub created_at: i64,
}

impl OneshotMarker {
    pub fn validate(&self) -> EngineResult<()> {
        if let Some(v) = self.volume {
            if !(0.0..=1.0).contains(&v) {
                return Err(EngineError::invariant(format!(
                    "marker {}: volume {} outside [0, 1]",
                    self.id, v
                )));
            }
        }
        Ok(())
    }
}

/// Timeline second where the marker's audio starts sounding.
pub fn audio_start_time(marker: &OneshotMarker, definition: &OneshotDefinition) -> f64 {
    marker.time - (definition.cue_point - definition.trim_start)
}

/// Timeline second where the marker's audio stops.
pub fn audio_end_time(marker: &OneshotMarker, definition: &OneshotDefinition) -> f64 {
    audio_start_time(marker, definition) + definition.slice_duration()
}

/// A marker resolved against its definition with derived timing
#[derive(Debug, Clone)]
pub struct ScheduledOneshot {
    pub marker: OneshotMarker,
    pub definition: OneshotDefinition,
    pub audio_start_time: f64,
    pub audio_end_time: f64,
}

/// One entry of the hot playback index, sorted by audio start time
struct IndexEntry {
    marker_id: Uuid,
    definition_id: Uuid,
    audio_start: f64,
    audio_end: f64,
    /// Running maximum of audio_end over entries up to and including this
    /// one; bounds the backward scan for still-sounding earlier onsets.
    prefix_max_end: f64,
}

/// Pre-resolved index built by `prepare_for_playback`
struct PlaybackIndex {
    entries: Vec<IndexEntry>,
    definitions: HashMap<Uuid, OneshotDefinition>,
    markers: HashMap<Uuid, OneshotMarker>,
}

/// View over the active scene's one-shot collections
pub struct OneshotManager {
    scene: Arc<SceneManager>,
    buffers: Arc<DecodedBufferCache>,
    index: Mutex<Option<PlaybackIndex>>,
}

impl OneshotManager {
    pub fn new(scene: Arc<SceneManager>, buffers: Arc<DecodedBufferCache>) -> Self {
        Self {
            scene,
            buffers,
            index: Mutex::new(None),
        }
    }

    /// React to a scene change: the index is stale, and definition edits
    /// or deletions may have invalidated cached audio.
    pub fn handle_scene_event(&self, event: &SceneEvent) {
        match event {
            SceneEvent::SceneReplaced(_)
            | SceneEvent::SceneRemoved(_)
            | SceneEvent::ScenesRestored
            | SceneEvent::ActiveSceneChanged => {
                *self.index.lock().unwrap() = None;
                self.buffers.clear();
            }
            _ => {}
        }
    }

    /// Decoded audio for a definition, from cache or a lazy decode.
    ///
    /// Decode failures log and return `None`; the one-shot is skipped for
    /// the session.
    pub fn buffer_for(&self, definition: &OneshotDefinition) -> Option<Arc<AudioData>> {
        self.buffers.get_or_decode(&definition.audio_source.source_key())
    }

    /// Build the sorted playback index and resolve the definition map.
    pub fn prepare_for_playback(&self) {
        let index = self.scene.with_active_scene(|scene| {
            let definitions: HashMap<Uuid, OneshotDefinition> = scene
                .oneshot_definitions
                .iter()
                .map(|d| (d.id, d.clone()))
                .collect();
            let markers: HashMap<Uuid, OneshotMarker> = scene
                .oneshot_markers
                .iter()
                .map(|m| (m.id, m.clone()))
                .collect();

            let mut entries: Vec<IndexEntry> = scene
                .oneshot_markers
                .iter()
                .filter_map(|m| {
                    let def = definitions.get(&m.oneshot_id)?;
                    let start = audio_start_time(m, def);
                    Some(IndexEntry {
                        marker_id: m.id,
                        definition_id: def.id,
                        audio_start: start,
                        audio_end: start + def.slice_duration(),
                        prefix_max_end: 0.0,
                    })
                })
                .collect();
            entries.sort_by(|a, b| a.audio_start.total_cmp(&b.audio_start));

            let mut running = f64::NEG_INFINITY;
            for entry in &mut entries {
                running = running.max(entry.audio_end);
                entry.prefix_max_end = running;
            }

            PlaybackIndex {
                entries,
                definitions,
                markers,
            }
        });
        *self.index.lock().unwrap() = index;
    }

    /// Drop the hot index (play session ended).
    pub fn release_playback_index(&self) {
        *self.index.lock().unwrap() = None;
    }

    /// Every marker whose audio span overlaps [start, end).
    ///
    /// Uses the hot index when one is prepared (binary search plus local
    /// scans), otherwise a full scan of the active scene. Both paths return
    /// the same set.
    pub fn markers_in_window(&self, start: f64, end: f64) -> Vec<ScheduledOneshot> {
        let guard = self.index.lock().unwrap();
        match guard.as_ref() {
            Some(index) => self.query_hot(index, start, end),
            None => self.query_cold(start, end),
        }
    }

    fn query_cold(&self, start: f64, end: f64) -> Vec<ScheduledOneshot> {
        self.scene
            .with_active_scene(|scene| {
                let mut hits: Vec<ScheduledOneshot> = scene
                    .oneshot_markers
                    .iter()
                    .filter_map(|m| {
                        let def = scene.definition_by_id(m.oneshot_id)?;
                        let audio_start = audio_start_time(m, def);
                        let audio_end = audio_start + def.slice_duration();
                        (audio_start < end && audio_end > start).then(|| ScheduledOneshot {
                            marker: m.clone(),
                            definition: def.clone(),
                            audio_start_time: audio_start,
                            audio_end_time: audio_end,
                        })
                    })
                    .collect();
                hits.sort_by(|a, b| a.audio_start_time.total_cmp(&b.audio_start_time));
                hits
            })
            .unwrap_or_default()
    }

    fn query_hot(&self, index: &PlaybackIndex, start: f64, end: f64) -> Vec<ScheduledOneshot> {
        let entries = &index.entries;
        let lower = entries.partition_point(|e| e.audio_start < start);

        let mut hits = Vec::new();

        // Earlier onsets still sounding at `start`: walk backwards while the
        // running max end says something back there can still overlap.
        let mut j = lower;
        while j > 0 && entries[j - 1].prefix_max_end > start {
            j -= 1;
            let e = &entries[j];
            if e.audio_end > start && e.audio_start < end {
                hits.push(e);
            }
        }
        hits.reverse();

        // Onsets inside the window.
        for e in &entries[lower..] {
            if e.audio_start >= end {
                break;
            }
            if e.audio_end > start {
                hits.push(e);
            }
        }

        hits.into_iter()
            .filter_map(|e| {
                let marker = index.markers.get(&e.marker_id)?.clone();
                let definition = index.definitions.get(&e.definition_id)?.clone();
                Some(ScheduledOneshot {
                    marker,
                    definition,
                    audio_start_time: e.audio_start,
                    audio_end_time: e.audio_end,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::MemoryMediaProvider;
    use crate::scene::{now_secs, Scene};
    use proptest::prelude::*;

    fn definition(trim_start: f64, trim_end: f64, cue: f64) -> OneshotDefinition {
        OneshotDefinition {
            id: Uuid::new_v4(),
            name: "clap".into(),
            color: "#ff5500".into(),
            audio_source: OneshotAudioSource::Library {
                sound_id: "clap-01".into(),
                url: "lib://clap-01".into(),
            },
            trim_start,
            trim_end,
            cue_point: cue,
            audio_duration: trim_end + 1.0,
            created_at: now_secs(),
            updated_at: now_secs(),
        }
    }

    fn marker(def: &OneshotDefinition, time: f64) -> OneshotMarker {
        OneshotMarker {
            id: Uuid::new_v4(),
            oneshot_id: def.id,
            time,
            volume: None,
            created_at: now_secs(),
        }
    }

    fn manager_with(defs: Vec<OneshotDefinition>, markers: Vec<OneshotMarker>) -> OneshotManager {
        let scene_mgr = Arc::new(SceneManager::new());
        let mut scene = Scene::new("test");
        scene.oneshot_definitions = defs;
        scene.oneshot_markers = markers;
        scene_mgr.add_scene(scene);
        let cache = Arc::new(DecodedBufferCache::new(Arc::new(MemoryMediaProvider::new())));
        OneshotManager::new(scene_mgr, cache)
    }

    #[test]
    fn test_derived_timing() {
        // trim [0.1, 0.5], cue 0.3, marker at 2.0: audio spans [1.8, 2.2].
        let def = definition(0.1, 0.5, 0.3);
        let m = marker(&def, 2.0);
        assert!((audio_start_time(&m, &def) - 1.8).abs() < 1e-9);
        assert!((audio_end_time(&m, &def) - 2.2).abs() < 1e-9);
    }

    #[test]
    fn test_cue_alignment_identity() {
        let def = definition(0.25, 1.25, 0.75);
        let m = marker(&def, 5.0);
        let start = audio_start_time(&m, &def);
        assert!((start + (def.cue_point - def.trim_start) - m.time).abs() < 1e-9);
        assert!((start + def.slice_duration() - audio_end_time(&m, &def)).abs() < 1e-9);
    }

    #[test]
    fn test_definition_validation() {
        assert!(definition(0.1, 0.5, 0.3).validate().is_ok());
        assert!(definition(0.5, 0.1, 0.3).validate().is_err());
        assert!(definition(0.1, 0.5, 0.6).validate().is_err());
    }

    #[test]
    fn test_window_query_cold() {
        let def = definition(0.1, 0.5, 0.3);
        let markers = vec![marker(&def, 2.0), marker(&def, 5.0)];
        let mgr = manager_with(vec![def], markers);

        // Audio spans [1.8, 2.2] and [4.8, 5.2].
        let hits = mgr.markers_in_window(0.0, 3.0);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].audio_start_time - 1.8).abs() < 1e-9);

        // Window starting mid-slice still catches the earlier onset.
        let hits = mgr.markers_in_window(2.1, 3.0);
        assert_eq!(hits.len(), 1);

        assert!(mgr.markers_in_window(2.5, 4.0).is_empty());
    }

    #[test]
    fn test_hot_and_cold_queries_agree() {
        let short = definition(0.0, 0.3, 0.1);
        let long = definition(0.0, 4.0, 0.5);
        let markers = vec![
            marker(&long, 1.0),  // spans [0.5, 4.5]
            marker(&short, 2.0), // spans [1.9, 2.2]
            marker(&short, 3.0), // spans [2.9, 3.2]
        ];
        let mgr = manager_with(vec![short, long], markers);

        // A window past the short slices but inside the long one: the
        // backward scan must hop over the ended short entries.
        let cold: Vec<Uuid> = mgr
            .markers_in_window(3.5, 4.0)
            .iter()
            .map(|h| h.marker.id)
            .collect();
        mgr.prepare_for_playback();
        let hot: Vec<Uuid> = mgr
            .markers_in_window(3.5, 4.0)
            .iter()
            .map(|h| h.marker.id)
            .collect();
        assert_eq!(cold, hot);
        assert_eq!(hot.len(), 1);
    }

    proptest! {
        #[test]
        fn prop_hot_equals_cold(
            times in proptest::collection::vec(0.0f64..20.0, 0..24),
            window_start in -1.0f64..21.0,
            window_len in 0.0f64..6.0,
        ) {
            let defs = vec![
                definition(0.0, 0.4, 0.2),
                definition(0.1, 2.6, 0.9),
                definition(0.0, 1.0, 0.0),
            ];
            let markers: Vec<OneshotMarker> = times
                .iter()
                .enumerate()
                .map(|(i, &t)| marker(&defs[i % defs.len()], t))
                .collect();
            let mgr = manager_with(defs, markers);

            let window_end = window_start + window_len;
            let mut cold: Vec<Uuid> = mgr
                .markers_in_window(window_start, window_end)
                .iter().map(|h| h.marker.id).collect();
            mgr.prepare_for_playback();
            let mut hot: Vec<Uuid> = mgr
                .markers_in_window(window_start, window_end)
                .iter().map(|h| h.marker.id).collect();

            cold.sort();
            hot.sort();
            prop_assert_eq!(cold, hot);
        }

        #[test]
        fn prop_derived_timing_consistent(
            trim_start in 0.0f64..2.0,
            slice in 0.01f64..3.0,
            cue_frac in 0.0f64..1.0,
            time in 0.0f64..30.0,
        ) {
            let trim_end = trim_start + slice;
            let cue = trim_start + slice * cue_frac;
            let def = definition(trim_start, trim_end, cue);
            let m = marker(&def, time);

            let start = audio_start_time(&m, &def);
            let end = audio_end_time(&m, &def);
            prop_assert!((start + def.slice_duration() - end).abs() < 1e-9);
            prop_assert!((start + (def.cue_point - def.trim_start) - m.time).abs() < 1e-9);
        }
    }
}
