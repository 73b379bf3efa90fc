//! Sidechain compression: configs, envelope cache and gain lookup
//!
//! A sidechain config picks a source signal (a track or a one-shot
//! definition) and a set of destinations to duck. Envelopes are
//! precomputed offline by the envelope engine against the live timeline
//! duration and cached per config; `prepare_for_playback` flattens the
//! enabled configs into per-destination lookup tables the gain tick reads.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::dsp::CompressorParams;
use crate::envelope::{compute_envelope, SidechainEnvelope, SourceElement};
use crate::error::{EngineError, EngineResult};
use crate::media::{DecodedBufferCache, SourceKey};
use crate::oneshot::{audio_start_time, OneshotManager};
use crate::scene::store::{SceneEvent, SceneManager};
use crate::scene::Scene;

/// The signal a sidechain config keys its ducking from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SidechainSource {
    Track { track_id: Uuid },
    Oneshot { definition_id: Uuid },
}

/// A sidechain routing: one source ducking a set of destinations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidechainConfig {
    pub id: Uuid,
    pub name: String,
    pub source: SidechainSource,
    #[serde(default)]
    pub target_track_ids: BTreeSet<Uuid>,
    #[serde(default)]
    pub target_oneshot_definition_ids: BTreeSet<Uuid>,
    pub params: CompressorParams,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SidechainConfig {
    pub fn validate(&self) -> EngineResult<()> {
        self.params.validate()?;
        let self_target = match &self.source {
            SidechainSource::Track { track_id } => self.target_track_ids.contains(track_id),
            SidechainSource::Oneshot { definition_id } => {
                self.target_oneshot_definition_ids.contains(definition_id)
            }
        };
        if self_target {
            return Err(EngineError::invariant(format!(
                "sidechain {}: source cannot target itself",
                self.id
            )));
        }
        Ok(())
    }
}

/// Flattened per-destination envelope tables for one play session
#[derive(Default)]
struct LookupTables {
    by_track: HashMap<Uuid, Vec<Arc<SidechainEnvelope>>>,
    by_oneshot: HashMap<Uuid, Vec<Arc<SidechainEnvelope>>>,
}

/// View over the active scene's sidechain configs
pub struct SidechainManager {
    scene: Arc<SceneManager>,
    buffers: Arc<DecodedBufferCache>,
    envelopes: Mutex<HashMap<Uuid, Arc<SidechainEnvelope>>>,
    tables: Mutex<LookupTables>,
}

impl SidechainManager {
    pub fn new(scene: Arc<SceneManager>, buffers: Arc<DecodedBufferCache>) -> Self {
        Self {
            scene,
            buffers,
            envelopes: Mutex::new(HashMap::new()),
            tables: Mutex::new(LookupTables::default()),
        }
    }

    /// Scene content changed: cached envelopes no longer describe the
    /// signal they were computed from.
    pub fn handle_scene_event(&self, event: &SceneEvent) {
        match event {
            SceneEvent::SceneReplaced(_)
            | SceneEvent::SceneRemoved(_)
            | SceneEvent::ScenesRestored
            | SceneEvent::ActiveSceneChanged => self.invalidate(),
            _ => {}
        }
    }

    /// Drop every cached envelope and the playback tables.
    ///
    /// Invalidation is deliberately whole-cache: a scene mutation can move
    /// the signal content under any config's source, not just the config
    /// that was edited.
    pub fn invalidate(&self) {
        self.envelopes.lock().unwrap().clear();
        *self.tables.lock().unwrap() = LookupTables::default();
    }

    /// Expand a config's source signal into envelope-engine elements.
    fn source_elements(
        &self,
        scene: &Scene,
        config: &SidechainConfig,
        oneshot: &OneshotManager,
    ) -> Vec<SourceElement> {
        match &config.source {
            SidechainSource::Track { track_id } => {
                let Some(track) = scene.track_by_id(*track_id) else {
                    return Vec::new();
                };
                track
                    .elements
                    .iter()
                    .filter_map(|e| e.as_audio())
                    .filter(|a| !a.placement.hidden)
                    .filter_map(|a| {
                        let buffer =
                            self.buffers.get_or_decode(&SourceKey::Asset(a.media_id))?;
                        let slice = a.placement.trim_end - a.placement.trim_start;
                        let duration = if slice > 0.0 { slice } else { a.placement.duration };
                        Some(SourceElement {
                            buffer,
                            start_time: a.placement.start_time,
                            trim_start: a.placement.trim_start,
                            duration,
                            looped: a.looped,
                        })
                    })
                    .collect()
            }
            SidechainSource::Oneshot { definition_id } => {
                let Some(def) = scene.definition_by_id(*definition_id) else {
                    return Vec::new();
                };
                let Some(buffer) = oneshot.buffer_for(def) else {
                    return Vec::new();
                };
                scene
                    .oneshot_markers
                    .iter()
                    .filter(|m| m.oneshot_id == def.id)
                    .map(|m| SourceElement {
                        buffer: buffer.clone(),
                        start_time: audio_start_time(m, def),
                        trim_start: def.trim_start,
                        duration: def.slice_duration(),
                        looped: false,
                    })
                    .collect()
            }
        }
    }

    /// Cached envelope for one config, computing it if needed.
    pub fn envelope_for(
        &self,
        config: &SidechainConfig,
        oneshot: &OneshotManager,
    ) -> Option<Arc<SidechainEnvelope>> {
        if let Some(hit) = self.envelopes.lock().unwrap().get(&config.id) {
            return Some(hit.clone());
        }

        let envelope = self.scene.with_active_scene(|scene| {
            let elements = self.source_elements(scene, config, oneshot);
            compute_envelope(&elements, scene.total_duration(), &config.params)
        })?;

        let envelope = Arc::new(envelope);
        self.envelopes
            .lock()
            .unwrap()
            .insert(config.id, envelope.clone());
        Some(envelope)
    }

    /// Compute every enabled config's envelope and build the lookup tables.
    ///
    /// Envelope computation is independent per config, so the cold ones run
    /// in parallel.
    pub fn prepare_for_playback(&self, oneshot: &OneshotManager) {
        let configs: Vec<SidechainConfig> = self
            .scene
            .with_active_scene(|scene| scene.sidechain_configs.clone())
            .unwrap_or_default();

        let computed: Vec<(SidechainConfig, Arc<SidechainEnvelope>)> = configs
            .into_par_iter()
            .filter(|c| c.enabled)
            .filter_map(|c| {
                let env = self.envelope_for(&c, oneshot)?;
                Some((c, env))
            })
            .collect();

        let mut tables = LookupTables::default();
        for (config, envelope) in computed {
            for track_id in &config.target_track_ids {
                tables
                    .by_track
                    .entry(*track_id)
                    .or_default()
                    .push(envelope.clone());
            }
            for def_id in &config.target_oneshot_definition_ids {
                tables
                    .by_oneshot
                    .entry(*def_id)
                    .or_default()
                    .push(envelope.clone());
            }
        }
        *self.tables.lock().unwrap() = tables;
    }

    /// Combined duck gain for a track at time `t`.
    ///
    /// Multiple configs targeting the same track multiply (duck stacking);
    /// an untargeted track is unity.
    pub fn gain_for_track(&self, track_id: Uuid, t: f64) -> f32 {
        let tables = self.tables.lock().unwrap();
        match tables.by_track.get(&track_id) {
            Some(envelopes) => envelopes.iter().map(|e| e.gain_at(t)).product(),
            None => 1.0,
        }
    }

    /// Combined duck gain for a one-shot definition at time `t`.
    pub fn gain_for_oneshot(&self, definition_id: Uuid, t: f64) -> f32 {
        let tables = self.tables.lock().unwrap();
        match tables.by_oneshot.get(&definition_id) {
            Some(envelopes) => envelopes.iter().map(|e| e.gain_at(t)).product(),
            None => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{AudioData, MemoryMediaProvider};
    use crate::scene::{now_secs, AudioElement, Element, Placement, Track, TrackKind};

    fn square(seconds: f64, rate: u32) -> AudioData {
        let n = (seconds * rate as f64) as usize;
        let samples: Vec<f32> = (0..n)
            .map(|i| if (i / 32) % 2 == 0 { 1.0 } else { -1.0 })
            .collect();
        AudioData::from_mono(samples, rate)
    }

    fn duck_params() -> CompressorParams {
        CompressorParams {
            threshold_db: -20.0,
            ratio: 4.0,
            attack: 0.01,
            release: 0.2,
            depth_db: -24.0,
        }
    }

    struct Fixture {
        scene_mgr: Arc<SceneManager>,
        sidechain: SidechainManager,
        oneshot: OneshotManager,
        source_track: Uuid,
        target_track: Uuid,
    }

    fn fixture() -> Fixture {
        let provider = Arc::new(MemoryMediaProvider::new());
        let media_id = Uuid::new_v4();
        provider.insert(SourceKey::Asset(media_id), square(1.0, 44_100));

        let mut scene = Scene::new("test");

        let mut source_track = Track::new(TrackKind::Audio, "kick");
        source_track.elements.push(Element::Audio(AudioElement {
            placement: Placement::new(0.0, 1.0),
            media_id,
            base_volume: 1.0,
            looped: false,
        }));
        let source_id = source_track.id;

        let target_track = Track::new(TrackKind::Audio, "music");
        let target_id = target_track.id;
        // The target needs an element so the timeline spans a full second.
        let mut target_track = target_track;
        target_track.elements.push(Element::Audio(AudioElement {
            placement: Placement::new(0.0, 1.0),
            media_id,
            base_volume: 1.0,
            looped: false,
        }));

        scene.tracks = vec![source_track, target_track];
        scene.sidechain_configs = vec![SidechainConfig {
            id: Uuid::new_v4(),
            name: "duck music".into(),
            source: SidechainSource::Track { track_id: source_id },
            target_track_ids: [target_id].into_iter().collect(),
            target_oneshot_definition_ids: BTreeSet::new(),
            params: duck_params(),
            enabled: true,
            created_at: now_secs(),
            updated_at: now_secs(),
        }];

        let scene_mgr = Arc::new(SceneManager::new());
        scene_mgr.add_scene(scene);

        let buffers = Arc::new(DecodedBufferCache::new(provider.clone()));
        let sidechain = SidechainManager::new(scene_mgr.clone(), buffers.clone());
        let oneshot = OneshotManager::new(scene_mgr.clone(), buffers);
        Fixture {
            scene_mgr,
            sidechain,
            oneshot,
            source_track: source_id,
            target_track: target_id,
        }
    }

    #[test]
    fn test_steady_state_duck_gain() {
        let f = fixture();
        f.sidechain.prepare_for_playback(&f.oneshot);

        // Full-scale square, threshold -20 dB, ratio 4: 15 dB reduction
        // once settled, gain ~= 0.178.
        let gain = f.sidechain.gain_for_track(f.target_track, 0.9);
        let expected = 10f32.powf(-15.0 / 20.0);
        assert!(
            (gain - expected).abs() < 0.01,
            "gain {} vs expected {}",
            gain,
            expected
        );
    }

    #[test]
    fn test_untargeted_ids_are_unity() {
        let f = fixture();
        f.sidechain.prepare_for_playback(&f.oneshot);

        assert_eq!(f.sidechain.gain_for_track(f.source_track, 0.5), 1.0);
        assert_eq!(f.sidechain.gain_for_oneshot(Uuid::new_v4(), 0.5), 1.0);
    }

    #[test]
    fn test_duck_stacking_multiplies() {
        let f = fixture();
        // Add a second enabled config with the same source and target.
        let active = f.scene_mgr.active_scene().unwrap();
        let mut clone = active.clone();
        let mut second = clone.sidechain_configs[0].clone();
        second.id = Uuid::new_v4();
        clone.sidechain_configs.push(second);
        f.scene_mgr.replace_scene(clone).unwrap();

        f.sidechain.prepare_for_playback(&f.oneshot);
        let stacked = f.sidechain.gain_for_track(f.target_track, 0.9);
        let single = 10f32.powf(-15.0 / 20.0);
        assert!(
            (stacked - single * single).abs() < 0.01,
            "stacked gain {} vs {}",
            stacked,
            single * single
        );
    }

    #[test]
    fn test_disabled_config_excluded() {
        let f = fixture();
        let mut scene = f.scene_mgr.active_scene().unwrap();
        scene.sidechain_configs[0].enabled = false;
        f.scene_mgr.replace_scene(scene).unwrap();

        f.sidechain.prepare_for_playback(&f.oneshot);
        assert_eq!(f.sidechain.gain_for_track(f.target_track, 0.5), 1.0);
    }

    #[test]
    fn test_scene_event_invalidates_cache() {
        let f = fixture();
        f.sidechain.prepare_for_playback(&f.oneshot);
        assert!(f.sidechain.gain_for_track(f.target_track, 0.9) < 1.0);

        let id = f.scene_mgr.active_scene_id().unwrap();
        f.sidechain
            .handle_scene_event(&SceneEvent::SceneReplaced(id));
        assert!(f.sidechain.envelopes.lock().unwrap().is_empty());
        assert_eq!(f.sidechain.gain_for_track(f.target_track, 0.9), 1.0);
    }

    #[test]
    fn test_source_cannot_target_itself() {
        let id = Uuid::new_v4();
        let track_id = Uuid::new_v4();
        let config = SidechainConfig {
            id,
            name: "bad".into(),
            source: SidechainSource::Track { track_id },
            target_track_ids: [track_id].into_iter().collect(),
            target_oneshot_definition_ids: BTreeSet::new(),
            params: duck_params(),
            enabled: true,
            created_at: now_secs(),
            updated_at: now_secs(),
        };
        assert!(config.validate().is_err());
    }
}
