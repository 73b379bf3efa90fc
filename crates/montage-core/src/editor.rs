//! Editor context
//!
//! Owns the scene store, the three managers and the playback scheduler,
//! and wires the change subscriptions between them at construction. The
//! managers never reference each other; everything flows through scene
//! queries and the subscriptions set up here.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::automation::AutomationManager;
use crate::error::{EngineError, EngineResult};
use crate::graph::AudioGraph;
use crate::media::{DecodedBufferCache, MediaProvider};
use crate::mixdown::{self, MixdownOutcome, MixdownProgress, TimeRemapConfig};
use crate::oneshot::{OneshotManager, OneshotMarker};
use crate::scene::command::{CommandStack, SceneCommand};
use crate::scene::persist::{from_json, to_json, SavedProject};
use crate::scene::store::SceneManager;
use crate::scene::now_secs;
use crate::scheduler::transport::{ManualTransport, Transport};
use crate::scheduler::{PlaybackScheduler, SchedulerConfig};
use crate::sidechain::SidechainManager;

/// The engine's root object
///
/// Construct once per project with a graph backend and a media provider;
/// everything else hangs off it.
pub struct Editor {
    scene: Arc<SceneManager>,
    buffers: Arc<DecodedBufferCache>,
    oneshot: Arc<OneshotManager>,
    automation: Arc<AutomationManager>,
    sidechain: Arc<SidechainManager>,
    scheduler: Arc<PlaybackScheduler>,
    transport: Arc<ManualTransport>,
    commands: Mutex<CommandStack>,
    active_oneshot: Mutex<Option<Uuid>>,
}

impl Editor {
    pub fn new(graph: Arc<dyn AudioGraph>, provider: Arc<dyn MediaProvider>) -> Arc<Self> {
        Self::with_scheduler_config(graph, provider, SchedulerConfig::default())
    }

    pub fn with_scheduler_config(
        graph: Arc<dyn AudioGraph>,
        provider: Arc<dyn MediaProvider>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        let scene = Arc::new(SceneManager::new());
        let buffers = Arc::new(DecodedBufferCache::new(provider));
        let oneshot = Arc::new(OneshotManager::new(scene.clone(), buffers.clone()));
        let automation = Arc::new(AutomationManager::new(scene.clone()));
        let sidechain = Arc::new(SidechainManager::new(scene.clone(), buffers.clone()));
        let scheduler = Arc::new(PlaybackScheduler::new(
            graph,
            scene.clone(),
            oneshot.clone(),
            automation.clone(),
            sidechain.clone(),
            buffers.clone(),
            config,
        ));

        // Scene changes invalidate the derived caches and, mid-session,
        // restart playback at the current playhead.
        {
            let oneshot = oneshot.clone();
            let sidechain = sidechain.clone();
            let scheduler = scheduler.clone();
            scene.subscribe(Arc::new(move |event| {
                oneshot.handle_scene_event(event);
                sidechain.handle_scene_event(event);
                scheduler.on_timeline_changed();
            }));
        }

        let commands = Mutex::new(CommandStack::new(scene.clone()));
        Arc::new(Self {
            scene,
            buffers,
            oneshot,
            automation,
            sidechain,
            scheduler,
            transport: Arc::new(ManualTransport::new()),
            commands,
            active_oneshot: Mutex::new(None),
        })
    }

    // --- Component access ---

    pub fn scene_manager(&self) -> &Arc<SceneManager> {
        &self.scene
    }

    pub fn oneshot(&self) -> &Arc<OneshotManager> {
        &self.oneshot
    }

    pub fn automation(&self) -> &Arc<AutomationManager> {
        &self.automation
    }

    pub fn sidechain(&self) -> &Arc<SidechainManager> {
        &self.sidechain
    }

    pub fn scheduler(&self) -> &Arc<PlaybackScheduler> {
        &self.scheduler
    }

    pub fn transport(&self) -> &Arc<ManualTransport> {
        &self.transport
    }

    // --- Command history ---

    pub fn execute(&self, command: SceneCommand) -> EngineResult<()> {
        self.commands.lock().unwrap().execute(command)
    }

    pub fn undo(&self) -> bool {
        self.commands.lock().unwrap().undo()
    }

    pub fn redo(&self) -> bool {
        self.commands.lock().unwrap().redo()
    }

    // --- Transport reactions ---

    pub fn play(&self) {
        self.transport.set_playing(true);
        self.scheduler.play(self.transport.current_time());
    }

    pub fn pause(&self) {
        self.transport.set_playing(false);
        self.scheduler.stop();
    }

    pub fn seek(&self, t: f64) {
        self.transport.set_time(t);
        self.scheduler.seek(t);
    }

    pub fn set_volume(&self, volume: f32) {
        self.transport.set_volume(volume);
        self.scheduler.set_volume(volume);
    }

    /// Playhead: the live session position while playing, the transport
    /// cursor otherwise.
    pub fn playhead(&self) -> f64 {
        self.scheduler
            .playback_position()
            .unwrap_or_else(|| self.transport.current_time())
    }

    // --- One-shot actions (the engine side of the `o` / `shift+tab` keys) ---

    /// Drop a marker for the active one-shot at the playhead.
    pub fn mark_oneshot_at_playhead(&self) -> EngineResult<Uuid> {
        let scene_id = self
            .scene
            .active_scene_id()
            .ok_or_else(|| EngineError::invariant("no active scene"))?;
        let definition_id = self
            .active_oneshot()
            .ok_or_else(|| EngineError::invariant("no one-shot definitions"))?;

        let marker = OneshotMarker {
            id: Uuid::new_v4(),
            oneshot_id: definition_id,
            time: self.playhead(),
            volume: None,
            created_at: now_secs(),
        };
        let marker_id = marker.id;
        self.execute(SceneCommand::AddOneshotMarker { scene_id, marker })?;
        Ok(marker_id)
    }

    /// The definition markers are currently created for.
    pub fn active_oneshot(&self) -> Option<Uuid> {
        let current = *self.active_oneshot.lock().unwrap();
        self.scene.with_active_scene(|scene| {
            if let Some(id) = current {
                if scene.definition_by_id(id).is_some() {
                    return Some(id);
                }
            }
            scene.oneshot_definitions.first().map(|d| d.id)
        })?
    }

    /// Advance the active one-shot to the next definition, wrapping.
    pub fn cycle_active_oneshot(&self) -> Option<Uuid> {
        let current = self.active_oneshot();
        let next = self.scene.with_active_scene(|scene| {
            if scene.oneshot_definitions.is_empty() {
                return None;
            }
            let idx = current
                .and_then(|id| scene.oneshot_definitions.iter().position(|d| d.id == id))
                .map(|i| (i + 1) % scene.oneshot_definitions.len())
                .unwrap_or(0);
            Some(scene.oneshot_definitions[idx].id)
        })??;
        *self.active_oneshot.lock().unwrap() = Some(next);
        Some(next)
    }

    // --- Persistence ---

    pub fn save_project(&self, name: impl Into<String>) -> EngineResult<String> {
        to_json(&SavedProject::capture(&self.scene, name))
    }

    pub fn load_project(&self, json: &str) -> EngineResult<()> {
        let project = from_json(json)?;
        project.restore(&self.scene);
        Ok(())
    }

    // --- Export ---

    /// Render the active scene through the offline mixdown.
    pub fn render_mixdown(
        &self,
        config: &TimeRemapConfig,
        sample_rate: Option<u32>,
        progress: Option<&mut dyn FnMut(MixdownProgress)>,
        cancel: &AtomicBool,
    ) -> EngineResult<MixdownOutcome> {
        let scene = self
            .scene
            .active_scene()
            .ok_or_else(|| EngineError::invariant("no active scene"))?;
        Ok(mixdown::render_mixdown(
            &scene,
            &self.buffers,
            &self.oneshot,
            config,
            sample_rate,
            progress,
            cancel,
        ))
    }
}
