//! Scene store and change notification
//!
//! Owns the ordered scene list, the active-scene cursor and the media
//! library. Mutation is atomic replace-by-id; observers are notified after
//! each mutation with a fine-grained event (no coalescing, downstream
//! caches rely on seeing every change).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::{MediaAsset, Scene};
use crate::error::{EngineError, EngineResult};

/// What changed in the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneEvent {
    SceneAdded(Uuid),
    SceneRemoved(Uuid),
    /// A scene was replaced in place (any content mutation lands here)
    SceneReplaced(Uuid),
    /// The whole scene list was swapped (undo/redo, project load)
    ScenesRestored,
    ActiveSceneChanged,
    AssetsChanged,
}

/// Observer callback
pub type SceneListener = Arc<dyn Fn(&SceneEvent) + Send + Sync>;

/// Token returned by [`SceneManager::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct StoreState {
    scenes: Vec<Scene>,
    active: Option<Uuid>,
    assets: Vec<MediaAsset>,
}

/// Owner of the scene list
///
/// Shared as `Arc<SceneManager>`; the managers query it, they never hold
/// references into scene data. Listeners are invoked after the state lock
/// is released, from a snapshot of the observer set, so a listener may
/// unsubscribe (or subscribe) re-entrantly.
#[derive(Default)]
pub struct SceneManager {
    state: Mutex<StoreState>,
    observers: Mutex<Vec<(u64, SceneListener)>>,
    next_token: AtomicU64,
}

impl SceneManager {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Observation ---

    pub fn subscribe(&self, listener: SceneListener) -> SubscriptionId {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().unwrap().push((token, listener));
        SubscriptionId(token)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.observers.lock().unwrap().retain(|(t, _)| *t != id.0);
    }

    fn notify(&self, event: SceneEvent) {
        let snapshot: Vec<SceneListener> = self
            .observers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(&event);
        }
    }

    // --- Scene access ---

    /// Run a closure against the active scene without cloning it.
    pub fn with_active_scene<R>(&self, f: impl FnOnce(&Scene) -> R) -> Option<R> {
        let state = self.state.lock().unwrap();
        let active = state.active?;
        state.scenes.iter().find(|s| s.id == active).map(f)
    }

    /// Clone of the active scene, if one is selected.
    pub fn active_scene(&self) -> Option<Scene> {
        self.with_active_scene(|s| s.clone())
    }

    pub fn active_scene_id(&self) -> Option<Uuid> {
        self.state.lock().unwrap().active
    }

    pub fn scene_by_id(&self, id: Uuid) -> Option<Scene> {
        self.state
            .lock()
            .unwrap()
            .scenes
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }

    pub fn scene_count(&self) -> usize {
        self.state.lock().unwrap().scenes.len()
    }

    /// Total timeline duration of the active scene.
    pub fn total_duration(&self) -> f64 {
        self.with_active_scene(|s| s.total_duration()).unwrap_or(0.0)
    }

    // --- Mutation ---

    /// Append a scene; the first scene added becomes active.
    pub fn add_scene(&self, scene: Scene) {
        let id = scene.id;
        {
            let mut state = self.state.lock().unwrap();
            if state.active.is_none() {
                state.active = Some(id);
            }
            state.scenes.push(scene);
        }
        self.notify(SceneEvent::SceneAdded(id));
    }

    pub fn remove_scene(&self, id: Uuid) -> EngineResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let before = state.scenes.len();
            state.scenes.retain(|s| s.id != id);
            if state.scenes.len() == before {
                return Err(EngineError::not_found("scene", id));
            }
            if state.active == Some(id) {
                state.active = state.scenes.first().map(|s| s.id);
            }
        }
        self.notify(SceneEvent::SceneRemoved(id));
        Ok(())
    }

    /// Atomic replace-by-id of a whole scene.
    pub fn replace_scene(&self, scene: Scene) -> EngineResult<()> {
        let id = scene.id;
        {
            let mut state = self.state.lock().unwrap();
            let slot = state
                .scenes
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or(EngineError::not_found("scene", id))?;
            *slot = scene;
        }
        self.notify(SceneEvent::SceneReplaced(id));
        Ok(())
    }

    /// Mutate one scene in place under the store lock.
    ///
    /// `f` must validate before it mutates: on `Err` the scene is assumed
    /// untouched and no notification is sent.
    pub fn update_scene(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut Scene) -> EngineResult<()>,
    ) -> EngineResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let scene = state
                .scenes
                .iter_mut()
                .find(|s| s.id == id)
                .ok_or(EngineError::not_found("scene", id))?;
            f(scene)?;
        }
        self.notify(SceneEvent::SceneReplaced(id));
        Ok(())
    }

    pub fn set_active_scene(&self, id: Option<Uuid>) {
        self.state.lock().unwrap().active = id;
        self.notify(SceneEvent::ActiveSceneChanged);
    }

    /// Snapshot of the full scene list (for command undo).
    pub fn snapshot(&self) -> Vec<Scene> {
        self.state.lock().unwrap().scenes.clone()
    }

    /// Restore a previously taken snapshot wholesale.
    pub fn restore(&self, scenes: Vec<Scene>) {
        {
            let mut state = self.state.lock().unwrap();
            let active_still_there = state
                .active
                .map(|id| scenes.iter().any(|s| s.id == id))
                .unwrap_or(false);
            if !active_still_there {
                state.active = scenes.first().map(|s| s.id);
            }
            state.scenes = scenes;
        }
        self.notify(SceneEvent::ScenesRestored);
    }

    // --- Media library ---

    pub fn assets(&self) -> Vec<MediaAsset> {
        self.state.lock().unwrap().assets.clone()
    }

    pub fn asset_by_id(&self, id: Uuid) -> Option<MediaAsset> {
        self.state
            .lock()
            .unwrap()
            .assets
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    pub fn upsert_asset(&self, asset: MediaAsset) {
        {
            let mut state = self.state.lock().unwrap();
            if let Some(slot) = state.assets.iter_mut().find(|a| a.id == asset.id) {
                *slot = asset;
            } else {
                state.assets.push(asset);
            }
        }
        self.notify(SceneEvent::AssetsChanged);
    }

    pub fn remove_asset(&self, id: Uuid) -> EngineResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            let before = state.assets.len();
            state.assets.retain(|a| a.id != id);
            if state.assets.len() == before {
                return Err(EngineError::not_found("asset", id));
            }
        }
        self.notify(SceneEvent::AssetsChanged);
        Ok(())
    }

    /// Replace the media library wholesale (project load).
    pub fn restore_assets(&self, assets: Vec<MediaAsset>) {
        self.state.lock().unwrap().assets = assets;
        self.notify(SceneEvent::AssetsChanged);
    }
}
