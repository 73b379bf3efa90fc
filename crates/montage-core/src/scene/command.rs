//! Scene mutation commands and the undo/redo stack
//!
//! Every edit is a value object applied atomically to one scene. The
//! stack snapshots the scene list before execution and restores it
//! wholesale on undo; redo replays forward the same way. A command that
//! fails validation leaves the scene untouched and the stacks unchanged.

use std::sync::Arc;

use uuid::Uuid;

use super::store::SceneManager;
use super::{now_secs, validate_element, Element, Scene, Track};
use crate::automation::{AutomationMarker, AutomationState};
use crate::error::{EngineError, EngineResult};
use crate::oneshot::{OneshotDefinition, OneshotMarker};
use crate::sidechain::SidechainConfig;

/// An atomic edit against the scene list
///
/// Add variants insert, Update variants require the id to exist (NotFound
/// otherwise), Remove variants delete. All validation runs before any
/// mutation.
#[derive(Debug, Clone)]
pub enum SceneCommand {
    AddScene { scene: Scene },
    RemoveScene { scene_id: Uuid },

    AddTrack { scene_id: Uuid, track: Track },
    RemoveTrack { scene_id: Uuid, track_id: Uuid },

    AddElement { scene_id: Uuid, track_id: Uuid, element: Element },
    UpdateElement { scene_id: Uuid, track_id: Uuid, element: Element },
    RemoveElement { scene_id: Uuid, track_id: Uuid, element_id: Uuid },

    AddOneshotDefinition { scene_id: Uuid, definition: OneshotDefinition },
    UpdateOneshotDefinition { scene_id: Uuid, definition: OneshotDefinition },
    /// Also removes the definition's markers
    RemoveOneshotDefinition { scene_id: Uuid, definition_id: Uuid },

    AddOneshotMarker { scene_id: Uuid, marker: OneshotMarker },
    UpdateOneshotMarker { scene_id: Uuid, marker: OneshotMarker },
    RemoveOneshotMarker { scene_id: Uuid, marker_id: Uuid },

    AddAutomationState { scene_id: Uuid, state: AutomationState },
    UpdateAutomationState { scene_id: Uuid, state: AutomationState },
    /// Also removes markers referencing the state
    RemoveAutomationState { scene_id: Uuid, state_id: Uuid },

    AddAutomationMarker { scene_id: Uuid, marker: AutomationMarker },
    RemoveAutomationMarker { scene_id: Uuid, marker_id: Uuid },

    AddSidechainConfig { scene_id: Uuid, config: SidechainConfig },
    UpdateSidechainConfig { scene_id: Uuid, config: SidechainConfig },
    RemoveSidechainConfig { scene_id: Uuid, config_id: Uuid },
}

impl SceneCommand {
    /// Short label for history UIs and logs.
    pub fn label(&self) -> &'static str {
        match self {
            SceneCommand::AddScene { .. } => "add scene",
            SceneCommand::RemoveScene { .. } => "remove scene",
            SceneCommand::AddTrack { .. } => "add track",
            SceneCommand::RemoveTrack { .. } => "remove track",
            SceneCommand::AddElement { .. } => "add element",
            SceneCommand::UpdateElement { .. } => "update element",
            SceneCommand::RemoveElement { .. } => "remove element",
            SceneCommand::AddOneshotDefinition { .. } => "add one-shot",
            SceneCommand::UpdateOneshotDefinition { .. } => "update one-shot",
            SceneCommand::RemoveOneshotDefinition { .. } => "remove one-shot",
            SceneCommand::AddOneshotMarker { .. } => "add one-shot marker",
            SceneCommand::UpdateOneshotMarker { .. } => "update one-shot marker",
            SceneCommand::RemoveOneshotMarker { .. } => "remove one-shot marker",
            SceneCommand::AddAutomationState { .. } => "add automation state",
            SceneCommand::UpdateAutomationState { .. } => "update automation state",
            SceneCommand::RemoveAutomationState { .. } => "remove automation state",
            SceneCommand::AddAutomationMarker { .. } => "add automation marker",
            SceneCommand::RemoveAutomationMarker { .. } => "remove automation marker",
            SceneCommand::AddSidechainConfig { .. } => "add sidechain",
            SceneCommand::UpdateSidechainConfig { .. } => "update sidechain",
            SceneCommand::RemoveSidechainConfig { .. } => "remove sidechain",
        }
    }

    /// Apply the command to the store.
    pub fn execute(&self, manager: &SceneManager) -> EngineResult<()> {
        match self {
            SceneCommand::AddScene { scene } => {
                manager.add_scene(scene.clone());
                Ok(())
            }
            SceneCommand::RemoveScene { scene_id } => manager.remove_scene(*scene_id),

            SceneCommand::AddTrack { scene_id, track } => {
                let track = track.clone();
                manager.update_scene(*scene_id, move |scene| {
                    let mut seen = std::collections::HashSet::new();
                    for e in &track.elements {
                        if !seen.insert(e.id()) {
                            return Err(EngineError::invariant(format!(
                                "duplicate element id {} in track {}",
                                e.id(),
                                track.id
                            )));
                        }
                    }
                    scene.tracks.push(track);
                    Ok(())
                })
            }
            SceneCommand::RemoveTrack { scene_id, track_id } => {
                let track_id = *track_id;
                manager.update_scene(*scene_id, move |scene| {
                    let before = scene.tracks.len();
                    scene.tracks.retain(|t| t.id != track_id);
                    if scene.tracks.len() == before {
                        return Err(EngineError::not_found("track", track_id));
                    }
                    Ok(())
                })
            }

            SceneCommand::AddElement { scene_id, track_id, element } => {
                let source = manager.asset_duration_for(element);
                let (track_id, element) = (*track_id, element.clone());
                manager.update_scene(*scene_id, move |scene| {
                    validate_element(&element, source)?;
                    let track = scene
                        .track_by_id_mut(track_id)
                        .ok_or(EngineError::not_found("track", track_id))?;
                    if track.element_by_id(element.id()).is_some() {
                        return Err(EngineError::invariant(format!(
                            "element id {} already on track {}",
                            element.id(),
                            track_id
                        )));
                    }
                    track.elements.push(element);
                    Ok(())
                })
            }
            SceneCommand::UpdateElement { scene_id, track_id, element } => {
                let source = manager.asset_duration_for(element);
                let (track_id, element) = (*track_id, element.clone());
                manager.update_scene(*scene_id, move |scene| {
                    validate_element(&element, source)?;
                    let track = scene
                        .track_by_id_mut(track_id)
                        .ok_or(EngineError::not_found("track", track_id))?;
                    let slot = track
                        .element_by_id_mut(element.id())
                        .ok_or(EngineError::not_found("element", element.id()))?;
                    *slot = element;
                    Ok(())
                })
            }
            SceneCommand::RemoveElement { scene_id, track_id, element_id } => {
                let (track_id, element_id) = (*track_id, *element_id);
                manager.update_scene(*scene_id, move |scene| {
                    let track = scene
                        .track_by_id_mut(track_id)
                        .ok_or(EngineError::not_found("track", track_id))?;
                    let before = track.elements.len();
                    track.elements.retain(|e| e.id() != element_id);
                    if track.elements.len() == before {
                        return Err(EngineError::not_found("element", element_id));
                    }
                    Ok(())
                })
            }

            SceneCommand::AddOneshotDefinition { scene_id, definition } => {
                let definition = definition.clone();
                manager.update_scene(*scene_id, move |scene| {
                    definition.validate()?;
                    scene.oneshot_definitions.push(definition);
                    Ok(())
                })
            }
            SceneCommand::UpdateOneshotDefinition { scene_id, definition } => {
                let mut definition = definition.clone();
                manager.update_scene(*scene_id, move |scene| {
                    definition.validate()?;
                    let slot = scene
                        .oneshot_definitions
                        .iter_mut()
                        .find(|d| d.id == definition.id)
                        .ok_or(EngineError::not_found("one-shot definition", definition.id))?;
                    definition.updated_at = now_secs();
                    *slot = definition;
                    Ok(())
                })
            }
            SceneCommand::RemoveOneshotDefinition { scene_id, definition_id } => {
                let definition_id = *definition_id;
                manager.update_scene(*scene_id, move |scene| {
                    let before = scene.oneshot_definitions.len();
                    scene.oneshot_definitions.retain(|d| d.id != definition_id);
                    if scene.oneshot_definitions.len() == before {
                        return Err(EngineError::not_found("one-shot definition", definition_id));
                    }
                    scene.oneshot_markers.retain(|m| m.oneshot_id != definition_id);
                    Ok(())
                })
            }

            SceneCommand::AddOneshotMarker { scene_id, marker } => {
                let marker = marker.clone();
                manager.update_scene(*scene_id, move |scene| {
                    marker.validate()?;
                    if scene.definition_by_id(marker.oneshot_id).is_none() {
                        return Err(EngineError::not_found("one-shot definition", marker.oneshot_id));
                    }
                    scene.oneshot_markers.push(marker);
                    Ok(())
                })
            }
            SceneCommand::UpdateOneshotMarker { scene_id, marker } => {
                let marker = marker.clone();
                manager.update_scene(*scene_id, move |scene| {
                    marker.validate()?;
                    let slot = scene
                        .oneshot_markers
                        .iter_mut()
                        .find(|m| m.id == marker.id)
                        .ok_or(EngineError::not_found("one-shot marker", marker.id))?;
                    *slot = marker;
                    Ok(())
                })
            }
            SceneCommand::RemoveOneshotMarker { scene_id, marker_id } => {
                let marker_id = *marker_id;
                manager.update_scene(*scene_id, move |scene| {
                    let before = scene.oneshot_markers.len();
                    scene.oneshot_markers.retain(|m| m.id != marker_id);
                    if scene.oneshot_markers.len() == before {
                        return Err(EngineError::not_found("one-shot marker", marker_id));
                    }
                    Ok(())
                })
            }

            SceneCommand::AddAutomationState { scene_id, state } => {
                let state = state.clone();
                manager.update_scene(*scene_id, move |scene| {
                    state.validate()?;
                    scene.automation_states.push(state);
                    Ok(())
                })
            }
            SceneCommand::UpdateAutomationState { scene_id, state } => {
                let state = state.clone();
                manager.update_scene(*scene_id, move |scene| {
                    state.validate()?;
                    let slot = scene
                        .automation_states
                        .iter_mut()
                        .find(|s| s.id == state.id)
                        .ok_or(EngineError::not_found("automation state", state.id))?;
                    *slot = state;
                    Ok(())
                })
            }
            SceneCommand::RemoveAutomationState { scene_id, state_id } => {
                let state_id = *state_id;
                manager.update_scene(*scene_id, move |scene| {
                    let before = scene.automation_states.len();
                    scene.automation_states.retain(|s| s.id != state_id);
                    if scene.automation_states.len() == before {
                        return Err(EngineError::not_found("automation state", state_id));
                    }
                    scene.automation_markers.retain(|m| m.state_id() != state_id);
                    Ok(())
                })
            }

            SceneCommand::AddAutomationMarker { scene_id, marker } => {
                let marker = marker.clone();
                manager.update_scene(*scene_id, move |scene| {
                    if scene.state_by_id(marker.state_id()).is_none() {
                        return Err(EngineError::not_found("automation state", marker.state_id()));
                    }
                    scene.automation_markers.push(marker);
                    Ok(())
                })
            }
            SceneCommand::RemoveAutomationMarker { scene_id, marker_id } => {
                let marker_id = *marker_id;
                manager.update_scene(*scene_id, move |scene| {
                    let before = scene.automation_markers.len();
                    scene.automation_markers.retain(|m| m.id() != marker_id);
                    if scene.automation_markers.len() == before {
                        return Err(EngineError::not_found("automation marker", marker_id));
                    }
                    Ok(())
                })
            }

            SceneCommand::AddSidechainConfig { scene_id, config } => {
                let config = config.clone();
                manager.update_scene(*scene_id, move |scene| {
                    config.validate()?;
                    scene.sidechain_configs.push(config);
                    Ok(())
                })
            }
            SceneCommand::UpdateSidechainConfig { scene_id, config } => {
                let mut config = config.clone();
                manager.update_scene(*scene_id, move |scene| {
                    config.validate()?;
                    let slot = scene
                        .sidechain_configs
                        .iter_mut()
                        .find(|c| c.id == config.id)
                        .ok_or(EngineError::not_found("sidechain config", config.id))?;
                    config.updated_at = now_secs();
                    *slot = config;
                    Ok(())
                })
            }
            SceneCommand::RemoveSidechainConfig { scene_id, config_id } => {
                let config_id = *config_id;
                manager.update_scene(*scene_id, move |scene| {
                    let before = scene.sidechain_configs.len();
                    scene.sidechain_configs.retain(|c| c.id != config_id);
                    if scene.sidechain_configs.len() == before {
                        return Err(EngineError::not_found("sidechain config", config_id));
                    }
                    Ok(())
                })
            }
        }
    }
}

impl SceneManager {
    /// Source duration for an element's media asset, when it is known.
    fn asset_duration_for(&self, element: &Element) -> Option<f64> {
        let media_id = match element {
            Element::Audio(e) => e.media_id,
            Element::Video(e) => e.media_id,
            Element::Image(e) => e.media_id,
            Element::Sticker(e) => e.media_id,
            Element::Text(_) => return None,
        };
        self.asset_by_id(media_id).map(|a| a.duration)
    }
}

/// One executed command plus the scene list as it was before it ran
struct HistoryEntry {
    command: SceneCommand,
    snapshot: Vec<Scene>,
}

/// LIFO undo history with a redo stack
///
/// Undo restores the pre-execute snapshot wholesale; executing a new
/// command clears redo.
pub struct CommandStack {
    manager: Arc<SceneManager>,
    undo: Vec<HistoryEntry>,
    redo: Vec<HistoryEntry>,
}

impl CommandStack {
    pub fn new(manager: Arc<SceneManager>) -> Self {
        Self {
            manager,
            undo: Vec::new(),
            redo: Vec::new(),
        }
    }

    /// Execute a command, recording it for undo on success.
    pub fn execute(&mut self, command: SceneCommand) -> EngineResult<()> {
        let snapshot = self.manager.snapshot();
        command.execute(&self.manager)?;
        self.undo.push(HistoryEntry { command, snapshot });
        self.redo.clear();
        Ok(())
    }

    /// Undo the most recent command. Returns false with an empty history.
    pub fn undo(&mut self) -> bool {
        let Some(entry) = self.undo.pop() else {
            return false;
        };
        let current = self.manager.snapshot();
        self.manager.restore(entry.snapshot);
        self.redo.push(HistoryEntry {
            command: entry.command,
            snapshot: current,
        });
        true
    }

    /// Redo the most recently undone command.
    pub fn redo(&mut self) -> bool {
        let Some(entry) = self.redo.pop() else {
            return false;
        };
        let current = self.manager.snapshot();
        self.manager.restore(entry.snapshot);
        self.undo.push(HistoryEntry {
            command: entry.command,
            snapshot: current,
        });
        true
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }
}
