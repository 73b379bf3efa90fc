//! Volume automation: states, markers and the effective-volume query
//!
//! An automation state is a named bundle of volume operations; markers
//! activate states either for the lifetime of a timeline element (range)
//! or from a point in time forward (point). Application is strictly
//! last-wins: states are ordered and each matching operation overwrites
//! the running volume.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::scene::store::SceneManager;

/// A single operation inside an automation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum AutomationOperation {
    /// Set a track's volume to `value` (0..=100)
    AudioVolume { id: Uuid, track_id: Uuid, value: f32 },
}

/// A named bundle of automation operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutomationState {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub operations: Vec<AutomationOperation>,
}

impl AutomationState {
    pub fn validate(&self) -> EngineResult<()> {
        for op in &self.operations {
            let AutomationOperation::AudioVolume { id, value, .. } = op;
            if !(0.0..=100.0).contains(value) {
                return Err(EngineError::invariant(format!(
                    "operation {}: volume {} outside [0, 100]",
                    id, value
                )));
            }
        }
        Ok(())
    }
}

/// A timeline activation of an automation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AutomationMarker {
    /// Active while the referenced element is active
    Range {
        id: Uuid,
        state_id: Uuid,
        track_id: Uuid,
        element_id: Uuid,
        created_at: i64,
    },
    /// Active from `time` forward until overridden
    Point {
        id: Uuid,
        state_id: Uuid,
        time: f64,
        created_at: i64,
    },
}

impl AutomationMarker {
    pub fn id(&self) -> Uuid {
        match self {
            AutomationMarker::Range { id, .. } | AutomationMarker::Point { id, .. } => *id,
        }
    }

    pub fn state_id(&self) -> Uuid {
        match self {
            AutomationMarker::Range { state_id, .. } | AutomationMarker::Point { state_id, .. } => {
                *state_id
            }
        }
    }
}

/// View over the active scene's automation collections
pub struct AutomationManager {
    scene: Arc<SceneManager>,
}

impl AutomationManager {
    pub fn new(scene: Arc<SceneManager>) -> Self {
        Self { scene }
    }

    /// Effective volume for an element at time `t`, starting from
    /// `base_volume` (both in the 0..=100 operation domain).
    ///
    /// Point states apply in time order (deduplicated by state id, most
    /// recent activation wins), then range states on top. Within each
    /// state, every operation targeting the track overwrites the running
    /// value; there is no blending.
    pub fn effective_volume(
        &self,
        track_id: Uuid,
        element_id: Uuid,
        t: f64,
        base_volume: f32,
    ) -> f32 {
        self.scene
            .with_active_scene(|scene| {
                // Point markers at or before t, most recent per state.
                let mut points: Vec<(f64, Uuid)> = Vec::new();
                for marker in &scene.automation_markers {
                    if let AutomationMarker::Point { state_id, time, .. } = marker {
                        if *time <= t {
                            match points.iter_mut().find(|(_, sid)| sid == state_id) {
                                Some(entry) if entry.0 < *time => entry.0 = *time,
                                Some(_) => {}
                                None => points.push((*time, *state_id)),
                            }
                        }
                    }
                }
                points.sort_by(|a, b| a.0.total_cmp(&b.0));

                // Range markers whose element is this one, or is currently
                // active at t on the same track.
                let mut ranges: Vec<Uuid> = Vec::new();
                for marker in &scene.automation_markers {
                    if let AutomationMarker::Range {
                        state_id,
                        track_id: m_track,
                        element_id: m_element,
                        ..
                    } = marker
                    {
                        if *m_track != track_id {
                            continue;
                        }
                        let active = *m_element == element_id
                            || scene
                                .element_by_id(*m_element)
                                .map(|(_, e)| {
                                    let p = e.placement();
                                    t >= p.start_time && t < p.end_time()
                                })
                                .unwrap_or(false);
                        if active {
                            ranges.push(*state_id);
                        }
                    }
                }

                let ordered = points
                    .into_iter()
                    .map(|(_, sid)| sid)
                    .chain(ranges.into_iter());

                let mut volume = base_volume;
                for state_id in ordered {
                    let Some(state) = scene.state_by_id(state_id) else {
                        continue;
                    };
                    for op in &state.operations {
                        let AutomationOperation::AudioVolume {
                            track_id: op_track,
                            value,
                            ..
                        } = op;
                        if *op_track == track_id {
                            volume = *value;
                        }
                    }
                }
                volume
            })
            .unwrap_or(base_volume)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{now_secs, AudioElement, Element, Placement, Scene, Track, TrackKind};

    fn state_for(track_id: Uuid, value: f32) -> AutomationState {
        AutomationState {
            id: Uuid::new_v4(),
            name: format!("vol {}", value),
            description: String::new(),
            operations: vec![AutomationOperation::AudioVolume {
                id: Uuid::new_v4(),
                track_id,
                value,
            }],
        }
    }

    fn point(state_id: Uuid, time: f64) -> AutomationMarker {
        AutomationMarker::Point {
            id: Uuid::new_v4(),
            state_id,
            time,
            created_at: now_secs(),
        }
    }

    fn setup(
        states: Vec<AutomationState>,
        markers: Vec<AutomationMarker>,
        tracks: Vec<Track>,
    ) -> AutomationManager {
        let mgr = Arc::new(SceneManager::new());
        let mut scene = Scene::new("test");
        scene.automation_states = states;
        scene.automation_markers = markers;
        scene.tracks = tracks;
        mgr.add_scene(scene);
        AutomationManager::new(mgr)
    }

    #[test]
    fn test_point_markers_last_wins() {
        // Two point markers: t=1 sets 30, t=2 sets 70. At t=3 the later
        // state wins over both the earlier one and the base volume.
        let track_id = Uuid::new_v4();
        let a = state_for(track_id, 30.0);
        let b = state_for(track_id, 70.0);
        let markers = vec![point(a.id, 1.0), point(b.id, 2.0)];
        let mgr = setup(vec![a, b], markers, vec![]);

        let v = mgr.effective_volume(track_id, Uuid::new_v4(), 3.0, 50.0);
        assert_eq!(v, 70.0);
    }

    #[test]
    fn test_point_marker_not_yet_active() {
        let track_id = Uuid::new_v4();
        let a = state_for(track_id, 30.0);
        let markers = vec![point(a.id, 5.0)];
        let mgr = setup(vec![a], markers, vec![]);

        assert_eq!(mgr.effective_volume(track_id, Uuid::new_v4(), 3.0, 50.0), 50.0);
    }

    #[test]
    fn test_duplicate_state_keeps_most_recent() {
        // Re-activating the same state later does not double-apply it; the
        // most recent activation determines its order slot.
        let track_id = Uuid::new_v4();
        let a = state_for(track_id, 30.0);
        let b = state_for(track_id, 70.0);
        let markers = vec![point(a.id, 1.0), point(b.id, 2.0), point(a.id, 4.0)];
        let mgr = setup(vec![a, b], markers, vec![]);

        // At t=5 state A was re-activated after B: A wins.
        assert_eq!(mgr.effective_volume(track_id, Uuid::new_v4(), 5.0, 50.0), 30.0);
    }

    #[test]
    fn test_range_marker_takes_precedence() {
        let mut track = Track::new(TrackKind::Audio, "a");
        let element = AudioElement {
            placement: Placement::new(0.0, 10.0),
            media_id: Uuid::new_v4(),
            base_volume: 1.0,
            looped: false,
        };
        let element_id = element.placement.id;
        track.elements.push(Element::Audio(element));
        let track_id = track.id;

        let low = state_for(track_id, 10.0);
        let high = state_for(track_id, 90.0);
        let markers = vec![
            point(high.id, 0.0),
            AutomationMarker::Range {
                id: Uuid::new_v4(),
                state_id: low.id,
                track_id,
                element_id,
                created_at: now_secs(),
            },
        ];
        let mgr = setup(vec![low, high], markers, vec![track]);

        // Range automation is applied after points, so it wins while the
        // element is active.
        assert_eq!(mgr.effective_volume(track_id, element_id, 5.0, 50.0), 10.0);
    }

    #[test]
    fn test_range_marker_matches_by_active_window() {
        // A range marker for another element on the same track applies
        // while that element is active at t.
        let mut track = Track::new(TrackKind::Audio, "a");
        let other = AudioElement {
            placement: Placement::new(2.0, 3.0),
            media_id: Uuid::new_v4(),
            base_volume: 1.0,
            looped: false,
        };
        let other_id = other.placement.id;
        track.elements.push(Element::Audio(other));
        let track_id = track.id;

        let ducked = state_for(track_id, 20.0);
        let markers = vec![AutomationMarker::Range {
            id: Uuid::new_v4(),
            state_id: ducked.id,
            track_id,
            element_id: other_id,
            created_at: now_secs(),
        }];
        let mgr = setup(vec![ducked], markers, vec![track]);

        let queried = Uuid::new_v4();
        assert_eq!(mgr.effective_volume(track_id, queried, 3.0, 80.0), 20.0);
        // Outside [2, 5) the element is inactive and base volume holds.
        assert_eq!(mgr.effective_volume(track_id, queried, 6.0, 80.0), 80.0);
    }

    #[test]
    fn test_operations_only_affect_their_track() {
        let track_id = Uuid::new_v4();
        let other_track = Uuid::new_v4();
        let a = state_for(other_track, 5.0);
        let markers = vec![point(a.id, 0.0)];
        let mgr = setup(vec![a], markers, vec![]);

        assert_eq!(mgr.effective_volume(track_id, Uuid::new_v4(), 1.0, 64.0), 64.0);
    }

    #[test]
    fn test_state_validation() {
        let track_id = Uuid::new_v4();
        assert!(state_for(track_id, 100.0).validate().is_ok());
        assert!(state_for(track_id, 101.0).validate().is_err());
        assert!(state_for(track_id, -1.0).validate().is_err());
    }
}
