//! Scene data model
//!
//! Scenes are the aggregate roots of the editor: ordered tracks of timeline
//! elements plus the one-shot, automation and sidechain collections that
//! the managers present views over. All mutation goes through commands
//! (see [`command`]); managers never hold references into scene data.

pub mod command;
pub mod persist;
pub mod store;

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::automation::{AutomationMarker, AutomationState};
use crate::error::{EngineError, EngineResult};
use crate::oneshot::{OneshotDefinition, OneshotMarker};
use crate::sidechain::SidechainConfig;

/// Current unix time in whole seconds, used for created/updated stamps.
pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Kind of a media library asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
    Image,
}

/// An imported media file in the project library
///
/// `source_path` is the durable blob handle the media provider resolves;
/// `duration` is the natural duration of the source in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: Uuid,
    pub kind: MediaKind,
    pub source_path: PathBuf,
    pub name: String,
    pub duration: f64,
}

/// Kind of a timeline track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    Text,
    Sticker,
}

/// A timeline track, ordered by render-stacking order within the scene
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: Uuid,
    pub kind: TrackKind,
    pub name: String,
    #[serde(default)]
    pub hidden: bool,
    /// The one track flagged for main-track stacking, if any
    #[serde(default)]
    pub is_main: bool,
    #[serde(default)]
    pub elements: Vec<Element>,
}

impl Track {
    pub fn new(kind: TrackKind, name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            name: name.into(),
            hidden: false,
            is_main: false,
            elements: Vec::new(),
        }
    }

    pub fn element_by_id(&self, id: Uuid) -> Option<&Element> {
        self.elements.iter().find(|e| e.id() == id)
    }

    pub fn element_by_id_mut(&mut self, id: Uuid) -> Option<&mut Element> {
        self.elements.iter_mut().find(|e| e.id() == id)
    }
}

/// Timeline placement shared by every element kind
///
/// `start_time` and `duration` are timeline seconds; `trim_start` and
/// `trim_end` are seconds within the source media.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Placement {
    pub id: Uuid,
    pub start_time: f64,
    pub duration: f64,
    #[serde(default)]
    pub trim_start: f64,
    #[serde(default)]
    pub trim_end: f64,
    #[serde(default)]
    pub hidden: bool,
}

impl Placement {
    pub fn new(start_time: f64, duration: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            start_time,
            duration,
            trim_start: 0.0,
            trim_end: duration,
            hidden: false,
        }
    }

    /// Timeline end of the element.
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// An audio clip on a timeline track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioElement {
    #[serde(flatten)]
    pub placement: Placement,
    pub media_id: Uuid,
    /// Clip volume in [0, 1]
    pub base_volume: f32,
    /// Repeat the trimmed slice until the timeline end
    #[serde(rename = "loop", default)]
    pub looped: bool,
}

/// A video clip on a timeline track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoElement {
    #[serde(flatten)]
    pub placement: Placement,
    pub media_id: Uuid,
}

/// A still image on a timeline track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageElement {
    #[serde(flatten)]
    pub placement: Placement,
    pub media_id: Uuid,
}

/// A text overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextElement {
    #[serde(flatten)]
    pub placement: Placement,
    pub content: String,
}

/// A sticker overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickerElement {
    #[serde(flatten)]
    pub placement: Placement,
    pub media_id: Uuid,
}

/// A timeline element, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Element {
    Video(VideoElement),
    Image(ImageElement),
    Audio(AudioElement),
    Text(TextElement),
    Sticker(StickerElement),
}

impl Element {
    pub fn placement(&self) -> &Placement {
        match self {
            Element::Video(e) => &e.placement,
            Element::Image(e) => &e.placement,
            Element::Audio(e) => &e.placement,
            Element::Text(e) => &e.placement,
            Element::Sticker(e) => &e.placement,
        }
    }

    pub fn id(&self) -> Uuid {
        self.placement().id
    }

    pub fn start_time(&self) -> f64 {
        self.placement().start_time
    }

    pub fn duration(&self) -> f64 {
        self.placement().duration
    }

    pub fn is_hidden(&self) -> bool {
        self.placement().hidden
    }

    pub fn as_audio(&self) -> Option<&AudioElement> {
        match self {
            Element::Audio(e) => Some(e),
            _ => None,
        }
    }
}

/// The edit-session aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub oneshot_definitions: Vec<OneshotDefinition>,
    #[serde(default)]
    pub oneshot_markers: Vec<OneshotMarker>,
    #[serde(default)]
    pub automation_states: Vec<AutomationState>,
    #[serde(default)]
    pub automation_markers: Vec<AutomationMarker>,
    #[serde(default)]
    pub sidechain_configs: Vec<SidechainConfig>,
}

impl Scene {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            tracks: Vec::new(),
            oneshot_definitions: Vec::new(),
            oneshot_markers: Vec::new(),
            automation_states: Vec::new(),
            automation_markers: Vec::new(),
            sidechain_configs: Vec::new(),
        }
    }

    pub fn track_by_id(&self, id: Uuid) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn track_by_id_mut(&mut self, id: Uuid) -> Option<&mut Track> {
        self.tracks.iter_mut().find(|t| t.id == id)
    }

    /// Look an element up across every track.
    pub fn element_by_id(&self, id: Uuid) -> Option<(&Track, &Element)> {
        self.tracks
            .iter()
            .find_map(|t| t.element_by_id(id).map(|e| (t, e)))
    }

    pub fn definition_by_id(&self, id: Uuid) -> Option<&OneshotDefinition> {
        self.oneshot_definitions.iter().find(|d| d.id == id)
    }

    pub fn marker_by_id(&self, id: Uuid) -> Option<&OneshotMarker> {
        self.oneshot_markers.iter().find(|m| m.id == id)
    }

    pub fn state_by_id(&self, id: Uuid) -> Option<&AutomationState> {
        self.automation_states.iter().find(|s| s.id == id)
    }

    pub fn config_by_id(&self, id: Uuid) -> Option<&SidechainConfig> {
        self.sidechain_configs.iter().find(|c| c.id == id)
    }

    /// Total timeline duration: the furthest element end across all tracks.
    pub fn total_duration(&self) -> f64 {
        self.tracks
            .iter()
            .flat_map(|t| t.elements.iter())
            .map(|e| e.placement().end_time())
            .fold(0.0, f64::max)
    }
}

/// Check an element's trim/duration invariants before it enters a scene.
///
/// `source_duration` comes from the media asset when one is known; trim
/// bounds against the source are only enforceable when it is present.
pub fn validate_element(element: &Element, source_duration: Option<f64>) -> EngineResult<()> {
    let p = element.placement();
    if !(p.duration > 0.0) {
        return Err(EngineError::invariant(format!(
            "element {} duration must be positive",
            p.id
        )));
    }
    if p.trim_start < 0.0 || p.trim_end < p.trim_start {
        return Err(EngineError::invariant(format!(
            "element {} trim window [{}, {}] out of order",
            p.id, p.trim_start, p.trim_end
        )));
    }
    if let Some(source) = source_duration {
        if p.trim_end > source + 1e-9 {
            return Err(EngineError::invariant(format!(
                "element {} trim end {} exceeds source duration {}",
                p.id, p.trim_end, source
            )));
        }
    }
    if let Some(audio) = element.as_audio() {
        if !(0.0..=1.0).contains(&audio.base_volume) {
            return Err(EngineError::invariant(format!(
                "element {} volume {} outside [0, 1]",
                p.id, audio.base_volume
            )));
        }
    }
    Ok(())
}
