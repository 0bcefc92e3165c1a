//! # deck-core: Presentation deck data model
//!
//! Plain value types shared by the sync layer and its consumers:
//! deck metadata, slides, components, edit patches and presence.
//! Nothing here performs I/O; every type round-trips through serde so
//! the sync layer can store records inside CRDT maps as JSON strings.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub mod presence;

pub use presence::{CursorPosition, PresenceState, SelectionState};

/// Free-form component/background properties.
pub type Properties = Map<String, Value>;

/// Type tag reserved for a slide's base element.
pub const BACKGROUND_TYPE: &str = "background";

/// Id prefix reserved for a slide's base element.
pub const BACKGROUND_PREFIX: &str = "bg-";

/// Milliseconds since the Unix epoch.
///
/// Lease expiry and presence timestamps are compared across actors, so they
/// use wall-clock time rather than `Instant`.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a fresh globally unique element id.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Returns true if `id` names a slide's base element.
pub fn is_base_element_id(id: &str) -> bool {
    id.starts_with(BACKGROUND_PREFIX) || id == BACKGROUND_TYPE
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct DeckMetadata {
    pub deck_id: String,
    pub name: String,
    pub version: u64,
    /// Number of slides in the deck.
    pub size: u64,
    pub last_modified: u64,
}

impl DeckMetadata {
    pub fn new(deck_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            deck_id: deck_id.into(),
            name: name.into(),
            version: 1,
            size: 0,
            last_modified: now_millis(),
        }
    }
}

/// The non-deletable base element every slide carries.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct BackgroundElement {
    pub id: String,
    #[serde(default)]
    pub props: Properties,
}

impl BackgroundElement {
    pub fn for_slide(slide_id: &str) -> Self {
        Self {
            id: format!("{BACKGROUND_PREFIX}{slide_id}"),
            props: Properties::new(),
        }
    }
}

/// A slide as stored in its shard.
///
/// Components are referenced by id; their records live in the shard's
/// component map so two slides can never own the same live component.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SlideRecord {
    pub id: String,
    pub title: String,
    pub background: BackgroundElement,
    #[serde(default)]
    pub component_ids: Vec<String>,
}

impl SlideRecord {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let id = id.into();
        let background = BackgroundElement::for_slide(&id);
        Self {
            id,
            title: title.into(),
            background,
            component_ids: Vec::new(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct ComponentRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub component_type: String,
    #[serde(default)]
    pub props: Properties,
}

impl ComponentRecord {
    pub fn new(id: impl Into<String>, component_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            component_type: component_type.into(),
            props: Properties::new(),
        }
    }

    pub fn with_prop(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    /// Background/base elements are never removable through component CRUD.
    pub fn is_base_element(&self) -> bool {
        self.component_type == BACKGROUND_TYPE || is_base_element_id(&self.id)
    }
}

/// Partial update for a slide. `None` fields are left untouched.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct SlidePatch {
    pub title: Option<String>,
    /// Properties merged into the background element.
    pub background: Option<Properties>,
}

impl SlidePatch {
    pub fn title(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            background: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.background.is_none()
    }

    pub fn apply(&self, slide: &mut SlideRecord) {
        if let Some(title) = &self.title {
            slide.title = title.clone();
        }
        if let Some(props) = &self.background {
            for (k, v) in props {
                slide.background.props.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Partial update for a component: merged properties, removed keys and an
/// optional new type tag.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct ComponentPatch {
    pub component_type: Option<String>,
    #[serde(default)]
    pub props: Properties,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl ComponentPatch {
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.props.insert(key.into(), value.into());
        self
    }

    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.remove.push(key.into());
        self
    }

    pub fn apply(&self, component: &mut ComponentRecord) {
        if let Some(t) = &self.component_type {
            component.component_type = t.clone();
        }
        for key in &self.remove {
            component.props.remove(key);
        }
        for (k, v) in &self.props {
            component.props.insert(k.clone(), v.clone());
        }
    }
}

/// Partial update for deck metadata.
#[derive(Clone, Serialize, Deserialize, Debug, Default, PartialEq)]
pub struct MetadataPatch {
    pub name: Option<String>,
}

/// Everything the UI needs to render one slide.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct SlideData {
    pub slide: SlideRecord,
    /// Components in slide order.
    pub components: Vec<ComponentRecord>,
}

impl SlideData {
    pub fn component(&self, id: &str) -> Option<&ComponentRecord> {
        self.components.iter().find(|c| c.id == id)
    }
}
