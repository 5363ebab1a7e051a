//! `ActivityPub` object model.
//!
//! Inbound JSON is parsed leniently into these types: single-or-array fields
//! go through [`OneOrMany`], references that may be either a bare URI or an
//! embedded object go through [`ObjectRef`], and anything fetched or embedded
//! is classified into the closed [`RemoteObject`] sum.

#![allow(missing_docs)]

mod note;

pub use note::{ApAttachment, ApNote, ApPollOption, ApPollReplies, ApTag};

use activitypub_federation::kinds::object::TombstoneType;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use url::Url;

use crate::activities::{Activity, ActivityKind};
use crate::actors::ApActor;
use crate::error::{FederationError, FederationResult};

/// ActivityStreams namespace.
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";

/// Object types treated as posts.
pub const POST_TYPES: &[&str] = &[
    "Note", "Question", "Article", "Audio", "Document", "Event", "Page", "Video",
];

/// Object types treated as actors.
pub const ACTOR_TYPES: &[&str] = &["Person", "Service", "Group", "Organization", "Application"];

/// Collection types.
pub const COLLECTION_TYPES: &[&str] = &[
    "Collection",
    "OrderedCollection",
    "CollectionPage",
    "OrderedCollectionPage",
];

/// The public audience URI.
#[must_use]
pub fn public_audience() -> Url {
    activitypub_federation::kinds::public()
}

/// Whether `url` addresses the public collection, including the compact forms.
#[must_use]
pub fn is_public_audience(url: &Url) -> bool {
    matches!(url.as_str(), "as:Public" | "Public") || *url == public_audience()
}

/// A field that is either a single value or an array of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    /// First item, if any.
    #[must_use]
    pub fn first(&self) -> Option<&T> {
        match self {
            Self::One(v) => Some(v),
            Self::Many(v) => v.first(),
        }
    }

    /// Iterate over all items.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        match self {
            Self::One(v) => std::slice::from_ref(v).iter(),
            Self::Many(v) => v.iter(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(v) => v.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(v) => vec![v],
            Self::Many(v) => v,
        }
    }
}

impl<T> From<T> for OneOrMany<T> {
    fn from(value: T) -> Self {
        Self::One(value)
    }
}

/// A reference to an object: its id, or the object itself.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectRef {
    Uri(Url),
    Embedded(Box<Value>),
}

impl ObjectRef {
    /// Build from a raw JSON value.
    pub fn from_value(value: Value) -> FederationResult<Self> {
        match value {
            Value::String(s) => Url::parse(&s)
                .map(Self::Uri)
                .map_err(|e| FederationError::InvalidObject(format!("invalid uri {s}: {e}"))),
            Value::Object(_) => Ok(Self::Embedded(Box::new(value))),
            other => Err(FederationError::InvalidObject(format!(
                "expected uri or object, got {other}"
            ))),
        }
    }

    /// The id of the referenced object.
    #[must_use]
    pub fn id(&self) -> Option<Url> {
        match self {
            Self::Uri(url) => Some(url.clone()),
            Self::Embedded(value) => value
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok()),
        }
    }

    /// The `type` of an embedded object. Bare URIs carry no type.
    #[must_use]
    pub fn type_name(&self) -> Option<&str> {
        match self {
            Self::Uri(_) => None,
            Self::Embedded(value) => value.get("type").and_then(Value::as_str),
        }
    }

    #[must_use]
    pub const fn as_embedded(&self) -> Option<&Value> {
        match self {
            Self::Uri(_) => None,
            Self::Embedded(value) => Some(value),
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Self::Uri(url) => Value::String(url.to_string()),
            Self::Embedded(value) => (**value).clone(),
        }
    }
}

impl From<Url> for ObjectRef {
    fn from(url: Url) -> Self {
        Self::Uri(url)
    }
}

impl Serialize for ObjectRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Uri(url) => serializer.serialize_str(url.as_str()),
            Self::Embedded(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ObjectRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// Lenient audience list: accepts a string, an array, or embedded objects,
/// drops entries that are not URIs and expands the compact public forms.
pub fn deserialize_urls<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Url>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.map(collect_urls).unwrap_or_default())
}

fn collect_urls(value: Value) -> Vec<Url> {
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };

    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s),
            Value::Object(map) => map.get("id").and_then(Value::as_str).map(String::from),
            _ => None,
        })
        .filter_map(|s| match s.as_str() {
            "as:Public" | "Public" => Some(public_audience()),
            _ => Url::parse(&s).ok(),
        })
        .collect()
}

/// An image reference (avatars, banners, emoji icons).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApImage {
    #[serde(rename = "type", default = "default_image_type")]
    pub kind: String,
    pub url: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

fn default_image_type() -> String {
    "Image".to_string()
}

/// What remains of a deleted object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApTombstone {
    #[serde(rename = "type")]
    pub kind: TombstoneType,
    pub id: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub former_type: Option<String>,
}

/// A (possibly paged) collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApCollection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<OneOrMany<ObjectRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ordered_items: Option<OneOrMany<ObjectRef>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first: Option<ObjectRef>,
}

impl ApCollection {
    /// Inline items, preferring `orderedItems` for ordered collections.
    #[must_use]
    pub fn items(&self) -> Vec<ObjectRef> {
        self.ordered_items
            .as_ref()
            .or(self.items.as_ref())
            .map(|items| items.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Any object the resolver can hand back.
#[derive(Debug, Clone)]
pub enum RemoteObject {
    Actor(ApActor),
    Note(ApNote),
    Question(ApNote),
    Image(ApImage),
    Tombstone(ApTombstone),
    Activity(Box<Activity>),
    Collection(ApCollection),
    /// A well-formed object of a type we do not model.
    Other { kind: String, value: Box<Value> },
}

impl RemoteObject {
    /// Classify and validate a JSON object.
    pub fn from_value(value: Value) -> FederationResult<Self> {
        let kind = value
            .get("type")
            .and_then(type_of)
            .ok_or_else(|| FederationError::InvalidObject("object has no type".to_string()))?;

        let invalid = |e: serde_json::Error| FederationError::InvalidObject(format!("{kind}: {e}"));

        let object = if ACTOR_TYPES.contains(&kind.as_str()) {
            Self::Actor(serde_json::from_value(value).map_err(invalid)?)
        } else if kind == "Question" {
            Self::Question(serde_json::from_value(value).map_err(invalid)?)
        } else if POST_TYPES.contains(&kind.as_str()) {
            Self::Note(serde_json::from_value(value).map_err(invalid)?)
        } else if kind == "Image" {
            Self::Image(serde_json::from_value(value).map_err(invalid)?)
        } else if kind == "Tombstone" {
            Self::Tombstone(serde_json::from_value(value).map_err(invalid)?)
        } else if COLLECTION_TYPES.contains(&kind.as_str()) {
            Self::Collection(serde_json::from_value(value).map_err(invalid)?)
        } else if !matches!(ActivityKind::from(kind.as_str()), ActivityKind::Unknown(_)) {
            Self::Activity(Box::new(Activity::from_value(value)?))
        } else {
            Self::Other {
                kind,
                value: Box::new(value),
            }
        };

        Ok(object)
    }

    /// The ActivityStreams type name.
    #[must_use]
    pub fn kind_name(&self) -> String {
        match self {
            Self::Actor(a) => a.kind.clone(),
            Self::Note(n) | Self::Question(n) => n.kind.clone(),
            Self::Image(i) => i.kind.clone(),
            Self::Tombstone(_) => "Tombstone".to_string(),
            Self::Activity(a) => a.kind.to_string(),
            Self::Collection(c) => c.kind.clone(),
            Self::Other { kind, .. } => kind.clone(),
        }
    }

    /// The object id, when it has one.
    #[must_use]
    pub fn id(&self) -> Option<Url> {
        match self {
            Self::Actor(a) => Some(a.id.clone()),
            Self::Note(n) | Self::Question(n) => Some(n.id.clone()),
            Self::Image(_) => None,
            Self::Tombstone(t) => Some(t.id.clone()),
            Self::Activity(a) => a.id.clone(),
            Self::Collection(c) => c.id.clone(),
            Self::Other { value, .. } => value
                .get("id")
                .and_then(Value::as_str)
                .and_then(|s| Url::parse(s).ok()),
        }
    }

    /// Whether this is a post (note-like) object.
    #[must_use]
    pub const fn is_post(&self) -> bool {
        matches!(self, Self::Note(_) | Self::Question(_))
    }
}

/// `type` may be a string or an array whose first entry is the primary type.
fn type_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(Value::as_str).map(String::from),
        _ => None,
    }
}
