//! `ActivityPub` activities.
//!
//! Every inbound activity parses into one [`Activity`] whose [`ActivityKind`]
//! is a closed enum; the kernel matches on it exhaustively.

#![allow(missing_docs)]

mod kind;

pub use kind::ActivityKind;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

use crate::error::{FederationError, FederationResult};
use crate::objects::{ObjectRef, OneOrMany, deserialize_urls};

/// An `ActivityPub` activity.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    #[serde(rename = "@context", default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Url>,

    #[serde(rename = "type")]
    pub kind: ActivityKind,

    pub actor: ObjectRef,

    #[serde(default, skip_serializing_if = "OneOrMany::is_empty")]
    pub object: OneOrMany<ObjectRef>,

    #[serde(default, deserialize_with = "deserialize_urls", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<Url>,

    #[serde(default, deserialize_with = "deserialize_urls", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ObjectRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, rename = "_misskey_reaction", skip_serializing_if = "Option::is_none")]
    pub misskey_reaction: Option<String>,

    /// Linked-data signature, when the sender attached one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Value>,

    /// Everything else (`name`, `instrument`, vendor extensions).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Activity {
    /// Create a bare activity.
    #[must_use]
    pub fn new(kind: ActivityKind, actor: Url, object: ObjectRef) -> Self {
        Self {
            context: None,
            id: None,
            kind,
            actor: ObjectRef::Uri(actor),
            object: OneOrMany::One(object),
            to: Vec::new(),
            cc: Vec::new(),
            target: None,
            published: None,
            content: None,
            misskey_reaction: None,
            signature: None,
            extra: Map::new(),
        }
    }

    /// Parse from JSON.
    pub fn from_value(value: Value) -> FederationResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| FederationError::InvalidObject(format!("malformed activity: {e}")))
    }

    pub fn to_value(&self) -> FederationResult<Value> {
        serde_json::to_value(self).map_err(|e| FederationError::Internal(e.to_string()))
    }

    /// Primary object.
    #[must_use]
    pub fn object(&self) -> Option<&ObjectRef> {
        self.object.first()
    }

    /// Id of the primary object.
    #[must_use]
    pub fn object_id(&self) -> Option<Url> {
        self.object().and_then(ObjectRef::id)
    }

    /// Id of the actor.
    #[must_use]
    pub fn actor_id(&self) -> Option<Url> {
        self.actor.id()
    }

    /// Ids of every object, for activities addressing several (Flag).
    #[must_use]
    pub fn object_ids(&self) -> Vec<Url> {
        self.object.iter().filter_map(ObjectRef::id).collect()
    }

    /// A string field from the extension map.
    #[must_use]
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_like_with_extensions() {
        let activity = Activity::from_value(json!({
            "@context": ["https://www.w3.org/ns/activitystreams"],
            "id": "https://remote.example/likes/1",
            "type": "Like",
            "actor": "https://remote.example/users/alice",
            "object": "https://local.example/notes/abc",
            "_misskey_reaction": ":blob:",
            "name": ":blob:"
        }))
        .unwrap();

        assert_eq!(activity.kind, ActivityKind::Like);
        assert_eq!(activity.misskey_reaction.as_deref(), Some(":blob:"));
        assert_eq!(activity.extra_str("name"), Some(":blob:"));
        assert_eq!(
            activity.object_id().unwrap().as_str(),
            "https://local.example/notes/abc"
        );
    }

    #[test]
    fn test_unknown_type_still_parses() {
        let activity = Activity::from_value(json!({
            "type": "EmojiReact",
            "actor": "https://remote.example/users/alice",
            "object": "https://local.example/notes/abc"
        }))
        .unwrap();

        assert_eq!(activity.kind, ActivityKind::Unknown("EmojiReact".to_string()));
    }

    #[test]
    fn test_flag_with_object_array() {
        let activity = Activity::from_value(json!({
            "type": "Flag",
            "actor": "https://remote.example/actor",
            "object": ["https://local.example/users/1", "https://local.example/notes/2"],
            "content": "spam"
        }))
        .unwrap();

        assert_eq!(activity.object_ids().len(), 2);
    }

    #[test]
    fn test_missing_actor_is_invalid() {
        let err = Activity::from_value(json!({"type": "Follow"})).unwrap_err();
        assert!(matches!(err, FederationError::InvalidObject(_)));
    }
}
