//! `ActivityPub` actor object (Person, Service, Group, ...).

use serde::{Deserialize, Serialize};
use url::Url;

use crate::objects::{ACTOR_TYPES, ApImage};

/// `ActivityPub` actor.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApActor {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: Url,
    pub preferred_username: String,
    pub inbox: Url,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbox: Option<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<ApEndpoints>,

    /// Legacy top-level shared inbox.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<ApImage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ApImage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<ApPublicKey>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub followers: Option<Url>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub following: Option<Url>,

    /// Pinned notes collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub featured: Option<Url>,

    #[serde(default)]
    pub manually_approves_followers: bool,

    #[serde(default)]
    pub discoverable: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_to: Option<Url>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub also_known_as: Vec<Url>,

    #[serde(rename = "isCat", default)]
    pub is_cat: bool,
}

/// Actor endpoints.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApEndpoints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shared_inbox: Option<Url>,
}

/// Actor public key.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApPublicKey {
    pub id: String,
    pub owner: Url,
    pub public_key_pem: String,
}

impl ApActor {
    /// Shared inbox from `endpoints`, falling back to the legacy field.
    #[must_use]
    pub fn shared_inbox_url(&self) -> Option<&Url> {
        self.endpoints
            .as_ref()
            .and_then(|e| e.shared_inbox.as_ref())
            .or(self.shared_inbox.as_ref())
    }

    /// Service actors are bots.
    #[must_use]
    pub fn is_bot(&self) -> bool {
        self.kind == "Service" || self.kind == "Application"
    }

    /// Structural checks applied to every fetched actor.
    pub fn validate(&self, expected_host: &str) -> Result<(), String> {
        if !ACTOR_TYPES.contains(&self.kind.as_str()) {
            return Err(format!("invalid actor type {}", self.kind));
        }
        if self.id.host_str() != Some(expected_host) {
            return Err(format!("actor id {} is not on {expected_host}", self.id));
        }
        if self.inbox.host_str() != Some(expected_host) {
            return Err(format!("inbox {} is not on {expected_host}", self.inbox));
        }
        if self.preferred_username.is_empty()
            || !self
                .preferred_username
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            return Err(format!("invalid username {}", self.preferred_username));
        }
        if self.public_key.as_ref().is_some_and(|key| key.owner != self.id) {
            return Err("public key owner does not match actor".to_string());
        }
        Ok(())
    }
}
