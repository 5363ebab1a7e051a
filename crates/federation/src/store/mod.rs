//! Domain capabilities consumed by the federation engine.
//!
//! Persistence of users, notes and relations lives outside this crate. The
//! kernel talks to it through the traits below, bundled as [`Domain`].
//! [`MemoryDomain`] implements all of them in process.

#![allow(missing_docs)]

mod memory;

pub use memory::MemoryDomain;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DomainResult;
use crate::instance::{InstanceHealth, InstanceUpdate};

/// A local or remote account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    /// `None` for local users.
    pub host: Option<String>,
    /// Actor id of a remote user.
    pub uri: Option<Url>,
    pub inbox: Option<Url>,
    pub shared_inbox: Option<Url>,
    pub followers_uri: Option<Url>,
    pub featured: Option<Url>,
    pub name: Option<String>,
    pub is_locked: bool,
    pub is_bot: bool,
    pub is_suspended: bool,
    pub is_deleted: bool,
    pub moved_to_uri: Option<Url>,
    pub also_known_as: Vec<Url>,
    /// When the remote profile was last fetched.
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A user known to live on another server.
pub type RemoteUser = User;

impl User {
    /// A local account with defaults.
    #[must_use]
    pub fn new_local(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            host: None,
            uri: None,
            inbox: None,
            shared_inbox: None,
            followers_uri: None,
            featured: None,
            name: None,
            is_locked: false,
            is_bot: false,
            is_suspended: false,
            is_deleted: false,
            moved_to_uri: None,
            also_known_as: Vec::new(),
            last_fetched_at: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn is_local(&self) -> bool {
        self.host.is_none()
    }

    #[must_use]
    pub const fn is_remote(&self) -> bool {
        self.host.is_some()
    }

    /// Actor id as seen by other servers.
    #[must_use]
    pub fn ap_id(&self, origin: &Url) -> Url {
        self.uri
            .clone()
            .unwrap_or_else(|| local_url(origin, &format!("/users/{}", self.id)))
    }
}

/// Build a URL on our own host.
#[must_use]
pub fn local_url(origin: &Url, path: &str) -> Url {
    let mut url = origin.clone();
    url.set_path(path);
    url.set_query(None);
    url.set_fragment(None);
    url
}

/// Profile of a remote actor, as written by person resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProfile {
    pub uri: Url,
    pub username: String,
    pub host: String,
    pub inbox: Url,
    pub shared_inbox: Option<Url>,
    pub followers_uri: Option<Url>,
    pub featured: Option<Url>,
    pub name: Option<String>,
    pub is_locked: bool,
    pub is_bot: bool,
    pub moved_to_uri: Option<Url>,
    pub also_known_as: Vec<Url>,
    pub public_key: Option<PublicKeyInfo>,
}

/// Public key advertised by an actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub key_id: String,
    pub key_pem: String,
}

/// A remote user's public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPublicKey {
    pub user_id: String,
    pub key_id: String,
    pub key_pem: String,
}

/// Signing material of a local user.
#[derive(Debug, Clone)]
pub struct UserKeypair {
    pub user_id: String,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

/// Note visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Home,
    Followers,
    Specified,
}

/// Poll attached to a note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub choices: Vec<String>,
    pub votes: Vec<u64>,
    pub multiple: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A stored note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub uri: Option<Url>,
    pub user_id: String,
    pub text: Option<String>,
    pub cw: Option<String>,
    pub visibility: Visibility,
    pub visible_user_ids: Vec<String>,
    pub reply_id: Option<String>,
    pub renote_id: Option<String>,
    pub mentions: Vec<String>,
    pub tags: Vec<String>,
    pub emojis: Vec<String>,
    pub file_urls: Vec<Url>,
    pub poll: Option<Poll>,
    pub created_at: DateTime<Utc>,
}

/// Input of [`NoteStore::create`].
#[derive(Debug, Clone, Default)]
pub struct NewNote {
    pub uri: Option<Url>,
    pub user_id: String,
    pub text: Option<String>,
    pub cw: Option<String>,
    pub visibility: Visibility,
    pub visible_user_ids: Vec<String>,
    pub reply_id: Option<String>,
    pub renote_id: Option<String>,
    pub mentions: Vec<String>,
    pub tags: Vec<String>,
    pub emojis: Vec<String>,
    pub file_urls: Vec<Url>,
    pub poll: Option<Poll>,
    pub created_at: Option<DateTime<Utc>>,
}

/// A pending follow request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowRequest {
    pub id: String,
    pub follower_id: String,
    pub followee_id: String,
    /// Id of the Follow activity that created it.
    pub request_id: Option<Url>,
}

/// An established following.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Following {
    pub id: String,
    pub follower_id: String,
    pub followee_id: String,
}

/// Result of [`RelationStore::follow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowResult {
    Followed,
    Requested,
    AlreadyFollowing,
    Blocked,
}

/// A legacy direct message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub uri: Option<Url>,
    pub user_id: String,
}

/// Input of [`ReportStore::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReport {
    pub target_user_id: String,
    pub reporter_id: String,
    pub comment: String,
    pub uri: Option<Url>,
}

/// An abuse report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: String,
    pub target_user_id: String,
    pub reporter_id: String,
    pub comment: String,
    pub uri: Option<Url>,
    pub created_at: DateTime<Utc>,
}

/// Relay subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayStatus {
    Requesting,
    Accepted,
    Rejected,
}

/// A relay this server subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relay {
    pub id: String,
    pub inbox: Url,
    pub status: RelayStatus,
}

/// Notifications raised by federation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notification {
    Followed { follower_id: String },
    FollowRequestReceived { follower_id: String },
    FollowRequestAccepted { followee_id: String },
    /// An account this user follows moved; the following now points at `to_user_id`.
    Moved { from_user_id: String, to_user_id: String },
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> DomainResult<Option<User>>;
    async fn find_by_uri(&self, uri: &Url) -> DomainResult<Option<User>>;
    async fn find_public_key(&self, key_id: &str) -> DomainResult<Option<UserPublicKey>>;
    async fn find_public_key_by_user(&self, user_id: &str) -> DomainResult<Option<UserPublicKey>>;
    async fn find_keypair(&self, user_id: &str) -> DomainResult<Option<UserKeypair>>;
    /// Insert or refresh a remote user by actor id. Sets `last_fetched_at`.
    async fn upsert_remote(&self, profile: RemoteProfile) -> DomainResult<User>;
    async fn mark_deleted(&self, id: &str) -> DomainResult<()>;
    async fn set_moved_to(&self, id: &str, target: Option<Url>) -> DomainResult<()>;
    /// The instance system actor, which signs fetches and reports.
    async fn instance_actor(&self) -> DomainResult<User>;
}

#[async_trait]
pub trait NoteStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> DomainResult<Option<Note>>;
    async fn find_by_uri(&self, uri: &Url) -> DomainResult<Option<Note>>;
    async fn create(&self, note: NewNote) -> DomainResult<Note>;
    async fn delete(&self, id: &str) -> DomainResult<()>;
    /// Delete every note of a user. Returns how many were removed.
    async fn delete_by_user(&self, user_id: &str) -> DomainResult<usize>;
    async fn update_poll_votes(&self, id: &str, votes: Vec<u64>) -> DomainResult<()>;
    async fn pin(&self, user_id: &str, note_id: &str) -> DomainResult<()>;
    async fn unpin(&self, user_id: &str, note_id: &str) -> DomainResult<()>;
}

#[async_trait]
pub trait RelationStore: Send + Sync {
    async fn follow(
        &self,
        follower: &User,
        followee: &User,
        request_id: Option<Url>,
    ) -> DomainResult<FollowResult>;
    async fn is_following(&self, follower_id: &str, followee_id: &str) -> DomainResult<bool>;
    async fn find_follow_request(
        &self,
        follower_id: &str,
        followee_id: &str,
    ) -> DomainResult<Option<FollowRequest>>;
    async fn accept_follow_request(&self, follower_id: &str, followee_id: &str) -> DomainResult<()>;
    async fn cancel_follow_request(&self, follower_id: &str, followee_id: &str) -> DomainResult<()>;
    /// Drop following and follow request; silent when neither exists.
    async fn reject_follow(&self, follower_id: &str, followee_id: &str) -> DomainResult<()>;
    async fn unfollow(&self, follower_id: &str, followee_id: &str) -> DomainResult<()>;
    /// Move an existing following from one followee to another.
    async fn repoint_following(&self, follower_id: &str, from_id: &str, to_id: &str)
    -> DomainResult<()>;
    async fn block(&self, blocker_id: &str, blockee_id: &str) -> DomainResult<()>;
    async fn unblock(&self, blocker_id: &str, blockee_id: &str) -> DomainResult<()>;
    async fn is_blocking(&self, blocker_id: &str, blockee_id: &str) -> DomainResult<bool>;
    async fn followers(&self, user_id: &str) -> DomainResult<Vec<User>>;
    /// Drop followings, follow requests and blockings in both directions.
    async fn remove_all_relations(&self, user_id: &str) -> DomainResult<()>;
}

#[async_trait]
pub trait ReactionStore: Send + Sync {
    async fn react(&self, user_id: &str, note_id: &str, reaction: &str) -> DomainResult<()>;
    async fn unreact(&self, user_id: &str, note_id: &str) -> DomainResult<()>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn find_by_uri(&self, uri: &Url) -> DomainResult<Option<Message>>;
    async fn delete(&self, id: &str) -> DomainResult<()>;
}

#[async_trait]
pub trait ReportStore: Send + Sync {
    async fn create(&self, report: NewReport) -> DomainResult<Report>;
}

#[async_trait]
pub trait InstanceStore: Send + Sync {
    async fn find(&self, host: &str) -> DomainResult<Option<InstanceHealth>>;
    /// Apply `update`, registering the host first when unknown.
    async fn update(&self, host: &str, update: InstanceUpdate) -> DomainResult<()>;
}

#[async_trait]
pub trait RelayStore: Send + Sync {
    async fn find(&self, id: &str) -> DomainResult<Option<Relay>>;
    async fn set_status(&self, id: &str, status: RelayStatus) -> DomainResult<()>;
    async fn accepted_inboxes(&self) -> DomainResult<Vec<Url>>;
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, user_id: &str, notification: Notification) -> DomainResult<()>;
}

/// All domain capabilities.
#[derive(Clone)]
pub struct Domain {
    pub users: Arc<dyn UserStore>,
    pub notes: Arc<dyn NoteStore>,
    pub relations: Arc<dyn RelationStore>,
    pub reactions: Arc<dyn ReactionStore>,
    pub messages: Arc<dyn MessageStore>,
    pub reports: Arc<dyn ReportStore>,
    pub instances: Arc<dyn InstanceStore>,
    pub relays: Arc<dyn RelayStore>,
    pub notifications: Arc<dyn NotificationSink>,
}

impl Domain {
    /// Every capability backed by one in-memory store.
    #[must_use]
    pub fn in_memory(store: &Arc<MemoryDomain>) -> Self {
        Self {
            users: store.clone(),
            notes: store.clone(),
            relations: store.clone(),
            reactions: store.clone(),
            messages: store.clone(),
            reports: store.clone(),
            instances: store.clone(),
            relays: store.clone(),
            notifications: store.clone(),
        }
    }
}
