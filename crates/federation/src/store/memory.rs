//! In-process implementation of every domain capability.

use std::collections::{HashMap, HashSet};

use apkernel_common::IdGenerator;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use url::Url;

use super::{
    FollowRequest, FollowResult, Following, InstanceStore, Message, MessageStore, NewNote,
    NewReport, Note, NoteStore, Notification, NotificationSink, ReactionStore, RelationStore,
    Relay, RelayStatus, RelayStore, RemoteProfile, Report, ReportStore, User, UserKeypair,
    UserPublicKey, UserStore,
};
use crate::error::{DomainError, DomainResult};
use crate::instance::{InstanceHealth, InstanceUpdate};

/// Username of the instance system actor.
pub const INSTANCE_ACTOR_USERNAME: &str = "instance.actor";

#[derive(Debug, Default)]
struct State {
    users: HashMap<String, User>,
    public_keys: HashMap<String, UserPublicKey>,
    keypairs: HashMap<String, UserKeypair>,
    notes: HashMap<String, Note>,
    pins: HashSet<(String, String)>,
    followings: Vec<Following>,
    follow_requests: Vec<FollowRequest>,
    blockings: HashSet<(String, String)>,
    reactions: HashMap<(String, String), String>,
    messages: HashMap<String, Message>,
    reports: Vec<Report>,
    instances: HashMap<String, InstanceHealth>,
    relays: HashMap<String, Relay>,
    notifications: Vec<(String, Notification)>,
}

impl State {
    fn is_following(&self, follower_id: &str, followee_id: &str) -> bool {
        self.followings
            .iter()
            .any(|f| f.follower_id == follower_id && f.followee_id == followee_id)
    }

    fn request_position(&self, follower_id: &str, followee_id: &str) -> Option<usize> {
        self.follow_requests
            .iter()
            .position(|r| r.follower_id == follower_id && r.followee_id == followee_id)
    }

    fn remove_relation(&mut self, follower_id: &str, followee_id: &str) -> bool {
        let before = self.followings.len() + self.follow_requests.len();
        self.followings
            .retain(|f| !(f.follower_id == follower_id && f.followee_id == followee_id));
        self.follow_requests
            .retain(|r| !(r.follower_id == follower_id && r.followee_id == followee_id));
        before != self.followings.len() + self.follow_requests.len()
    }
}

/// Users, notes and relations held in memory.
///
/// Backs the standalone server and every test in the workspace.
#[derive(Debug)]
pub struct MemoryDomain {
    state: RwLock<State>,
    id_gen: IdGenerator,
    instance_actor_id: String,
}

impl Default for MemoryDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDomain {
    /// An empty store holding only the instance system actor.
    #[must_use]
    pub fn new() -> Self {
        let id_gen = IdGenerator::new();
        let instance_actor = User {
            is_bot: true,
            is_locked: true,
            ..User::new_local(id_gen.generate(), INSTANCE_ACTOR_USERNAME)
        };
        let instance_actor_id = instance_actor.id.clone();

        let mut state = State::default();
        state.users.insert(instance_actor.id.clone(), instance_actor);

        Self {
            state: RwLock::new(state),
            id_gen,
            instance_actor_id,
        }
    }

    pub async fn insert_user(&self, user: User) {
        self.state.write().await.users.insert(user.id.clone(), user);
    }

    pub async fn insert_public_key(&self, key: UserPublicKey) {
        self.state
            .write()
            .await
            .public_keys
            .insert(key.key_id.clone(), key);
    }

    pub async fn insert_keypair(&self, keypair: UserKeypair) {
        self.state
            .write()
            .await
            .keypairs
            .insert(keypair.user_id.clone(), keypair);
    }

    pub async fn insert_note(&self, note: Note) {
        self.state.write().await.notes.insert(note.id.clone(), note);
    }

    pub async fn insert_message(&self, message: Message) {
        self.state
            .write()
            .await
            .messages
            .insert(message.id.clone(), message);
    }

    pub async fn insert_relay(&self, relay: Relay) {
        self.state.write().await.relays.insert(relay.id.clone(), relay);
    }

    pub async fn insert_following(&self, follower_id: &str, followee_id: &str) {
        let id = self.id_gen.generate();
        let mut state = self.state.write().await;
        if !state.is_following(follower_id, followee_id) {
            state.followings.push(Following {
                id,
                follower_id: follower_id.to_string(),
                followee_id: followee_id.to_string(),
            });
        }
    }

    pub async fn insert_follow_request(&self, follower_id: &str, followee_id: &str) {
        let id = self.id_gen.generate();
        let mut state = self.state.write().await;
        if state.request_position(follower_id, followee_id).is_none() {
            state.follow_requests.push(FollowRequest {
                id,
                follower_id: follower_id.to_string(),
                followee_id: followee_id.to_string(),
                request_id: None,
            });
        }
    }

    pub async fn followings(&self) -> Vec<Following> {
        self.state.read().await.followings.clone()
    }

    pub async fn follow_requests(&self) -> Vec<FollowRequest> {
        self.state.read().await.follow_requests.clone()
    }

    pub async fn notes(&self) -> Vec<Note> {
        let mut notes: Vec<Note> = self.state.read().await.notes.values().cloned().collect();
        notes.sort_by(|a, b| a.id.cmp(&b.id));
        notes
    }

    pub async fn reports(&self) -> Vec<Report> {
        self.state.read().await.reports.clone()
    }

    pub async fn notifications(&self) -> Vec<(String, Notification)> {
        self.state.read().await.notifications.clone()
    }

    pub async fn reaction(&self, user_id: &str, note_id: &str) -> Option<String> {
        self.state
            .read()
            .await
            .reactions
            .get(&(user_id.to_string(), note_id.to_string()))
            .cloned()
    }

    pub async fn is_pinned(&self, user_id: &str, note_id: &str) -> bool {
        self.state
            .read()
            .await
            .pins
            .contains(&(user_id.to_string(), note_id.to_string()))
    }

    pub async fn instance(&self, host: &str) -> Option<InstanceHealth> {
        self.state.read().await.instances.get(host).cloned()
    }

    pub async fn set_instance(&self, health: InstanceHealth) {
        self.state
            .write()
            .await
            .instances
            .insert(health.host.clone(), health);
    }
}

#[async_trait]
impl UserStore for MemoryDomain {
    async fn find_by_id(&self, id: &str) -> DomainResult<Option<User>> {
        Ok(self.state.read().await.users.get(id).cloned())
    }

    async fn find_by_uri(&self, uri: &Url) -> DomainResult<Option<User>> {
        Ok(self
            .state
            .read()
            .await
            .users
            .values()
            .find(|u| u.uri.as_ref() == Some(uri))
            .cloned())
    }

    async fn find_public_key(&self, key_id: &str) -> DomainResult<Option<UserPublicKey>> {
        Ok(self.state.read().await.public_keys.get(key_id).cloned())
    }

    async fn find_public_key_by_user(&self, user_id: &str) -> DomainResult<Option<UserPublicKey>> {
        Ok(self
            .state
            .read()
            .await
            .public_keys
            .values()
            .find(|k| k.user_id == user_id)
            .cloned())
    }

    async fn find_keypair(&self, user_id: &str) -> DomainResult<Option<UserKeypair>> {
        Ok(self.state.read().await.keypairs.get(user_id).cloned())
    }

    async fn upsert_remote(&self, profile: RemoteProfile) -> DomainResult<User> {
        let new_id = self.id_gen.generate();
        let mut state = self.state.write().await;

        let existing = state
            .users
            .values()
            .find(|u| u.uri.as_ref() == Some(&profile.uri))
            .cloned();

        let mut user = existing.unwrap_or_else(|| User {
            host: Some(profile.host.clone()),
            uri: Some(profile.uri.clone()),
            ..User::new_local(new_id, profile.username.clone())
        });
        user.username = profile.username;
        user.host = Some(profile.host);
        user.inbox = Some(profile.inbox);
        user.shared_inbox = profile.shared_inbox;
        user.followers_uri = profile.followers_uri;
        user.featured = profile.featured;
        user.name = profile.name;
        user.is_locked = profile.is_locked;
        user.is_bot = profile.is_bot;
        user.moved_to_uri = profile.moved_to_uri;
        user.also_known_as = profile.also_known_as;
        user.last_fetched_at = Some(Utc::now());

        if let Some(key) = profile.public_key {
            state.public_keys.retain(|_, k| k.user_id != user.id);
            state.public_keys.insert(
                key.key_id.clone(),
                UserPublicKey {
                    user_id: user.id.clone(),
                    key_id: key.key_id,
                    key_pem: key.key_pem,
                },
            );
        }

        state.users.insert(user.id.clone(), user.clone());
        Ok(user)
    }

    async fn mark_deleted(&self, id: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(id)
            .ok_or_else(|| DomainError::NotFound(format!("user {id}")))?;
        user.is_deleted = true;
        Ok(())
    }

    async fn set_moved_to(&self, id: &str, target: Option<Url>) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let user = state
            .users
            .get_mut(id)
            .ok_or_else(|| DomainError::NotFound(format!("user {id}")))?;
        user.moved_to_uri = target;
        Ok(())
    }

    async fn instance_actor(&self) -> DomainResult<User> {
        self.state
            .read()
            .await
            .users
            .get(&self.instance_actor_id)
            .cloned()
            .ok_or_else(|| DomainError::NotFound("instance actor".to_string()))
    }
}

#[async_trait]
impl NoteStore for MemoryDomain {
    async fn find_by_id(&self, id: &str) -> DomainResult<Option<Note>> {
        Ok(self.state.read().await.notes.get(id).cloned())
    }

    async fn find_by_uri(&self, uri: &Url) -> DomainResult<Option<Note>> {
        Ok(self
            .state
            .read()
            .await
            .notes
            .values()
            .find(|n| n.uri.as_ref() == Some(uri))
            .cloned())
    }

    async fn create(&self, note: NewNote) -> DomainResult<Note> {
        let note = Note {
            id: self.id_gen.generate(),
            uri: note.uri,
            user_id: note.user_id,
            text: note.text,
            cw: note.cw,
            visibility: note.visibility,
            visible_user_ids: note.visible_user_ids,
            reply_id: note.reply_id,
            renote_id: note.renote_id,
            mentions: note.mentions,
            tags: note.tags,
            emojis: note.emojis,
            file_urls: note.file_urls,
            poll: note.poll,
            created_at: note.created_at.unwrap_or_else(Utc::now),
        };

        let mut state = self.state.write().await;
        if let Some(uri) = &note.uri {
            if state.notes.values().any(|n| n.uri.as_ref() == Some(uri)) {
                return Err(DomainError::Store(format!("duplicate note uri {uri}")));
            }
        }
        state.notes.insert(note.id.clone(), note.clone());
        Ok(note)
    }

    async fn delete(&self, id: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        state
            .notes
            .remove(id)
            .ok_or_else(|| DomainError::NotFound(format!("note {id}")))?;
        state.pins.retain(|(_, note_id)| note_id != id);
        state.reactions.retain(|(_, note_id), _| note_id != id);
        Ok(())
    }

    async fn delete_by_user(&self, user_id: &str) -> DomainResult<usize> {
        let mut state = self.state.write().await;
        let ids: HashSet<String> = state
            .notes
            .values()
            .filter(|n| n.user_id == user_id)
            .map(|n| n.id.clone())
            .collect();
        state.notes.retain(|id, _| !ids.contains(id));
        state.pins.retain(|(_, note_id)| !ids.contains(note_id));
        state.reactions.retain(|(reactor, note_id), _| {
            reactor != user_id && !ids.contains(note_id)
        });
        Ok(ids.len())
    }

    async fn update_poll_votes(&self, id: &str, votes: Vec<u64>) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let poll = state
            .notes
            .get_mut(id)
            .and_then(|n| n.poll.as_mut())
            .ok_or_else(|| DomainError::NotFound(format!("poll of note {id}")))?;
        poll.votes = votes;
        Ok(())
    }

    async fn pin(&self, user_id: &str, note_id: &str) -> DomainResult<()> {
        self.state
            .write()
            .await
            .pins
            .insert((user_id.to_string(), note_id.to_string()));
        Ok(())
    }

    async fn unpin(&self, user_id: &str, note_id: &str) -> DomainResult<()> {
        self.state
            .write()
            .await
            .pins
            .remove(&(user_id.to_string(), note_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl RelationStore for MemoryDomain {
    async fn follow(
        &self,
        follower: &User,
        followee: &User,
        request_id: Option<Url>,
    ) -> DomainResult<FollowResult> {
        let id = self.id_gen.generate();
        let mut state = self.state.write().await;

        if state
            .blockings
            .contains(&(followee.id.clone(), follower.id.clone()))
        {
            return Ok(FollowResult::Blocked);
        }
        if state.is_following(&follower.id, &followee.id) {
            return Ok(FollowResult::AlreadyFollowing);
        }
        if followee.is_locked {
            if state.request_position(&follower.id, &followee.id).is_none() {
                state.follow_requests.push(FollowRequest {
                    id,
                    follower_id: follower.id.clone(),
                    followee_id: followee.id.clone(),
                    request_id,
                });
            }
            return Ok(FollowResult::Requested);
        }

        state.followings.push(Following {
            id,
            follower_id: follower.id.clone(),
            followee_id: followee.id.clone(),
        });
        Ok(FollowResult::Followed)
    }

    async fn is_following(&self, follower_id: &str, followee_id: &str) -> DomainResult<bool> {
        Ok(self.state.read().await.is_following(follower_id, followee_id))
    }

    async fn find_follow_request(
        &self,
        follower_id: &str,
        followee_id: &str,
    ) -> DomainResult<Option<FollowRequest>> {
        let state = self.state.read().await;
        Ok(state
            .request_position(follower_id, followee_id)
            .map(|i| state.follow_requests[i].clone()))
    }

    async fn accept_follow_request(&self, follower_id: &str, followee_id: &str) -> DomainResult<()> {
        let id = self.id_gen.generate();
        let mut state = self.state.write().await;
        let position = state
            .request_position(follower_id, followee_id)
            .ok_or(DomainError::NoSuchFollowRequest)?;
        state.follow_requests.remove(position);

        if !state.is_following(follower_id, followee_id) {
            state.followings.push(Following {
                id,
                follower_id: follower_id.to_string(),
                followee_id: followee_id.to_string(),
            });
        }
        Ok(())
    }

    async fn cancel_follow_request(&self, follower_id: &str, followee_id: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let position = state
            .request_position(follower_id, followee_id)
            .ok_or(DomainError::NoSuchFollowRequest)?;
        state.follow_requests.remove(position);
        Ok(())
    }

    async fn reject_follow(&self, follower_id: &str, followee_id: &str) -> DomainResult<()> {
        self.state
            .write()
            .await
            .remove_relation(follower_id, followee_id);
        Ok(())
    }

    async fn unfollow(&self, follower_id: &str, followee_id: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        if !state.is_following(follower_id, followee_id) {
            return Err(DomainError::NotFollowing);
        }
        state
            .followings
            .retain(|f| !(f.follower_id == follower_id && f.followee_id == followee_id));
        Ok(())
    }

    async fn repoint_following(
        &self,
        follower_id: &str,
        from_id: &str,
        to_id: &str,
    ) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let following = state
            .followings
            .iter_mut()
            .find(|f| f.follower_id == follower_id && f.followee_id == from_id)
            .ok_or(DomainError::NotFollowing)?;
        following.followee_id = to_id.to_string();
        Ok(())
    }

    async fn block(&self, blocker_id: &str, blockee_id: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        state
            .blockings
            .insert((blocker_id.to_string(), blockee_id.to_string()));
        state.remove_relation(blocker_id, blockee_id);
        state.remove_relation(blockee_id, blocker_id);
        Ok(())
    }

    async fn unblock(&self, blocker_id: &str, blockee_id: &str) -> DomainResult<()> {
        let removed = self
            .state
            .write()
            .await
            .blockings
            .remove(&(blocker_id.to_string(), blockee_id.to_string()));
        if removed {
            Ok(())
        } else {
            Err(DomainError::NotBlocking)
        }
    }

    async fn is_blocking(&self, blocker_id: &str, blockee_id: &str) -> DomainResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .blockings
            .contains(&(blocker_id.to_string(), blockee_id.to_string())))
    }

    async fn followers(&self, user_id: &str) -> DomainResult<Vec<User>> {
        let state = self.state.read().await;
        Ok(state
            .followings
            .iter()
            .filter(|f| f.followee_id == user_id)
            .filter_map(|f| state.users.get(&f.follower_id).cloned())
            .collect())
    }

    async fn remove_all_relations(&self, user_id: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        state
            .followings
            .retain(|f| f.follower_id != user_id && f.followee_id != user_id);
        state
            .follow_requests
            .retain(|r| r.follower_id != user_id && r.followee_id != user_id);
        state
            .blockings
            .retain(|(blocker, blockee)| blocker != user_id && blockee != user_id);
        Ok(())
    }
}

#[async_trait]
impl ReactionStore for MemoryDomain {
    async fn react(&self, user_id: &str, note_id: &str, reaction: &str) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let key = (user_id.to_string(), note_id.to_string());
        if state.reactions.contains_key(&key) {
            return Err(DomainError::AlreadyReacted);
        }
        state.reactions.insert(key, reaction.to_string());
        Ok(())
    }

    async fn unreact(&self, user_id: &str, note_id: &str) -> DomainResult<()> {
        self.state
            .write()
            .await
            .reactions
            .remove(&(user_id.to_string(), note_id.to_string()))
            .map(|_| ())
            .ok_or(DomainError::NotReacted)
    }
}

#[async_trait]
impl MessageStore for MemoryDomain {
    async fn find_by_uri(&self, uri: &Url) -> DomainResult<Option<Message>> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .values()
            .find(|m| m.uri.as_ref() == Some(uri))
            .cloned())
    }

    async fn delete(&self, id: &str) -> DomainResult<()> {
        self.state
            .write()
            .await
            .messages
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DomainError::NotFound(format!("message {id}")))
    }
}

#[async_trait]
impl ReportStore for MemoryDomain {
    async fn create(&self, report: NewReport) -> DomainResult<Report> {
        let report = Report {
            id: self.id_gen.generate(),
            target_user_id: report.target_user_id,
            reporter_id: report.reporter_id,
            comment: report.comment,
            uri: report.uri,
            created_at: Utc::now(),
        };
        self.state.write().await.reports.push(report.clone());
        Ok(report)
    }
}

#[async_trait]
impl InstanceStore for MemoryDomain {
    async fn find(&self, host: &str) -> DomainResult<Option<InstanceHealth>> {
        Ok(self.state.read().await.instances.get(host).cloned())
    }

    async fn update(&self, host: &str, update: InstanceUpdate) -> DomainResult<()> {
        self.state
            .write()
            .await
            .instances
            .entry(host.to_string())
            .or_insert_with(|| InstanceHealth::new(host))
            .apply(update);
        Ok(())
    }
}

#[async_trait]
impl RelayStore for MemoryDomain {
    async fn find(&self, id: &str) -> DomainResult<Option<Relay>> {
        Ok(self.state.read().await.relays.get(id).cloned())
    }

    async fn set_status(&self, id: &str, status: RelayStatus) -> DomainResult<()> {
        let mut state = self.state.write().await;
        let relay = state
            .relays
            .get_mut(id)
            .ok_or_else(|| DomainError::NotFound(format!("relay {id}")))?;
        relay.status = status;
        Ok(())
    }

    async fn accepted_inboxes(&self) -> DomainResult<Vec<Url>> {
        Ok(self
            .state
            .read()
            .await
            .relays
            .values()
            .filter(|r| r.status == RelayStatus::Accepted)
            .map(|r| r.inbox.clone())
            .collect())
    }
}

#[async_trait]
impl NotificationSink for MemoryDomain {
    async fn notify(&self, user_id: &str, notification: Notification) -> DomainResult<()> {
        self.state
            .write()
            .await
            .notifications
            .push((user_id.to_string(), notification));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn remote(id: &str) -> User {
        User {
            host: Some("remote.example".to_string()),
            uri: Some(Url::parse(&format!("https://remote.example/users/{id}")).unwrap()),
            ..User::new_local(id, id)
        }
    }

    #[tokio::test]
    async fn test_follow_locked_user_creates_request() {
        let store = MemoryDomain::new();
        let alice = remote("alice");
        let bob = User {
            is_locked: true,
            ..User::new_local("bob", "bob")
        };

        let result = store.follow(&alice, &bob, None).await.unwrap();
        assert_eq!(result, FollowResult::Requested);
        assert!(store.find_follow_request("alice", "bob").await.unwrap().is_some());

        store.accept_follow_request("alice", "bob").await.unwrap();
        assert!(store.is_following("alice", "bob").await.unwrap());
        assert_eq!(
            store.follow(&alice, &bob, None).await.unwrap(),
            FollowResult::AlreadyFollowing
        );
    }

    #[tokio::test]
    async fn test_block_drops_relations() {
        let store = MemoryDomain::new();
        let alice = remote("alice");
        let bob = User::new_local("bob", "bob");

        store.follow(&alice, &bob, None).await.unwrap();
        store.block("bob", "alice").await.unwrap();

        assert!(!store.is_following("alice", "bob").await.unwrap());
        assert_eq!(
            store.follow(&alice, &bob, None).await.unwrap(),
            FollowResult::Blocked
        );
        store.unblock("bob", "alice").await.unwrap();
        assert_eq!(
            store.unblock("bob", "alice").await.unwrap_err(),
            DomainError::NotBlocking
        );
    }

    #[tokio::test]
    async fn test_reactions_are_unique() {
        let store = MemoryDomain::new();
        store.react("alice", "n1", "👍").await.unwrap();
        assert_eq!(
            store.react("alice", "n1", "🎉").await.unwrap_err(),
            DomainError::AlreadyReacted
        );
        store.unreact("alice", "n1").await.unwrap();
        assert_eq!(
            store.unreact("alice", "n1").await.unwrap_err(),
            DomainError::NotReacted
        );
    }

    #[tokio::test]
    async fn test_upsert_remote_keeps_id() {
        let store = MemoryDomain::new();
        let uri = Url::parse("https://remote.example/users/alice").unwrap();
        let profile = RemoteProfile {
            uri: uri.clone(),
            username: "alice".to_string(),
            host: "remote.example".to_string(),
            inbox: Url::parse("https://remote.example/users/alice/inbox").unwrap(),
            shared_inbox: None,
            followers_uri: None,
            featured: None,
            name: None,
            is_locked: false,
            is_bot: false,
            moved_to_uri: None,
            also_known_as: Vec::new(),
            public_key: None,
        };

        let first = store.upsert_remote(profile.clone()).await.unwrap();
        let second = store
            .upsert_remote(RemoteProfile {
                name: Some("Alice".to_string()),
                ..profile
            })
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.name.as_deref(), Some("Alice"));
        assert!(second.last_fetched_at.is_some());
    }

    #[tokio::test]
    async fn test_instance_update_registers_host() {
        let store = MemoryDomain::new();
        let now = Utc::now();
        InstanceStore::update(&store, "remote.example", InstanceUpdate::failed(500, now))
            .await
            .unwrap();

        let health = store.instance("remote.example").await.unwrap();
        assert_eq!(health.latest_status, Some(500));
        assert!(health.is_not_responding);
    }
}
