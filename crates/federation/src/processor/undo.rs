//! Undo activity processor.

use tracing::info;

use super::{NoteService, Outcome, PersonService, ensure_actor, require_object};
use crate::activities::{Activity, ActivityKind};
use crate::context::FederationContext;
use crate::error::{DomainError, FederationResult};
use crate::objects::RemoteObject;
use crate::resolver::Resolver;
use crate::store::User;

/// A remote actor takes back an earlier activity.
#[derive(Clone)]
pub struct UndoProcessor {
    ctx: FederationContext,
    persons: PersonService,
    notes: NoteService,
}

impl UndoProcessor {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            persons: PersonService::new(ctx.clone()),
            notes: NoteService::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn process(
        &self,
        actor: &User,
        activity: &Activity,
        resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        ensure_actor(actor, activity)?;
        let object = require_object(activity)?;

        let undone = match resolver.resolve(object).await? {
            RemoteObject::Activity(undone) => undone,
            other => {
                return Ok(Outcome::skip(format!("unknown object type {}", other.kind_name())));
            }
        };

        match undone.kind {
            ActivityKind::Follow => self.undo_follow(actor, &undone).await,
            ActivityKind::Block => self.undo_block(actor, &undone).await,
            ActivityKind::Like => self.undo_like(actor, &undone).await,
            ActivityKind::Announce => self.undo_announce(actor, &undone).await,
            ActivityKind::Accept => self.undo_accept(actor, &undone, resolver).await,
            ref other => Ok(Outcome::skip(format!("unknown object type {other}"))),
        }
    }

    async fn local_user(&self, activity: &Activity) -> FederationResult<Option<User>> {
        match activity.object_id() {
            Some(uri) => Ok(self
                .persons
                .fetch_person(&uri)
                .await?
                .filter(User::is_local)),
            None => Ok(None),
        }
    }

    async fn undo_follow(&self, actor: &User, follow: &Activity) -> FederationResult<Outcome> {
        let Some(followee) = self.local_user(follow).await? else {
            return Ok(Outcome::skip("followee not found"));
        };
        let relations = &self.ctx.domain.relations;

        if relations
            .find_follow_request(&actor.id, &followee.id)
            .await?
            .is_some()
        {
            relations.cancel_follow_request(&actor.id, &followee.id).await?;
            info!(follower = %actor.id, followee = %followee.id, "Follow request canceled");
            return Ok(Outcome::ok_with("follow request canceled"));
        }

        if relations.is_following(&actor.id, &followee.id).await? {
            relations.unfollow(&actor.id, &followee.id).await?;
            info!(follower = %actor.id, followee = %followee.id, "Unfollowed");
            return Ok(Outcome::ok_with("unfollowed"));
        }

        Ok(Outcome::skip("no such following or follow request"))
    }

    async fn undo_block(&self, actor: &User, block: &Activity) -> FederationResult<Outcome> {
        let Some(blockee) = self.local_user(block).await? else {
            return Ok(Outcome::skip("blockee not found"));
        };

        match self.ctx.domain.relations.unblock(&actor.id, &blockee.id).await {
            Ok(()) => Ok(Outcome::ok()),
            Err(DomainError::NotBlocking) => Ok(Outcome::skip("not blocking")),
            Err(e) => Err(e.into()),
        }
    }

    async fn undo_like(&self, actor: &User, like: &Activity) -> FederationResult<Outcome> {
        let Some(target) = like.object_id() else {
            return Ok(Outcome::skip("target note not found"));
        };
        let Some(note) = self.notes.fetch_note(&target).await? else {
            return Ok(Outcome::skip("target note not found"));
        };

        match self.ctx.domain.reactions.unreact(&actor.id, &note.id).await {
            Ok(()) => Ok(Outcome::ok()),
            Err(DomainError::NotReacted) => Ok(Outcome::skip("not reacted")),
            Err(e) => Err(e.into()),
        }
    }

    async fn undo_announce(&self, actor: &User, announce: &Activity) -> FederationResult<Outcome> {
        let Some(uri) = &announce.id else {
            return Ok(Outcome::skip("no such announce"));
        };
        let renote = self
            .ctx
            .domain
            .notes
            .find_by_uri(uri)
            .await?
            .filter(|note| note.user_id == actor.id && note.renote_id.is_some());
        let Some(renote) = renote else {
            return Ok(Outcome::skip("no such announce"));
        };

        self.ctx.domain.notes.delete(&renote.id).await?;
        info!(note_id = %renote.id, uri = %uri, "Deleted renote");
        Ok(Outcome::ok_with("deleted"))
    }

    /// The actor no longer accepts one of our follows.
    async fn undo_accept(
        &self,
        actor: &User,
        accept: &Activity,
        resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        let follower_uri = match accept.object() {
            Some(object) => match resolver.resolve(object).await? {
                RemoteObject::Activity(follow) if follow.kind == ActivityKind::Follow => {
                    follow.actor_id()
                }
                _ => None,
            },
            None => None,
        };
        let follower = match follower_uri {
            Some(uri) => self.persons.fetch_person(&uri).await?.filter(User::is_local),
            None => None,
        };
        let Some(follower) = follower else {
            return Ok(Outcome::skip("not following"));
        };

        let relations = &self.ctx.domain.relations;
        if !relations.is_following(&follower.id, &actor.id).await? {
            return Ok(Outcome::skip("not following"));
        }
        relations.unfollow(&follower.id, &actor.id).await?;
        info!(follower = %follower.id, followee = %actor.id, "Follow revoked by followee");
        Ok(Outcome::ok_with("unfollowed"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::FederationError;
    use crate::store::RelationStore;
    use crate::test_utils::TestFederation;
    use serde_json::{Value, json};

    const ALICE: &str = "https://remote.example/users/alice";

    fn undo(object: Value) -> Activity {
        Activity::from_value(json!({
            "type": "Undo",
            "id": "https://remote.example/undo/1",
            "actor": ALICE,
            "object": object
        }))
        .unwrap()
    }

    fn follow_of_bob() -> Value {
        json!({
            "type": "Follow",
            "id": "https://remote.example/follows/1",
            "actor": ALICE,
            "object": "https://local.example/users/bob1"
        })
    }

    async fn run(fed: &TestFederation, actor: &User, activity: &Activity) -> FederationResult<Outcome> {
        UndoProcessor::new(fed.ctx.clone())
            .process(actor, activity, &mut Resolver::new(fed.ctx.clone()))
            .await
    }

    #[tokio::test]
    async fn test_undo_follow_cancels_request_then_following() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.local_user("bob1", "bob").await;
        fed.store.insert_follow_request("alice1", "bob1").await;

        let outcome = run(&fed, &alice, &undo(follow_of_bob())).await.unwrap();
        assert_eq!(outcome, Outcome::ok_with("follow request canceled"));
        assert!(fed.store.follow_requests().await.is_empty());

        fed.store.insert_following("alice1", "bob1").await;
        let outcome = run(&fed, &alice, &undo(follow_of_bob())).await.unwrap();
        assert_eq!(outcome, Outcome::ok_with("unfollowed"));
        assert!(fed.store.followings().await.is_empty());
    }

    #[tokio::test]
    async fn test_undo_follow_without_state_changes_nothing() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.local_user("bob1", "bob").await;
        fed.store.insert_following("bob1", "alice1").await;

        let outcome = run(&fed, &alice, &undo(follow_of_bob())).await.unwrap();
        assert_eq!(outcome, Outcome::skip("no such following or follow request"));
        assert_eq!(fed.store.followings().await.len(), 1);
    }

    #[tokio::test]
    async fn test_undo_block_and_like_map_domain_errors() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.local_user("bob1", "bob").await;
        fed.note("n1", "bob1", None).await;

        let block = json!({"type": "Block", "actor": ALICE, "object": "https://local.example/users/bob1"});
        let outcome = run(&fed, &alice, &undo(block.clone())).await.unwrap();
        assert_eq!(outcome, Outcome::skip("not blocking"));

        fed.store.block("alice1", "bob1").await.unwrap();
        let outcome = run(&fed, &alice, &undo(block)).await.unwrap();
        assert_eq!(outcome, Outcome::ok());

        let like = json!({"type": "Like", "actor": ALICE, "object": "https://local.example/notes/n1"});
        let outcome = run(&fed, &alice, &undo(like)).await.unwrap();
        assert_eq!(outcome, Outcome::skip("not reacted"));
    }

    #[tokio::test]
    async fn test_undo_announce_deletes_renote() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.local_user("bob1", "bob").await;
        fed.note("n1", "bob1", None).await;
        let mut renote = fed
            .note("r1", "alice1", Some("https://remote.example/announces/1"))
            .await;
        renote.renote_id = Some("n1".to_string());
        fed.store.insert_note(renote).await;

        let announce = json!({
            "type": "Announce",
            "id": "https://remote.example/announces/1",
            "actor": ALICE,
            "object": "https://local.example/notes/n1"
        });
        let outcome = run(&fed, &alice, &undo(announce.clone())).await.unwrap();
        assert_eq!(outcome, Outcome::ok_with("deleted"));
        assert_eq!(fed.store.notes().await.len(), 1);

        let outcome = run(&fed, &alice, &undo(announce)).await.unwrap();
        assert_eq!(outcome, Outcome::skip("no such announce"));
    }

    #[tokio::test]
    async fn test_undo_accept_drops_our_following() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.local_user("bob1", "bob").await;
        fed.store.insert_following("bob1", "alice1").await;

        let accept = json!({
            "type": "Accept",
            "actor": ALICE,
            "object": {
                "type": "Follow",
                "id": "https://local.example/follows/bob1/alice1",
                "actor": "https://local.example/users/bob1",
                "object": ALICE
            }
        });
        let outcome = run(&fed, &alice, &undo(accept.clone())).await.unwrap();
        assert_eq!(outcome, Outcome::ok_with("unfollowed"));

        let outcome = run(&fed, &alice, &undo(accept)).await.unwrap();
        assert_eq!(outcome, Outcome::skip("not following"));
    }

    #[tokio::test]
    async fn test_undo_by_other_actor_is_rejected() {
        let fed = TestFederation::new().await;
        let mallory = fed.remote_user("m1", "evil.example", "mallory").await;

        let err = run(&fed, &mallory, &undo(follow_of_bob())).await.unwrap_err();
        assert!(matches!(err, FederationError::Validation(_)));
    }

    #[tokio::test]
    async fn test_undo_of_unknown_type_is_skipped() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;

        let outcome = run(&fed, &alice, &undo(json!({"type": "Listen", "id": "https://remote.example/l/1"})))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::skip("unknown object type Listen"));
    }
}
