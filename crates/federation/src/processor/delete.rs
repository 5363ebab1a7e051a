//! Delete activity processor.

use serde_json::Value;
use tracing::info;
use url::Url;

use super::{NoteService, Outcome, ensure_actor, require_object};
use crate::activities::Activity;
use crate::context::FederationContext;
use crate::error::{FederationError, FederationResult};
use crate::events::InternalEvent;
use crate::objects::{ACTOR_TYPES, ObjectRef, POST_TYPES};
use crate::resolver::Resolver;
use crate::store::User;

/// A remote actor deleted a post or itself.
#[derive(Clone)]
pub struct DeleteProcessor {
    ctx: FederationContext,
    notes: NoteService,
}

impl DeleteProcessor {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            notes: NoteService::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn process(
        &self,
        actor: &User,
        activity: &Activity,
        _resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        ensure_actor(actor, activity)?;
        let object = require_object(activity)?;
        let uri = object
            .id()
            .ok_or_else(|| FederationError::InvalidObject("delete of an object without id".to_string()))?;

        let former_type = former_type(object, &uri, actor);
        if POST_TYPES.contains(&former_type.as_str()) {
            self.delete_note(actor, &uri).await
        } else if ACTOR_TYPES.contains(&former_type.as_str()) {
            self.delete_actor(actor, &uri).await
        } else {
            Ok(Outcome::skip(format!("unknown type {former_type}")))
        }
    }

    async fn delete_actor(&self, actor: &User, uri: &Url) -> FederationResult<Outcome> {
        if actor.uri.as_ref() != Some(uri) {
            return Ok(Outcome::skip(format!(
                "delete actor {} !== {uri}",
                actor.uri.as_ref().map_or("(local)", Url::as_str)
            )));
        }

        let current = self.ctx.domain.users.find_by_id(&actor.id).await?;
        if current.is_none_or(|user| user.is_deleted) {
            return Ok(Outcome::skip("already deleted"));
        }

        // The purge worker skips accounts that are not marked deleted yet.
        self.ctx.domain.users.mark_deleted(&actor.id).await?;
        let job_id = self.ctx.account_jobs.enqueue_delete_account(&actor.id).await?;
        self.ctx.users_cache.invalidate(uri.as_str());
        self.ctx
            .events
            .publish(InternalEvent::RemoteUserUpdated {
                user_id: actor.id.clone(),
                uri: uri.to_string(),
            })
            .await;

        info!(user_id = %actor.id, uri = %uri, job_id = %job_id, "Remote account deleted");
        Ok(Outcome::ok_with(format!("queued delete account job {job_id}")))
    }

    async fn delete_note(&self, actor: &User, uri: &Url) -> FederationResult<Outcome> {
        let guard = self.ctx.locks.ap_lock(uri.as_str()).await?;
        let result = self.delete_note_locked(actor, uri).await;
        guard.release().await?;
        result
    }

    async fn delete_note_locked(&self, actor: &User, uri: &Url) -> FederationResult<Outcome> {
        if let Some(note) = self.notes.fetch_note(uri).await? {
            if note.user_id != actor.id {
                return Ok(Outcome::skip("actor is not the author"));
            }
            self.ctx.domain.notes.delete(&note.id).await?;
            info!(note_id = %note.id, uri = %uri, "Deleted remote note");
            return Ok(Outcome::ok_with("note deleted"));
        }

        if let Some(message) = self.ctx.domain.messages.find_by_uri(uri).await? {
            if message.user_id != actor.id {
                return Ok(Outcome::skip("actor is not the author"));
            }
            self.ctx.domain.messages.delete(&message.id).await?;
            info!(message_id = %message.id, uri = %uri, "Deleted remote message");
            return Ok(Outcome::ok_with("message deleted"));
        }

        Ok(Outcome::skip("note not found"))
    }
}

/// What the deleted object used to be.
///
/// Tombstones carry `formerType`; embedded objects carry their own type; a
/// bare URI is the actor itself when it equals the actor id, else a note.
fn former_type(object: &ObjectRef, uri: &Url, actor: &User) -> String {
    let declared = object.as_embedded().and_then(|value| {
        if value.get("type").and_then(Value::as_str) == Some("Tombstone") {
            value.get("formerType").and_then(Value::as_str)
        } else {
            object.type_name()
        }
    });

    declared.map_or_else(
        || {
            if actor.uri.as_ref() == Some(uri) {
                "Person".to_string()
            } else {
                "Note".to_string()
            }
        },
        String::from,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::jobs::{AccountJobQueue, DeleteAccountJob, QueueError};
    use crate::store::{MemoryDomain, Message, UserStore};
    use crate::test_utils::TestFederation;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Records whether the user was already marked deleted at enqueue time.
    struct DeletionObservingQueue {
        store: Arc<MemoryDomain>,
        seen: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl AccountJobQueue for DeletionObservingQueue {
        async fn enqueue_delete_account(&self, user_id: &str) -> Result<String, QueueError> {
            let deleted = UserStore::find_by_id(self.store.as_ref(), user_id)
                .await
                .unwrap()
                .is_some_and(|user| user.is_deleted);
            self.seen.lock().unwrap().push(deleted);
            Ok("job1".to_string())
        }

        async fn enqueue(&self, _job: DeleteAccountJob, _delay: Option<Duration>) -> Result<(), QueueError> {
            Ok(())
        }
    }

    const ALICE: &str = "https://remote.example/users/alice";

    fn delete(object: Value) -> Activity {
        Activity::from_value(json!({
            "type": "Delete",
            "id": "https://remote.example/deletes/1",
            "actor": ALICE,
            "object": object
        }))
        .unwrap()
    }

    async fn run(fed: &TestFederation, actor: &User, activity: &Activity) -> FederationResult<Outcome> {
        DeleteProcessor::new(fed.ctx.clone())
            .process(actor, activity, &mut Resolver::new(fed.ctx.clone()))
            .await
    }

    #[test]
    fn test_former_type_inference() {
        let alice = crate::test_utils::remote_user("alice1", "remote.example", "alice");
        let actor_uri = Url::parse(ALICE).unwrap();
        let note_uri = Url::parse("https://remote.example/notes/1").unwrap();

        let tombstone = ObjectRef::from_value(json!({
            "type": "Tombstone", "id": "https://remote.example/notes/1", "formerType": "Question"
        }))
        .unwrap();
        assert_eq!(former_type(&tombstone, &note_uri, &alice), "Question");

        let bare_tombstone = ObjectRef::from_value(json!({
            "type": "Tombstone", "id": ALICE
        }))
        .unwrap();
        assert_eq!(former_type(&bare_tombstone, &actor_uri, &alice), "Person");

        assert_eq!(former_type(&ObjectRef::Uri(actor_uri.clone()), &actor_uri, &alice), "Person");
        assert_eq!(former_type(&ObjectRef::Uri(note_uri.clone()), &note_uri, &alice), "Note");
    }

    #[tokio::test]
    async fn test_delete_note_checks_owner() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.remote_user("carol1", "remote.example", "carol").await;
        fed.note("n1", "carol1", Some("https://remote.example/notes/1")).await;
        fed.note("n2", "alice1", Some("https://remote.example/notes/2")).await;

        let outcome = run(&fed, &alice, &delete(json!("https://remote.example/notes/1")))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::skip("actor is not the author"));

        let outcome = run(
            &fed,
            &alice,
            &delete(json!({"type": "Tombstone", "id": "https://remote.example/notes/2"})),
        )
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::ok_with("note deleted"));
        assert_eq!(fed.store.notes().await.len(), 1);

        let outcome = run(&fed, &alice, &delete(json!("https://remote.example/notes/9")))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::skip("note not found"));
        assert!(fed.leases.holder("ap-object:https://remote.example/notes/9").is_none());
    }

    #[tokio::test]
    async fn test_delete_legacy_message() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.store
            .insert_message(Message {
                id: "m1".to_string(),
                uri: Some(Url::parse("https://remote.example/messages/1").unwrap()),
                user_id: "alice1".to_string(),
            })
            .await;

        let outcome = run(&fed, &alice, &delete(json!("https://remote.example/messages/1")))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::ok_with("message deleted"));
    }

    #[tokio::test]
    async fn test_account_is_marked_deleted_before_purge_is_queued() {
        let mut fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        let queue = Arc::new(DeletionObservingQueue {
            store: fed.store.clone(),
            seen: Mutex::new(Vec::new()),
        });
        fed.ctx.account_jobs = queue.clone() as Arc<dyn AccountJobQueue>;

        let outcome = run(&fed, &alice, &delete(json!(ALICE))).await.unwrap();
        assert_eq!(outcome, Outcome::ok_with("queued delete account job job1"));
        assert_eq!(*queue.seen.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_delete_actor_queues_purge_once() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        let mut events = fed.ctx.events.subscribe();

        let outcome = run(&fed, &alice, &delete(json!(ALICE))).await.unwrap();
        let jobs = fed.account_jobs.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].user_id, "alice1");
        assert_eq!(
            outcome,
            Outcome::ok_with(format!("queued delete account job {}", jobs[0].id))
        );
        assert_eq!(
            events.recv().await.unwrap(),
            InternalEvent::RemoteUserUpdated {
                user_id: "alice1".to_string(),
                uri: ALICE.to_string(),
            }
        );

        let again = run(&fed, &alice, &delete(json!(ALICE))).await.unwrap();
        assert_eq!(again, Outcome::skip("already deleted"));
        assert_eq!(fed.account_jobs.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_of_other_actor_and_unknown_type() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;

        let outcome = run(
            &fed,
            &alice,
            &delete(json!({"type": "Person", "id": "https://remote.example/users/carol"})),
        )
        .await
        .unwrap();
        assert_eq!(
            outcome,
            Outcome::skip(format!("delete actor {ALICE} !== https://remote.example/users/carol"))
        );

        let outcome = run(
            &fed,
            &alice,
            &delete(json!({"type": "Image", "id": "https://remote.example/media/1"})),
        )
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::skip("unknown type Image"));
    }

    #[tokio::test]
    async fn test_delete_by_other_actor_is_rejected() {
        let fed = TestFederation::new().await;
        let mallory = fed.remote_user("m1", "evil.example", "mallory").await;

        let err = run(&fed, &mallory, &delete(json!(ALICE))).await.unwrap_err();
        assert!(matches!(err, FederationError::Validation(_)));
    }
}
