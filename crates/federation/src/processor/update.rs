//! Update activity processor.

use tracing::{info, warn};

use super::{NoteService, Outcome, PersonService, require_object};
use crate::activities::Activity;
use crate::context::FederationContext;
use crate::error::{FederationError, FederationResult};
use crate::objects::{ObjectRef, RemoteObject};
use crate::resolver::Resolver;
use crate::store::User;

/// A remote actor changed its profile or a poll.
#[derive(Clone)]
pub struct UpdateProcessor {
    persons: PersonService,
    notes: NoteService,
}

impl UpdateProcessor {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            persons: PersonService::new(ctx.clone()),
            notes: NoteService::new(ctx),
        }
    }

    pub async fn process(
        &self,
        actor: &User,
        activity: &Activity,
        resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        if activity.actor_id().is_none() || activity.actor_id() != actor.uri {
            return Ok(Outcome::skip("invalid actor"));
        }

        match resolver.resolve(require_object(activity)?).await? {
            RemoteObject::Actor(object) => {
                if Some(&object.id) != actor.uri.as_ref() {
                    return Err(FederationError::Validation(format!(
                        "actor {} cannot update {}",
                        activity.actor_id().map(|u| u.to_string()).unwrap_or_default(),
                        object.id
                    )));
                }
                let user = self.persons.update_person(&object).await?;
                info!(user_id = %user.id, "Person updated");
                Ok(Outcome::ok_with("person updated"))
            }
            RemoteObject::Question(question) => {
                // Already resolved; hand the document over instead of its URI.
                let embedded = serde_json::to_value(&question)
                    .map_err(|e| FederationError::Internal(e.to_string()))?;
                let reference = ObjectRef::Embedded(Box::new(embedded));
                if let Err(e) = self.notes.update_question(&reference, resolver).await {
                    warn!(uri = %question.id, error = %e, "Failed to update question");
                }
                Ok(Outcome::ok_with("question updated"))
            }
            other => Ok(Outcome::skip(format!("unknown type {}", other.kind_name()))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{NoteStore, Poll, UserStore};
    use crate::test_utils::{TestFederation, remote_actor_json};
    use serde_json::{Value, json};

    const ALICE: &str = "https://remote.example/users/alice";

    fn update(actor: &str, object: Value) -> Activity {
        Activity::from_value(json!({
            "type": "Update",
            "id": "https://remote.example/updates/1",
            "actor": actor,
            "object": object
        }))
        .unwrap()
    }

    async fn run(fed: &TestFederation, actor: &User, activity: &Activity) -> FederationResult<Outcome> {
        UpdateProcessor::new(fed.ctx.clone())
            .process(actor, activity, &mut Resolver::new(fed.ctx.clone()))
            .await
    }

    #[tokio::test]
    async fn test_update_person() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        let mut object = remote_actor_json("remote.example", "alice");
        object["name"] = json!("Alice Updated");

        let outcome = run(&fed, &alice, &update(ALICE, object)).await.unwrap();
        assert_eq!(outcome, Outcome::ok_with("person updated"));
        let stored = UserStore::find_by_id(fed.store.as_ref(), "alice1").await.unwrap().unwrap();
        assert_eq!(stored.name.as_deref(), Some("Alice Updated"));
    }

    #[tokio::test]
    async fn test_update_of_other_person_is_rejected() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.remote_user("carol1", "remote.example", "carol").await;

        let err = run(&fed, &alice, &update(ALICE, remote_actor_json("remote.example", "carol")))
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Validation(_)));
        let carol = UserStore::find_by_id(fed.store.as_ref(), "carol1").await.unwrap().unwrap();
        assert!(carol.name.is_none());
    }

    #[tokio::test]
    async fn test_update_from_other_actor_is_skipped() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;

        let outcome = run(
            &fed,
            &alice,
            &update("https://remote.example/users/carol", remote_actor_json("remote.example", "carol")),
        )
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::skip("invalid actor"));
    }

    #[tokio::test]
    async fn test_update_question_refreshes_votes() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        let mut note = fed.note("q1", "alice1", Some("https://remote.example/notes/q")).await;
        note.poll = Some(Poll {
            choices: vec!["yes".to_string(), "no".to_string()],
            votes: vec![0, 0],
            multiple: false,
            expires_at: None,
        });
        fed.store.insert_note(note).await;

        let question = json!({
            "type": "Question",
            "id": "https://remote.example/notes/q",
            "attributedTo": ALICE,
            "oneOf": [
                {"name": "yes", "replies": {"totalItems": 3}},
                {"name": "no", "replies": {"totalItems": 1}}
            ]
        });
        let outcome = run(&fed, &alice, &update(ALICE, question)).await.unwrap();
        assert_eq!(outcome, Outcome::ok_with("question updated"));
        let stored = NoteStore::find_by_id(fed.store.as_ref(), "q1").await.unwrap().unwrap();
        assert_eq!(stored.poll.unwrap().votes, vec![3, 1]);
    }

    #[tokio::test]
    async fn test_update_of_note_is_skipped() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;

        let outcome = run(
            &fed,
            &alice,
            &update(ALICE, json!({"type": "Note", "id": "https://remote.example/notes/1", "attributedTo": ALICE})),
        )
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::skip("unknown type Note"));
    }
}
