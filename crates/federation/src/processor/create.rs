//! Create activity processor.

use serde_json::Value;
use tracing::debug;

use super::{NoteService, Outcome, require_object};
use crate::activities::Activity;
use crate::context::FederationContext;
use crate::error::{FederationError, FederationResult};
use crate::objects::{ApNote, ObjectRef, RemoteObject};
use crate::resolver::Resolver;
use crate::store::User;

/// A remote actor published a post.
#[derive(Clone)]
pub struct CreateProcessor {
    ctx: FederationContext,
    notes: NoteService,
}

impl CreateProcessor {
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
        resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        let object = with_activity_audience(require_object(activity)?, activity);

        let note = match resolver.resolve(&object).await? {
            RemoteObject::Note(note) | RemoteObject::Question(note) => note,
            other => {
                return Ok(Outcome::skip(format!("unsupported type {}", other.kind_name())));
            }
        };
        check_attribution(actor, &note)?;

        let guard = self.ctx.locks.ap_lock(note.id.as_str()).await?;
        let result = self.create_note(&note, resolver).await;
        guard.release().await?;
        result
    }

    async fn create_note(&self, note: &ApNote, resolver: &mut Resolver) -> FederationResult<Outcome> {
        if self.notes.fetch_note(&note.id).await?.is_some() {
            return Ok(Outcome::skip("note exists"));
        }

        match self.notes.create_note(note, resolver).await {
            Ok(_) => Ok(Outcome::ok()),
            Err(FederationError::Status(e)) if !e.is_retryable() => {
                debug!(uri = %note.id, status = e.code, "Note creation hit a client error");
                Ok(Outcome::skip(e.code.to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

/// Fill in `to`/`cc` that only one of activity and embedded object carries.
fn with_activity_audience(object: &ObjectRef, activity: &Activity) -> ObjectRef {
    let ObjectRef::Embedded(value) = object else {
        return object.clone();
    };
    let mut value = (**value).clone();
    if let Value::Object(map) = &mut value {
        for (key, addressed) in [("to", &activity.to), ("cc", &activity.cc)] {
            let missing = map.get(key).is_none_or(|v| v.is_null());
            if missing && !addressed.is_empty() {
                let uris = addressed.iter().map(|u| Value::String(u.to_string())).collect();
                map.insert(key.to_string(), Value::Array(uris));
            }
        }
    }
    ObjectRef::Embedded(Box::new(value))
}

/// The post must be attributed to the actor and live on the actor's host.
fn check_attribution(actor: &User, note: &ApNote) -> FederationResult<()> {
    let attributed_to = note.attributed_to.id();
    if attributed_to.is_none() || attributed_to != actor.uri {
        return Err(FederationError::Validation(format!(
            "actor {} is not the author of {}",
            actor.uri.as_ref().map_or("(local)", url::Url::as_str),
            note.id
        )));
    }
    let actor_host = actor.uri.as_ref().and_then(|u| u.host_str());
    if note.id.host_str() != actor_host {
        return Err(FederationError::Validation(format!(
            "note {} is not on the host of its actor",
            note.id
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::Visibility;
    use crate::test_utils::TestFederation;
    use serde_json::json;

    fn create(object: Value) -> Activity {
        Activity::from_value(json!({
            "type": "Create",
            "id": "https://remote.example/notes/1/activity",
            "actor": "https://remote.example/users/alice",
            "to": ["https://www.w3.org/ns/activitystreams#Public"],
            "object": object
        }))
        .unwrap()
    }

    fn note(extra: Value) -> Value {
        let mut value = json!({
            "type": "Note",
            "id": "https://remote.example/notes/1",
            "attributedTo": "https://remote.example/users/alice",
            "content": "<p>hi</p>"
        });
        if let (Value::Object(map), Value::Object(extra)) = (&mut value, extra) {
            map.extend(extra);
        }
        value
    }

    async fn run(fed: &TestFederation, actor: &User, activity: &Activity) -> FederationResult<Outcome> {
        CreateProcessor::new(fed.ctx.clone())
            .process(actor, activity, &mut Resolver::new(fed.ctx.clone()))
            .await
    }

    #[tokio::test]
    async fn test_create_takes_audience_from_activity_and_is_idempotent() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        let activity = create(note(json!({})));

        assert_eq!(run(&fed, &alice, &activity).await.unwrap(), Outcome::ok());
        let notes = fed.store.notes().await;
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].visibility, Visibility::Public);
        assert_eq!(notes[0].text.as_deref(), Some("hi"));

        assert_eq!(
            run(&fed, &alice, &activity).await.unwrap(),
            Outcome::skip("note exists")
        );
        assert_eq!(fed.store.notes().await.len(), 1);
        assert!(fed.leases.holder("ap-object:https://remote.example/notes/1").is_none());
    }

    #[tokio::test]
    async fn test_create_with_foreign_attribution_is_rejected() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;

        let spoofed = create(note(json!({"attributedTo": "https://remote.example/users/bob"})));
        assert!(matches!(
            run(&fed, &alice, &spoofed).await,
            Err(FederationError::Validation(_))
        ));

        let off_host = create(note(json!({"id": "https://other.example/notes/1"})));
        assert!(matches!(
            run(&fed, &alice, &off_host).await,
            Err(FederationError::Validation(_))
        ));
        assert!(fed.store.notes().await.is_empty());
    }

    #[tokio::test]
    async fn test_create_of_unsupported_type_is_skipped() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;

        let outcome = run(
            &fed,
            &alice,
            &create(json!({"type": "Listen", "id": "https://remote.example/listens/1"})),
        )
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::skip("unsupported type Listen"));
    }

    #[tokio::test]
    async fn test_create_with_missing_reply_target_is_skipped() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.transport.status("https://remote.example/notes/0", 404);

        let outcome = run(
            &fed,
            &alice,
            &create(note(json!({"inReplyTo": "https://remote.example/notes/0"}))),
        )
        .await
        .unwrap();
        assert_eq!(outcome, Outcome::skip("404"));
        assert!(fed.store.notes().await.is_empty());
        assert!(fed.leases.holder("ap-object:https://remote.example/notes/1").is_none());
    }
}
