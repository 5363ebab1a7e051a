//! Accept activity processor.

use tracing::info;
use url::Url;

use super::{Outcome, PersonService, require_object};
use crate::activities::{Activity, ActivityKind};
use crate::context::FederationContext;
use crate::error::{DomainError, FederationResult};
use crate::objects::RemoteObject;
use crate::resolver::Resolver;
use crate::store::{Notification, RelayStatus, User};

/// Path prefix of the Follow activities we send to relays.
pub(crate) const RELAY_FOLLOW_PATH: &str = "/activities/follow-relay/";

/// Relay id when `id` names one of our relay Follow activities.
pub(crate) fn relay_follow_id(ctx: &FederationContext, id: &Url) -> Option<String> {
    if !ctx.is_local_url(id) {
        return None;
    }
    id.path()
        .strip_prefix(RELAY_FOLLOW_PATH)
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
        .map(String::from)
}

/// A remote actor accepted a follow (or relay subscription) of ours.
#[derive(Clone)]
pub struct AcceptProcessor {
    ctx: FederationContext,
    persons: PersonService,
}

impl AcceptProcessor {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            persons: PersonService::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn process(
        &self,
        actor: &User,
        activity: &Activity,
        resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        let object = require_object(activity)?;

        if let Some(relay_id) = object.id().and_then(|id| relay_follow_id(&self.ctx, &id)) {
            return self.accept_relay(&relay_id).await;
        }

        match resolver.resolve(object).await? {
            RemoteObject::Activity(follow) if follow.kind == ActivityKind::Follow => {
                self.accept_follow(actor, &follow).await
            }
            other => Ok(Outcome::skip(format!("unknown accept type {}", other.kind_name()))),
        }
    }

    async fn accept_relay(&self, relay_id: &str) -> FederationResult<Outcome> {
        if self.ctx.domain.relays.find(relay_id).await?.is_none() {
            return Ok(Outcome::skip("relay not found"));
        }
        self.ctx
            .domain
            .relays
            .set_status(relay_id, RelayStatus::Accepted)
            .await?;
        info!(relay_id = %relay_id, "Relay subscription accepted");
        Ok(Outcome::ok_with("relay accepted"))
    }

    async fn accept_follow(&self, actor: &User, follow: &Activity) -> FederationResult<Outcome> {
        let Some(follower_uri) = follow.actor_id() else {
            return Ok(Outcome::skip("follower not found"));
        };
        let Some(follower) = self.persons.fetch_person(&follower_uri).await? else {
            return Ok(Outcome::skip("follower not found"));
        };
        if follower.is_remote() {
            return Ok(Outcome::skip("follower is not a local user"));
        }

        match self
            .ctx
            .domain
            .relations
            .accept_follow_request(&follower.id, &actor.id)
            .await
        {
            Ok(()) => {}
            Err(DomainError::NoSuchFollowRequest) => {
                if self
                    .ctx
                    .domain
                    .relations
                    .is_following(&follower.id, &actor.id)
                    .await?
                {
                    return Ok(Outcome::ok());
                }
                return Ok(Outcome::skip("follow request not found"));
            }
            Err(e) => return Err(e.into()),
        }

        self.ctx
            .domain
            .notifications
            .notify(
                &follower.id,
                Notification::FollowRequestAccepted {
                    followee_id: actor.id.clone(),
                },
            )
            .await?;
        info!(follower = %follower.id, followee = %actor.id, "Follow accepted");
        Ok(Outcome::ok())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{Relay, RelationStore};
    use crate::test_utils::TestFederation;
    use serde_json::json;

    fn accept(object: serde_json::Value) -> Activity {
        Activity::from_value(json!({
            "type": "Accept",
            "actor": "https://remote.example/users/alice",
            "object": object
        }))
        .unwrap()
    }

    async fn run(fed: &TestFederation, actor: &User, activity: &Activity) -> Outcome {
        AcceptProcessor::new(fed.ctx.clone())
            .process(actor, activity, &mut Resolver::new(fed.ctx.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_accept_local_follow_uri() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.local_user("bob1", "bob").await;
        fed.store.insert_follow_request("bob1", "alice1").await;

        let outcome = run(
            &fed,
            &alice,
            &accept(json!("https://local.example/follows/bob1/alice1")),
        )
        .await;

        assert_eq!(outcome, Outcome::ok());
        assert!(fed.store.is_following("bob1", "alice1").await.unwrap());
        assert!(fed.store.follow_requests().await.is_empty());
        assert!(fed.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_accept_embedded_follow_of_remote_user_is_skipped() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.remote_user("carol1", "other.example", "carol").await;

        let outcome = run(
            &fed,
            &alice,
            &accept(json!({
                "type": "Follow",
                "actor": "https://other.example/users/carol",
                "object": "https://remote.example/users/alice"
            })),
        )
        .await;
        assert_eq!(outcome, Outcome::skip("follower is not a local user"));
    }

    #[tokio::test]
    async fn test_accept_relay_subscription() {
        let fed = TestFederation::new().await;
        let relay_actor = fed.remote_user("relay1", "relay.example", "relay").await;
        fed.store
            .insert_relay(Relay {
                id: "r1".to_string(),
                inbox: Url::parse("https://relay.example/inbox").unwrap(),
                status: RelayStatus::Requesting,
            })
            .await;

        let outcome = run(
            &fed,
            &relay_actor,
            &accept(json!("https://local.example/activities/follow-relay/r1")),
        )
        .await;

        assert_eq!(outcome, Outcome::ok_with("relay accepted"));
        let inboxes = crate::store::RelayStore::accepted_inboxes(fed.store.as_ref())
            .await
            .unwrap();
        assert_eq!(inboxes.len(), 1);
    }

    #[tokio::test]
    async fn test_accept_of_other_type_is_skipped() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;

        let outcome = run(
            &fed,
            &alice,
            &accept(json!({
                "type": "Note",
                "id": "https://remote.example/notes/1",
                "attributedTo": "https://remote.example/users/alice"
            })),
        )
        .await;
        assert_eq!(outcome, Outcome::skip("unknown accept type Note"));
    }
}
