//! Reject activity processor.

use tracing::info;

use super::accept::relay_follow_id;
use super::{Outcome, PersonService, require_object};
use crate::activities::{Activity, ActivityKind};
use crate::context::FederationContext;
use crate::error::FederationResult;
use crate::objects::RemoteObject;
use crate::resolver::Resolver;
use crate::store::{RelayStatus, User};

/// A remote actor rejected (or later revoked) a follow of ours.
#[derive(Clone)]
pub struct RejectProcessor {
    ctx: FederationContext,
    persons: PersonService,
}

impl RejectProcessor {
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
            if self.ctx.domain.relays.find(&relay_id).await?.is_none() {
                return Ok(Outcome::skip("relay not found"));
            }
            self.ctx
                .domain
                .relays
                .set_status(&relay_id, RelayStatus::Rejected)
                .await?;
            info!(relay_id = %relay_id, "Relay subscription rejected");
            return Ok(Outcome::ok_with("relay rejected"));
        }

        match resolver.resolve(object).await? {
            RemoteObject::Activity(follow) if follow.kind == ActivityKind::Follow => {
                self.reject_follow(actor, &follow).await
            }
            other => Ok(Outcome::skip(format!("unknown reject type {}", other.kind_name()))),
        }
    }

    async fn reject_follow(&self, actor: &User, follow: &Activity) -> FederationResult<Outcome> {
        let Some(follower_uri) = follow.actor_id() else {
            return Ok(Outcome::skip("follower not found"));
        };
        let Some(follower) = self.persons.fetch_person(&follower_uri).await? else {
            return Ok(Outcome::skip("follower not found"));
        };
        if follower.is_remote() {
            return Ok(Outcome::skip("follower is not a local user"));
        }

        self.ctx
            .domain
            .relations
            .reject_follow(&follower.id, &actor.id)
            .await?;
        info!(follower = %follower.id, followee = %actor.id, "Follow rejected");
        Ok(Outcome::ok())
    }
}
