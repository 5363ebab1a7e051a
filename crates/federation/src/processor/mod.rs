//! Inbound activity processing.
//!
//! [`ActivityKernel`] matches on [`ActivityKind`] and hands the activity to
//! one processor per type. Processors report what they did as an
//! [`Outcome`]; only genuine failures are errors.

#![allow(missing_docs)]

mod accept;
mod announce;
mod block;
mod create;
mod delete;
mod featured;
mod flag;
mod follow;
mod like;
mod move_processor;
mod note;
mod person;
mod reject;
mod undo;
mod update;

pub use accept::AcceptProcessor;
pub use announce::AnnounceProcessor;
pub use block::BlockProcessor;
pub use create::CreateProcessor;
pub use delete::DeleteProcessor;
pub use featured::FeaturedProcessor;
pub use flag::FlagProcessor;
pub use follow::FollowProcessor;
pub use like::LikeProcessor;
pub use move_processor::MoveProcessor;
pub use note::NoteService;
pub use person::{PersonService, profile_from_actor};
pub use reject::RejectProcessor;
pub use undo::UndoProcessor;
pub use update::UpdateProcessor;

use std::fmt;

use chrono::{Duration, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use crate::activities::{Activity, ActivityKind};
use crate::context::FederationContext;
use crate::error::{FederationError, FederationResult};
use crate::objects::{COLLECTION_TYPES, ObjectRef};
use crate::resolver::Resolver;
use crate::store::User;

/// Remote persons older than this are refreshed in the background.
pub const PERSON_REFRESH_AFTER_HOURS: i64 = 24;

/// What processing an activity amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The activity took effect.
    Ok(Option<String>),
    /// The activity was understood but nothing was done.
    Skip(String),
}

impl Outcome {
    #[must_use]
    pub const fn ok() -> Self {
        Self::Ok(None)
    }

    #[must_use]
    pub fn ok_with(detail: impl Into<String>) -> Self {
        Self::Ok(Some(detail.into()))
    }

    #[must_use]
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip(reason.into())
    }

    #[must_use]
    pub const fn is_skip(&self) -> bool {
        matches!(self, Self::Skip(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok(None) => f.write_str("ok"),
            Self::Ok(Some(detail)) => write!(f, "ok: {detail}"),
            Self::Skip(reason) => write!(f, "skip: {reason}"),
        }
    }
}

/// Routes activities from an authenticated remote actor to their processors.
#[derive(Clone)]
pub struct ActivityKernel {
    ctx: FederationContext,
    persons: PersonService,
}

impl ActivityKernel {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            persons: PersonService::new(ctx.clone()),
            ctx,
        }
    }

    #[must_use]
    pub const fn context(&self) -> &FederationContext {
        &self.ctx
    }

    /// Perform an inbound payload: one activity, or a collection of them.
    pub async fn perform_value(&self, actor: &User, payload: Value) -> FederationResult<Outcome> {
        let kind = payload.get("type").and_then(Value::as_str).unwrap_or_default();
        if !COLLECTION_TYPES.contains(&kind) {
            return self.perform(actor, Activity::from_value(payload)?).await;
        }

        let mut resolver = Resolver::new(self.ctx.clone());
        let collection = resolver
            .resolve_collection(&ObjectRef::from_value(payload)?)
            .await?;

        let mut performed = 0usize;
        for item in collection
            .items()
            .iter()
            .take(self.ctx.config.max_collection_items)
        {
            let result = match resolver.resolve_activity(item).await {
                Ok(activity) => self.perform_with(actor, &activity, &mut resolver).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome) => {
                    debug!(item = ?item.id(), outcome = %outcome, "Performed collection item");
                    performed += 1;
                }
                Err(e) => warn!(item = ?item.id(), error = %e, "Failed to perform collection item"),
            }
        }

        Ok(Outcome::ok_with(format!("performed {performed} activities")))
    }

    /// Perform one activity.
    pub async fn perform(&self, actor: &User, activity: Activity) -> FederationResult<Outcome> {
        let mut resolver = Resolver::new(self.ctx.clone());
        if let Some(id) = &activity.id {
            resolver.remember(id);
        }
        self.perform_with(actor, &activity, &mut resolver).await
    }

    async fn perform_with(
        &self,
        actor: &User,
        activity: &Activity,
        resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        if actor.is_suspended {
            return Ok(Outcome::skip("actor is suspended"));
        }

        let outcome = self.dispatch(actor, activity, resolver).await?;
        self.refresh_if_stale(actor);

        info!(
            actor = %actor.id,
            activity_id = ?activity.id.as_ref().map(Url::as_str),
            activity_type = %activity.kind,
            outcome = %outcome,
            "Performed activity"
        );
        Ok(outcome)
    }

    async fn dispatch(
        &self,
        actor: &User,
        activity: &Activity,
        resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        let ctx = self.ctx.clone();
        match &activity.kind {
            ActivityKind::Create => CreateProcessor::new(ctx).process(actor, activity, resolver).await,
            ActivityKind::Delete => DeleteProcessor::new(ctx).process(actor, activity, resolver).await,
            ActivityKind::Update => UpdateProcessor::new(ctx).process(actor, activity, resolver).await,
            ActivityKind::Read => Ok(Outcome::skip("read receipts are not supported")),
            ActivityKind::Follow => FollowProcessor::new(ctx).process(actor, activity, resolver).await,
            ActivityKind::Accept => AcceptProcessor::new(ctx).process(actor, activity, resolver).await,
            ActivityKind::Reject => RejectProcessor::new(ctx).process(actor, activity, resolver).await,
            ActivityKind::Add => {
                FeaturedProcessor::new(ctx)
                    .process_add(actor, activity, resolver)
                    .await
            }
            ActivityKind::Remove => {
                FeaturedProcessor::new(ctx)
                    .process_remove(actor, activity, resolver)
                    .await
            }
            ActivityKind::Announce => {
                AnnounceProcessor::new(ctx)
                    .process(actor, activity, resolver)
                    .await
            }
            ActivityKind::Like => LikeProcessor::new(ctx).process(actor, activity, resolver).await,
            ActivityKind::Undo => UndoProcessor::new(ctx).process(actor, activity, resolver).await,
            ActivityKind::Block => BlockProcessor::new(ctx).process(actor, activity, resolver).await,
            ActivityKind::Flag => FlagProcessor::new(ctx).process(actor, activity, resolver).await,
            ActivityKind::Move => MoveProcessor::new(ctx).process(actor, activity, resolver).await,
            ActivityKind::Unknown(kind) => {
                debug!(activity_type = %kind, "Unrecognized activity type");
                Ok(Outcome::skip(format!("unrecognized activity type: {kind}")))
            }
        }
    }

    /// Submit a background refresh when the actor's profile is older than a day.
    fn refresh_if_stale(&self, actor: &User) {
        let stale_before = Utc::now() - Duration::hours(PERSON_REFRESH_AFTER_HOURS);
        let is_stale = actor.last_fetched_at.is_none_or(|at| at < stale_before);
        let Some(uri) = actor.uri.clone().filter(|_| actor.is_remote() && is_stale) else {
            return;
        };

        let persons = self.persons.clone();
        self.ctx.tasks.spawn("refresh person", async move {
            persons.refresh_person(&uri).await.map(|_| ())
        });
    }
}

/// The actor of `activity` must be the authenticated actor.
pub(crate) fn ensure_actor(actor: &User, activity: &Activity) -> FederationResult<()> {
    let claimed = activity.actor_id();
    if claimed.is_none() || claimed != actor.uri {
        return Err(FederationError::Validation(format!(
            "activity actor {} does not match authenticated actor {}",
            claimed.map_or_else(|| "(none)".to_string(), |u| u.to_string()),
            actor.uri.as_ref().map_or("(local)", Url::as_str)
        )));
    }
    Ok(())
}

/// The primary object, or a validation error naming `kind`.
pub(crate) fn require_object<'a>(activity: &'a Activity) -> FederationResult<&'a ObjectRef> {
    activity.object().ok_or_else(|| {
        FederationError::InvalidObject(format!("{} activity without object", activity.kind))
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::TestFederation;
    use serde_json::json;

    #[test]
    fn test_outcome_display() {
        assert_eq!(Outcome::ok().to_string(), "ok");
        assert_eq!(Outcome::ok_with("unfollowed").to_string(), "ok: unfollowed");
        assert_eq!(Outcome::skip("note exists").to_string(), "skip: note exists");
    }

    #[tokio::test]
    async fn test_unknown_and_read_are_skipped() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        let kernel = ActivityKernel::new(fed.ctx.clone());

        let unknown = json!({
            "type": "EmojiReact",
            "actor": "https://remote.example/users/alice",
            "object": "https://local.example/notes/1"
        });
        assert_eq!(
            kernel.perform_value(&alice, unknown).await.unwrap(),
            Outcome::skip("unrecognized activity type: EmojiReact")
        );

        let read = json!({
            "type": "Read",
            "actor": "https://remote.example/users/alice",
            "object": "https://local.example/notes/1"
        });
        assert!(kernel.perform_value(&alice, read).await.unwrap().is_skip());
    }

    #[tokio::test]
    async fn test_suspended_actor_is_skipped() {
        let fed = TestFederation::new().await;
        let mut alice = fed.remote_user("alice1", "remote.example", "alice").await;
        alice.is_suspended = true;
        let kernel = ActivityKernel::new(fed.ctx.clone());

        let outcome = kernel
            .perform_value(
                &alice,
                json!({
                    "type": "Follow",
                    "actor": "https://remote.example/users/alice",
                    "object": "https://local.example/users/bob1"
                }),
            )
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::skip("actor is suspended"));
    }

    #[tokio::test]
    async fn test_collection_payload_performs_each_item() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.local_user("bob1", "bob").await;
        fed.local_user("carol1", "carol").await;
        let kernel = ActivityKernel::new(fed.ctx.clone());

        let follow = |id: &str, target: &str| {
            json!({
                "id": format!("https://remote.example/follows/{id}"),
                "type": "Follow",
                "actor": "https://remote.example/users/alice",
                "object": format!("https://local.example/users/{target}")
            })
        };
        let payload = json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "OrderedCollection",
            "orderedItems": [follow("1", "bob1"), follow("2", "carol1"), {"type": "Follow"}]
        });

        let outcome = kernel.perform_value(&alice, payload).await.unwrap();
        assert_eq!(outcome, Outcome::ok_with("performed 2 activities"));
        assert_eq!(fed.store.followings().await.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_actor_is_refreshed_in_background() {
        let fed = TestFederation::new().await;
        let mut alice = fed.remote_user("alice1", "remote.example", "alice").await;
        alice.last_fetched_at = Some(Utc::now() - Duration::hours(48));
        let mut actor_json = crate::test_utils::remote_actor_json("remote.example", "alice");
        actor_json["name"] = json!("Alice Refreshed");
        fed.transport
            .activity_json("https://remote.example/users/alice", actor_json);
        let kernel = ActivityKernel::new(fed.ctx.clone());

        kernel
            .perform_value(
                &alice,
                json!({
                    "type": "Read",
                    "actor": "https://remote.example/users/alice",
                    "object": "https://local.example/notes/1"
                }),
            )
            .await
            .unwrap();
        fed.ctx.tasks.drain().await;

        let refreshed = crate::store::UserStore::find_by_id(fed.store.as_ref(), "alice1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(refreshed.name.as_deref(), Some("Alice Refreshed"));
    }
}
