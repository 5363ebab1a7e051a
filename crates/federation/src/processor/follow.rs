//! Follow activity processor.

use tracing::info;

use super::{Outcome, PersonService, require_object};
use crate::activities::Activity;
use crate::context::FederationContext;
use crate::error::FederationResult;
use crate::resolver::Resolver;
use crate::store::{FollowResult, Notification, User};

/// A remote actor follows one of our users.
#[derive(Clone)]
pub struct FollowProcessor {
    ctx: FederationContext,
    persons: PersonService,
}

impl FollowProcessor {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            persons: PersonService::new(ctx.clone()),
            ctx,
        }
    }

    /// Follow, then answer with Accept (or Reject when blocked). Locked
    /// accounts get a follow request and no answer yet.
    pub async fn process(
        &self,
        actor: &User,
        activity: &Activity,
        _resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        let Some(object_id) = require_object(activity)?.id() else {
            return Ok(Outcome::skip("followee not found"));
        };
        let Some(followee) = self.persons.fetch_person(&object_id).await? else {
            return Ok(Outcome::skip("followee not found"));
        };
        if followee.is_remote() {
            return Ok(Outcome::skip("followee is not local"));
        }

        let result = self
            .ctx
            .domain
            .relations
            .follow(actor, &followee, activity.id.clone())
            .await?;
        info!(follower = %actor.id, followee = %followee.id, result = ?result, "Processed follow");

        let follow = self
            .ctx
            .renderer
            .render_follow(actor, &followee, activity.id.as_ref());

        match result {
            FollowResult::Followed | FollowResult::AlreadyFollowing => {
                let accept = self.ctx.renderer.render_accept(follow, &followee);
                self.ctx
                    .delivery
                    .deliver_to_user(accept, &followee, actor)
                    .await?;
                if result == FollowResult::Followed {
                    self.ctx
                        .domain
                        .notifications
                        .notify(
                            &followee.id,
                            Notification::Followed {
                                follower_id: actor.id.clone(),
                            },
                        )
                        .await?;
                }
                Ok(Outcome::ok())
            }
            FollowResult::Requested => {
                self.ctx
                    .domain
                    .notifications
                    .notify(
                        &followee.id,
                        Notification::FollowRequestReceived {
                            follower_id: actor.id.clone(),
                        },
                    )
                    .await?;
                Ok(Outcome::ok_with("follow requested"))
            }
            FollowResult::Blocked => {
                let reject = self.ctx.renderer.render_reject(follow, &followee);
                self.ctx
                    .delivery
                    .deliver_to_user(reject, &followee, actor)
                    .await?;
                Ok(Outcome::ok_with("rejected"))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{RelationStore, User};
    use crate::test_utils::TestFederation;
    use serde_json::json;

    fn follow(target: &str) -> Activity {
        Activity::from_value(json!({
            "id": "https://remote.example/follows/1",
            "type": "Follow",
            "actor": "https://remote.example/users/alice",
            "object": target
        }))
        .unwrap()
    }

    async fn run(fed: &TestFederation, actor: &User, activity: &Activity) -> Outcome {
        FollowProcessor::new(fed.ctx.clone())
            .process(actor, activity, &mut Resolver::new(fed.ctx.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_follow_is_accepted() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.local_user("bob1", "bob").await;

        let outcome = run(&fed, &alice, &follow("https://local.example/users/bob1")).await;

        assert_eq!(outcome, Outcome::ok());
        assert!(fed.store.is_following("alice1", "bob1").await.unwrap());
        let jobs = fed.deliveries.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0.activity_type(), "Accept");
        assert_eq!(jobs[0].0.target_inbox.as_str(), "https://remote.example/users/alice/inbox");
        assert_eq!(
            jobs[0].0.payload["object"]["id"],
            json!("https://remote.example/follows/1")
        );
        assert_eq!(fed.store.notifications().await.len(), 1);
    }

    #[tokio::test]
    async fn test_locked_account_gets_request() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.store
            .insert_user(User {
                is_locked: true,
                ..User::new_local("bob1", "bob")
            })
            .await;

        let outcome = run(&fed, &alice, &follow("https://local.example/users/bob1")).await;

        assert_eq!(outcome, Outcome::ok_with("follow requested"));
        assert_eq!(fed.store.follow_requests().await.len(), 1);
        assert!(fed.deliveries.jobs().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_follower_is_rejected() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.local_user("bob1", "bob").await;
        fed.store.block("bob1", "alice1").await.unwrap();

        let outcome = run(&fed, &alice, &follow("https://local.example/users/bob1")).await;

        assert_eq!(outcome, Outcome::ok_with("rejected"));
        assert!(!fed.store.is_following("alice1", "bob1").await.unwrap());
        assert_eq!(fed.deliveries.jobs()[0].0.activity_type(), "Reject");
    }

    #[tokio::test]
    async fn test_followee_must_be_local() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.remote_user("carol1", "other.example", "carol").await;

        assert_eq!(
            run(&fed, &alice, &follow("https://other.example/users/carol")).await,
            Outcome::skip("followee is not local")
        );
        assert_eq!(
            run(&fed, &alice, &follow("https://local.example/users/nobody")).await,
            Outcome::skip("followee not found")
        );
    }
}
