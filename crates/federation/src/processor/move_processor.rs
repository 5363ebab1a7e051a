//! Move activity processor.
//!
//! A remote account announces it moved to a new actor. Local followers of
//! the old account are re-pointed at the new one, but only when the new
//! actor lists the old one in `alsoKnownAs`. Nobody is auto-followed.

use tracing::{debug, info};
use url::Url;

use super::{Outcome, PersonService, profile_from_actor};
use crate::activities::Activity;
use crate::context::FederationContext;
use crate::error::{FederationError, FederationResult};
use crate::events::InternalEvent;
use crate::objects::ObjectRef;
use crate::resolver::Resolver;
use crate::store::{Notification, User};

#[derive(Clone)]
pub struct MoveProcessor {
    ctx: FederationContext,
    persons: PersonService,
}

impl MoveProcessor {
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
        let Some(target_uri) = activity.target.as_ref().and_then(ObjectRef::id) else {
            return Ok(Outcome::skip("invalid move target"));
        };
        let Some(source_uri) = activity.object_id().or_else(|| actor.uri.clone()) else {
            return Ok(Outcome::skip("source account not found"));
        };
        let Some(source) = self.persons.fetch_person(&source_uri).await? else {
            return Ok(Outcome::skip("source account not found"));
        };
        if source.id != actor.id {
            return Err(FederationError::Validation(format!(
                "actor {} cannot move {source_uri}",
                actor.id
            )));
        }

        let target = self.resolve_target(&target_uri, &source_uri, resolver).await?;
        if target.id == source.id {
            return Err(FederationError::Validation(format!("{source_uri} cannot move to itself")));
        }

        let users = &self.ctx.domain.users;
        users.set_moved_to(&source.id, Some(target_uri.clone())).await?;
        self.ctx.users_cache.invalidate(source_uri.as_str());
        self.ctx
            .events
            .publish(InternalEvent::RemoteUserUpdated {
                user_id: source.id.clone(),
                uri: source_uri.to_string(),
            })
            .await;

        let moved = self.repoint_followers(&source, &target).await?;
        info!(
            source = %source_uri,
            target = %target_uri,
            followers = moved,
            "Account moved"
        );
        Ok(Outcome::ok_with(format!("moved {moved} followers")))
    }

    /// The target account, registered or refreshed, after checking that it
    /// claims the source as an alias.
    async fn resolve_target(
        &self,
        target_uri: &Url,
        source_uri: &Url,
        resolver: &mut Resolver,
    ) -> FederationResult<User> {
        if self.ctx.is_local_url(target_uri) {
            let target = self
                .persons
                .fetch_person(target_uri)
                .await?
                .ok_or_else(|| FederationError::Validation(format!("unknown move target {target_uri}")))?;
            if !target.also_known_as.contains(source_uri) {
                return Err(alias_missing(target_uri, source_uri));
            }
            return Ok(target);
        }

        let actor = resolver.resolve_actor(&ObjectRef::Uri(target_uri.clone())).await?;
        if !actor.also_known_as.contains(source_uri) {
            return Err(alias_missing(target_uri, source_uri));
        }

        let user = self
            .ctx
            .domain
            .users
            .upsert_remote(profile_from_actor(&actor)?)
            .await?;
        self.ctx.users_cache.set(&user);
        Ok(user)
    }

    async fn repoint_followers(&self, source: &User, target: &User) -> FederationResult<usize> {
        let relations = &self.ctx.domain.relations;
        let mut moved = 0;

        for follower in relations.followers(&source.id).await? {
            if follower.is_remote() {
                continue;
            }
            if relations.is_following(&follower.id, &target.id).await?
                || relations.is_blocking(&target.id, &follower.id).await?
            {
                debug!(follower = %follower.id, target = %target.id, "Follower left on moved account");
                continue;
            }

            relations
                .repoint_following(&follower.id, &source.id, &target.id)
                .await?;
            self.ctx
                .domain
                .notifications
                .notify(
                    &follower.id,
                    Notification::Moved {
                        from_user_id: source.id.clone(),
                        to_user_id: target.id.clone(),
                    },
                )
                .await?;
            moved += 1;
        }

        Ok(moved)
    }
}

fn alias_missing(target_uri: &Url, source_uri: &Url) -> FederationError {
    FederationError::Validation(format!(
        "move target {target_uri} does not list {source_uri} in alsoKnownAs"
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{RelationStore, UserStore};
    use crate::test_utils::{TestFederation, remote_actor_json};
    use serde_json::json;

    const ALICE: &str = "https://remote.example/users/alice";
    const NEW_ALICE: &str = "https://new.example/users/alice";

    fn move_activity() -> Activity {
        Activity::from_value(json!({
            "type": "Move",
            "id": "https://remote.example/moves/1",
            "actor": ALICE,
            "object": ALICE,
            "target": NEW_ALICE
        }))
        .unwrap()
    }

    async fn setup(also_known_as: &[&str]) -> (TestFederation, User) {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.local_user("bob1", "bob").await;
        fed.local_user("carol1", "carol").await;
        fed.remote_user("dave1", "other.example", "dave").await;
        for follower in ["bob1", "carol1", "dave1"] {
            fed.store.insert_following(follower, "alice1").await;
        }

        let mut target = remote_actor_json("new.example", "alice");
        target["alsoKnownAs"] = json!(also_known_as);
        fed.transport.activity_json(NEW_ALICE, target);
        (fed, alice)
    }

    async fn run(fed: &TestFederation, actor: &User) -> FederationResult<Outcome> {
        MoveProcessor::new(fed.ctx.clone())
            .process(actor, &move_activity(), &mut Resolver::new(fed.ctx.clone()))
            .await
    }

    #[tokio::test]
    async fn test_move_repoints_local_followers() {
        let (fed, alice) = setup(&[ALICE]).await;
        let target = fed
            .store
            .upsert_remote(profile_from_actor(
                &serde_json::from_value(remote_actor_json("new.example", "alice")).unwrap(),
            )
            .unwrap())
            .await
            .unwrap();
        fed.store.insert_following("carol1", &target.id).await;

        let outcome = run(&fed, &alice).await.unwrap();
        assert_eq!(outcome, Outcome::ok_with("moved 1 followers"));

        assert!(fed.store.is_following("bob1", &target.id).await.unwrap());
        assert!(!fed.store.is_following("bob1", "alice1").await.unwrap());
        // carol already followed the target; dave is remote.
        assert!(fed.store.is_following("carol1", "alice1").await.unwrap());
        assert!(fed.store.is_following("dave1", "alice1").await.unwrap());

        let notifications = fed.store.notifications().await;
        assert_eq!(
            notifications,
            vec![(
                "bob1".to_string(),
                Notification::Moved {
                    from_user_id: "alice1".to_string(),
                    to_user_id: target.id.clone(),
                }
            )]
        );

        let source = UserStore::find_by_id(fed.store.as_ref(), "alice1").await.unwrap().unwrap();
        assert_eq!(source.moved_to_uri.unwrap().as_str(), NEW_ALICE);
    }

    #[tokio::test]
    async fn test_move_without_alias_changes_nothing() {
        let (fed, alice) = setup(&[]).await;

        let err = run(&fed, &alice).await.unwrap_err();
        assert!(matches!(err, FederationError::Validation(_)));

        assert_eq!(fed.store.followings().await.len(), 3);
        assert!(fed.store.notifications().await.is_empty());
        let source = UserStore::find_by_id(fed.store.as_ref(), "alice1").await.unwrap().unwrap();
        assert!(source.moved_to_uri.is_none());
    }

    #[tokio::test]
    async fn test_move_requires_target_and_own_source() {
        let (fed, alice) = setup(&[ALICE]).await;
        let mut activity = move_activity();
        activity.target = None;
        let outcome = MoveProcessor::new(fed.ctx.clone())
            .process(&alice, &activity, &mut Resolver::new(fed.ctx.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::skip("invalid move target"));

        let dave = UserStore::find_by_id(fed.store.as_ref(), "dave1").await.unwrap().unwrap();
        assert!(matches!(run(&fed, &dave).await, Err(FederationError::Validation(_))));
        assert!(fed.transport.requests().is_empty());
    }
}
