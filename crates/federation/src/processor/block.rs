//! Block activity processor.

use tracing::info;

use super::{Outcome, PersonService, require_object};
use crate::activities::Activity;
use crate::context::FederationContext;
use crate::error::FederationResult;
use crate::resolver::Resolver;
use crate::store::User;

/// A remote actor blocks one of our users.
#[derive(Clone)]
pub struct BlockProcessor {
    ctx: FederationContext,
    persons: PersonService,
}

impl BlockProcessor {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            persons: PersonService::new(ctx.clone()),
            ctx,
        }
    }

    /// Record the block. Followings in both directions are dropped by the store.
    pub async fn process(
        &self,
        actor: &User,
        activity: &Activity,
        _resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        let Some(blockee) = self.local_object_user(activity).await? else {
            return Ok(Outcome::skip("blockee not found"));
        };
        if blockee.is_remote() {
            return Ok(Outcome::skip("blockee is not local"));
        }

        self.ctx.domain.relations.block(&actor.id, &blockee.id).await?;
        info!(blocker = %actor.id, blockee = %blockee.id, "Blocked");
        Ok(Outcome::ok())
    }

    async fn local_object_user(&self, activity: &Activity) -> FederationResult<Option<User>> {
        match require_object(activity)?.id() {
            Some(uri) => self.persons.fetch_person(&uri).await,
            None => Ok(None),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::RelationStore;
    use crate::test_utils::TestFederation;
    use serde_json::json;

    fn block(object: &str) -> Activity {
        Activity::from_value(json!({
            "type": "Block",
            "id": "https://remote.example/blocks/1",
            "actor": "https://remote.example/users/alice",
            "object": object
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_block_drops_followings() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.local_user("bob1", "bob").await;
        fed.store.insert_following("bob1", "alice1").await;

        let outcome = BlockProcessor::new(fed.ctx.clone())
            .process(
                &alice,
                &block("https://local.example/users/bob1"),
                &mut Resolver::new(fed.ctx.clone()),
            )
            .await
            .unwrap();

        assert_eq!(outcome, Outcome::ok());
        assert!(fed.store.is_blocking("alice1", "bob1").await.unwrap());
        assert!(fed.store.followings().await.is_empty());
    }

    #[tokio::test]
    async fn test_block_requires_local_blockee() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        fed.remote_user("carol1", "other.example", "carol").await;
        let processor = BlockProcessor::new(fed.ctx.clone());

        let remote = processor
            .process(
                &alice,
                &block("https://other.example/users/carol"),
                &mut Resolver::new(fed.ctx.clone()),
            )
            .await
            .unwrap();
        assert_eq!(remote, Outcome::skip("blockee is not local"));

        let missing = processor
            .process(
                &alice,
                &block("https://local.example/users/nobody"),
                &mut Resolver::new(fed.ctx.clone()),
            )
            .await
            .unwrap();
        assert_eq!(missing, Outcome::skip("blockee not found"));
    }
}
