//! Resolution of the actor behind an inbound signature.

use tracing::debug;
use url::Url;

use crate::context::FederationContext;
use crate::error::FederationResult;
use crate::processor::PersonService;
use crate::resolver::Resolver;
use crate::store::{User, UserPublicKey};

/// A remote user and the key it signs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub user: User,
    pub key: UserPublicKey,
}

/// Maps signature key ids to remote users, fetching unknown actors.
#[derive(Clone)]
pub struct AuthUserResolver {
    ctx: FederationContext,
    persons: PersonService,
}

impl AuthUserResolver {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            persons: PersonService::new(ctx.clone()),
            ctx,
        }
    }

    /// The signer of a request: by key id when the key is known, otherwise
    /// by resolving `actor_uri`. `None` when the actor has no usable key.
    pub async fn get_auth_user(&self, key_id: &str, actor_uri: &Url) -> FederationResult<Option<AuthUser>> {
        if let Some((user, key)) = self.ctx.keys_cache.get(key_id) {
            return Ok(Some(AuthUser { user, key }));
        }

        let users = &self.ctx.domain.users;
        if let Some(key) = users.find_public_key(key_id).await? {
            if let Some(user) = users.find_by_id(&key.user_id).await? {
                self.ctx.keys_cache.set(&user, &key);
                return Ok(Some(AuthUser { user, key }));
            }
        }

        let known = self.persons.fetch_person(actor_uri).await?.is_some();
        let mut resolver = Resolver::new(self.ctx.clone());
        let mut user = self.persons.resolve_person(actor_uri, &mut resolver).await?;
        if user.is_local() {
            return Ok(None);
        }

        let mut key = users.find_public_key_by_user(&user.id).await?;
        if known && key.as_ref().is_none_or(|k| k.key_id != key_id) {
            // Stored profile predates a key rotation.
            debug!(key_id = %key_id, actor = %actor_uri, "Unknown key id; refreshing actor");
            user = self.persons.refresh_person(actor_uri).await?;
            key = users.find_public_key_by_user(&user.id).await?;
        }

        Ok(key.map(|key| {
            self.ctx.keys_cache.set(&user, &key);
            AuthUser { user, key }
        }))
    }
}
