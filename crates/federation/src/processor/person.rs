//! Remote actor lookup, creation and refresh.

use tracing::{debug, info};
use url::Url;

use crate::actors::ApActor;
use crate::context::FederationContext;
use crate::error::{FederationError, FederationResult};
use crate::events::InternalEvent;
use crate::objects::ObjectRef;
use crate::resolver::Resolver;
use crate::store::{PublicKeyInfo, RemoteProfile, User};

/// Finds persons in the cache or store, fetching unknown ones.
#[derive(Clone)]
pub struct PersonService {
    ctx: FederationContext,
}

impl PersonService {
    #[must_use]
    pub const fn new(ctx: FederationContext) -> Self {
        Self { ctx }
    }

    /// A known person by actor id, without network access.
    pub async fn fetch_person(&self, uri: &Url) -> FederationResult<Option<User>> {
        if let Some(user) = self.ctx.users_cache.get(uri.as_str()) {
            return Ok(Some(user));
        }

        if self.ctx.is_local_url(uri) {
            let segments: Vec<&str> = uri.path_segments().map(Iterator::collect).unwrap_or_default();
            let ["users", id] = segments.as_slice() else {
                return Ok(None);
            };
            return Ok(self
                .ctx
                .domain
                .users
                .find_by_id(id)
                .await?
                .filter(User::is_local));
        }

        let user = self.ctx.domain.users.find_by_uri(uri).await?;
        if let Some(user) = &user {
            self.ctx.users_cache.set(user);
        }
        Ok(user)
    }

    /// A person by actor id, fetching and registering it when unknown.
    pub async fn resolve_person(&self, uri: &Url, resolver: &mut Resolver) -> FederationResult<User> {
        if let Some(user) = self.fetch_person(uri).await? {
            return Ok(user);
        }
        self.create_person(uri, resolver).await
    }

    /// Fetch a remote actor and register it.
    pub async fn create_person(&self, uri: &Url, resolver: &mut Resolver) -> FederationResult<User> {
        if self.ctx.is_local_url(uri) {
            return Err(FederationError::InvalidObject(format!(
                "cannot create local person {uri}"
            )));
        }

        let actor = resolver.resolve_actor(&ObjectRef::Uri(uri.clone())).await?;
        let profile = profile_from_actor(&actor)?;
        let user = self.ctx.domain.users.upsert_remote(profile).await?;
        self.ctx.users_cache.set(&user);

        info!(user_id = %user.id, uri = %actor.id, "Registered remote person");
        Ok(user)
    }

    /// Store a fresh copy of `actor` and tell every process about it.
    pub async fn update_person(&self, actor: &ApActor) -> FederationResult<User> {
        let profile = profile_from_actor(actor)?;
        let user = self.ctx.domain.users.upsert_remote(profile).await?;

        self.ctx.users_cache.invalidate(actor.id.as_str());
        self.ctx.keys_cache.invalidate_user(&user.id);
        self.ctx
            .events
            .publish(InternalEvent::RemoteUserUpdated {
                user_id: user.id.clone(),
                uri: actor.id.to_string(),
            })
            .await;

        debug!(user_id = %user.id, uri = %actor.id, "Updated remote person");
        Ok(user)
    }

    /// Re-fetch a remote person and update it.
    pub async fn refresh_person(&self, uri: &Url) -> FederationResult<User> {
        let mut resolver = Resolver::new(self.ctx.clone());
        let actor = resolver.resolve_actor(&ObjectRef::Uri(uri.clone())).await?;
        self.update_person(&actor).await
    }
}

/// Validate an actor document and turn it into a store profile.
pub fn profile_from_actor(actor: &ApActor) -> FederationResult<RemoteProfile> {
    let host = actor
        .id
        .host_str()
        .ok_or_else(|| FederationError::InvalidObject(format!("actor id without host: {}", actor.id)))?;
    actor.validate(host).map_err(FederationError::InvalidObject)?;

    Ok(RemoteProfile {
        uri: actor.id.clone(),
        username: actor.preferred_username.clone(),
        host: host.to_lowercase(),
        inbox: actor.inbox.clone(),
        shared_inbox: actor.shared_inbox_url().cloned(),
        followers_uri: actor.followers.clone(),
        featured: actor.featured.clone(),
        name: actor.name.clone().filter(|n| !n.is_empty()),
        is_locked: actor.manually_approves_followers,
        is_bot: actor.is_bot(),
        moved_to_uri: actor.moved_to.clone(),
        also_known_as: actor.also_known_as.clone(),
        public_key: actor.public_key.as_ref().map(|key| PublicKeyInfo {
            key_id: key.id.clone(),
            key_pem: key.public_key_pem.clone(),
        }),
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{TestFederation, remote_actor_json};

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_person_is_fetched_once() {
        let fed = TestFederation::new().await;
        fed.transport.activity_json(
            "https://remote.example/users/alice",
            remote_actor_json("remote.example", "alice"),
        );
        let persons = PersonService::new(fed.ctx.clone());
        let uri = url("https://remote.example/users/alice");

        let created = persons
            .resolve_person(&uri, &mut Resolver::new(fed.ctx.clone()))
            .await
            .unwrap();
        assert_eq!(created.host.as_deref(), Some("remote.example"));
        assert_eq!(created.shared_inbox.unwrap().as_str(), "https://remote.example/inbox");

        let again = persons
            .resolve_person(&uri, &mut Resolver::new(fed.ctx.clone()))
            .await
            .unwrap();
        assert_eq!(again.id, created.id);
        assert_eq!(fed.transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_local_person_is_never_fetched() {
        let fed = TestFederation::new().await;
        fed.local_user("bob1", "bob").await;
        let persons = PersonService::new(fed.ctx.clone());

        let bob = persons
            .fetch_person(&url("https://local.example/users/bob1"))
            .await
            .unwrap()
            .unwrap();
        assert!(bob.is_local());
        assert!(persons
            .fetch_person(&url("https://local.example/notes/bob1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_person_publishes_event() {
        let fed = TestFederation::new().await;
        let mut events = fed.ctx.events.subscribe();
        let persons = PersonService::new(fed.ctx.clone());

        let mut json = remote_actor_json("remote.example", "alice");
        json["name"] = "Alice".into();
        let actor: ApActor = serde_json::from_value(json).unwrap();
        let user = persons.update_person(&actor).await.unwrap();

        assert_eq!(user.name.as_deref(), Some("Alice"));
        assert_eq!(
            events.recv().await.unwrap(),
            InternalEvent::RemoteUserUpdated {
                user_id: user.id,
                uri: "https://remote.example/users/alice".to_string(),
            }
        );
    }

    #[test]
    fn test_profile_rejects_foreign_inbox() {
        let mut json = remote_actor_json("remote.example", "alice");
        json["inbox"] = "https://other.example/inbox".into();
        let actor: ApActor = serde_json::from_value(json).unwrap();
        assert!(matches!(
            profile_from_actor(&actor),
            Err(FederationError::InvalidObject(_))
        ));
    }
}
