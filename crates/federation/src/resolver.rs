//! Object resolution.
//!
//! A [`Resolver`] turns an [`ObjectRef`] into a validated [`RemoteObject`].
//! Embedded objects are classified in place; URIs on our own host are served
//! from the store; everything else is fetched with a (signed) GET.
//!
//! One resolver is created per inbound activity. It remembers every URI it
//! fetched so that reference cycles terminate.

use std::collections::HashSet;

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::activities::Activity;
use crate::actors::ApActor;
use crate::context::FederationContext;
use crate::error::{FederationError, FederationResult, StatusError};
use crate::objects::{AS_CONTEXT, ApCollection, ApNote, ObjectRef, RemoteObject};

/// Default number of fetches one resolver may perform.
pub const DEFAULT_RECURSION_LIMIT: usize = 100;

/// Resolves object references for one unit of work.
pub struct Resolver {
    ctx: FederationContext,
    history: HashSet<String>,
    recursion_limit: usize,
}

impl Resolver {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            ctx,
            history: HashSet::new(),
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }

    #[must_use]
    pub const fn with_recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }

    /// URIs fetched so far.
    #[must_use]
    pub fn history(&self) -> &HashSet<String> {
        &self.history
    }

    /// Treat `uri` as already resolved, so that a later fetch of it fails.
    pub fn remember(&mut self, uri: &Url) {
        self.history.insert(uri.to_string());
    }

    /// Resolve a URI or embedded object.
    pub async fn resolve(&mut self, value: &ObjectRef) -> FederationResult<RemoteObject> {
        match value {
            ObjectRef::Embedded(object) => RemoteObject::from_value((**object).clone()),
            ObjectRef::Uri(uri) => self.resolve_uri(uri).await,
        }
    }

    /// Dereference `uri`.
    pub async fn resolve_uri(&mut self, uri: &Url) -> FederationResult<RemoteObject> {
        let value = self.fetch(uri).await?;
        RemoteObject::from_value(value)
    }

    /// Raw JSON of `uri`, after the history, host and document checks.
    pub async fn fetch(&mut self, uri: &Url) -> FederationResult<Value> {
        if self.history.len() >= self.recursion_limit {
            return Err(FederationError::RecursionLimit);
        }
        if self.history.contains(uri.as_str()) {
            return Err(FederationError::AlreadyResolved(uri.to_string()));
        }

        let host = uri
            .host_str()
            .ok_or_else(|| FederationError::InvalidObject(format!("uri without host: {uri}")))?;
        if self.ctx.skip_policy.is_blocked_host(host) {
            return Err(FederationError::BlockedHost(host.to_string()));
        }

        self.history.insert(uri.to_string());

        if self.ctx.is_local_url(uri) {
            return self.resolve_local(uri).await;
        }

        let key = self.ctx.fetch_key().await?;
        let (final_url, value) = self.ctx.client.signed_get(uri, key.as_ref()).await?;
        validate_document(&value, &final_url)?;
        debug!(uri = %uri, final_url = %final_url, "Resolved remote object");
        Ok(value)
    }

    /// Render one of our own objects instead of fetching it over HTTP.
    async fn resolve_local(&self, uri: &Url) -> FederationResult<Value> {
        let not_found = || FederationError::from(StatusError::new(404, "Not Found"));
        let segments: Vec<&str> = uri
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let domain = &self.ctx.domain;
        let renderer = &self.ctx.renderer;

        match segments.as_slice() {
            ["follows", follower_id, followee_id] => {
                let follower = domain.users.find_by_id(follower_id).await?.ok_or_else(not_found)?;
                let followee = domain.users.find_by_id(followee_id).await?.ok_or_else(not_found)?;
                Ok(renderer.render_follow(&follower, &followee, Some(uri)))
            }
            ["users", id] => {
                let user = domain
                    .users
                    .find_by_id(id)
                    .await?
                    .filter(|u| u.is_local())
                    .ok_or_else(not_found)?;
                let keypair = domain.users.find_keypair(&user.id).await?;
                Ok(renderer.render_person(&user, keypair.as_ref().map(|k| k.public_key_pem.as_str())))
            }
            ["notes", id] => {
                let note = domain.notes.find_by_id(id).await?.ok_or_else(not_found)?;
                let author = domain
                    .users
                    .find_by_id(&note.user_id)
                    .await?
                    .ok_or_else(not_found)?;
                Ok(renderer.render_note(&note, &author))
            }
            _ => Err(not_found()),
        }
    }

    pub async fn resolve_actor(&mut self, value: &ObjectRef) -> FederationResult<ApActor> {
        match self.resolve(value).await? {
            RemoteObject::Actor(actor) => Ok(actor),
            other => Err(unexpected("actor", &other)),
        }
    }

    /// A Note, Question or other post object.
    pub async fn resolve_note(&mut self, value: &ObjectRef) -> FederationResult<ApNote> {
        match self.resolve(value).await? {
            RemoteObject::Note(note) | RemoteObject::Question(note) => Ok(note),
            other => Err(unexpected("note", &other)),
        }
    }

    pub async fn resolve_activity(&mut self, value: &ObjectRef) -> FederationResult<Activity> {
        match self.resolve(value).await? {
            RemoteObject::Activity(activity) => Ok(*activity),
            other => Err(unexpected("activity", &other)),
        }
    }

    pub async fn resolve_collection(&mut self, value: &ObjectRef) -> FederationResult<ApCollection> {
        match self.resolve(value).await? {
            RemoteObject::Collection(collection) => Ok(collection),
            other => Err(unexpected("collection", &other)),
        }
    }
}

fn unexpected(expected: &str, got: &RemoteObject) -> FederationError {
    FederationError::InvalidObject(format!("expected {expected}, got {}", got.kind_name()))
}

/// A fetched document must be an `ActivityStreams` object served from the
/// host its id names.
fn validate_document(value: &Value, final_url: &Url) -> FederationResult<()> {
    let has_context = match value.get("@context") {
        Some(Value::String(s)) => s == AS_CONTEXT,
        Some(Value::Array(items)) => items.iter().any(|c| c.as_str() == Some(AS_CONTEXT)),
        _ => false,
    };
    if !has_context {
        return Err(FederationError::InvalidObject(format!(
            "{final_url} is not an ActivityStreams document"
        )));
    }

    let id = value
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| Url::parse(s).ok())
        .ok_or_else(|| FederationError::InvalidObject(format!("{final_url} has no id")))?;
    if id.host_str() != final_url.host_str() {
        return Err(FederationError::InvalidObject(format!(
            "id {id} does not match host of {final_url}"
        )));
    }
    Ok(())
}
