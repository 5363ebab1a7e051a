//! Remote note lookup and creation.

use futures::future::BoxFuture;
use tracing::{debug, info, warn};
use url::Url;

use super::PersonService;
use crate::audience::parse_audience;
use crate::context::FederationContext;
use crate::error::{DomainError, FederationError, FederationResult, StatusError};
use crate::objects::{ApNote, ObjectRef};
use crate::resolver::Resolver;
use crate::store::{NewNote, Note, Poll, User};

/// Creates notes from remote post objects.
#[derive(Clone)]
pub struct NoteService {
    ctx: FederationContext,
    persons: PersonService,
}

impl NoteService {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            persons: PersonService::new(ctx.clone()),
            ctx,
        }
    }

    /// A stored note by URI, without network access.
    pub async fn fetch_note(&self, uri: &Url) -> FederationResult<Option<Note>> {
        if self.ctx.is_local_url(uri) {
            let segments: Vec<&str> = uri.path_segments().map(Iterator::collect).unwrap_or_default();
            let ["notes", id] = segments.as_slice() else {
                return Ok(None);
            };
            return Ok(self.ctx.domain.notes.find_by_id(id).await?);
        }
        Ok(self.ctx.domain.notes.find_by_uri(uri).await?)
    }

    /// A note by reference, fetching and creating it when unknown.
    ///
    /// Creation runs under the `ap-object:` lock of the note URI. Boxed
    /// because reply chains recurse back into it.
    pub fn resolve_note<'a>(
        &'a self,
        value: &'a ObjectRef,
        resolver: &'a mut Resolver,
    ) -> BoxFuture<'a, FederationResult<Note>> {
        Box::pin(async move {
            let uri = value.id().ok_or_else(|| {
                FederationError::InvalidObject("note reference without id".to_string())
            })?;

            if let Some(note) = self.fetch_note(&uri).await? {
                return Ok(note);
            }
            if self.ctx.is_local_url(&uri) {
                return Err(StatusError::new(404, "Not Found").into());
            }
            if uri.host_str().is_some_and(|h| self.ctx.skip_policy.is_blocked_host(h)) {
                return Err(FederationError::BlockedHost(uri.to_string()));
            }
            // Already being created further up this chain; its lock is ours.
            if resolver.history().contains(uri.as_str()) {
                return Err(FederationError::AlreadyResolved(uri.to_string()));
            }

            let guard = self.ctx.locks.ap_lock(uri.as_str()).await?;
            let result = match self.fetch_note(&uri).await {
                Ok(Some(note)) => Ok(note),
                Ok(None) => match resolver.resolve_note(value).await {
                    Ok(object) => self.create_note(&object, resolver).await,
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };
            guard.release().await?;
            result
        })
    }

    /// Create a note from a validated post object.
    ///
    /// The author is resolved from `attributedTo`, and the reply target,
    /// quote, mentions and addressed users are resolved through `resolver`.
    pub async fn create_note(&self, object: &ApNote, resolver: &mut Resolver) -> FederationResult<Note> {
        let author_uri = object
            .attributed_to
            .id()
            .ok_or_else(|| FederationError::InvalidObject("note without attributedTo".to_string()))?;
        if object.id.host_str() != author_uri.host_str() {
            return Err(FederationError::Validation(format!(
                "note {} is not on the host of its author {author_uri}",
                object.id
            )));
        }
        resolver.remember(&object.id);

        let author = self.persons.resolve_person(&author_uri, resolver).await?;
        if author.is_suspended {
            return Err(DomainError::Suspended.into());
        }

        let audience = parse_audience(&object.to, &object.cc, author.followers_uri.as_ref());
        let visible_user_ids = self.resolve_users(&audience.visible_uris, resolver).await;

        let reply_id = match &object.in_reply_to {
            Some(reply) => self.resolve_reply(reply, resolver).await?,
            None => None,
        };
        let renote_id = match object.quote() {
            Some(quote) => self.resolve_quote(quote, resolver).await?,
            None => None,
        };
        let mentions = self.resolve_users(&object.mention_uris(), resolver).await;

        let poll = object.poll_choices().map(|(choices, multiple)| {
            let (choices, votes) = choices.into_iter().unzip();
            Poll {
                choices,
                votes,
                multiple,
                expires_at: object.end_time.or(object.closed),
            }
        });

        let note = self
            .ctx
            .domain
            .notes
            .create(NewNote {
                uri: Some(object.id.clone()),
                user_id: author.id.clone(),
                text: object.text(),
                cw: object.summary.clone().filter(|s| !s.is_empty()),
                visibility: audience.visibility,
                visible_user_ids,
                reply_id,
                renote_id,
                mentions,
                tags: object.hashtags(),
                emojis: object.emoji_names(),
                file_urls: object.attachment.iter().map(|a| a.url.clone()).collect(),
                poll,
                created_at: object.published,
            })
            .await?;

        info!(note_id = %note.id, uri = %object.id, author = %author.id, "Created remote note");
        Ok(note)
    }

    /// Refresh vote counts of a stored poll.
    pub async fn update_question(&self, value: &ObjectRef, resolver: &mut Resolver) -> FederationResult<()> {
        let uri = value
            .id()
            .ok_or_else(|| FederationError::InvalidObject("question without id".to_string()))?;
        if self.ctx.is_local_url(&uri) {
            return Err(FederationError::Validation(format!("{uri} points to a local note")));
        }

        let note = self
            .ctx
            .domain
            .notes
            .find_by_uri(&uri)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("question {uri}")))?;
        if note.poll.is_none() {
            return Err(DomainError::NotFound(format!("poll of {uri}")).into());
        }

        let question = resolver.resolve_note(value).await?;
        let (choices, _) = question
            .poll_choices()
            .ok_or_else(|| FederationError::InvalidObject(format!("{uri} has no choices")))?;
        let votes = choices.into_iter().map(|(_, votes)| votes).collect();
        self.ctx.domain.notes.update_poll_votes(&note.id, votes).await?;

        debug!(note_id = %note.id, "Updated poll votes");
        Ok(())
    }

    /// Cycles end the reply chain instead of failing the note.
    async fn resolve_reply(&self, reply: &ObjectRef, resolver: &mut Resolver) -> FederationResult<Option<String>> {
        match self.resolve_note(reply, resolver).await {
            Ok(note) => Ok(Some(note.id)),
            Err(FederationError::AlreadyResolved(uri)) => {
                debug!(uri = %uri, "Reply chain loops back; dropping reply");
                Ok(None)
            }
            Err(FederationError::RecursionLimit) => Ok(None),
            Err(e) => {
                warn!(reply = ?reply.id(), error = %e, "Failed to resolve reply target");
                Err(e)
            }
        }
    }

    /// A quote that can never be fetched is dropped; transient failures propagate.
    async fn resolve_quote(&self, quote: &Url, resolver: &mut Resolver) -> FederationResult<Option<String>> {
        let reference = ObjectRef::Uri(quote.clone());
        match self.resolve_note(&reference, resolver).await {
            Ok(note) => Ok(Some(note.id)),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => {
                debug!(quote = %quote, error = %e, "Ignoring unresolvable quote");
                Ok(None)
            }
        }
    }

    /// Ids of the users behind `uris`; unresolvable ones are left out.
    async fn resolve_users(&self, uris: &[Url], resolver: &mut Resolver) -> Vec<String> {
        let mut ids = Vec::new();
        for uri in uris {
            match self.persons.resolve_person(uri, resolver).await {
                Ok(User { id, .. }) if !ids.contains(&id) => ids.push(id),
                Ok(_) => {}
                Err(e) => debug!(uri = %uri, error = %e, "Skipping unresolvable addressee"),
            }
        }
        ids
    }
}
