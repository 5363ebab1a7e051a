//! Announce (boost) activity processor.

use tracing::{debug, info};
use url::Url;

use super::{NoteService, Outcome, PersonService, require_object};
use crate::activities::Activity;
use crate::audience::parse_audience;
use crate::context::FederationContext;
use crate::error::{FederationError, FederationResult};
use crate::objects::POST_TYPES;
use crate::resolver::Resolver;
use crate::store::{NewNote, Note, User, Visibility};

/// A remote actor boosted a post.
#[derive(Clone)]
pub struct AnnounceProcessor {
    ctx: FederationContext,
    persons: PersonService,
    notes: NoteService,
}

impl AnnounceProcessor {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            persons: PersonService::new(ctx.clone()),
            notes: NoteService::new(ctx.clone()),
            ctx,
        }
    }

    /// Store a renote of the announced post, once per announce URI.
    pub async fn process(
        &self,
        actor: &User,
        activity: &Activity,
        resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        let object = require_object(activity)?;
        if object.type_name().is_some_and(|t| !POST_TYPES.contains(&t)) {
            return Ok(Outcome::skip("unknown object type"));
        }
        let target_uri = object.id().ok_or_else(|| {
            FederationError::InvalidObject("announce target without id".to_string())
        })?;
        let uri = activity.id.clone().ok_or_else(|| {
            FederationError::InvalidObject("announce without id".to_string())
        })?;

        let blocked = [&uri, &target_uri]
            .into_iter()
            .filter_map(|u| u.host_str())
            .any(|host| self.ctx.skip_policy.is_blocked_host(host));
        if blocked {
            return Ok(Outcome::skip("blocked host"));
        }

        let guard = self.ctx.locks.ap_lock(uri.as_str()).await?;
        let result = self.announce_note(actor, activity, &uri, resolver).await;
        guard.release().await?;
        result
    }

    async fn announce_note(
        &self,
        actor: &User,
        activity: &Activity,
        uri: &Url,
        resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        if self.ctx.domain.notes.find_by_uri(uri).await?.is_some() {
            return Ok(Outcome::skip("renote exists"));
        }

        let object = require_object(activity)?;
        let renote = match self.notes.resolve_note(object, resolver).await {
            Ok(note) => note,
            Err(FederationError::Status(e)) if !e.is_retryable() => {
                let target = object.id().map(|u| u.to_string()).unwrap_or_default();
                return Ok(Outcome::skip(format!(
                    "ignored announce target {target} - {}",
                    e.code
                )));
            }
            Err(FederationError::InvalidObject(reason)) => {
                debug!(uri = %uri, reason = %reason, "Announce of a non-post object");
                return Ok(Outcome::skip("unknown object type"));
            }
            Err(e) => return Err(e),
        };

        if !self.is_visible_for(&renote, actor).await? {
            return Ok(Outcome::skip("invalid actor for this activity"));
        }

        let audience = parse_audience(&activity.to, &activity.cc, actor.followers_uri.as_ref());
        let mut visible_user_ids = Vec::new();
        if audience.visibility == Visibility::Specified {
            for addressee in &audience.visible_uris {
                if let Some(user) = self.persons.fetch_person(addressee).await? {
                    visible_user_ids.push(user.id);
                }
            }
        }

        let note = self
            .ctx
            .domain
            .notes
            .create(NewNote {
                uri: Some(uri.clone()),
                user_id: actor.id.clone(),
                visibility: audience.visibility,
                visible_user_ids,
                renote_id: Some(renote.id.clone()),
                created_at: activity.published,
                ..NewNote::default()
            })
            .await?;

        info!(note_id = %note.id, renote_id = %renote.id, uri = %uri, "Created renote");
        Ok(Outcome::ok())
    }

    /// Whether `actor` may see `note` at all.
    async fn is_visible_for(&self, note: &Note, actor: &User) -> FederationResult<bool> {
        if note.user_id == actor.id {
            return Ok(true);
        }
        Ok(match note.visibility {
            Visibility::Public | Visibility::Home => true,
            Visibility::Specified => note.visible_user_ids.contains(&actor.id),
            Visibility::Followers => {
                self.ctx
                    .domain
                    .relations
                    .is_following(&actor.id, &note.user_id)
                    .await?
            }
        })
    }
}
