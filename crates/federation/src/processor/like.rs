//! Like (reaction) activity processor.

use tracing::info;

use super::{NoteService, Outcome, require_object};
use crate::activities::Activity;
use crate::context::FederationContext;
use crate::error::{DomainError, FederationResult};
use crate::resolver::Resolver;
use crate::store::User;

/// Reaction used when a Like carries none.
pub const DEFAULT_REACTION: &str = "❤";

/// A remote actor reacted to one of the notes we know.
#[derive(Clone)]
pub struct LikeProcessor {
    ctx: FederationContext,
    notes: NoteService,
}

impl LikeProcessor {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            notes: NoteService::new(ctx.clone()),
            ctx,
        }
    }

    pub async fn process(
        &self,
        actor: &User,
        activity: &Activity,
        _resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        let Some(target) = require_object(activity)?.id() else {
            return Ok(Outcome::skip("target note not found"));
        };
        let Some(note) = self.notes.fetch_note(&target).await? else {
            return Ok(Outcome::skip("target note not found"));
        };

        let reaction = reaction_of(activity);
        match self
            .ctx
            .domain
            .reactions
            .react(&actor.id, &note.id, &reaction)
            .await
        {
            Ok(()) => {
                info!(user_id = %actor.id, note_id = %note.id, reaction = %reaction, "Reacted");
                Ok(Outcome::ok())
            }
            Err(DomainError::AlreadyReacted) => Ok(Outcome::skip("already reacted")),
            Err(e) => Err(e.into()),
        }
    }
}

/// `_misskey_reaction`, then `content`, then `name`, then the default like.
pub(crate) fn reaction_of(activity: &Activity) -> String {
    activity
        .misskey_reaction
        .as_deref()
        .or(activity.content.as_deref())
        .or_else(|| activity.extra_str("name"))
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_REACTION)
        .to_string()
}
