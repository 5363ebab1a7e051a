//! Add/Remove activity processor for the featured (pinned notes) collection.

use tracing::info;

use super::{NoteService, Outcome, require_object};
use crate::activities::Activity;
use crate::context::FederationContext;
use crate::error::FederationResult;
use crate::objects::ObjectRef;
use crate::resolver::Resolver;
use crate::store::User;

#[derive(Clone)]
pub struct FeaturedProcessor {
    ctx: FederationContext,
    notes: NoteService,
}

impl FeaturedProcessor {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            notes: NoteService::new(ctx.clone()),
            ctx,
        }
    }

    /// Pin a note, resolving it first when unknown.
    pub async fn process_add(
        &self,
        actor: &User,
        activity: &Activity,
        resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        if !targets_featured(actor, activity) {
            return Ok(Outcome::skip("target is not featured collection"));
        }

        let note = self.notes.resolve_note(require_object(activity)?, resolver).await?;
        if note.user_id != actor.id {
            return Ok(Outcome::skip("note is not owned by actor"));
        }
        self.ctx.domain.notes.pin(&actor.id, &note.id).await?;
        info!(user_id = %actor.id, note_id = %note.id, "Pinned note");
        Ok(Outcome::ok())
    }

    /// Unpin a known note.
    pub async fn process_remove(
        &self,
        actor: &User,
        activity: &Activity,
        _resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        if !targets_featured(actor, activity) {
            return Ok(Outcome::skip("target is not featured collection"));
        }

        let note = match require_object(activity)?.id() {
            Some(uri) => self.notes.fetch_note(&uri).await?,
            None => None,
        };
        let Some(note) = note else {
            return Ok(Outcome::skip("note not found"));
        };
        self.ctx.domain.notes.unpin(&actor.id, &note.id).await?;
        info!(user_id = %actor.id, note_id = %note.id, "Unpinned note");
        Ok(Outcome::ok())
    }
}

fn targets_featured(actor: &User, activity: &Activity) -> bool {
    let target = activity.target.as_ref().and_then(ObjectRef::id);
    target.is_some() && target == actor.featured
}
