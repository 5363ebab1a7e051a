//! Flag (abuse report) activity processor.

use tracing::info;
use url::Url;

use super::{Outcome, PersonService};
use crate::activities::Activity;
use crate::context::FederationContext;
use crate::error::{FederationError, FederationResult};
use crate::resolver::Resolver;
use crate::store::{NewReport, User};

/// A remote server reports one of our users.
#[derive(Clone)]
pub struct FlagProcessor {
    ctx: FederationContext,
    persons: PersonService,
}

impl FlagProcessor {
    #[must_use]
    pub fn new(ctx: FederationContext) -> Self {
        Self {
            persons: PersonService::new(ctx.clone()),
            ctx,
        }
    }

    /// File a report against the first local user among the objects. The
    /// other objects (usually the offending notes) go into the comment.
    pub async fn process(
        &self,
        actor: &User,
        activity: &Activity,
        _resolver: &mut Resolver,
    ) -> FederationResult<Outcome> {
        let uris = activity.object_ids();

        let mut target: Option<(Url, User)> = None;
        for uri in uris.iter().filter(|u| self.is_local_user_uri(u)) {
            if let Some(user) = self.persons.fetch_person(uri).await? {
                target = Some((uri.clone(), user));
                break;
            }
        }
        let Some((target_uri, target)) = target else {
            return Ok(Outcome::skip("no local users reported"));
        };

        let rest: Vec<&str> = uris
            .iter()
            .filter(|u| **u != target_uri)
            .map(Url::as_str)
            .collect();
        let mut comment = activity.content.clone().unwrap_or_default();
        if !rest.is_empty() {
            let listed = serde_json::to_string_pretty(&rest)
                .map_err(|e| FederationError::Internal(e.to_string()))?;
            comment = format!("{comment}\n{listed}");
        }

        let report = self
            .ctx
            .domain
            .reports
            .create(NewReport {
                target_user_id: target.id.clone(),
                reporter_id: actor.id.clone(),
                comment,
                uri: activity.id.clone(),
            })
            .await?;

        info!(report_id = %report.id, target = %target.id, reporter = %actor.id, "Abuse report received");
        Ok(Outcome::ok())
    }

    fn is_local_user_uri(&self, uri: &Url) -> bool {
        self.ctx.is_local_url(uri) && uri.path().starts_with("/users/")
    }
}
