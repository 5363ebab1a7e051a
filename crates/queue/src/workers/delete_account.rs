//! Account deletion worker.

use apalis::prelude::*;
use apkernel_federation::events::InternalEvent;
use apkernel_federation::jobs::{AccountJobQueue, DeleteAccountJob, QueueError};
use apkernel_federation::{FederationContext, FederationResult, Outcome};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::{Disposition, failed};
use crate::retry::{RetryDecision, RetryDriver};

/// Purges the data of an account the kernel marked deleted.
#[derive(Clone)]
pub struct DeleteAccountProcessor {
    ctx: FederationContext,
}

impl DeleteAccountProcessor {
    #[must_use]
    pub const fn new(ctx: FederationContext) -> Self {
        Self { ctx }
    }

    pub async fn process(&self, job: &DeleteAccountJob) -> FederationResult<Outcome> {
        let domain = &self.ctx.domain;
        let Some(user) = domain.users.find_by_id(&job.user_id).await? else {
            return Ok(Outcome::skip("user not found"));
        };
        if !user.is_deleted {
            return Ok(Outcome::skip("user is not deleted"));
        }

        let notes = domain.notes.delete_by_user(&user.id).await?;
        domain.relations.remove_all_relations(&user.id).await?;

        self.ctx.keys_cache.invalidate_user(&user.id);
        if let Some(uri) = &user.uri {
            self.ctx.users_cache.invalidate(uri.as_str());
            self.ctx
                .events
                .publish(InternalEvent::RemoteUserUpdated {
                    user_id: user.id.clone(),
                    uri: uri.to_string(),
                })
                .await;
        }

        Ok(Outcome::ok_with(format!("removed {notes} notes")))
    }
}

/// Runs [`DeleteAccountProcessor`] and reschedules failures.
#[derive(Clone)]
pub struct DeleteAccountWorker {
    processor: DeleteAccountProcessor,
    driver: RetryDriver,
    queue: Arc<dyn AccountJobQueue>,
}

impl DeleteAccountWorker {
    #[must_use]
    pub fn new(
        processor: DeleteAccountProcessor,
        driver: RetryDriver,
        queue: Arc<dyn AccountJobQueue>,
    ) -> Self {
        Self {
            processor,
            driver,
            queue,
        }
    }

    pub async fn handle(&self, job: DeleteAccountJob) -> Result<Disposition, QueueError> {
        let err = match self.processor.process(&job).await {
            Ok(outcome) => {
                info!(user_id = %job.user_id, outcome = %outcome, "Account deletion finished");
                return Ok(Disposition::Completed);
            }
            Err(e) => e,
        };

        warn!(user_id = %job.user_id, error = %err, "Account deletion failed");
        match self.driver.on_failure(job, &err.to_string()) {
            RetryDecision::Retry { job, delay } => {
                self.queue.enqueue(job, Some(delay)).await?;
                Ok(Disposition::Rescheduled(delay))
            }
            RetryDecision::GiveUp(_) => Ok(Disposition::Dropped),
        }
    }
}

/// Worker function for purging deleted accounts.
///
/// # Errors
/// Returns an error only when a failed job could not be rescheduled.
pub async fn delete_account_worker(
    job: DeleteAccountJob,
    worker: Data<DeleteAccountWorker>,
) -> Result<(), Error> {
    worker.handle(job).await.map(|_| ()).map_err(|e| {
        error!(error = %e, "Failed to reschedule delete account job");
        failed(e)
    })
}
