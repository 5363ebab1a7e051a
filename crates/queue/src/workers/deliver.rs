//! Deliver worker.

use std::fmt;
use std::sync::Arc;

use apalis::prelude::*;
use apkernel_federation::instance::{InstanceUpdate, normalize_host};
use apkernel_federation::jobs::{DeliveryJob, DeliveryQueue, QueueError};
use apkernel_federation::{DomainError, FederationContext, FederationError};
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{Disposition, failed};
use crate::retry::{RetryDecision, RetryDriver};

/// How a delivery ended without needing a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliverOutcome {
    /// The inbox answered 2xx.
    Delivered,
    /// No request was made.
    Skipped(String),
    /// A shared inbox answered 410; the instance is now suspended.
    Gone,
    /// The inbox refused the activity; retrying will not help.
    ClientError(u16),
}

impl fmt::Display for DeliverOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Delivered => f.write_str("delivered"),
            Self::Skipped(reason) => write!(f, "skip ({reason})"),
            Self::Gone => f.write_str("gone"),
            Self::ClientError(status) => write!(f, "client error {status}"),
        }
    }
}

/// A delivery failure worth retrying.
#[derive(Debug, Error)]
pub enum DeliverError {
    #[error("remote returned {0}")]
    Status(u16),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("domain error: {0}")]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Federation(#[from] FederationError),
}

/// Makes the signed POST of one [`DeliveryJob`] and classifies the result.
#[derive(Clone)]
pub struct DeliverProcessor {
    ctx: FederationContext,
}

impl DeliverProcessor {
    #[must_use]
    pub const fn new(ctx: FederationContext) -> Self {
        Self { ctx }
    }

    pub async fn process(&self, job: &DeliveryJob) -> Result<DeliverOutcome, DeliverError> {
        let host = normalize_host(job.host());
        if let Some(reason) = self.ctx.skip_policy.delivery_skip_reason(&host).await? {
            debug!(inbox = %job.target_inbox, reason = %reason, "Skipping delivery");
            self.ctx.delivery.stats().record_skipped();
            return Ok(DeliverOutcome::Skipped(reason.to_string()));
        }

        let users = &self.ctx.domain.users;
        let Some(sender) = users.find_by_id(&job.sender_user_id).await? else {
            return Ok(DeliverOutcome::Skipped("sender not found".to_string()));
        };
        let Some(keypair) = users.find_keypair(&sender.id).await? else {
            return Ok(DeliverOutcome::Skipped("sender has no keypair".to_string()));
        };
        let key = self.ctx.renderer.actor_key(&sender, &keypair);
        let body = serde_json::to_vec(&job.payload)
            .map_err(|e| FederationError::Internal(e.to_string()))?;

        let instances = &self.ctx.domain.instances;
        let stats = self.ctx.delivery.stats();
        let now = Utc::now();

        let response = match self.ctx.client.post(&job.target_inbox, body, &key).await {
            Ok(response) => response,
            Err(e) => {
                instances.update(&host, InstanceUpdate::unreachable(now)).await?;
                stats.record_failed();
                return Err(DeliverError::Transport(e.to_string()));
            }
        };

        if response.is_success() {
            instances
                .update(&host, InstanceUpdate::delivered(response.status, now))
                .await?;
            stats.record_delivered();

            let metadata = self.ctx.metadata.clone();
            self.ctx.tasks.spawn("fetch instance metadata", async move {
                metadata.fetch_instance_metadata(&host, false).await
            });
            return Ok(DeliverOutcome::Delivered);
        }

        instances
            .update(&host, InstanceUpdate::failed(response.status, now))
            .await?;
        stats.record_failed();

        let status = response.status_error();
        if status.code == 410 && job.is_shared_inbox {
            warn!(host = %host, "Shared inbox is gone; suspending instance");
            instances.update(&host, InstanceUpdate::suspended()).await?;
            return Ok(DeliverOutcome::Gone);
        }
        if status.is_client_error() && !status.is_retryable() {
            return Ok(DeliverOutcome::ClientError(status.code));
        }
        Err(DeliverError::Status(status.code))
    }
}

/// Runs [`DeliverProcessor`] and reschedules failures.
#[derive(Clone)]
pub struct DeliverWorker {
    processor: DeliverProcessor,
    driver: RetryDriver,
    queue: Arc<dyn DeliveryQueue>,
}

impl DeliverWorker {
    #[must_use]
    pub fn new(processor: DeliverProcessor, driver: RetryDriver, queue: Arc<dyn DeliveryQueue>) -> Self {
        Self {
            processor,
            driver,
            queue,
        }
    }

    pub async fn handle(&self, job: DeliveryJob) -> Result<Disposition, QueueError> {
        info!(
            job_id = %job.id,
            inbox = %job.target_inbox,
            activity_type = job.activity_type(),
            attempt = job.attempt_count,
            "Delivering activity"
        );

        let err = match self.processor.process(&job).await {
            Ok(outcome) => {
                info!(inbox = %job.target_inbox, outcome = %outcome, "Delivery finished");
                return Ok(Disposition::Completed);
            }
            Err(e) => e,
        };

        warn!(inbox = %job.target_inbox, error = %err, "Delivery failed");
        match self.driver.on_failure(job, &err.to_string()) {
            RetryDecision::Retry { job, delay } => {
                self.queue.enqueue(job, Some(delay)).await?;
                Ok(Disposition::Rescheduled(delay))
            }
            RetryDecision::GiveUp(_) => Ok(Disposition::Dropped),
        }
    }
}

/// Worker function for delivering activities.
///
/// # Errors
/// Returns an error only when a failed job could not be rescheduled.
pub async fn deliver_worker(job: DeliveryJob, worker: Data<DeliverWorker>) -> Result<(), Error> {
    worker.handle(job).await.map(|_| ()).map_err(|e| {
        error!(error = %e, "Failed to reschedule delivery");
        failed(e)
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use apkernel_common::FederationConfig;
    use apkernel_federation::store::InstanceStore;
    use apkernel_federation::test_utils::TestFederation;
    use serde_json::json;
    use url::Url;

    const INBOX: &str = "https://remote.example/inbox";

    async fn setup(config: FederationConfig) -> (TestFederation, DeliverProcessor, DeliveryJob) {
        let fed = TestFederation::with_config(config).await;
        fed.local_user("bob1", "bob").await;
        let processor = DeliverProcessor::new(fed.ctx.clone());
        let job = DeliveryJob::new(
            Url::parse(INBOX).unwrap(),
            "bob1",
            json!({"type": "Create", "id": "https://local.example/notes/1/activity"}),
            true,
        );
        (fed, processor, job)
    }

    #[tokio::test]
    async fn test_success_marks_instance_responding() {
        let (fed, processor, job) = setup(FederationConfig::default()).await;
        fed.transport.status(INBOX, 202);

        assert_eq!(processor.process(&job).await.unwrap(), DeliverOutcome::Delivered);

        let request = &fed.transport.requests_to(INBOX)[0];
        assert_eq!(request.header("content-type"), Some("application/activity+json"));
        let health = InstanceStore::find(fed.store.as_ref(), "remote.example")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(health.latest_status, Some(202));
        assert!(!health.is_not_responding);
        assert!(health.last_communicated_at.is_some());
        assert_eq!(fed.ctx.delivery.stats().snapshot().delivered, 1);
        fed.ctx.tasks.drain().await;
    }

    #[tokio::test]
    async fn test_client_error_is_terminal() {
        let (fed, processor, job) = setup(FederationConfig::default()).await;
        fed.transport.status(INBOX, 403);

        assert_eq!(
            processor.process(&job).await.unwrap(),
            DeliverOutcome::ClientError(403)
        );
        let health = fed.store.instance("remote.example").await.unwrap();
        assert_eq!(health.latest_status, Some(403));
        assert!(health.is_not_responding);
    }

    #[tokio::test]
    async fn test_server_errors_and_rate_limits_retry() {
        let (fed, processor, job) = setup(FederationConfig::default()).await;
        fed.transport.status(INBOX, 429);
        assert!(matches!(processor.process(&job).await, Err(DeliverError::Status(429))));

        fed.transport.status("https://other.example/inbox", 502);
        let mut other = job.clone();
        other.target_inbox = Url::parse("https://other.example/inbox").unwrap();
        assert!(matches!(processor.process(&other).await, Err(DeliverError::Status(502))));
    }

    #[tokio::test]
    async fn test_transport_failure_clears_status() {
        let (fed, processor, job) = setup(FederationConfig::default()).await;
        fed.transport.fail(INBOX, "connection refused");

        assert!(matches!(processor.process(&job).await, Err(DeliverError::Transport(_))));
        let health = fed.store.instance("remote.example").await.unwrap();
        assert_eq!(health.latest_status, None);
        assert!(health.is_not_responding);
    }

    #[tokio::test]
    async fn test_gone_shared_inbox_suspends_instance() {
        let (fed, processor, job) = setup(FederationConfig::default()).await;
        fed.transport.status(INBOX, 410);

        assert_eq!(processor.process(&job).await.unwrap(), DeliverOutcome::Gone);
        assert!(fed.store.instance("remote.example").await.unwrap().is_suspended);

        let outcome = processor.process(&job).await.unwrap();
        assert_eq!(outcome, DeliverOutcome::Skipped("suspended".to_string()));
        assert_eq!(fed.transport.requests_to(INBOX).len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_host_is_never_contacted() {
        let config = FederationConfig {
            blocked_hosts: vec!["example".to_string()],
            ..FederationConfig::default()
        };
        let (fed, processor, job) = setup(config).await;

        assert_eq!(
            processor.process(&job).await.unwrap(),
            DeliverOutcome::Skipped("blocked".to_string())
        );
        assert!(fed.transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_redirect_is_not_followed() {
        let (fed, processor, job) = setup(FederationConfig::default()).await;
        fed.transport.redirect(INBOX, "https://elsewhere.example/inbox");

        assert!(matches!(processor.process(&job).await, Err(DeliverError::Status(302))));
        assert!(fed.transport.requests_to("https://elsewhere.example/inbox").is_empty());
    }
}
