//! Inbox worker.
//!
//! Authenticates the sender of a queued activity (HTTP signature first,
//! `RsaSignature2017` as a fallback), records the contact with its instance
//! and hands the activity to the kernel.

use std::collections::HashMap;
use std::sync::Arc;

use apalis::prelude::*;
use apkernel_federation::instance::{InstanceUpdate, normalize_host};
use apkernel_federation::jobs::{InboxJob, InboxQueue, QueueError};
use apkernel_federation::ld_signature::{LdSigner, signature_creator};
use apkernel_federation::security::validate_date_header;
use apkernel_federation::signature::{SignatureComponents, SignatureVerifier};
use apkernel_federation::{
    ActivityKernel, AuthUser, AuthUserResolver, FederationContext, FederationError,
    FederationResult, Outcome,
};
use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Disposition, failed};
use crate::retry::{RetryDecision, RetryDriver};

/// Verifies and performs one queued inbound activity.
#[derive(Clone)]
pub struct InboxProcessor {
    ctx: FederationContext,
    kernel: ActivityKernel,
    auth: AuthUserResolver,
    verifier: Arc<dyn SignatureVerifier>,
    ld_signer: Arc<dyn LdSigner>,
}

impl InboxProcessor {
    #[must_use]
    pub fn new(
        ctx: FederationContext,
        verifier: Arc<dyn SignatureVerifier>,
        ld_signer: Arc<dyn LdSigner>,
    ) -> Self {
        Self {
            kernel: ActivityKernel::new(ctx.clone()),
            auth: AuthUserResolver::new(ctx.clone()),
            ctx,
            verifier,
            ld_signer,
        }
    }

    /// `Err` only for failures a retry may fix.
    pub async fn process(&self, job: &InboxJob) -> FederationResult<Outcome> {
        let Some(header) = job.headers.get("signature") else {
            return Ok(Outcome::skip("missing signature header"));
        };
        let Ok(components) = SignatureComponents::parse(header) else {
            return Ok(Outcome::skip("invalid signature header"));
        };

        let Some(key_host) = components.key_host() else {
            // `acct:` key ids and other non-URL key ids
            return Ok(Outcome::skip(format!("invalid key id {}", components.key_id)));
        };
        if let Some(skip) = self.host_denied(&key_host) {
            return Ok(skip);
        }

        let Some(actor_uri) = actor_uri(&job.activity) else {
            return Ok(Outcome::skip("activity has no actor"));
        };

        let auth_user = match self.auth_user(&components.key_id, &actor_uri).await? {
            Ok(auth_user) => auth_user,
            Err(skip) => return Ok(skip),
        };

        let auth_user = if self.verify_http_signature(job, &components, &auth_user) {
            auth_user
        } else {
            match self.verify_ld_signature(&job.activity, &actor_uri).await? {
                Ok(auth_user) => auth_user,
                Err(skip) => return Ok(skip),
            }
        };

        let signer_host = auth_user.user.host.clone().unwrap_or_default();
        let activity_id = activity_id(&job.activity);
        if let Some(id) = &activity_id {
            let id_host = id.host_str().map(normalize_host).unwrap_or_default();
            if id_host != normalize_host(&signer_host) {
                return Ok(Outcome::skip(format!(
                    "activity id host {id_host} does not match signer host {signer_host}"
                )));
            }
        }

        self.record_contact(&signer_host).await?;

        if let Some(id) = &activity_id {
            if !self.ctx.dedupe.check_and_record(id.as_str(), &job.id).await? {
                return Ok(Outcome::skip("duplicate activity"));
            }
        }

        match self.kernel.perform_value(&auth_user.user, job.activity.clone()).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_retryable() => {
                if let Some(id) = &activity_id {
                    self.ctx.dedupe.forget(id.as_str(), &job.id).await?;
                }
                Err(e)
            }
            Err(e) => Ok(Outcome::skip(e.to_string())),
        }
    }

    fn host_denied(&self, host: &str) -> Option<Outcome> {
        let policy = &self.ctx.skip_policy;
        if policy.is_blocked_host(host) {
            return Some(Outcome::skip(format!("blocked host {host}")));
        }
        if !policy.is_allowed_host(host) {
            return Some(Outcome::skip(format!("host {host} is not allowed")));
        }
        None
    }

    /// The signer, or a skip when it cannot be known.
    async fn auth_user(
        &self,
        key_id: &str,
        actor_uri: &Url,
    ) -> FederationResult<Result<AuthUser, Outcome>> {
        match self.auth.get_auth_user(key_id, actor_uri).await {
            Ok(Some(auth_user)) => Ok(Ok(auth_user)),
            Ok(None) => Ok(Err(Outcome::skip(format!("failed to resolve user {actor_uri}")))),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => Ok(Err(Outcome::skip(format!(
                "failed to resolve user {actor_uri}: {e}"
            )))),
        }
    }

    fn verify_http_signature(
        &self,
        job: &InboxJob,
        components: &SignatureComponents,
        auth_user: &AuthUser,
    ) -> bool {
        if let Some(date) = job.headers.get("date") {
            if let Err(e) = validate_date_header(date, job.received_at) {
                debug!(error = %e, "Rejecting signature date");
                return false;
            }
        }

        let headers: HashMap<String, String> = job
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        match self.verifier.verify(
            &auth_user.key.key_pem,
            components,
            &job.method,
            &job.path,
            &headers,
        ) {
            Ok(valid) => valid,
            Err(e) => {
                debug!(error = %e, key_id = %components.key_id, "HTTP signature check failed");
                false
            }
        }
    }

    /// Authenticate through the LD signature of the activity body.
    async fn verify_ld_signature(
        &self,
        activity: &Value,
        actor_uri: &Url,
    ) -> FederationResult<Result<AuthUser, Outcome>> {
        let Some(creator) = signature_creator(activity) else {
            return Ok(Err(Outcome::skip("signature verification failed")));
        };
        let Some(creator_host) = Url::parse(creator).ok().and_then(|u| u.host_str().map(normalize_host))
        else {
            return Ok(Err(Outcome::skip(format!("invalid LD signature creator {creator}"))));
        };
        if let Some(skip) = self.host_denied(&creator_host) {
            return Ok(Err(skip));
        }

        let auth_user = match self.auth_user(creator, actor_uri).await? {
            Ok(auth_user) => auth_user,
            Err(skip) => return Ok(Err(skip)),
        };

        let valid = self
            .ld_signer
            .verify(activity, &auth_user.key.key_pem)
            .unwrap_or(false);
        if !valid {
            return Ok(Err(Outcome::skip("LD-Signature verification failed")));
        }
        if auth_user.user.uri.as_ref() != Some(actor_uri) {
            return Ok(Err(Outcome::skip(format!(
                "LD-Signature user {} does not match activity actor {actor_uri}",
                auth_user.user.uri.as_ref().map_or("(local)", Url::as_str)
            ))));
        }
        debug!(creator = %creator, "Authenticated by LD signature");
        Ok(Ok(auth_user))
    }

    async fn record_contact(&self, host: &str) -> FederationResult<()> {
        let host = normalize_host(host);
        self.ctx
            .domain
            .instances
            .update(&host, InstanceUpdate::received(Utc::now()))
            .await?;

        let metadata = self.ctx.metadata.clone();
        self.ctx.tasks.spawn("fetch instance metadata", async move {
            metadata.fetch_instance_metadata(&host, false).await
        });
        Ok(())
    }
}

fn actor_uri(activity: &Value) -> Option<Url> {
    let actor = activity.get("actor")?;
    let id = actor.as_str().or_else(|| actor.get("id").and_then(Value::as_str))?;
    Url::parse(id).ok()
}

fn activity_id(activity: &Value) -> Option<Url> {
    activity
        .get("id")
        .and_then(Value::as_str)
        .and_then(|id| Url::parse(id).ok())
}

/// Runs [`InboxProcessor`] and reschedules failures.
#[derive(Clone)]
pub struct InboxWorker {
    processor: InboxProcessor,
    driver: RetryDriver,
    queue: Arc<dyn InboxQueue>,
}

impl InboxWorker {
    #[must_use]
    pub fn new(processor: InboxProcessor, driver: RetryDriver, queue: Arc<dyn InboxQueue>) -> Self {
        Self {
            processor,
            driver,
            queue,
        }
    }

    pub async fn handle(&self, job: InboxJob) -> Result<Disposition, QueueError> {
        let activity_type = job
            .activity
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
            .to_string();
        debug!(job_id = %job.id, activity_type = %activity_type, "Processing incoming activity");

        let err: FederationError = match self.processor.process(&job).await {
            Ok(outcome @ Outcome::Skip(_)) => {
                warn!(job_id = %job.id, activity_type = %activity_type, outcome = %outcome, "Activity skipped");
                return Ok(Disposition::Completed);
            }
            Ok(outcome) => {
                info!(job_id = %job.id, activity_type = %activity_type, outcome = %outcome, "Activity processed");
                return Ok(Disposition::Completed);
            }
            Err(e) => e,
        };

        warn!(job_id = %job.id, error = %err, "Failed to process activity");
        match self.driver.on_failure(job, &err.to_string()) {
            RetryDecision::Retry { job, delay } => {
                self.queue.enqueue(job, Some(delay)).await?;
                Ok(Disposition::Rescheduled(delay))
            }
            RetryDecision::GiveUp(_) => Ok(Disposition::Dropped),
        }
    }
}

/// Worker function for processing incoming activities.
///
/// # Errors
/// Returns an error only when a failed job could not be rescheduled.
pub async fn inbox_worker(job: InboxJob, worker: Data<InboxWorker>) -> Result<(), Error> {
    worker.handle(job).await.map(|_| ()).map_err(|e| {
        error!(error = %e, "Failed to reschedule inbox job");
        failed(e)
    })
}
