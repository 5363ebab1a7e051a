//! Replay protection for inbound activities.
//!
//! Duplicate activity ids are detected through the same [`LeaseStore`] the
//! lock manager uses: the first job to see an id records it for 48 hours.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::lock::{LeaseStore, LockError};
use crate::signature::SignatureError;

/// How long a seen activity id is remembered.
pub const DEDUPE_WINDOW: Duration = Duration::from_secs(48 * 60 * 60);

/// Maximum accepted skew of the `Date` header.
pub const MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

/// Remembers which inbound activity ids have been processed.
#[derive(Clone)]
pub struct ActivityDeduplicator {
    store: Arc<dyn LeaseStore>,
    window: Duration,
}

impl ActivityDeduplicator {
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self {
            store,
            window: DEDUPE_WINDOW,
        }
    }

    fn key(activity_id: &str) -> String {
        format!("activity-seen:{activity_id}")
    }

    /// Record `activity_id` for `owner`. Returns `false` when another job already did.
    pub async fn check_and_record(&self, activity_id: &str, owner: &str) -> Result<bool, LockError> {
        let recorded = self
            .store
            .set_if_absent(&Self::key(activity_id), owner, self.window)
            .await?;
        if recorded {
            debug!(activity_id = %activity_id, "New activity recorded");
        } else {
            warn!(activity_id = %activity_id, "Duplicate activity detected");
        }
        Ok(recorded)
    }

    /// Forget an id recorded by `owner`, so a retry of the same job is not
    /// mistaken for a duplicate.
    pub async fn forget(&self, activity_id: &str, owner: &str) -> Result<(), LockError> {
        self.store
            .release_if_owner(&Self::key(activity_id), owner)
            .await?;
        Ok(())
    }
}

/// Parse an RFC 7231 `Date` header.
pub fn parse_http_date(value: &str) -> Result<DateTime<Utc>, SignatureError> {
    DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| SignatureError::InvalidDateFormat)
}

/// Reject `Date` headers too far from our clock.
pub fn validate_date_header(value: &str, now: DateTime<Utc>) -> Result<(), SignatureError> {
    let sent_at = parse_http_date(value)?;
    let skew = now.signed_duration_since(sent_at).num_seconds();
    if skew.abs() > MAX_CLOCK_SKEW_SECS {
        warn!(date = %value, skew_secs = skew, "Signature date outside allowed skew");
        return Err(SignatureError::ExpiredSignature);
    }
    Ok(())
}
