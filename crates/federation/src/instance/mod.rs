//! Remote instance health and reachability.
//!
//! [`InstanceHealth`] is updated last-writer-wins by the delivery processor
//! and the inbox; [`InstanceSkipPolicy`] reads it to decide whether a host
//! should be contacted at all.

mod metadata;
mod skip;

pub use metadata::{InstanceMetadataFetcher, NodeInfo};
pub use skip::{InstanceSkipPolicy, SkipReason, normalize_host};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// How long a non-responding instance may stay silent before it is treated as dead.
pub const DEAD_AFTER_DAYS: i64 = 7;

/// Reachability and metadata of one remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub host: String,
    pub latest_request_sent_at: Option<DateTime<Utc>>,
    pub latest_request_received_at: Option<DateTime<Utc>>,
    pub latest_status: Option<u16>,
    pub is_not_responding: bool,
    pub is_suspended: bool,
    pub last_communicated_at: Option<DateTime<Utc>>,
    pub info_updated_at: Option<DateTime<Utc>>,
    pub software_name: Option<String>,
    pub software_version: Option<String>,
    pub open_registrations: Option<bool>,
}

impl InstanceHealth {
    /// A freshly registered host.
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            latest_request_sent_at: None,
            latest_request_received_at: None,
            latest_status: None,
            is_not_responding: false,
            is_suspended: false,
            last_communicated_at: None,
            info_updated_at: None,
            software_name: None,
            software_version: None,
            open_registrations: None,
        }
    }

    /// Not responding and silent for [`DEAD_AFTER_DAYS`].
    #[must_use]
    pub fn is_dead(&self, now: DateTime<Utc>) -> bool {
        self.is_not_responding
            && self
                .last_communicated_at
                .is_some_and(|at| at < now - Duration::days(DEAD_AFTER_DAYS))
    }

    /// Apply a partial update.
    pub fn apply(&mut self, update: InstanceUpdate) {
        if let Some(at) = update.latest_request_sent_at {
            self.latest_request_sent_at = Some(at);
        }
        if let Some(at) = update.latest_request_received_at {
            self.latest_request_received_at = Some(at);
        }
        if let Some(status) = update.latest_status {
            self.latest_status = status;
        }
        if let Some(flag) = update.is_not_responding {
            self.is_not_responding = flag;
        }
        if let Some(flag) = update.is_suspended {
            self.is_suspended = flag;
        }
        if let Some(at) = update.last_communicated_at {
            self.last_communicated_at = Some(at);
        }
        if let Some(meta) = update.metadata {
            self.software_name = meta.software_name;
            self.software_version = meta.software_version;
            self.open_registrations = meta.open_registrations;
            self.info_updated_at = Some(meta.updated_at);
        }
    }
}

/// Software information from nodeinfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceMetadata {
    pub software_name: Option<String>,
    pub software_version: Option<String>,
    pub open_registrations: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of [`InstanceHealth`]; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceUpdate {
    pub latest_request_sent_at: Option<DateTime<Utc>>,
    pub latest_request_received_at: Option<DateTime<Utc>>,
    pub latest_status: Option<Option<u16>>,
    pub is_not_responding: Option<bool>,
    pub is_suspended: Option<bool>,
    pub last_communicated_at: Option<DateTime<Utc>>,
    pub metadata: Option<InstanceMetadata>,
}

impl InstanceUpdate {
    /// A delivery was answered with 2xx.
    #[must_use]
    pub fn delivered(status: u16, now: DateTime<Utc>) -> Self {
        Self {
            latest_request_sent_at: Some(now),
            latest_status: Some(Some(status)),
            is_not_responding: Some(false),
            last_communicated_at: Some(now),
            ..Self::default()
        }
    }

    /// A delivery was answered with an error status.
    #[must_use]
    pub fn failed(status: u16, now: DateTime<Utc>) -> Self {
        Self {
            latest_request_sent_at: Some(now),
            latest_status: Some(Some(status)),
            is_not_responding: Some(true),
            ..Self::default()
        }
    }

    /// A delivery never got a response.
    #[must_use]
    pub fn unreachable(now: DateTime<Utc>) -> Self {
        Self {
            latest_request_sent_at: Some(now),
            latest_status: Some(None),
            is_not_responding: Some(true),
            ..Self::default()
        }
    }

    /// A verified activity arrived from the host.
    #[must_use]
    pub fn received(now: DateTime<Utc>) -> Self {
        Self {
            latest_request_received_at: Some(now),
            is_not_responding: Some(false),
            last_communicated_at: Some(now),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn suspended() -> Self {
        Self {
            is_suspended: Some(true),
            ..Self::default()
        }
    }
}
