//! Job payloads and the queues they are pushed to.
//!
//! The queue crate provides the apalis/Redis backends; the `Memory*` queues
//! here record what was enqueued.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use apkernel_common::IdGenerator;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::FederationError;

/// Queue backend failure.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("failed to enqueue job: {0}")]
    Backend(String),
}

impl From<QueueError> for FederationError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e.to_string())
    }
}

/// Deliver one activity to one inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub id: String,
    pub target_inbox: Url,
    pub sender_user_id: String,
    /// The rendered, LD-signed activity.
    pub payload: Value,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub is_shared_inbox: bool,
}

impl DeliveryJob {
    #[must_use]
    pub fn new(
        target_inbox: Url,
        sender_user_id: impl Into<String>,
        payload: Value,
        is_shared_inbox: bool,
    ) -> Self {
        Self {
            id: IdGenerator::new().generate(),
            target_inbox,
            sender_user_id: sender_user_id.into(),
            payload,
            attempt_count: 0,
            is_shared_inbox,
        }
    }

    /// Host of the target inbox.
    #[must_use]
    pub fn host(&self) -> &str {
        self.target_inbox.host_str().unwrap_or_default()
    }

    /// Type of the carried activity, for logs.
    #[must_use]
    pub fn activity_type(&self) -> &str {
        self.payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("Unknown")
    }
}

/// Process one inbound activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxJob {
    pub id: String,
    pub activity: Value,
    pub method: String,
    /// Request path including the query.
    pub path: String,
    /// Request headers keyed by lowercase name.
    pub headers: BTreeMap<String, String>,
    /// When the request reached the inbox. The `Date` header is checked
    /// against this, not against the time a retry runs.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
    #[serde(default)]
    pub attempt_count: u32,
}

impl InboxJob {
    #[must_use]
    pub fn new(
        activity: Value,
        method: impl Into<String>,
        path: impl Into<String>,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: IdGenerator::new().generate(),
            activity,
            method: method.into(),
            path: path.into(),
            headers,
            received_at: Utc::now(),
            attempt_count: 0,
        }
    }
}

/// Purge a deleted account's data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAccountJob {
    pub id: String,
    pub user_id: String,
    #[serde(default)]
    pub attempt_count: u32,
}

impl DeleteAccountJob {
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: IdGenerator::new().generate(),
            user_id: user_id.into(),
            attempt_count: 0,
        }
    }
}

#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Push `job`, to run after `delay` when given.
    async fn enqueue(&self, job: DeliveryJob, delay: Option<Duration>) -> Result<(), QueueError>;
}

#[async_trait]
pub trait InboxQueue: Send + Sync {
    async fn enqueue(&self, job: InboxJob, delay: Option<Duration>) -> Result<(), QueueError>;
}

#[async_trait]
pub trait AccountJobQueue: Send + Sync {
    /// Returns the id of the queued job.
    async fn enqueue_delete_account(&self, user_id: &str) -> Result<String, QueueError>;

    /// Push an already built job, e.g. a retry.
    async fn enqueue(&self, job: DeleteAccountJob, delay: Option<Duration>) -> Result<(), QueueError>;
}

/// Recording [`DeliveryQueue`].
#[derive(Debug, Default)]
pub struct MemoryDeliveryQueue {
    jobs: Mutex<Vec<(DeliveryJob, Option<Duration>)>>,
}

impl MemoryDeliveryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything enqueued so far.
    #[must_use]
    pub fn jobs(&self) -> Vec<(DeliveryJob, Option<Duration>)> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return everything enqueued so far.
    #[must_use]
    pub fn take(&self) -> Vec<(DeliveryJob, Option<Duration>)> {
        std::mem::take(&mut *self.jobs.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl DeliveryQueue for MemoryDeliveryQueue {
    async fn enqueue(&self, job: DeliveryJob, delay: Option<Duration>) -> Result<(), QueueError> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((job, delay));
        Ok(())
    }
}

/// Recording [`InboxQueue`].
#[derive(Debug, Default)]
pub struct MemoryInboxQueue {
    jobs: Mutex<Vec<(InboxJob, Option<Duration>)>>,
}

impl MemoryInboxQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn jobs(&self) -> Vec<(InboxJob, Option<Duration>)> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl InboxQueue for MemoryInboxQueue {
    async fn enqueue(&self, job: InboxJob, delay: Option<Duration>) -> Result<(), QueueError> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((job, delay));
        Ok(())
    }
}

/// Recording [`AccountJobQueue`].
#[derive(Debug, Default)]
pub struct MemoryAccountJobQueue {
    jobs: Mutex<Vec<DeleteAccountJob>>,
}

impl MemoryAccountJobQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn jobs(&self) -> Vec<DeleteAccountJob> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AccountJobQueue for MemoryAccountJobQueue {
    async fn enqueue_delete_account(&self, user_id: &str) -> Result<String, QueueError> {
        let job = DeleteAccountJob::new(user_id);
        let id = job.id.clone();
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
        Ok(id)
    }

    async fn enqueue(&self, job: DeleteAccountJob, _delay: Option<Duration>) -> Result<(), QueueError> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(job);
        Ok(())
    }
}
