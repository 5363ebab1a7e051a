//! Job queues on `apalis_redis` storage.

use std::time::Duration;

use apalis::prelude::Storage;
use apalis_redis::RedisStorage;
use apkernel_federation::jobs::{
    AccountJobQueue, DeleteAccountJob, DeliveryJob, DeliveryQueue, InboxJob, InboxQueue, QueueError,
};
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

/// Namespace of the delivery queue.
pub const DELIVER_QUEUE: &str = "deliver";
/// Namespace of the inbox queue.
pub const INBOX_QUEUE: &str = "inbox";
/// Namespace of the account deletion queue.
pub const DELETE_ACCOUNT_QUEUE: &str = "delete-account";

/// Storage for `T` under `<prefix>:<queue>`.
pub fn redis_storage<T>(
    conn: ConnectionManager,
    prefix: &str,
    queue: &str,
) -> RedisStorage<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static,
{
    let config = apalis_redis::Config::default().set_namespace(&format!("{prefix}:{queue}"));
    RedisStorage::new_with_config(conn, config)
}

/// Push now, or schedule when a delay is given.
async fn push_job<T>(
    storage: &RedisStorage<T>,
    job: T,
    delay: Option<Duration>,
) -> Result<(), QueueError>
where
    T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static,
{
    let mut storage = storage.clone();
    let result = match delay.filter(|d| !d.is_zero()) {
        None => storage.push(job).await.map(|_| ()),
        Some(delay) => {
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            let run_at = Utc::now()
                .checked_add_signed(delay)
                .unwrap_or_else(Utc::now)
                .timestamp();
            storage.schedule(job, run_at).await.map(|_| ())
        }
    };
    result.map_err(|e| QueueError::Backend(e.to_string()))
}

/// [`DeliveryQueue`] on Redis.
#[derive(Clone)]
pub struct RedisDeliveryQueue {
    storage: RedisStorage<DeliveryJob>,
}

impl RedisDeliveryQueue {
    #[must_use]
    pub const fn new(storage: RedisStorage<DeliveryJob>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl DeliveryQueue for RedisDeliveryQueue {
    async fn enqueue(&self, job: DeliveryJob, delay: Option<Duration>) -> Result<(), QueueError> {
        debug!(job_id = %job.id, inbox = %job.target_inbox, ?delay, "Queued delivery job");
        push_job(&self.storage, job, delay).await
    }
}

/// [`InboxQueue`] on Redis.
#[derive(Clone)]
pub struct RedisInboxQueue {
    storage: RedisStorage<InboxJob>,
}

impl RedisInboxQueue {
    #[must_use]
    pub const fn new(storage: RedisStorage<InboxJob>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl InboxQueue for RedisInboxQueue {
    async fn enqueue(&self, job: InboxJob, delay: Option<Duration>) -> Result<(), QueueError> {
        debug!(job_id = %job.id, path = %job.path, ?delay, "Queued inbox job");
        push_job(&self.storage, job, delay).await
    }
}

/// [`AccountJobQueue`] on Redis.
#[derive(Clone)]
pub struct RedisAccountJobQueue {
    storage: RedisStorage<DeleteAccountJob>,
}

impl RedisAccountJobQueue {
    #[must_use]
    pub const fn new(storage: RedisStorage<DeleteAccountJob>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl AccountJobQueue for RedisAccountJobQueue {
    async fn enqueue_delete_account(&self, user_id: &str) -> Result<String, QueueError> {
        let job = DeleteAccountJob::new(user_id);
        let id = job.id.clone();
        debug!(job_id = %id, user_id = %user_id, "Queued delete account job");
        push_job(&self.storage, job, None).await?;
        Ok(id)
    }

    async fn enqueue(&self, job: DeleteAccountJob, delay: Option<Duration>) -> Result<(), QueueError> {
        debug!(job_id = %job.id, user_id = %job.user_id, ?delay, "Requeued delete account job");
        push_job(&self.storage, job, delay).await
    }
}
