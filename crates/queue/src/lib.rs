//! Redis backends and background workers for apkernel.
//!
//! - **Storage**: apalis queues for deliveries, inbound activities and account purges
//! - **Workers**: job handlers that reschedule failures with `apBackoff`
//! - **Leases**: lock and deduplication records shared across processes
//! - **Pub/Sub**: internal events relayed between processes

pub mod lease;
pub mod pubsub;
pub mod retry;
pub mod storage;
pub mod workers;

pub use lease::RedisLeaseStore;
pub use pubsub::RedisEventRelay;
pub use retry::{DeadLetterEntry, RetryDecision, RetryDriver, RetryPolicy, ap_backoff};
pub use storage::{
    DELETE_ACCOUNT_QUEUE, DELIVER_QUEUE, INBOX_QUEUE, RedisAccountJobQueue, RedisDeliveryQueue,
    RedisInboxQueue, redis_storage,
};
pub use workers::*;
