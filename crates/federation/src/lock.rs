//! Distributed leases keyed by object URI, host or chart key.
//!
//! A lease is held by an opaque owner token and expires on its own after the
//! timeout, so a crashed holder never blocks others for longer than that.
//! Acquisition polls every 100 ms until the key is free.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use apkernel_common::IdGenerator;
use async_trait::async_trait;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Delay between acquisition attempts.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Default lease time.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Lock backend failure.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lease store error: {0}")]
    Store(String),
}

/// Atomic lease primitives.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Set `key` to `owner` with `ttl` unless it is already held. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Delete `key` only if `owner` still holds it. Returns whether it was deleted.
    async fn release_if_owner(&self, key: &str, owner: &str) -> Result<bool, LockError>;
}

/// What a lease protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    /// Processing of one `ActivityPub` object.
    ApObject(String),
    /// Metadata refresh of one instance.
    Instance(String),
    /// One chart bucket.
    ChartInsert(String),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApObject(uri) => write!(f, "ap-object:{uri}"),
            Self::Instance(host) => write!(f, "instance:{host}"),
            Self::ChartInsert(key) => write!(f, "chart-insert:{key}"),
        }
    }
}

/// Hands out [`LockGuard`]s.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn LeaseStore>,
    default_timeout: Duration,
    id_gen: IdGenerator,
}

impl LockManager {
    #[must_use]
    pub fn new(store: Arc<dyn LeaseStore>, default_timeout: Duration) -> Self {
        Self {
            store,
            default_timeout,
            id_gen: IdGenerator::new(),
        }
    }

    /// The backing store, shared with the activity deduplicator.
    #[must_use]
    pub fn store(&self) -> Arc<dyn LeaseStore> {
        self.store.clone()
    }

    /// Wait until `key` is free and take it for `timeout`.
    pub async fn acquire(&self, key: LockKey, timeout: Duration) -> Result<LockGuard, LockError> {
        let key = key.to_string();
        let owner = self.id_gen.generate_token();

        loop {
            if self.store.set_if_absent(&key, &owner, timeout).await? {
                debug!(key = %key, "Lock acquired");
                return Ok(LockGuard {
                    key,
                    owner,
                    acquired_at: Instant::now(),
                    timeout,
                    store: self.store.clone(),
                    released: false,
                });
            }
            tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
        }
    }

    /// Lock an `ActivityPub` object URI with the default timeout.
    pub async fn ap_lock(&self, uri: &str) -> Result<LockGuard, LockError> {
        self.acquire(LockKey::ApObject(uri.to_string()), self.default_timeout)
            .await
    }

    /// Lock an instance host with the default timeout.
    pub async fn instance_lock(&self, host: &str) -> Result<LockGuard, LockError> {
        self.acquire(LockKey::Instance(host.to_string()), self.default_timeout)
            .await
    }

    /// Lock a chart bucket with the default timeout.
    pub async fn chart_insert_lock(&self, key: &str) -> Result<LockGuard, LockError> {
        self.acquire(LockKey::ChartInsert(key.to_string()), self.default_timeout)
            .await
    }
}

/// A held lease. Released explicitly with [`LockGuard::release`], or in the
/// background when dropped.
pub struct LockGuard {
    key: String,
    owner: String,
    acquired_at: Instant,
    timeout: Duration,
    store: Arc<dyn LeaseStore>,
    released: bool,
}

impl LockGuard {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the lease has outlived its timeout and may belong to someone else.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.timeout
    }

    /// Release the lease now.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        let deleted = self.store.release_if_owner(&self.key, &self.owner).await?;
        if !deleted {
            debug!(key = %self.key, "Lease already expired or taken over");
        }
        Ok(())
    }
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let owner = std::mem::take(&mut self.owner);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.release_if_owner(&key, &owner).await {
                        warn!(key = %key, error = %e, "Failed to release dropped lock");
                    }
                });
            }
            Err(_) => warn!(key = %key, "Lock dropped outside a runtime; lease will expire"),
        }
    }
}

/// Process-local [`LeaseStore`].
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLeaseStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `key`, if the lease is live.
    #[must_use]
    pub fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(owner, _)| owner.clone())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn set_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if entries.get(key).is_some_and(|(_, expires_at)| *expires_at > now) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (owner.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_if_owner(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.get(key).is_some_and(|(holder, _)| holder == owner) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}
