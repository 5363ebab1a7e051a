//! In-process caches for remote users and their public keys.
//!
//! Entries expire after a TTL and are dropped early when an
//! [`InternalEvent::RemoteUserUpdated`] arrives on the event bus.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::{EventBus, InternalEvent};
use crate::store::{User, UserPublicKey};

/// Default cache TTL: 24 hours
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Key-value cache with per-entry expiry.
#[derive(Debug)]
pub struct MemoryKvCache<V> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (V, Instant)>>,
}

impl<V: Clone> MemoryKvCache<V> {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        let expires_at = Instant::now() + self.ttl;
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), (value, expires_at));
    }

    pub fn delete(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Drop every entry whose value matches `predicate`.
    pub fn delete_where(&self, predicate: impl Fn(&V) -> bool) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, (value, _)| !predicate(value));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Remote users by actor URI.
#[derive(Debug)]
pub struct UserCache {
    inner: MemoryKvCache<User>,
}

impl Default for UserCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl UserCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: MemoryKvCache::new(ttl),
        }
    }

    pub fn get(&self, uri: &str) -> Option<User> {
        self.inner.get(uri)
    }

    pub fn set(&self, user: &User) {
        if let Some(uri) = &user.uri {
            self.inner.set(uri.as_str(), user.clone());
        }
    }

    pub fn invalidate(&self, uri: &str) {
        self.inner.delete(uri);
    }
}

/// Public keys and their owners by key id.
#[derive(Debug)]
pub struct PublicKeyCache {
    inner: MemoryKvCache<(User, UserPublicKey)>,
}

impl Default for PublicKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

impl PublicKeyCache {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: MemoryKvCache::new(ttl),
        }
    }

    pub fn get(&self, key_id: &str) -> Option<(User, UserPublicKey)> {
        self.inner.get(key_id)
    }

    pub fn set(&self, user: &User, key: &UserPublicKey) {
        self.inner
            .set(key.key_id.clone(), (user.clone(), key.clone()));
    }

    pub fn invalidate_user(&self, user_id: &str) {
        self.inner.delete_where(|(user, _)| user.id == user_id);
    }
}

/// Drop cached entries whenever a remote user changes.
pub fn spawn_invalidator(
    bus: &EventBus,
    users: std::sync::Arc<UserCache>,
    keys: std::sync::Arc<PublicKeyCache>,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(InternalEvent::RemoteUserUpdated { user_id, uri }) => {
                    debug!(user_id = %user_id, uri = %uri, "Invalidating cached user");
                    users.invalidate(&uri);
                    keys.invalidate_user(&user_id);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Cache invalidator lagged behind the event bus");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}
