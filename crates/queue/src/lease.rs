//! Redis-backed lease store for locks and activity deduplication.

use std::time::Duration;

use apkernel_federation::lock::{LeaseStore, LockError};
use async_trait::async_trait;
use fred::clients::Client as RedisClient;
use fred::interfaces::{KeysInterface, LuaInterface};
use fred::types::{Expiration, SetOptions};
use tracing::debug;

/// Deletes the key only while it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// [`LeaseStore`] over `SET NX PX`, shared by every process of a deployment.
#[derive(Clone)]
pub struct RedisLeaseStore {
    redis: RedisClient,
    prefix: String,
}

impl RedisLeaseStore {
    #[must_use]
    pub fn new(redis: RedisClient, prefix: impl Into<String>) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:lock:{key}", self.prefix)
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn set_if_absent(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        // NX returns None if key already exists, Some("OK") if set
        let result: Option<String> = self
            .redis
            .set(
                self.key(key),
                owner,
                Some(Expiration::PX(ttl_ms)),
                Some(SetOptions::NX),
                false,
            )
            .await
            .map_err(|e| LockError::Store(e.to_string()))?;
        Ok(result.is_some())
    }

    async fn release_if_owner(&self, key: &str, owner: &str) -> Result<bool, LockError> {
        let deleted: i64 = self
            .redis
            .eval(RELEASE_SCRIPT, vec![self.key(key)], vec![owner.to_string()])
            .await
            .map_err(|e| LockError::Store(e.to_string()))?;
        if deleted == 0 {
            debug!(key = %key, "Lease already expired or taken over");
        }
        Ok(deleted > 0)
    }
}
