//! Per-host skip decisions for outgoing traffic.

use std::fmt;
use std::sync::Arc;

use apkernel_common::FederationConfig;
use chrono::Utc;

use crate::error::DomainResult;
use crate::store::InstanceStore;

/// Why a host is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Blocked,
    NotAllowed,
    Suspended,
    Dead,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Blocked => "blocked",
            Self::NotAllowed => "not allowed",
            Self::Suspended => "suspended",
            Self::Dead => "dead",
        })
    }
}

/// Lowercased ASCII (punycode) form of a host.
#[must_use]
pub fn normalize_host(host: &str) -> String {
    match url::Host::parse(host.trim()) {
        Ok(url::Host::Domain(domain)) => domain.to_ascii_lowercase(),
        Ok(other) => other.to_string(),
        Err(_) => host.trim().to_lowercase(),
    }
}

/// Decides whether a remote host may be contacted.
#[derive(Clone)]
pub struct InstanceSkipPolicy {
    blocked_hosts: Arc<Vec<String>>,
    allowed_hosts: Arc<Vec<String>>,
    private_mode: bool,
    instances: Arc<dyn InstanceStore>,
}

impl InstanceSkipPolicy {
    #[must_use]
    pub fn new(config: &FederationConfig, instances: Arc<dyn InstanceStore>) -> Self {
        Self {
            blocked_hosts: Arc::new(config.blocked_hosts.iter().map(|h| normalize_host(h)).collect()),
            allowed_hosts: Arc::new(config.allowed_hosts.iter().map(|h| normalize_host(h)).collect()),
            private_mode: config.private_mode,
            instances,
        }
    }

    /// Blocked hosts match exactly or as a parent domain.
    #[must_use]
    pub fn is_blocked_host(&self, host: &str) -> bool {
        let host = normalize_host(host);
        self.blocked_hosts
            .iter()
            .any(|blocked| host == *blocked || host.ends_with(&format!(".{blocked}")))
    }

    /// Outside private mode every host is allowed.
    #[must_use]
    pub fn is_allowed_host(&self, host: &str) -> bool {
        if !self.private_mode {
            return true;
        }
        let host = normalize_host(host);
        self.allowed_hosts.iter().any(|allowed| host == *allowed)
    }

    /// Static checks plus suspension. Used right before a request goes out.
    pub async fn delivery_skip_reason(&self, host: &str) -> DomainResult<Option<SkipReason>> {
        if self.is_blocked_host(host) {
            return Ok(Some(SkipReason::Blocked));
        }
        if !self.is_allowed_host(host) {
            return Ok(Some(SkipReason::NotAllowed));
        }
        let health = self.instances.find(&normalize_host(host)).await?;
        Ok(health
            .filter(|h| h.is_suspended)
            .map(|_| SkipReason::Suspended))
    }

    /// Everything [`Self::delivery_skip_reason`] checks, plus dead instances.
    pub async fn should_skip_instance(&self, host: &str) -> DomainResult<Option<SkipReason>> {
        if let Some(reason) = self.delivery_skip_reason(host).await? {
            return Ok(Some(reason));
        }
        let health = self.instances.find(&normalize_host(host)).await?;
        Ok(health
            .filter(|h| h.is_dead(Utc::now()))
            .map(|_| SkipReason::Dead))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::instance::InstanceUpdate;
    use crate::store::MemoryDomain;
    use chrono::Duration;

    fn policy(config: FederationConfig) -> (InstanceSkipPolicy, Arc<MemoryDomain>) {
        let store = Arc::new(MemoryDomain::new());
        (InstanceSkipPolicy::new(&config, store.clone()), store)
    }

    #[test]
    fn test_blocked_suffix_match() {
        let (policy, _) = policy(FederationConfig {
            blocked_hosts: vec!["Bad.Example".to_string()],
            ..FederationConfig::default()
        });

        assert!(policy.is_blocked_host("bad.example"));
        assert!(policy.is_blocked_host("sub.bad.example"));
        assert!(!policy.is_blocked_host("notbad.example"));
    }

    #[test]
    fn test_punycode_normalization() {
        let (policy, _) = policy(FederationConfig {
            blocked_hosts: vec!["xn--r8jz45g.example".to_string()],
            ..FederationConfig::default()
        });

        assert!(policy.is_blocked_host("例え.example"));
    }

    #[tokio::test]
    async fn test_private_mode_allowlist() {
        let (policy, _) = policy(FederationConfig {
            private_mode: true,
            allowed_hosts: vec!["friend.example".to_string()],
            ..FederationConfig::default()
        });

        assert_eq!(policy.delivery_skip_reason("friend.example").await.unwrap(), None);
        assert_eq!(
            policy.delivery_skip_reason("stranger.example").await.unwrap(),
            Some(SkipReason::NotAllowed)
        );
    }

    #[tokio::test]
    async fn test_suspended_and_dead() {
        let (policy, store) = policy(FederationConfig::default());
        store
            .update("suspended.example", InstanceUpdate::suspended())
            .await
            .unwrap();
        let long_ago = Utc::now() - Duration::days(30);
        store
            .update("dead.example", InstanceUpdate::delivered(200, long_ago))
            .await
            .unwrap();
        store
            .update("dead.example", InstanceUpdate::failed(502, Utc::now()))
            .await
            .unwrap();

        assert_eq!(
            policy.should_skip_instance("suspended.example").await.unwrap(),
            Some(SkipReason::Suspended)
        );
        assert_eq!(
            policy.should_skip_instance("dead.example").await.unwrap(),
            Some(SkipReason::Dead)
        );
        assert_eq!(policy.delivery_skip_reason("dead.example").await.unwrap(), None);
        assert_eq!(policy.should_skip_instance("alive.example").await.unwrap(), None);
    }
}
