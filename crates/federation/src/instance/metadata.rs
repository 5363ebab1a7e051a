//! Nodeinfo-based instance metadata refresh.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use super::{InstanceMetadata, InstanceUpdate};
use crate::client::ApClient;
use crate::error::{FederationError, FederationResult};
use crate::lock::LockManager;
use crate::store::InstanceStore;

/// Minimum time between two refreshes of the same host.
pub const METADATA_REFRESH_INTERVAL_HOURS: i64 = 24;

const NODEINFO_SCHEMAS: &[&str] = &[
    "http://nodeinfo.diaspora.software/ns/schema/2.1",
    "http://nodeinfo.diaspora.software/ns/schema/2.0",
];

/// The parts of a nodeinfo 2.x document we keep.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub software: NodeInfoSoftware,
    #[serde(default)]
    pub open_registrations: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfoSoftware {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WellKnownLinks {
    #[serde(default)]
    links: Vec<WellKnownLink>,
}

#[derive(Debug, Deserialize)]
struct WellKnownLink {
    rel: String,
    href: Url,
}

/// Refreshes software name, version and registration status of remote hosts.
#[derive(Clone)]
pub struct InstanceMetadataFetcher {
    client: ApClient,
    locks: LockManager,
    instances: Arc<dyn InstanceStore>,
}

impl InstanceMetadataFetcher {
    #[must_use]
    pub fn new(client: ApClient, locks: LockManager, instances: Arc<dyn InstanceStore>) -> Self {
        Self {
            client,
            locks,
            instances,
        }
    }

    /// Fetch nodeinfo for `host` unless it was fetched in the last 24 hours
    /// (or `force` is set).
    pub async fn fetch_instance_metadata(&self, host: &str, force: bool) -> FederationResult<()> {
        let guard = self.locks.instance_lock(host).await?;
        let result = self.refresh(host, force).await;
        guard.release().await?;
        result
    }

    async fn refresh(&self, host: &str, force: bool) -> FederationResult<()> {
        if !force {
            let health = self.instances.find(host).await?;
            let fresh_after = Utc::now() - Duration::hours(METADATA_REFRESH_INTERVAL_HOURS);
            if health
                .and_then(|h| h.info_updated_at)
                .is_some_and(|at| at > fresh_after)
            {
                debug!(host = %host, "Instance metadata is fresh");
                return Ok(());
            }
        }

        let nodeinfo = self.fetch_nodeinfo(host).await?;
        info!(
            host = %host,
            software = %nodeinfo.software.name,
            version = ?nodeinfo.software.version,
            "Fetched instance metadata"
        );

        self.instances
            .update(
                host,
                InstanceUpdate {
                    metadata: Some(InstanceMetadata {
                        software_name: Some(nodeinfo.software.name.to_lowercase()),
                        software_version: nodeinfo.software.version,
                        open_registrations: nodeinfo.open_registrations,
                        updated_at: Utc::now(),
                    }),
                    ..InstanceUpdate::default()
                },
            )
            .await?;
        Ok(())
    }

    async fn fetch_nodeinfo(&self, host: &str) -> FederationResult<NodeInfo> {
        let well_known = Url::parse(&format!("https://{host}/.well-known/nodeinfo"))
            .map_err(|e| FederationError::InvalidObject(format!("invalid host {host}: {e}")))?;
        let links: WellKnownLinks = parse(self.client.get_json(&well_known).await?)?;

        let link = NODEINFO_SCHEMAS
            .iter()
            .find_map(|schema| links.links.iter().find(|l| l.rel == *schema))
            .ok_or_else(|| FederationError::InvalidObject(format!("no nodeinfo link on {host}")))?;

        parse(self.client.get_json(&link.href).await?)
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: Value) -> FederationResult<T> {
    serde_json::from_value(value).map_err(|e| FederationError::InvalidObject(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::lock::{DEFAULT_LOCK_TIMEOUT, MemoryLeaseStore};
    use crate::store::MemoryDomain;
    use crate::test_utils::{FakeTransport, StubRequestSigner};
    use serde_json::json;

    fn fetcher(transport: Arc<FakeTransport>, store: Arc<MemoryDomain>) -> InstanceMetadataFetcher {
        let client = ApClient::new(
            transport,
            Arc::new(StubRequestSigner),
            &Url::parse("https://local.example").unwrap(),
        );
        let locks = LockManager::new(Arc::new(MemoryLeaseStore::new()), DEFAULT_LOCK_TIMEOUT);
        InstanceMetadataFetcher::new(client, locks, store)
    }

    fn serve_nodeinfo(transport: &FakeTransport) {
        transport.json(
            "https://remote.example/.well-known/nodeinfo",
            json!({"links": [{
                "rel": "http://nodeinfo.diaspora.software/ns/schema/2.0",
                "href": "https://remote.example/nodeinfo/2.0"
            }]}),
        );
        transport.json(
            "https://remote.example/nodeinfo/2.0",
            json!({
                "version": "2.0",
                "software": {"name": "Misskey", "version": "2024.11.0"},
                "openRegistrations": false
            }),
        );
    }

    #[tokio::test]
    async fn test_metadata_is_stored_and_cached_for_a_day() {
        let transport = Arc::new(FakeTransport::new());
        serve_nodeinfo(&transport);
        let store = Arc::new(MemoryDomain::new());
        let fetcher = fetcher(transport.clone(), store.clone());

        fetcher.fetch_instance_metadata("remote.example", false).await.unwrap();
        let health = store.instance("remote.example").await.unwrap();
        assert_eq!(health.software_name.as_deref(), Some("misskey"));
        assert_eq!(health.open_registrations, Some(false));
        assert_eq!(transport.requests().len(), 2);

        fetcher.fetch_instance_metadata("remote.example", false).await.unwrap();
        assert_eq!(transport.requests().len(), 2);

        fetcher.fetch_instance_metadata("remote.example", true).await.unwrap();
        assert_eq!(transport.requests().len(), 4);
    }
}
