//! Shared state of the federation engine.

use std::sync::Arc;

use apkernel_common::FederationConfig;
use url::Url;

use crate::cache::{PublicKeyCache, UserCache};
use crate::client::{ApClient, HttpTransport};
use crate::delivery::{ApRenderer, DeliveryService, DeliveryStats};
use crate::error::FederationResult;
use crate::events::EventBus;
use crate::instance::{InstanceMetadataFetcher, InstanceSkipPolicy};
use crate::jobs::{AccountJobQueue, DeliveryQueue};
use crate::ld_signature::LdSigner;
use crate::lock::{LeaseStore, LockManager};
use crate::security::ActivityDeduplicator;
use crate::signature::{ActorKey, RequestSigner};
use crate::store::Domain;
use crate::tasks::BackgroundTasks;

/// Capabilities the composition root plugs in.
pub struct FederationDeps {
    pub domain: Domain,
    pub transport: Arc<dyn HttpTransport>,
    pub request_signer: Arc<dyn RequestSigner>,
    pub ld_signer: Arc<dyn LdSigner>,
    pub lease_store: Arc<dyn LeaseStore>,
    pub delivery_queue: Arc<dyn DeliveryQueue>,
    pub account_jobs: Arc<dyn AccountJobQueue>,
    pub events: EventBus,
}

/// Everything processors, the resolver and the workers share.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct FederationContext {
    pub origin: Url,
    pub config: Arc<FederationConfig>,
    pub domain: Domain,
    pub client: ApClient,
    pub locks: LockManager,
    pub dedupe: ActivityDeduplicator,
    pub events: EventBus,
    pub tasks: BackgroundTasks,
    pub users_cache: Arc<UserCache>,
    pub keys_cache: Arc<PublicKeyCache>,
    pub renderer: ApRenderer,
    pub delivery: DeliveryService,
    pub account_jobs: Arc<dyn AccountJobQueue>,
    pub skip_policy: InstanceSkipPolicy,
    pub metadata: InstanceMetadataFetcher,
}

impl FederationContext {
    #[must_use]
    pub fn new(origin: Url, config: FederationConfig, deps: FederationDeps) -> Self {
        let client = ApClient::new(deps.transport, deps.request_signer, &origin);
        let locks = LockManager::new(deps.lease_store.clone(), config.lock_timeout());
        let skip_policy = InstanceSkipPolicy::new(&config, deps.domain.instances.clone());
        let renderer = ApRenderer::new(origin.clone(), deps.ld_signer);
        let delivery = DeliveryService::new(
            deps.domain.clone(),
            renderer.clone(),
            deps.delivery_queue,
            skip_policy.clone(),
            Arc::new(DeliveryStats::new()),
        );
        let metadata =
            InstanceMetadataFetcher::new(client.clone(), locks.clone(), deps.domain.instances.clone());

        Self {
            origin,
            config: Arc::new(config),
            domain: deps.domain,
            client,
            locks,
            dedupe: ActivityDeduplicator::new(deps.lease_store),
            events: deps.events,
            tasks: BackgroundTasks::new(),
            users_cache: Arc::new(UserCache::default()),
            keys_cache: Arc::new(PublicKeyCache::default()),
            renderer,
            delivery,
            account_jobs: deps.account_jobs,
            skip_policy,
            metadata,
        }
    }

    /// Our own host.
    #[must_use]
    pub fn local_host(&self) -> &str {
        self.origin.host_str().unwrap_or_default()
    }

    #[must_use]
    pub fn is_local_url(&self, url: &Url) -> bool {
        url.host_str() == self.origin.host_str()
            && url.port_or_known_default() == self.origin.port_or_known_default()
    }

    /// Key the instance actor signs fetches with, when signed fetches are on.
    pub async fn fetch_key(&self) -> FederationResult<Option<ActorKey>> {
        if !self.config.sign_to_activitypub_get {
            return Ok(None);
        }
        let actor = self.domain.users.instance_actor().await?;
        let keypair = self.domain.users.find_keypair(&actor.id).await?;
        Ok(keypair.map(|kp| self.renderer.actor_key(&actor, &kp)))
    }
}

