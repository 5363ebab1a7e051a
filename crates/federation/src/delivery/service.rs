//! Delivery service.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use super::{ApRenderer, DeliverManager, DeliveryStats};
use crate::error::{DomainError, FederationError, FederationResult};
use crate::instance::{InstanceSkipPolicy, normalize_host};
use crate::jobs::{DeliveryJob, DeliveryQueue};
use crate::store::{Domain, User};

/// Queues activities of local users for delivery.
#[derive(Clone)]
pub struct DeliveryService {
    domain: Domain,
    renderer: ApRenderer,
    queue: Arc<dyn DeliveryQueue>,
    skip_policy: InstanceSkipPolicy,
    stats: Arc<DeliveryStats>,
}

impl DeliveryService {
    #[must_use]
    pub fn new(
        domain: Domain,
        renderer: ApRenderer,
        queue: Arc<dyn DeliveryQueue>,
        skip_policy: InstanceSkipPolicy,
        stats: Arc<DeliveryStats>,
    ) -> Self {
        Self {
            domain,
            renderer,
            queue,
            skip_policy,
            stats,
        }
    }

    #[must_use]
    pub(crate) const fn domain(&self) -> &Domain {
        &self.domain
    }

    #[must_use]
    pub fn stats(&self) -> Arc<DeliveryStats> {
        self.stats.clone()
    }

    /// Render `activity` and LD-sign it with `from`'s key.
    pub async fn prepare(&self, activity: Value, from: &User) -> FederationResult<Value> {
        if !from.is_local() {
            return Err(FederationError::Internal(format!(
                "cannot deliver on behalf of remote user {}",
                from.id
            )));
        }
        let keypair = self
            .domain
            .users
            .find_keypair(&from.id)
            .await?
            .ok_or_else(|| DomainError::NotFound(format!("keypair of user {}", from.id)))?;

        let rendered = self.renderer.render_activity(activity);
        self.renderer
            .sign(rendered, &self.renderer.actor_key(from, &keypair))
    }

    /// Enqueue an already prepared payload for one inbox, unless the skip
    /// policy rejects its host. Returns whether a job was queued.
    pub(crate) async fn enqueue(
        &self,
        payload: Value,
        from: &User,
        inbox: Url,
        is_shared_inbox: bool,
    ) -> FederationResult<bool> {
        let host = inbox.host_str().map(normalize_host).unwrap_or_default();
        if let Some(reason) = self.skip_policy.should_skip_instance(&host).await? {
            debug!(inbox = %inbox, reason = %reason, "Not queueing delivery to skipped instance");
            self.stats.record_skipped();
            return Ok(false);
        }

        let job = DeliveryJob::new(inbox, from.id.clone(), payload, is_shared_inbox);
        debug!(
            job_id = %job.id,
            inbox = %job.target_inbox,
            activity_type = job.activity_type(),
            "Queueing delivery"
        );
        self.queue.enqueue(job, None).await?;
        self.stats.record_queued(1);
        Ok(true)
    }

    /// Deliver `activity` from a local user to one inbox.
    pub async fn deliver(&self, activity: Value, from: &User, to_inbox: &Url) -> FederationResult<()> {
        let payload = self.prepare(activity, from).await?;
        self.enqueue(payload, from, to_inbox.clone(), false).await?;
        Ok(())
    }

    /// Deliver to a single remote user's inbox.
    pub async fn deliver_to_user(&self, activity: Value, from: &User, to: &User) -> FederationResult<()> {
        let Some(inbox) = to.inbox.as_ref().filter(|_| to.is_remote()) else {
            debug!(user_id = %to.id, "Recipient has no remote inbox; not delivering");
            return Ok(());
        };
        info!(from = %from.id, to = %to.id, "Delivering to user");
        self.deliver(activity, from, inbox).await
    }

    /// Deliver to every remote follower of `from`.
    pub async fn deliver_to_followers(&self, activity: Value, from: &User) -> FederationResult<usize> {
        let mut manager = self.manager(activity, from);
        manager.add_followers_recipe();
        manager.execute().await
    }

    /// Deliver to every relay with an accepted subscription.
    pub async fn deliver_to_relays(&self, activity: Value, from: &User) -> FederationResult<usize> {
        let inboxes = self.domain.relays.accepted_inboxes().await?;
        if inboxes.is_empty() {
            return Ok(0);
        }

        let payload = self.prepare(activity, from).await?;
        let mut count = 0;
        for inbox in inboxes {
            if self.enqueue(payload.clone(), from, inbox, false).await? {
                count += 1;
            }
        }
        info!(from = %from.id, count, "Queued relay deliveries");
        Ok(count)
    }

    /// Fanout builder for `activity`.
    #[must_use]
    pub fn manager(&self, activity: Value, from: &User) -> DeliverManager {
        DeliverManager::new(self.clone(), activity, from.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::{Relay, RelayStatus};
    use crate::test_utils::TestFederation;
    use apkernel_common::FederationConfig;
    use serde_json::json;

    fn follow() -> Value {
        json!({
            "type": "Follow",
            "id": "https://local.example/follows/1",
            "actor": "https://local.example/users/bob1"
        })
    }

    fn relay(id: &str, inbox: &str, status: RelayStatus) -> Relay {
        Relay {
            id: id.to_string(),
            inbox: Url::parse(inbox).unwrap(),
            status,
        }
    }

    #[tokio::test]
    async fn test_deliver_to_blocked_subdomain_queues_nothing() {
        let fed = TestFederation::with_config(FederationConfig {
            blocked_hosts: vec!["evil.example".to_string()],
            ..FederationConfig::default()
        })
        .await;
        let bob = fed.local_user("bob1", "bob").await;

        let inbox = Url::parse("https://sub.evil.example/inbox").unwrap();
        fed.ctx.delivery.deliver(follow(), &bob, &inbox).await.unwrap();

        assert!(fed.deliveries.jobs().is_empty());
        assert_eq!(fed.ctx.delivery.stats().snapshot().skipped, 1);

        let inbox = Url::parse("https://remote.example/users/alice/inbox").unwrap();
        fed.ctx.delivery.deliver(follow(), &bob, &inbox).await.unwrap();
        let jobs = fed.deliveries.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0.target_inbox, inbox);
        assert!(!jobs[0].0.is_shared_inbox);
    }

    #[tokio::test]
    async fn test_relay_fanout_uses_accepted_relays() {
        let fed = TestFederation::with_config(FederationConfig {
            blocked_hosts: vec!["blocked-relay.example".to_string()],
            ..FederationConfig::default()
        })
        .await;
        let bob = fed.local_user("bob1", "bob").await;
        fed.store
            .insert_relay(relay("r1", "https://relay.example/inbox", RelayStatus::Accepted))
            .await;
        fed.store
            .insert_relay(relay("r2", "https://pending.example/inbox", RelayStatus::Requesting))
            .await;
        fed.store
            .insert_relay(relay("r3", "https://rejected.example/inbox", RelayStatus::Rejected))
            .await;
        fed.store
            .insert_relay(relay("r4", "https://blocked-relay.example/inbox", RelayStatus::Accepted))
            .await;

        let count = fed.ctx.delivery.deliver_to_relays(follow(), &bob).await.unwrap();

        assert_eq!(count, 1);
        let jobs = fed.deliveries.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0.target_inbox.as_str(), "https://relay.example/inbox");
        assert_eq!(jobs[0].0.sender_user_id, "bob1");
    }

    #[tokio::test]
    async fn test_remote_sender_is_refused() {
        let fed = TestFederation::new().await;
        let alice = fed.remote_user("alice1", "remote.example", "alice").await;
        let inbox = Url::parse("https://other.example/inbox").unwrap();

        assert!(fed.ctx.delivery.deliver(follow(), &alice, &inbox).await.is_err());
        assert!(fed.deliveries.jobs().is_empty());
    }
}
