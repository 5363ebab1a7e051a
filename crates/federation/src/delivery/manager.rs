//! Inbox fanout.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{debug, info};
use url::Url;

use super::DeliveryService;
use crate::error::FederationResult;
use crate::store::User;

/// Who should receive an activity.
#[derive(Debug, Clone)]
pub enum Recipe {
    /// Every remote follower of the actor.
    Followers,
    /// One specific remote user.
    Direct(User),
}

/// Collects inboxes from recipes and queues one job per inbox.
///
/// Shared inboxes are preferred over personal ones, each inbox receives the
/// activity once, and hosts the skip policy rejects are dropped.
pub struct DeliverManager {
    service: DeliveryService,
    activity: Value,
    actor: User,
    recipes: Vec<Recipe>,
}

impl DeliverManager {
    #[must_use]
    pub(crate) const fn new(service: DeliveryService, activity: Value, actor: User) -> Self {
        Self {
            service,
            activity,
            actor,
            recipes: Vec::new(),
        }
    }

    pub fn add_followers_recipe(&mut self) -> &mut Self {
        self.recipes.push(Recipe::Followers);
        self
    }

    pub fn add_direct_recipe(&mut self, to: User) -> &mut Self {
        self.recipes.push(Recipe::Direct(to));
        self
    }

    /// Inboxes to deliver to, with whether each is a shared inbox.
    async fn collect_inboxes(&self) -> FederationResult<HashMap<Url, bool>> {
        let mut inboxes = HashMap::new();

        for recipe in &self.recipes {
            match recipe {
                Recipe::Followers => {
                    let followers = self
                        .service
                        .domain()
                        .relations
                        .followers(&self.actor.id)
                        .await?;
                    for follower in followers.iter().filter(|f| f.is_remote()) {
                        if let Some(shared) = &follower.shared_inbox {
                            inboxes.insert(shared.clone(), true);
                        } else if let Some(inbox) = &follower.inbox {
                            inboxes.entry(inbox.clone()).or_insert(false);
                        }
                    }
                }
                Recipe::Direct(user) => {
                    if let Some(inbox) = user.inbox.as_ref().filter(|_| user.is_remote()) {
                        inboxes.entry(inbox.clone()).or_insert(false);
                    }
                }
            }
        }

        Ok(inboxes)
    }

    /// Queue the deliveries. Returns the number of jobs queued.
    pub async fn execute(&self) -> FederationResult<usize> {
        let inboxes = self.collect_inboxes().await?;
        if inboxes.is_empty() {
            debug!(actor = %self.actor.id, "No inboxes to deliver to");
            return Ok(0);
        }

        let payload = self
            .service
            .prepare(self.activity.clone(), &self.actor)
            .await?;
        let total = inboxes.len();
        let mut count = 0;
        for (inbox, is_shared) in inboxes {
            if self
                .service
                .enqueue(payload.clone(), &self.actor, inbox, is_shared)
                .await?
            {
                count += 1;
            }
        }

        info!(
            actor = %self.actor.id,
            count,
            skipped = total - count,
            "Queued fanout deliveries"
        );
        Ok(count)
    }
}
