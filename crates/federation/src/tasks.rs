//! Fire-and-forget background work.
//!
//! Tasks are spawned on the runtime and their failures only logged. Tests can
//! [`BackgroundTasks::drain`] to wait for everything submitted so far.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinSet;
use tracing::warn;

use crate::error::FederationResult;

/// Log-and-drop task runner.
#[derive(Clone, Default)]
pub struct BackgroundTasks {
    set: Arc<Mutex<JoinSet<()>>>,
}

impl BackgroundTasks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `future` in the background; an error is logged under `name`.
    pub fn spawn<F>(&self, name: &'static str, future: F)
    where
        F: Future<Output = FederationResult<()>> + Send + 'static,
    {
        let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        // Reap finished tasks so the set does not grow unbounded.
        while set.try_join_next().is_some() {}
        set.spawn(async move {
            if let Err(e) = future.await {
                warn!(task = name, error = %e, "Background task failed");
            }
        });
    }

    /// Wait for every task submitted so far.
    pub async fn drain(&self) {
        loop {
            let mut pending = {
                let mut set = self.set.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *set)
            };
            if pending.is_empty() {
                return;
            }
            while pending.join_next().await.is_some() {}
        }
    }
}
