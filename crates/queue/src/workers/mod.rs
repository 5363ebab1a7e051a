//! Job workers.
//!
//! Each worker wraps a processor with a [`RetryDriver`](crate::retry::RetryDriver):
//! failures are pushed back to their queue with `apBackoff` delay instead of
//! being retried by apalis.

mod delete_account;
mod deliver;
mod inbox;

use std::sync::Arc;
use std::time::Duration;

use apalis::prelude::Error;

pub use delete_account::{DeleteAccountProcessor, DeleteAccountWorker, delete_account_worker};
pub use deliver::{DeliverError, DeliverOutcome, DeliverProcessor, DeliverWorker, deliver_worker};
pub use inbox::{InboxProcessor, InboxWorker, inbox_worker};

/// What became of a handled job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Done, successfully or terminally.
    Completed,
    /// Failed and queued again.
    Rescheduled(Duration),
    /// Failed with no attempts left.
    Dropped,
}

pub(crate) fn failed<E>(e: E) -> Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    let boxed: Box<dyn std::error::Error + Send + Sync> = Box::new(e);
    Error::Failed(Arc::new(boxed))
}
