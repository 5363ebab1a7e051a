//! Outbound delivery: render, sign and enqueue activities.
//!
//! [`DeliveryService`] turns an activity of a local user into one
//! [`DeliveryJob`](crate::jobs::DeliveryJob) per inbox. [`DeliverManager`]
//! computes the inbox set for follower fanout. The HTTP request itself is
//! made later by the delivery job processor.

#![allow(missing_docs)]

mod manager;
mod render;
mod service;
mod stats;

pub use manager::{DeliverManager, Recipe};
pub use render::{ApRenderer, context};
pub use service::DeliveryService;
pub use stats::{DeliveryStats, DeliveryStatsSnapshot};
