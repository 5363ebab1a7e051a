//! `ActivityPub` federation kernel for apkernel.
//!
//! This crate turns inbound activities into domain effects and domain
//! events into outbound deliveries:
//!
//! - **Resolution**: [`resolver::Resolver`] fetches and validates remote objects
//! - **Locking**: [`lock::LockManager`] serializes work per object and per host
//! - **Kernel**: [`processor::ActivityKernel`] dispatches activities to their processors
//! - **Delivery**: [`delivery::DeliveryService`] renders, signs and queues outbound activities
//! - **Inbox**: [`handler::inbox_router`] accepts signed POSTs and queues them
//!
//! Persistence is reached through the capability traits in [`store`].

pub mod activities;
pub mod actors;
pub mod audience;
pub mod auth;
pub mod cache;
pub mod client;
pub mod context;
pub mod delivery;
pub mod error;
pub mod events;
pub mod handler;
pub mod instance;
pub mod jobs;
pub mod ld_signature;
pub mod lock;
pub mod objects;
pub mod processor;
pub mod resolver;
pub mod security;
pub mod signature;
pub mod store;
pub mod tasks;
#[doc(hidden)]
pub mod test_utils;

pub use activities::{Activity, ActivityKind};
pub use auth::{AuthUser, AuthUserResolver};
pub use context::{FederationContext, FederationDeps};
pub use delivery::{ApRenderer, DeliveryService};
pub use error::{DomainError, FederationError, FederationResult, StatusError};
pub use processor::{ActivityKernel, Outcome};
pub use resolver::Resolver;
