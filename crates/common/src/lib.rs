//! Common utilities and shared types for apkernel.
//!
//! - **Configuration**: settings via [`Config`]
//! - **Error handling**: [`AppError`] and [`AppResult`]
//! - **Cryptography**: RSA keypairs for `ActivityPub` signatures
//! - **ID Generation**: ULID ids and activity ids via [`IdGenerator`]
//! - **Logging**: `tracing` subscriber setup via [`init_tracing`]
//!
//! # Example
//!
//! ```no_run
//! use apkernel_common::{AppResult, Config, IdGenerator};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id = IdGenerator::new().generate();
//!     println!("{} {id}", config.server.url);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod id;
pub mod logging;

pub use config::{Config, FederationConfig, LogFormat, LoggingConfig, ProcessRole};
pub use crypto::{RsaKeypair, generate_rsa_keypair, load_or_generate_rsa_keypair};
pub use error::{AppError, AppResult};
pub use id::IdGenerator;
pub use logging::init_tracing;
