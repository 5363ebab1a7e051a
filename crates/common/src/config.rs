//! Application configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use validator::Validate;

use crate::AppResult;

/// Application configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Config {
    /// Server configuration.
    #[validate(nested)]
    pub server: ServerConfig,
    /// Redis configuration.
    pub redis: RedisConfig,
    /// Federation configuration.
    #[validate(nested)]
    pub federation: FederationConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which parts of the server a process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    /// HTTP listener only (inbox endpoints enqueue jobs).
    Web,
    /// Queue workers only.
    Worker,
    /// Both in one process.
    #[default]
    All,
}

impl ProcessRole {
    /// Whether this process serves HTTP.
    #[must_use]
    pub const fn serves_http(self) -> bool {
        matches!(self, Self::Web | Self::All)
    }

    /// Whether this process consumes queues.
    #[must_use]
    pub const fn runs_workers(self) -> bool {
        matches!(self, Self::Worker | Self::All)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to bind to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public URL of this instance.
    #[validate(url)]
    pub url: String,
    /// Process role.
    #[serde(default)]
    pub role: ProcessRole,
    /// PKCS#8 PEM file holding the instance actor's private key. Created on
    /// first start.
    #[serde(default = "default_instance_key_path")]
    pub instance_key_path: PathBuf,
}

/// Redis configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL.
    pub url: String,
    /// Key prefix for all Redis keys.
    #[serde(default = "default_redis_prefix")]
    pub prefix: String,
}

/// Federation configuration.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct FederationConfig {
    /// Whether federation is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Instance name.
    pub instance_name: String,
    /// Hosts we never talk to. Subdomains of an entry are blocked too.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,
    /// When `private_mode` is on, the only hosts we deliver to.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Restrict federation to `allowed_hosts`.
    #[serde(default)]
    pub private_mode: bool,
    /// Sign GET requests used to resolve remote objects.
    #[serde(default = "default_true")]
    pub sign_to_activitypub_get: bool,
    /// Lease time of `ap-object:` and `instance:` locks, in seconds.
    #[serde(default = "default_lock_timeout_secs")]
    #[validate(range(min = 1, max = 600))]
    pub lock_timeout_secs: u64,
    /// Attempt ceiling for delivery jobs.
    #[serde(default = "default_deliver_job_max_attempts")]
    #[validate(range(min = 1, max = 64))]
    pub deliver_job_max_attempts: u32,
    /// Attempt ceiling for inbox jobs.
    #[serde(default = "default_inbox_job_max_attempts")]
    #[validate(range(min = 1, max = 64))]
    pub inbox_job_max_attempts: u32,
    /// Concurrent in-flight deliveries per worker process.
    #[serde(default = "default_deliver_concurrency")]
    #[validate(range(min = 1))]
    pub deliver_concurrency: usize,
    /// Concurrent inbox jobs per worker process.
    #[serde(default = "default_inbox_concurrency")]
    #[validate(range(min = 1))]
    pub inbox_concurrency: usize,
    /// Per-request timeout for outgoing HTTP, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,
    /// Maximum number of activities performed from one inbound collection.
    #[serde(default = "default_max_collection_items")]
    pub max_collection_items: usize,
}

impl FederationConfig {
    /// Lock lease duration.
    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Outgoing request timeout.
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            instance_name: "apkernel".to_string(),
            blocked_hosts: Vec::new(),
            allowed_hosts: Vec::new(),
            private_mode: false,
            sign_to_activitypub_get: true,
            lock_timeout_secs: default_lock_timeout_secs(),
            deliver_job_max_attempts: default_deliver_job_max_attempts(),
            inbox_job_max_attempts: default_inbox_job_max_attempts(),
            deliver_concurrency: default_deliver_concurrency(),
            inbox_concurrency: default_inbox_concurrency(),
            request_timeout_secs: default_request_timeout_secs(),
            max_collection_items: default_max_collection_items(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Output format.
    #[serde(default)]
    pub format: LogFormat,
    /// Fallback filter when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: default_log_filter(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_port() -> u16 {
    3000
}

fn default_instance_key_path() -> PathBuf {
    PathBuf::from("data/instance-key.pem")
}

fn default_redis_prefix() -> String {
    "apkernel".to_string()
}

const fn default_true() -> bool {
    true
}

const fn default_lock_timeout_secs() -> u64 {
    30
}

const fn default_deliver_job_max_attempts() -> u32 {
    12
}

const fn default_inbox_job_max_attempts() -> u32 {
    8
}

const fn default_deliver_concurrency() -> usize {
    128
}

const fn default_inbox_concurrency() -> usize {
    16
}

const fn default_request_timeout_secs() -> u64 {
    30
}

const fn default_max_collection_items() -> usize {
    50
}

fn default_log_filter() -> String {
    "apkernel=debug,tower_http=debug".to_string()
}

impl Config {
    /// Load configuration from files and environment variables.
    ///
    /// Configuration is loaded in the following order:
    /// 1. `.env` (if present)
    /// 2. `config/default.toml`
    /// 3. `config/{environment}.toml` (based on `APKERNEL_ENV`)
    /// 4. Environment variables with `APKERNEL__` prefix
    pub fn load() -> AppResult<Self> {
        dotenvy::dotenv().ok();
        let env = std::env::var("APKERNEL_ENV").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{env}")).required(false))
            .add_source(
                config::Environment::with_prefix("APKERNEL")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("federation.blocked_hosts")
                    .with_list_parse_key("federation.allowed_hosts")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("APKERNEL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
