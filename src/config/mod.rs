//! Configuration module for the exporter.
//!
//! Provides YAML-based configuration loading and validation for:
//! - Server settings (port, bind address)
//! - Azure DevOps organization, credentials and filters
//! - Request budget, retry policy and result-count limits
//! - Per-collector scrape intervals and the snapshot cache location

mod app;
mod validation;

pub use app::{
    AppConfig, BackoffConfig, CacheConfig, DevOpsConfig, LimitsConfig, RequestConfig,
    ScrapeConfig, ServerConfig, StatsConfig,
};
pub use validation::{ConfigError, QueryRef, expand_env_vars, parse_duration, parse_queries};

// Re-export constants
pub use app::{
    DEFAULT_API_VERSION, DEFAULT_CONCURRENCY_LIMIT, DEFAULT_INTERVAL, DEFAULT_RETRIES,
    DEPRECATED_AGENTPOOL_ENV,
};
