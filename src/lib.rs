//! Azure DevOps Prometheus exporter.
//!
//! This crate collects organization, pipeline, repository and work item data
//! from Azure DevOps and exposes it in the Prometheus text format. It can be
//! used as a library, or run as the `devops-exporter` binary.
//!
//! # Architecture
//!
//! - **Client**: authenticated, budgeted and retrying access to the REST API
//! - **Collectors**: one per resource kind, each producing a metric snapshot
//! - **Runtime**: one repeating job per collector, pre-warmed from the cache
//! - **Cache**: one JSON file per collector, invalidated by a config fingerprint
//! - **Metrics**: the registry merging every snapshot at scrape time
//! - **Server**: `/metrics`, `/healthz` and `/readyz`
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use devops_exporter::{AppConfig, ConfigFingerprint, FileCacheStore, MetricRegistry, Runtime};
//!
//! let config = AppConfig::load("config.yaml")?;
//! let client = devops_exporter::client_from_config(&config).await?;
//! let registry = Arc::new(MetricRegistry::new()?);
//! let runtime = Runtime::new(
//!     client,
//!     Arc::clone(&registry),
//!     Arc::new(FileCacheStore::new(&config.cache.path)),
//!     ConfigFingerprint::from_config(&config),
//! )
//! .await?;
//! for (spec, collector) in devops_exporter::collector::catalog(&config)? {
//!     runtime.register(spec, collector).await?;
//! }
//! runtime.start().await?;
//! ```

pub mod cache;
pub mod client;
pub mod collector;
pub mod config;
pub mod metrics;
pub mod runtime;
pub mod server;

pub use cache::{CacheEntry, CacheError, CacheStore, ConfigFingerprint, FileCacheStore};
pub use client::{ApiError, ApiRequest, AuthError, Credentials, DevOpsClient, RetryPolicy};
pub use collector::{Collection, Collector, CollectorError, PartialCollectionError};
pub use config::{AppConfig, ConfigError};
pub use metrics::{Labels, MetricRegistry, MetricSnapshot};
pub use runtime::{CollectorSpec, Runtime, RuntimeError, TickOutcome};

/// Build the API client described by `config`.
///
/// # Errors
/// Returns `ConfigError` when no credentials are configured, or `ApiError`
/// wrapped in the boxed error if the initial token cannot be acquired.
pub async fn client_from_config(
    config: &AppConfig,
) -> Result<DevOpsClient, Box<dyn std::error::Error + Send + Sync>> {
    let credentials = config.devops.credentials()?;
    let mut builder = DevOpsClient::builder(&config.devops.organisation)
        .api_version(&config.devops.api_version)
        .concurrency_limit(config.request.concurrency_limit)
        .retry_policy(config.request.retry_policy())
        .timeout(config.request.timeout);
    if let Some(ref url) = config.devops.url {
        builder = builder.base_url(url);
    }
    Ok(builder.build(credentials).await?)
}
