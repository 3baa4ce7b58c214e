//! Collectors: named units of work turning remote API data into metric snapshots.
//!
//! Every collector implements [`Collector`]. A collector issues as many calls as
//! it needs through the shared [`DevOpsClient`], which owns concurrency and
//! retries. Each tick is a full recomputation; collectors keep no state between
//! ticks.
//!
//! When some sub-fetches fail, a collector still returns the data it did get and
//! lists the failures in its [`Collection`]. Only when nothing could be fetched
//! does it return an error, so the runtime keeps the previous snapshot.

mod agent_pool;
mod build;
mod deployment;
mod discovery;
mod latest_build;
mod project;
mod pull_request;
mod query;
mod release;
mod repository;
mod resource_usage;
mod stats;

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use thiserror::Error;

use crate::client::{ApiError, DevOpsClient};
use crate::config::{AppConfig, ConfigError};
use crate::metrics::MetricSnapshot;
use crate::runtime::CollectorSpec;

pub use agent_pool::AgentPoolCollector;
pub use build::BuildCollector;
pub use deployment::DeploymentCollector;
pub use discovery::{Project, ProjectFilter, discover_projects};
pub use latest_build::LatestBuildCollector;
pub use project::ProjectCollector;
pub use pull_request::PullRequestCollector;
pub use query::QueryCollector;
pub use release::ReleaseCollector;
pub use repository::RepositoryCollector;
pub use resource_usage::ResourceUsageCollector;
pub use stats::StatsCollector;

/// Errors that fail a whole tick.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// A call every other fetch depends on failed.
    #[error("api error: {0}")]
    Api(#[from] ApiError),

    /// Every sub-fetch failed.
    #[error("all {} sub-fetch(es) failed: {}", failures.len(), failures.join("; "))]
    NothingCollected {
        /// One entry per failed sub-fetch.
        failures: Vec<String>,
    },
}

/// Some sub-fetches failed, but the snapshot was still published.
#[derive(Debug, Clone, Error)]
#[error("collector {collector}: {} sub-fetch(es) failed: {}", failures.len(), failures.join("; "))]
pub struct PartialCollectionError {
    /// Collector name.
    pub collector: String,
    /// One entry per failed sub-fetch.
    pub failures: Vec<String>,
}

/// Result of one successful tick.
#[derive(Debug, Default)]
pub struct Collection {
    /// Observations to publish.
    pub snapshot: MetricSnapshot,
    failures: Vec<String>,
}

impl Collection {
    /// Empty collection.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap a complete snapshot.
    pub fn complete(snapshot: MetricSnapshot) -> Self {
        Self {
            snapshot,
            failures: Vec::new(),
        }
    }

    /// Record a failed sub-fetch.
    pub fn fail(&mut self, scope: impl Display, error: impl Display) {
        self.failures.push(format!("{scope}: {error}"));
    }

    /// Failed sub-fetches.
    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    /// Whether any sub-fetch failed.
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// Summary of failed sub-fetches, if there were any.
    pub fn partial_error(&self, collector: &str) -> Option<PartialCollectionError> {
        self.is_partial().then(|| PartialCollectionError {
            collector: collector.to_string(),
            failures: self.failures.clone(),
        })
    }

    /// Turn a collection where all `attempted` sub-fetches failed into an error.
    pub fn finish(self, attempted: usize) -> Result<Self, CollectorError> {
        if attempted > 0 && self.failures.len() >= attempted {
            return Err(CollectorError::NothingCollected {
                failures: self.failures,
            });
        }
        Ok(self)
    }
}

/// A unit producing one family group of metric observations.
#[async_trait::async_trait]
pub trait Collector: Send + Sync + 'static {
    /// Unique collector name, used in logs and as the registry key.
    fn name(&self) -> &str;

    /// Perform one full collection.
    ///
    /// # Errors
    /// Returns `CollectorError` only when no snapshot can be published at all.
    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError>;
}

/// Build every known collector together with its schedule and cache key.
///
/// Disabled collectors (zero interval) are included; the runtime skips them.
///
/// # Errors
/// Returns `ConfigError` if the work item queries are malformed.
pub fn catalog(config: &AppConfig) -> Result<Vec<(CollectorSpec, Arc<dyn Collector>)>, ConfigError> {
    let scrape = &config.scrape;
    let limits = &config.limits;
    let filter = ProjectFilter::from_config(config);

    Ok(vec![
        entry(
            Arc::new(ProjectCollector::new(filter.clone())),
            scrape.resolve(scrape.projects),
            "project.json",
        ),
        entry(
            Arc::new(AgentPoolCollector::new(config.devops.agent_pools.clone())),
            scrape.resolve(scrape.agent_pools),
            "agentpool.json",
        ),
        entry(
            Arc::new(LatestBuildCollector::new(filter.clone(), limits.clone())),
            scrape.resolve(scrape.build),
            "latestbuild.json",
        ),
        entry(
            Arc::new(RepositoryCollector::new(
                filter.clone(),
                scrape.resolve(scrape.repository),
            )),
            scrape.resolve(scrape.repository),
            "repository.json",
        ),
        entry(
            Arc::new(PullRequestCollector::new(filter.clone())),
            scrape.resolve(scrape.pull_request),
            "pullrequest.json",
        ),
        entry(
            Arc::new(BuildCollector::new(filter.clone(), limits.clone())),
            scrape.resolve(scrape.build),
            "build.json",
        ),
        entry(
            Arc::new(ReleaseCollector::new(filter.clone(), limits.clone())),
            scrape.resolve(scrape.release),
            "release.json",
        ),
        entry(
            Arc::new(DeploymentCollector::new(filter.clone(), limits.clone())),
            scrape.resolve(scrape.deployment),
            "deployment.json",
        ),
        entry(
            Arc::new(ResourceUsageCollector::new()),
            scrape.resolve(scrape.resource_usage),
            "resourceusage.json",
        ),
        entry(
            Arc::new(QueryCollector::new(config.devops.parsed_queries()?)),
            scrape.resolve(scrape.query),
            "query.json",
        ),
        entry(
            Arc::new(StatsCollector::new(
                filter,
                limits.clone(),
                config.stats.window(scrape),
            )),
            scrape.resolve(scrape.stats),
            "stats.json",
        ),
    ])
}

fn entry(
    collector: Arc<dyn Collector>,
    interval: Duration,
    cache_key: &str,
) -> (CollectorSpec, Arc<dyn Collector>) {
    (CollectorSpec::new(collector.name(), interval, cache_key), collector)
}

/// Run `fetch` for every item concurrently, keeping input order.
///
/// Concurrency is bounded by the client's request budget, not here.
pub(crate) async fn fan_out<'a, I, T, F, Fut>(
    items: &'a [I],
    fetch: F,
) -> Vec<(&'a I, Result<T, ApiError>)>
where
    F: Fn(&'a I) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let results = join_all(items.iter().map(&fetch)).await;
    items.iter().zip(results).collect()
}

/// Parse a remote timestamp. Missing, malformed and pre-epoch values map to `None`.
pub(crate) fn parse_time(value: Option<&str>) -> Option<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(value?).ok()?.with_timezone(&Utc);
    (parsed.timestamp() > 0).then_some(parsed)
}

/// Seconds between two timestamps, if both are known and ordered.
pub(crate) fn duration_secs(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<f64> {
    let millis = (end? - start?).num_milliseconds();
    (millis >= 0).then(|| millis as f64 / 1000.0)
}

/// `1.0` for true, `0.0` for false.
pub(crate) fn flag(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.devops.organisation = "contoso".to_string();
        config.devops.access_token = Some("pat".to_string());
        config
    }

    #[test]
    fn test_catalog_names_and_cache_keys_are_unique() {
        let entries = catalog(&config()).unwrap();
        assert_eq!(entries.len(), 11);

        let names: HashSet<_> = entries.iter().map(|(s, _)| s.name.clone()).collect();
        let keys: HashSet<_> = entries.iter().map(|(s, _)| s.cache_key.clone()).collect();
        assert_eq!(names.len(), 11);
        assert_eq!(keys.len(), 11);

        for (spec, collector) in &entries {
            assert_eq!(spec.name, collector.name());
        }
    }

    #[test]
    fn test_catalog_intervals() {
        let mut config = config();
        config.scrape.interval = Duration::from_secs(600);
        config.scrape.build = Some(Duration::from_secs(60));
        config.scrape.query = Some(Duration::ZERO);

        let entries = catalog(&config).unwrap();
        let interval = |name: &str| {
            entries
                .iter()
                .find(|(s, _)| s.name == name)
                .map(|(s, _)| s.interval)
                .unwrap()
        };

        assert_eq!(interval("Build"), Duration::from_secs(60));
        assert_eq!(interval("LatestBuild"), Duration::from_secs(60));
        assert_eq!(interval("Project"), Duration::from_secs(600));
        assert_eq!(interval("Query"), Duration::ZERO);
        assert_eq!(interval("Stats"), Duration::from_secs(600));
    }

    #[test]
    fn test_catalog_rejects_malformed_query() {
        let mut config = config();
        config.devops.queries = vec!["nope".to_string()];
        assert!(catalog(&config).is_err());
    }

    #[test]
    fn test_collection_finish() {
        let mut partial = Collection::new();
        partial.fail("project Website", "boom");
        let partial = partial.finish(2).unwrap();
        assert!(partial.is_partial());

        let err = partial.partial_error("Build").unwrap();
        assert_eq!(err.failures, vec!["project Website: boom".to_string()]);
        assert!(err.to_string().contains("Build"));

        let mut failed = Collection::new();
        failed.fail("a", "x");
        failed.fail("b", "y");
        assert!(matches!(
            failed.finish(2),
            Err(CollectorError::NothingCollected { failures }) if failures.len() == 2
        ));

        assert!(Collection::new().finish(0).unwrap().partial_error("x").is_none());
    }

    #[test]
    fn test_parse_time() {
        let parsed = parse_time(Some("2024-03-01T10:15:30.1234567Z")).unwrap();
        assert_eq!(parsed.timestamp(), 1_709_288_130);
        assert!(parse_time(Some("0001-01-01T00:00:00Z")).is_none());
        assert!(parse_time(Some("garbage")).is_none());
        assert!(parse_time(None).is_none());
    }

    #[test]
    fn test_duration_secs() {
        let start = parse_time(Some("2024-03-01T10:00:00Z"));
        let end = parse_time(Some("2024-03-01T10:01:30.500Z"));
        assert_eq!(duration_secs(start, end), Some(90.5));
        assert_eq!(duration_secs(end, start), None);
        assert_eq!(duration_secs(start, None), None);
    }

    #[tokio::test]
    async fn test_fan_out_keeps_order() {
        let items = vec![3u64, 1, 2];
        let results = fan_out(&items, |n| async move {
            tokio::time::sleep(Duration::from_millis(*n * 5)).await;
            Ok::<_, ApiError>(*n * 10)
        })
        .await;

        let values: Vec<_> = results
            .into_iter()
            .map(|(n, r)| (*n, r.unwrap()))
            .collect();
        assert_eq!(values, vec![(3, 30), (1, 10), (2, 20)]);
    }
}
