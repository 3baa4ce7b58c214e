//! One collector's tick: collect, publish, persist.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use strum::AsRefStr;

use crate::cache::{CacheEntry, CacheStore, ConfigFingerprint};
use crate::client::DevOpsClient;
use crate::collector::Collector;
use crate::metrics::{MetricRegistry, MetricSnapshot};

use super::CollectorSpec;

/// How a tick ended. The string form is the `result` label of the tick counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
pub enum TickOutcome {
    /// A complete snapshot was published.
    #[strum(serialize = "success")]
    Succeeded,
    /// A snapshot was published, but some sub-fetches failed.
    #[strum(serialize = "partial")]
    Partial,
    /// Nothing was published; the previous snapshot stays.
    #[strum(serialize = "failed")]
    Failed,
    /// The previous tick was still running.
    #[strum(serialize = "skipped")]
    Skipped,
}

/// Clears the in-flight flag when the tick ends, however it ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub(crate) struct CollectorTask {
    spec: CollectorSpec,
    collector: Arc<dyn Collector>,
    client: DevOpsClient,
    registry: Arc<MetricRegistry>,
    cache: Arc<dyn CacheStore>,
    fingerprint: ConfigFingerprint,
    running: AtomicBool,
}

impl CollectorTask {
    pub fn new(
        spec: CollectorSpec,
        collector: Arc<dyn Collector>,
        client: DevOpsClient,
        registry: Arc<MetricRegistry>,
        cache: Arc<dyn CacheStore>,
        fingerprint: ConfigFingerprint,
    ) -> Self {
        Self {
            spec,
            collector,
            client,
            registry,
            cache,
            fingerprint,
            running: AtomicBool::new(false),
        }
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    /// Install the cached snapshot if it was produced by the same configuration.
    /// Returns whether anything was installed.
    pub async fn prewarm(&self) -> bool {
        let name = self.name();
        match self.cache.load(&self.spec.cache_key).await {
            Ok(Some(entry)) if entry.fingerprint == self.fingerprint.as_str() => {
                let samples = entry.snapshot.len();
                self.registry.replace(name, Arc::new(entry.snapshot));
                self.registry
                    .runtime()
                    .observe_publish(name, entry.collected_at, samples);
                tracing::info!(
                    collector = %name,
                    collected_at = %entry.collected_at,
                    samples,
                    "Restored snapshot from cache"
                );
                true
            }
            Ok(Some(entry)) => {
                tracing::info!(
                    collector = %name,
                    cached = %entry.fingerprint,
                    current = %self.fingerprint,
                    "Cached snapshot belongs to another configuration, ignoring"
                );
                false
            }
            Ok(None) => {
                tracing::debug!(collector = %name, "No cached snapshot");
                false
            }
            Err(e) => {
                self.registry.runtime().observe_cache_error(name, "load");
                tracing::warn!(collector = %name, error = %e, "Failed to read cached snapshot");
                false
            }
        }
    }

    /// Run one collection unless the previous one is still in flight.
    pub async fn tick(&self) -> TickOutcome {
        let name = self.name();
        let runtime = self.registry.runtime();

        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(collector = %name, "Previous tick still running, skipping");
            runtime.observe_tick(name, TickOutcome::Skipped.as_ref());
            return TickOutcome::Skipped;
        }
        let _in_flight = InFlight(&self.running);

        let collected_at = Utc::now();
        let start = Instant::now();
        tracing::debug!(collector = %name, "Running collection");

        let result = self.collector.collect(&self.client).await;
        let elapsed = start.elapsed();
        runtime.observe_duration(name, elapsed.as_secs_f64());

        let outcome = match result {
            Ok(collection) => {
                let partial = collection.partial_error(name);
                let snapshot = Arc::new(collection.snapshot);
                let samples = snapshot.len();

                self.registry.replace(name, Arc::clone(&snapshot));
                runtime.observe_publish(name, collected_at, samples);
                self.persist(collected_at, &snapshot).await;

                match partial {
                    Some(err) => {
                        tracing::warn!(
                            collector = %name,
                            duration_ms = elapsed.as_millis() as u64,
                            samples,
                            error = %err,
                            "Collection partially failed"
                        );
                        TickOutcome::Partial
                    }
                    None => {
                        tracing::info!(
                            collector = %name,
                            duration_ms = elapsed.as_millis() as u64,
                            samples,
                            "Collection succeeded"
                        );
                        TickOutcome::Succeeded
                    }
                }
            }
            Err(e) => {
                tracing::error!(
                    collector = %name,
                    duration_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Collection failed, keeping previous snapshot"
                );
                TickOutcome::Failed
            }
        };

        runtime.observe_tick(name, outcome.as_ref());
        outcome
    }

    async fn persist(&self, collected_at: DateTime<Utc>, snapshot: &MetricSnapshot) {
        let entry = CacheEntry {
            fingerprint: self.fingerprint.as_str().to_string(),
            collected_at,
            snapshot: snapshot.clone(),
        };
        if let Err(e) = self.cache.store(&self.spec.cache_key, &entry).await {
            self.registry.runtime().observe_cache_error(self.name(), "store");
            tracing::warn!(collector = %self.name(), error = %e, "Failed to persist snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::collector::{Collection, CollectorError};
    use crate::runtime::testing::{MemoryCache, ScriptedCollector, client, snapshot};

    const KEY: &str = "test.json";

    async fn task(
        collector: Arc<ScriptedCollector>,
        cache: Arc<MemoryCache>,
    ) -> (CollectorTask, Arc<MetricRegistry>) {
        let registry = Arc::new(MetricRegistry::new().unwrap());
        let task = CollectorTask::new(
            CollectorSpec::new("Test", Duration::from_secs(60), KEY),
            collector,
            client().await,
            Arc::clone(&registry),
            cache,
            ConfigFingerprint::from_hex("f1"),
        );
        (task, registry)
    }

    fn nothing() -> CollectorError {
        CollectorError::NothingCollected {
            failures: vec!["project Website: 503".to_string()],
        }
    }

    #[tokio::test]
    async fn test_success_publishes_and_persists() {
        let cache = Arc::new(MemoryCache::default());
        let collector =
            Arc::new(ScriptedCollector::new("Test").then(Ok(Collection::complete(snapshot(1.0)))));
        let (task, registry) = task(collector, Arc::clone(&cache)).await;

        let before = Utc::now();
        assert_eq!(task.tick().await, TickOutcome::Succeeded);

        assert_eq!(*registry.snapshot("Test").unwrap(), snapshot(1.0));
        let entry = cache.entry(KEY).unwrap();
        assert_eq!(entry.fingerprint, "f1");
        assert_eq!(entry.snapshot, snapshot(1.0));
        assert!(entry.collected_at >= before);
        assert_eq!(registry.runtime().ticks("Test", "success"), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_snapshot() {
        let cache = Arc::new(MemoryCache::default());
        let collector = Arc::new(
            ScriptedCollector::new("Test")
                .then(Ok(Collection::complete(snapshot(1.0))))
                .then(Err(nothing())),
        );
        let (task, registry) = task(collector, Arc::clone(&cache)).await;

        assert_eq!(task.tick().await, TickOutcome::Succeeded);
        assert_eq!(task.tick().await, TickOutcome::Failed);

        assert_eq!(*registry.snapshot("Test").unwrap(), snapshot(1.0));
        assert_eq!(cache.stores.load(Ordering::SeqCst), 1);
        assert_eq!(registry.runtime().ticks("Test", "failed"), 1);
    }

    #[tokio::test]
    async fn test_partial_collection_is_published() {
        let mut collection = Collection::complete(snapshot(2.0));
        collection.fail("project Backend", "503 Service Unavailable");
        let collector = Arc::new(ScriptedCollector::new("Test").then(Ok(collection)));
        let (task, registry) = task(collector, Arc::new(MemoryCache::default())).await;

        assert_eq!(task.tick().await, TickOutcome::Partial);
        assert_eq!(*registry.snapshot("Test").unwrap(), snapshot(2.0));
        assert_eq!(registry.runtime().ticks("Test", "partial"), 1);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let collector = Arc::new(
            ScriptedCollector::new("Test")
                .delay(Duration::from_millis(200))
                .then(Ok(Collection::complete(snapshot(1.0)))),
        );
        let (task, registry) = task(Arc::clone(&collector), Arc::new(MemoryCache::default())).await;

        let (first, second) = tokio::join!(task.tick(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            task.tick().await
        });

        assert_eq!(first, TickOutcome::Succeeded);
        assert_eq!(second, TickOutcome::Skipped);
        assert_eq!(collector.calls(), 1);
        assert_eq!(registry.runtime().ticks("Test", "skipped"), 1);

        // The flag is cleared once the running tick ends.
        assert_eq!(task.tick().await, TickOutcome::Succeeded);
        assert_eq!(collector.calls(), 2);
    }

    #[tokio::test]
    async fn test_cache_write_failure_still_publishes() {
        let collector =
            Arc::new(ScriptedCollector::new("Test").then(Ok(Collection::complete(snapshot(4.0)))));
        let (task, registry) = task(collector, Arc::new(MemoryCache::failing())).await;

        assert_eq!(task.tick().await, TickOutcome::Succeeded);
        assert_eq!(*registry.snapshot("Test").unwrap(), snapshot(4.0));
        assert!(registry.render().contains(
            "azure_devops_exporter_cache_errors_total{collector=\"Test\",operation=\"store\"} 1"
        ));
    }

    #[tokio::test]
    async fn test_prewarm_ignores_other_fingerprint() {
        let cache = Arc::new(MemoryCache::default());
        cache.insert(
            KEY,
            CacheEntry {
                fingerprint: "f0".to_string(),
                collected_at: Utc::now(),
                snapshot: snapshot(9.0),
            },
        );
        let (task, registry) = task(Arc::new(ScriptedCollector::new("Test")), cache).await;

        assert!(!task.prewarm().await);
        assert!(registry.snapshot("Test").is_none());
    }
}
