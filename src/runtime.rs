//! Collector runtime: one repeating job per collector on a shared scheduler.
//!
//! Registering a collector pre-warms the registry from its cache entry when the
//! configuration fingerprint still matches. Starting the runtime launches a
//! first tick for every registered collector, then the scheduler takes over.

mod task;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::cache::{CacheStore, ConfigFingerprint};
use crate::client::DevOpsClient;
use crate::collector::Collector;
use crate::metrics::MetricRegistry;

pub use task::TickOutcome;
pub(crate) use task::CollectorTask;

/// Shortest accepted tick interval; shorter ones are raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_secs(1);
/// Default timeout for graceful shutdown (5 seconds).
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime errors.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The job scheduler failed.
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// A collector with this name is already registered.
    #[error("collector '{0}' is already registered")]
    DuplicateCollector(String),

    /// Another collector already persists under this cache key.
    #[error("cache key '{key}' of collector '{collector}' is already in use")]
    DuplicateCacheKey {
        /// Collector being registered.
        collector: String,
        /// Conflicting key.
        key: String,
    },
}

/// Name, schedule and cache key of a collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorSpec {
    /// Unique collector name.
    pub name: String,
    /// Tick interval; zero disables the collector.
    pub interval: Duration,
    /// Cache entry identifier.
    pub cache_key: String,
}

impl CollectorSpec {
    /// Create a spec.
    pub fn new(name: impl Into<String>, interval: Duration, cache_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            interval,
            cache_key: cache_key.into(),
        }
    }

    /// Whether the collector is switched off.
    pub fn is_disabled(&self) -> bool {
        self.interval.is_zero()
    }
}

/// Metadata about a registered job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    /// Job UUID.
    pub id: Uuid,
    /// Collector name.
    pub name: String,
    /// Effective tick interval.
    pub interval: Duration,
    /// Cache entry identifier.
    pub cache_key: String,
    /// Whether a cached snapshot was installed at registration.
    pub prewarmed: bool,
}

/// Schedules every registered collector.
pub struct Runtime {
    scheduler: JobScheduler,
    client: DevOpsClient,
    registry: Arc<MetricRegistry>,
    cache: Arc<dyn CacheStore>,
    fingerprint: ConfigFingerprint,
    jobs: Arc<RwLock<HashMap<Uuid, JobInfo>>>,
    tasks: Mutex<Vec<Arc<CollectorTask>>>,
    initial_ticks: Mutex<Vec<JoinHandle<TickOutcome>>>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field(
                "job_count",
                &self.jobs.try_read().map(|j| j.len()).unwrap_or(0),
            )
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    /// Create a runtime with nothing registered.
    ///
    /// # Errors
    /// Returns `RuntimeError::Scheduler` if the scheduler cannot be created.
    pub async fn new(
        client: DevOpsClient,
        registry: Arc<MetricRegistry>,
        cache: Arc<dyn CacheStore>,
        fingerprint: ConfigFingerprint,
    ) -> Result<Self, RuntimeError> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| RuntimeError::Scheduler(e.to_string()))?;

        Ok(Self {
            scheduler,
            client,
            registry,
            cache,
            fingerprint,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(Vec::new()),
            initial_ticks: Mutex::new(Vec::new()),
        })
    }

    /// Register a collector.
    ///
    /// A disabled collector (zero interval) is logged and skipped without
    /// touching the cache; `Ok(None)` is returned. Otherwise the registry is
    /// pre-warmed from the cache and a repeating job is added.
    ///
    /// # Errors
    /// Returns `RuntimeError` on a duplicate name or cache key, or if the job
    /// cannot be scheduled.
    pub async fn register(
        &self,
        spec: CollectorSpec,
        collector: Arc<dyn Collector>,
    ) -> Result<Option<Uuid>, RuntimeError> {
        if spec.is_disabled() {
            tracing::info!(collector = %spec.name, "Collector disabled");
            return Ok(None);
        }

        {
            let jobs = self.jobs.read().await;
            if jobs.values().any(|j| j.name == spec.name) {
                return Err(RuntimeError::DuplicateCollector(spec.name));
            }
            if jobs.values().any(|j| j.cache_key == spec.cache_key) {
                return Err(RuntimeError::DuplicateCacheKey {
                    collector: spec.name,
                    key: spec.cache_key,
                });
            }
        }

        let mut spec = spec;
        if spec.interval < MIN_INTERVAL {
            tracing::warn!(
                collector = %spec.name,
                interval = ?spec.interval,
                minimum = ?MIN_INTERVAL,
                "Collector interval too short, using minimum"
            );
            spec.interval = MIN_INTERVAL;
        }

        let task = Arc::new(CollectorTask::new(
            spec.clone(),
            collector,
            self.client.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.cache),
            self.fingerprint.clone(),
        ));
        let prewarmed = task.prewarm().await;

        let job = create_job(Arc::clone(&task), spec.interval)?;
        let job_id = self
            .scheduler
            .add(job)
            .await
            .map_err(|e| RuntimeError::Scheduler(e.to_string()))?;

        self.jobs.write().await.insert(
            job_id,
            JobInfo {
                id: job_id,
                name: spec.name.clone(),
                interval: spec.interval,
                cache_key: spec.cache_key.clone(),
                prewarmed,
            },
        );
        self.tasks.lock().push(task);

        tracing::info!(
            collector = %spec.name,
            job_id = %job_id,
            interval = ?spec.interval,
            cache_key = %spec.cache_key,
            prewarmed,
            "Collector registered"
        );
        Ok(Some(job_id))
    }

    /// Start the scheduler and launch a first tick for every collector.
    ///
    /// # Errors
    /// Returns `RuntimeError::Scheduler` if the scheduler fails to start.
    pub async fn start(&self) -> Result<(), RuntimeError> {
        self.scheduler
            .start()
            .await
            .map_err(|e| RuntimeError::Scheduler(e.to_string()))?;

        let tasks: Vec<Arc<CollectorTask>> = self.tasks.lock().clone();
        let handles = tasks
            .into_iter()
            .map(|task| tokio::spawn(async move { task.tick().await }));
        self.initial_ticks.lock().extend(handles);

        tracing::info!(collectors = self.tasks.lock().len(), "Collector scheduler started");
        Ok(())
    }

    /// List all registered jobs.
    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Get the number of registered jobs.
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Gracefully shutdown the scheduler with default timeout.
    pub async fn shutdown(self) -> Result<(), RuntimeError> {
        self.shutdown_with_timeout(DEFAULT_SHUTDOWN_TIMEOUT).await
    }

    /// Shutdown with custom timeout. Initial ticks still running are aborted.
    pub async fn shutdown_with_timeout(mut self, timeout: Duration) -> Result<(), RuntimeError> {
        for handle in self.initial_ticks.lock().drain(..) {
            handle.abort();
        }

        let job_count = self.jobs.read().await.len();
        let result = tokio::time::timeout(timeout, async {
            self.scheduler
                .shutdown()
                .await
                .map_err(|e| RuntimeError::Scheduler(e.to_string()))
        })
        .await;

        match result {
            Ok(Ok(())) => {
                tracing::info!(job_count, "Collector scheduler shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(job_count, error = %e, "Collector scheduler shutdown failed");
                Err(e)
            }
            Err(_) => {
                tracing::warn!(job_count, "Collector scheduler shutdown timed out");
                Ok(())
            }
        }
    }
}

fn create_job(task: Arc<CollectorTask>, interval: Duration) -> Result<Job, RuntimeError> {
    Job::new_repeated_async(interval, move |_: Uuid, _: JobScheduler| {
        let task = Arc::clone(&task);
        Box::pin(async move {
            task.tick().await;
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
    })
    .map_err(|e| RuntimeError::Scheduler(e.to_string()))
}
