//! Process-wide metric registry.
//!
//! Holds the latest snapshot of every collector plus the exporter's own runtime
//! metrics. Replacing a collector's snapshot swaps one `Arc` under a short write
//! lock, so a concurrent scrape sees either the old or the new snapshot, never a
//! mix of both.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use prometheus::{
    Encoder, GaugeVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder, proto,
};
use thiserror::Error;

use super::snapshot::{MetricFamily, MetricKind, MetricSnapshot, Sample};

/// Prefix of the exporter's own metrics.
const RUNTIME_PREFIX: &str = "azure_devops_exporter";

/// Registry errors.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// Metric definition or registration failed.
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Metrics about the collection runtime itself.
#[derive(Clone)]
pub struct RuntimeMetrics {
    ticks: IntCounterVec,
    duration: GaugeVec,
    last_success: GaugeVec,
    samples: IntGaugeVec,
    cache_errors: IntCounterVec,
}

impl RuntimeMetrics {
    fn register(registry: &Registry) -> Result<Self, MetricsError> {
        let ticks = IntCounterVec::new(
            Opts::new("collector_ticks_total", "Collector ticks by outcome.")
                .namespace(RUNTIME_PREFIX),
            &["collector", "result"],
        )?;
        let duration = GaugeVec::new(
            Opts::new(
                "collector_duration_seconds",
                "Duration of the last finished collector tick.",
            )
            .namespace(RUNTIME_PREFIX),
            &["collector"],
        )?;
        let last_success = GaugeVec::new(
            Opts::new(
                "collector_last_success_timestamp_seconds",
                "Unix time of the last snapshot published by a collector.",
            )
            .namespace(RUNTIME_PREFIX),
            &["collector"],
        )?;
        let samples = IntGaugeVec::new(
            Opts::new(
                "collector_samples",
                "Samples in the snapshot currently published by a collector.",
            )
            .namespace(RUNTIME_PREFIX),
            &["collector"],
        )?;
        let cache_errors = IntCounterVec::new(
            Opts::new("cache_errors_total", "Failed cache reads and writes.")
                .namespace(RUNTIME_PREFIX),
            &["collector", "operation"],
        )?;

        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(last_success.clone()))?;
        registry.register(Box::new(samples.clone()))?;
        registry.register(Box::new(cache_errors.clone()))?;

        Ok(Self {
            ticks,
            duration,
            last_success,
            samples,
            cache_errors,
        })
    }

    /// Count a finished or skipped tick.
    pub fn observe_tick(&self, collector: &str, result: &str) {
        self.ticks.with_label_values(&[collector, result]).inc();
    }

    /// Record how long a tick took.
    pub fn observe_duration(&self, collector: &str, seconds: f64) {
        self.duration.with_label_values(&[collector]).set(seconds);
    }

    /// Record a published snapshot.
    pub fn observe_publish(&self, collector: &str, at: chrono::DateTime<chrono::Utc>, len: usize) {
        self.last_success
            .with_label_values(&[collector])
            .set(at.timestamp_millis() as f64 / 1000.0);
        self.samples
            .with_label_values(&[collector])
            .set(i64::try_from(len).unwrap_or(i64::MAX));
    }

    /// Count a cache failure. `operation` is `load` or `store`.
    pub fn observe_cache_error(&self, collector: &str, operation: &str) {
        self.cache_errors
            .with_label_values(&[collector, operation])
            .inc();
    }

    /// Ticks counted so far for a collector and result.
    pub fn ticks(&self, collector: &str, result: &str) -> u64 {
        self.ticks.with_label_values(&[collector, result]).get()
    }
}

/// Latest snapshot per collector plus runtime metrics.
pub struct MetricRegistry {
    snapshots: RwLock<BTreeMap<String, Arc<MetricSnapshot>>>,
    registry: Registry,
    runtime: RuntimeMetrics,
}

impl std::fmt::Debug for MetricRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("collectors", &self.snapshots.read().keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MetricRegistry {
    /// Create an empty registry.
    ///
    /// # Errors
    /// Returns `MetricsError` if the runtime metrics cannot be registered.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let runtime = RuntimeMetrics::register(&registry)?;
        Ok(Self {
            snapshots: RwLock::new(BTreeMap::new()),
            registry,
            runtime,
        })
    }

    /// Runtime metrics handle.
    pub fn runtime(&self) -> &RuntimeMetrics {
        &self.runtime
    }

    /// Atomically replace the contribution of `collector`.
    pub fn replace(&self, collector: &str, snapshot: Arc<MetricSnapshot>) {
        self.snapshots
            .write()
            .insert(collector.to_string(), snapshot);
    }

    /// Current contribution of `collector`.
    pub fn snapshot(&self, collector: &str) -> Option<Arc<MetricSnapshot>> {
        self.snapshots.read().get(collector).cloned()
    }

    /// Names of collectors with a published snapshot.
    pub fn collectors(&self) -> Vec<String> {
        self.snapshots.read().keys().cloned().collect()
    }

    /// Render everything in the Prometheus text exposition format.
    ///
    /// Never fails: a family the encoder rejects is logged and left out.
    pub fn render(&self) -> String {
        let held: Vec<Arc<MetricSnapshot>> = self.snapshots.read().values().cloned().collect();

        let mut families = self.registry.gather();
        families.extend(merge_families(&held));
        families.sort_by(|a, b| a.get_name().cmp(b.get_name()));

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        for family in &families {
            let mut chunk = Vec::new();
            match encoder.encode(std::slice::from_ref(family), &mut chunk) {
                Ok(()) => buffer.extend(chunk),
                Err(e) => {
                    tracing::warn!(metric = family.get_name(), error = %e, "Skipping unencodable metric family");
                }
            }
        }

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Group samples of all snapshots by family name and convert them.
fn merge_families(snapshots: &[Arc<MetricSnapshot>]) -> Vec<proto::MetricFamily> {
    let mut grouped: BTreeMap<&str, (&MetricFamily, Vec<&Sample>)> = BTreeMap::new();

    for snapshot in snapshots {
        for family in snapshot.families() {
            match grouped.get_mut(family.name.as_str()) {
                Some((first, samples)) => {
                    if first.kind != family.kind {
                        tracing::warn!(
                            metric = %family.name,
                            expected = %first.kind,
                            found = %family.kind,
                            "Metric type conflict between collectors, dropping samples"
                        );
                        continue;
                    }
                    samples.extend(&family.samples);
                }
                None => {
                    grouped.insert(&family.name, (family, family.samples.iter().collect()));
                }
            }
        }
    }

    grouped
        .into_values()
        .filter(|(_, samples)| !samples.is_empty())
        .map(|(family, samples)| to_proto(family, &samples))
        .collect()
}

fn to_proto(family: &MetricFamily, samples: &[&Sample]) -> proto::MetricFamily {
    let metrics: Vec<proto::Metric> = samples
        .iter()
        .map(|sample| {
            let labels: Vec<proto::LabelPair> = sample
                .labels
                .iter()
                .map(|(name, value)| {
                    let mut pair = proto::LabelPair::default();
                    pair.set_name(name.to_string());
                    pair.set_value(value.to_string());
                    pair
                })
                .collect();

            let mut metric = proto::Metric::default();
            metric.set_label(labels.into());
            match family.kind {
                MetricKind::Gauge => {
                    let mut gauge = proto::Gauge::default();
                    gauge.set_value(sample.value);
                    metric.set_gauge(gauge);
                }
                MetricKind::Counter => {
                    let mut counter = proto::Counter::default();
                    counter.set_value(sample.value);
                    metric.set_counter(counter);
                }
            }
            metric
        })
        .collect();

    let mut out = proto::MetricFamily::default();
    out.set_name(family.name.clone());
    out.set_help(family.help.clone());
    out.set_field_type(match family.kind {
        MetricKind::Gauge => proto::MetricType::GAUGE,
        MetricKind::Counter => proto::MetricType::COUNTER,
    });
    out.set_metric(metrics.into());
    out
}
