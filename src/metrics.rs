//! Metric snapshots and the shared registry they are published to.

mod registry;
mod snapshot;

pub use registry::{MetricRegistry, MetricsError, RuntimeMetrics};
pub use snapshot::{Labels, MetricFamily, MetricKind, MetricSnapshot, Sample};
