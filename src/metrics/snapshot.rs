//! Serializable metric snapshots.
//!
//! A [`MetricSnapshot`] is everything one collector contributes to the exposition
//! in one tick. Snapshots are plain data: they are cached to disk as JSON and
//! converted into Prometheus families only when rendered.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

/// Prometheus metric type of a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MetricKind {
    /// Value that can go up and down.
    Gauge,
    /// Monotonic total.
    Counter,
}

/// Sorted label set of a sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a label, replacing an earlier value for the same name.
    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.0.insert(name.into(), value.to_string());
        self
    }

    /// Value of a label.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Iterate over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of labels.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Label set.
    pub labels: Labels,
    /// Observed value.
    pub value: f64,
}

/// Samples sharing a name, help text and type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricFamily {
    /// Metric name.
    pub name: String,
    /// Help text.
    pub help: String,
    /// Metric type.
    pub kind: MetricKind,
    /// Observations.
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    /// Record an observation.
    pub fn add(&mut self, labels: Labels, value: f64) -> &mut Self {
        self.samples.push(Sample { labels, value });
        self
    }

    /// Record a `1` observation, the usual value of `*_info` metrics.
    pub fn info(&mut self, labels: Labels) -> &mut Self {
        self.add(labels, 1.0)
    }

    /// Record a timestamp as seconds since the epoch. `None` records nothing.
    pub fn timestamp(
        &mut self,
        labels: Labels,
        at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> &mut Self {
        if let Some(at) = at {
            self.add(labels, at.timestamp_millis() as f64 / 1000.0);
        }
        self
    }
}

/// The complete set of observations produced by one collector in one tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    families: BTreeMap<String, MetricFamily>,
}

impl MetricSnapshot {
    /// Empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a gauge family.
    pub fn gauge(&mut self, name: &str, help: &str) -> &mut MetricFamily {
        self.family(name, help, MetricKind::Gauge)
    }

    /// Get or create a counter family.
    pub fn counter(&mut self, name: &str, help: &str) -> &mut MetricFamily {
        self.family(name, help, MetricKind::Counter)
    }

    /// Get or create a family. An existing family keeps its help text and type.
    pub fn family(&mut self, name: &str, help: &str, kind: MetricKind) -> &mut MetricFamily {
        self.families
            .entry(name.to_string())
            .or_insert_with(|| MetricFamily {
                name: name.to_string(),
                help: help.to_string(),
                kind,
                samples: Vec::new(),
            })
    }

    /// Append every sample of `other`.
    pub fn merge(&mut self, other: MetricSnapshot) {
        for (name, family) in other.families {
            match self.families.get_mut(&name) {
                Some(existing) => existing.samples.extend(family.samples),
                None => {
                    self.families.insert(name, family);
                }
            }
        }
    }

    /// Family by name.
    pub fn get(&self, name: &str) -> Option<&MetricFamily> {
        self.families.get(name)
    }

    /// Families in name order.
    pub fn families(&self) -> impl Iterator<Item = &MetricFamily> {
        self.families.values()
    }

    /// Total number of samples.
    pub fn len(&self) -> usize {
        self.families.values().map(|f| f.samples.len()).sum()
    }

    /// Whether the snapshot holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_sorted_and_replaced() {
        let labels = Labels::new()
            .with("projectName", "Website")
            .with("projectID", 42)
            .with("projectName", "Portal");

        let pairs: Vec<_> = labels.iter().collect();
        assert_eq!(pairs, vec![("projectID", "42"), ("projectName", "Portal")]);
        assert_eq!(labels.get("projectID"), Some("42"));
    }

    #[test]
    fn test_family_reuse_keeps_first_definition() {
        let mut snapshot = MetricSnapshot::new();
        snapshot
            .gauge("azure_devops_project_info", "Project info")
            .info(Labels::new().with("projectID", "a"));
        snapshot
            .gauge("azure_devops_project_info", "ignored")
            .info(Labels::new().with("projectID", "b"));

        let family = snapshot.get("azure_devops_project_info").unwrap();
        assert_eq!(family.help, "Project info");
        assert_eq!(family.samples.len(), 2);
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn test_timestamp_skips_missing_values() {
        let mut snapshot = MetricSnapshot::new();
        let at = chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:01.500Z")
            .unwrap()
            .with_timezone(&chrono::Utc);

        snapshot
            .gauge("azure_devops_build_status", "Build timestamps")
            .timestamp(Labels::new().with("type", "started"), Some(at))
            .timestamp(Labels::new().with("type", "finished"), None);

        let family = snapshot.get("azure_devops_build_status").unwrap();
        assert_eq!(family.samples.len(), 1);
        assert_eq!(family.samples[0].value, 1_704_067_201.5);
    }

    #[test]
    fn test_merge_appends_samples() {
        let mut a = MetricSnapshot::new();
        a.gauge("m", "help").add(Labels::new().with("k", "1"), 1.0);

        let mut b = MetricSnapshot::new();
        b.gauge("m", "help").add(Labels::new().with("k", "2"), 2.0);
        b.counter("c", "help").add(Labels::new(), 3.0);

        a.merge(b);
        assert_eq!(a.get("m").unwrap().samples.len(), 2);
        assert_eq!(a.get("c").unwrap().kind, MetricKind::Counter);
        assert!(!a.is_empty());
    }

    #[test]
    fn test_snapshot_json_is_exact() {
        let mut snapshot = MetricSnapshot::new();
        snapshot
            .gauge("azure_devops_build_status", "Build timestamps")
            .add(Labels::new().with("type", "jobDuration"), 0.1 + 0.2);

        let json = serde_json::to_string(&snapshot).unwrap();
        let back: MetricSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snapshot);
    }
}
