//! Parallel pipeline job usage of the organization.

use serde::Deserialize;

use crate::client::{ApiRequest, DevOpsClient};
use crate::metrics::{Labels, MetricSnapshot};

use super::{Collection, Collector, CollectorError};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceUsage {
    #[serde(default)]
    resource_limit: Option<ResourceLimit>,
    #[serde(default)]
    running_requests: Vec<serde_json::Value>,
    #[serde(default)]
    used_count: Option<f64>,
    #[serde(default)]
    used_minutes: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResourceLimit {
    #[serde(default)]
    total_count: Option<f64>,
    #[serde(default)]
    total_minutes: Option<f64>,
}

/// Private parallel job limits and current usage.
#[derive(Default)]
pub struct ResourceUsageCollector;

impl ResourceUsageCollector {
    /// Create the collector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl Collector for ResourceUsageCollector {
    fn name(&self) -> &str {
        "ResourceUsage"
    }

    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError> {
        let usage: ResourceUsage = client
            .get_json(
                &ApiRequest::get("_apis/distributedtask/resourceusage")
                    .query("parallelismTag", "Private")
                    .query("poolIsHosted", true)
                    .query("includeRunningRequests", true),
            )
            .await?;

        let mut snapshot = MetricSnapshot::new();
        let family = snapshot.gauge(
            "azure_devops_resourceusage_build",
            "Parallel pipeline job usage by name",
        );
        let limit = usage.resource_limit.as_ref();
        let values = [
            ("totalCount", limit.and_then(|l| l.total_count)),
            ("totalMinutes", limit.and_then(|l| l.total_minutes)),
            ("usedCount", usage.used_count),
            ("usedMinutes", usage.used_minutes),
            ("runningRequests", Some(usage.running_requests.len() as f64)),
        ];
        for (name, value) in values {
            if let Some(value) = value {
                family.add(Labels::new().with("name", name), value);
            }
        }

        Ok(Collection::complete(snapshot))
    }
}
