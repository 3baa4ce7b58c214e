//! Project inventory.

use crate::client::DevOpsClient;
use crate::metrics::{Labels, MetricSnapshot};

use super::discovery::{ProjectFilter, discover_projects};
use super::{Collection, Collector, CollectorError, parse_time};

/// Publishes one info sample per selected project.
pub struct ProjectCollector {
    filter: ProjectFilter,
}

impl ProjectCollector {
    /// Create the collector.
    pub fn new(filter: ProjectFilter) -> Self {
        Self { filter }
    }
}

#[async_trait::async_trait]
impl Collector for ProjectCollector {
    fn name(&self) -> &str {
        "Project"
    }

    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError> {
        let projects = discover_projects(client, &self.filter).await?;

        let mut snapshot = MetricSnapshot::new();
        for project in &projects {
            snapshot
                .gauge("azure_devops_project_info", "Azure DevOps project")
                .info(
                    Labels::new()
                        .with("projectID", &project.id)
                        .with("projectName", &project.name)
                        .with("visibility", project.visibility.as_deref().unwrap_or_default()),
                );
            snapshot
                .gauge(
                    "azure_devops_project_last_update",
                    "Unix time of the last project update",
                )
                .timestamp(
                    Labels::new().with("projectID", &project.id),
                    parse_time(project.last_update_time.as_deref()),
                );
        }

        Ok(Collection::complete(snapshot))
    }
}
