//! Latest build of every build definition.

use crate::client::{ApiRequest, DevOpsClient};
use crate::config::LimitsConfig;
use crate::metrics::MetricSnapshot;

use super::build::Build;
use super::discovery::{ProjectFilter, discover_projects};
use super::{Collection, Collector, CollectorError, fan_out};

/// The most recent build per definition, regardless of the history window.
pub struct LatestBuildCollector {
    filter: ProjectFilter,
    limits: LimitsConfig,
}

impl LatestBuildCollector {
    /// Create the collector.
    pub fn new(filter: ProjectFilter, limits: LimitsConfig) -> Self {
        Self { filter, limits }
    }
}

#[async_trait::async_trait]
impl Collector for LatestBuildCollector {
    fn name(&self) -> &str {
        "LatestBuild"
    }

    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError> {
        let projects = discover_projects(client, &self.filter).await?;
        let limit = self.limits.builds_per_project;

        let results = fan_out(&projects, |project| {
            client.list::<Build>(
                ApiRequest::get(format!("{}/_apis/build/builds", project.id))
                    .query("maxBuildsPerDefinition", 1)
                    .query("queryOrder", "finishTimeDescending")
                    .query("$top", limit),
                limit,
            )
        })
        .await;

        let mut collection = Collection::new();
        for (project, result) in results {
            let builds = match result {
                Ok(builds) => builds,
                Err(e) => {
                    collection.fail(format_args!("project {}", project.name), e);
                    continue;
                }
            };

            let snapshot: &mut MetricSnapshot = &mut collection.snapshot;
            for build in &builds {
                snapshot
                    .gauge("azure_devops_build_latest_info", "Latest build per definition")
                    .info(build.info_labels(project));
                build.record_status(
                    snapshot.gauge(
                        "azure_devops_build_latest_status",
                        "Latest build timestamps by type",
                    ),
                    project,
                );
            }
        }

        collection.finish(projects.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_latest_build_per_definition() {
        let server = MockServer::start().await;
        testing::mount_projects(&server, &[("p1", "Website"), ("p2", "Backend")]).await;
        Mock::given(method("GET"))
            .and(path("/org/p1/_apis/build/builds"))
            .and(query_param("maxBuildsPerDefinition", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testing::list(vec![
                json!({ "id": 7, "buildNumber": "7", "status": "completed", "result": "failed",
                        "startTime": "2024-01-01T00:00:00Z", "finishTime": "2024-01-01T00:00:42Z",
                        "definition": { "id": 1, "name": "CI" } }),
                json!({ "id": 8, "buildNumber": "8", "status": "completed", "result": "succeeded",
                        "definition": { "id": 2, "name": "Nightly" } }),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/org/p2/_apis/build/builds"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = testing::client(&server).await;
        let collection = LatestBuildCollector::new(
            ProjectFilter::new(vec![], vec![], 100),
            LimitsConfig::default(),
        )
        .collect(&client)
        .await
        .unwrap();
        let snapshot = &collection.snapshot;

        assert_eq!(testing::count(snapshot, "azure_devops_build_latest_info"), 2);
        assert_eq!(
            testing::value(
                snapshot,
                "azure_devops_build_latest_info",
                &[("buildDefinitionID", "1"), ("result", "failed")]
            ),
            Some(1.0)
        );
        assert_eq!(
            testing::value(
                snapshot,
                "azure_devops_build_latest_status",
                &[("buildID", "7"), ("type", "jobDuration")]
            ),
            Some(42.0)
        );

        // Backend failed, Website is still published.
        assert_eq!(collection.failures().len(), 1);
        assert!(collection.failures()[0].contains("Backend"));
    }
}
