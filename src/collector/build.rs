//! Build definitions and recent builds.

use std::time::Duration;

use chrono::Utc;
use serde::Deserialize;

use crate::client::{ApiError, ApiRequest, DevOpsClient, UNLIMITED};
use crate::config::LimitsConfig;
use crate::metrics::{Labels, MetricFamily, MetricSnapshot};

use super::discovery::{Project, ProjectFilter, discover_projects};
use super::{Collection, Collector, CollectorError, duration_secs, fan_out, parse_time};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IdentityRef {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub unique_name: Option<String>,
}

impl IdentityRef {
    pub fn label(identity: Option<&IdentityRef>) -> &str {
        identity
            .and_then(|i| i.display_name.as_deref().or(i.unique_name.as_deref()))
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct DefinitionRef {
    pub id: i64,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct PoolRef {
    #[serde(default)]
    pub id: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct QueueRef {
    #[serde(default)]
    pub pool: Option<PoolRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Build {
    pub id: i64,
    #[serde(default)]
    pub build_number: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub queue_time: Option<String>,
    #[serde(default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub finish_time: Option<String>,
    #[serde(default)]
    pub source_branch: Option<String>,
    #[serde(default)]
    pub source_version: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub definition: DefinitionRef,
    #[serde(default)]
    pub queue: Option<QueueRef>,
    #[serde(default)]
    pub requested_by: Option<IdentityRef>,
}

impl Build {
    /// Labels identifying the build across the status metrics.
    pub fn key_labels(&self, project: &Project) -> Labels {
        Labels::new()
            .with("projectID", &project.id)
            .with("buildDefinitionID", self.definition.id)
            .with("buildID", self.id)
            .with("buildNumber", &self.build_number)
    }

    /// Descriptive labels for the info metric.
    pub fn info_labels(&self, project: &Project) -> Labels {
        let pool = self
            .queue
            .as_ref()
            .and_then(|q| q.pool.as_ref())
            .map(|p| p.id.to_string())
            .unwrap_or_default();

        self.key_labels(project)
            .with("buildName", &self.definition.name)
            .with("agentPoolID", pool)
            .with("requestedBy", IdentityRef::label(self.requested_by.as_ref()))
            .with("sourceBranch", self.source_branch.as_deref().unwrap_or_default())
            .with("sourceVersion", self.source_version.as_deref().unwrap_or_default())
            .with("status", self.status.as_deref().unwrap_or_default())
            .with("reason", self.reason.as_deref().unwrap_or_default())
            .with("result", self.result.as_deref().unwrap_or_default())
            .with("url", self.url.as_deref().unwrap_or_default())
    }

    /// Queue, start and finish timestamps plus the job duration.
    pub fn record_status(&self, family: &mut MetricFamily, project: &Project) {
        let labels = self
            .key_labels(project)
            .with("result", self.result.as_deref().unwrap_or_default());
        let queued = parse_time(self.queue_time.as_deref());
        let started = parse_time(self.start_time.as_deref());
        let finished = parse_time(self.finish_time.as_deref());

        family
            .timestamp(labels.clone().with("type", "queued"), queued)
            .timestamp(labels.clone().with("type", "started"), started)
            .timestamp(labels.clone().with("type", "finished"), finished);
        if let Some(seconds) = duration_secs(started, finished) {
            family.add(labels.with("type", "jobDuration"), seconds);
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildDefinition {
    id: i64,
    name: String,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    revision: Option<i64>,
    #[serde(default)]
    url: Option<String>,
}

/// Build definitions and every build queued within the history window.
pub struct BuildCollector {
    filter: ProjectFilter,
    limits: LimitsConfig,
}

impl BuildCollector {
    /// Create the collector.
    pub fn new(filter: ProjectFilter, limits: LimitsConfig) -> Self {
        Self { filter, limits }
    }
}

/// Lower bound for history windows, in the format the API expects.
/// Windows reaching before the epoch start at the epoch.
pub(crate) fn min_time(history: Duration) -> String {
    let since = chrono::Duration::from_std(history)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .filter(|since| since.timestamp() >= 0)
        .unwrap_or_default();
    since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

async fn fetch_project(
    client: &DevOpsClient,
    project: &Project,
    limits: &LimitsConfig,
) -> Result<(Vec<BuildDefinition>, Vec<Build>), ApiError> {
    let definitions = client.list(
        ApiRequest::get(format!("{}/_apis/build/definitions", project.id)),
        UNLIMITED,
    );
    let builds = client.list(
        ApiRequest::get(format!("{}/_apis/build/builds", project.id))
            .query("minTime", min_time(limits.build_history))
            .query("maxBuildsPerDefinition", limits.builds_per_definition)
            .query("$top", limits.builds_per_project)
            .query("queryOrder", "queueTimeDescending"),
        limits.builds_per_project,
    );
    tokio::try_join!(definitions, builds)
}

#[async_trait::async_trait]
impl Collector for BuildCollector {
    fn name(&self) -> &str {
        "Build"
    }

    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError> {
        let projects = discover_projects(client, &self.filter).await?;
        let limits = &self.limits;

        let mut collection = Collection::new();
        let results = fan_out(&projects, |project| fetch_project(client, project, limits)).await;
        for (project, result) in results {
            let (definitions, builds) = match result {
                Ok(fetched) => fetched,
                Err(e) => {
                    collection.fail(format_args!("project {}", project.name), e);
                    continue;
                }
            };

            let snapshot: &mut MetricSnapshot = &mut collection.snapshot;
            for definition in &definitions {
                snapshot
                    .gauge("azure_devops_build_definition_info", "Build definition")
                    .info(
                        Labels::new()
                            .with("projectID", &project.id)
                            .with("buildDefinitionID", definition.id)
                            .with("buildDefinitionName", &definition.name)
                            .with("path", definition.path.as_deref().unwrap_or_default())
                            .with("revision", definition.revision.unwrap_or_default())
                            .with("url", definition.url.as_deref().unwrap_or_default()),
                    );
            }

            for build in &builds {
                snapshot
                    .gauge("azure_devops_build_info", "Build")
                    .info(build.info_labels(project));
                build.record_status(
                    snapshot.gauge("azure_devops_build_status", "Build timestamps by type"),
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

    fn build_json(id: i64, definition: i64) -> serde_json::Value {
        json!({
            "id": id,
            "buildNumber": format!("2024.{id}"),
            "status": "completed",
            "result": "succeeded",
            "reason": "manual",
            "queueTime": "2024-01-01T00:00:00Z",
            "startTime": "2024-01-01T00:00:30Z",
            "finishTime": "2024-01-01T00:05:30Z",
            "sourceBranch": "refs/heads/main",
            "definition": { "id": definition, "name": "CI" },
            "queue": { "pool": { "id": 9 } },
            "requestedBy": { "displayName": "Jane Doe" }
        })
    }

    #[test]
    fn test_min_time_format() {
        let value = min_time(Duration::from_secs(3600));
        assert!(value.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&value).is_ok());
        assert!(chrono::DateTime::parse_from_rfc3339(&min_time(Duration::MAX)).is_ok());
    }

    #[tokio::test]
    async fn test_collects_definitions_and_builds() {
        let server = MockServer::start().await;
        testing::mount_projects(&server, &[("p1", "Website")]).await;
        Mock::given(method("GET"))
            .and(path("/org/p1/_apis/build/definitions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testing::list(vec![
                json!({ "id": 3, "name": "CI", "path": "\\", "revision": 4 }),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/org/p1/_apis/build/builds"))
            .and(query_param("maxBuildsPerDefinition", "10"))
            .and(query_param("$top", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testing::list(vec![
                build_json(11, 3),
                json!({ "id": 12, "buildNumber": "2024.12", "status": "inProgress",
                        "queueTime": "2024-01-01T01:00:00Z", "definition": { "id": 3, "name": "CI" } }),
            ])))
            .mount(&server)
            .await;

        let client = testing::client(&server).await;
        let collector = BuildCollector::new(
            ProjectFilter::new(vec![], vec![], 100),
            LimitsConfig::default(),
        );
        let collection = collector.collect(&client).await.unwrap();
        let snapshot = &collection.snapshot;

        assert_eq!(testing::count(snapshot, "azure_devops_build_definition_info"), 1);
        assert_eq!(testing::count(snapshot, "azure_devops_build_info"), 2);
        assert_eq!(
            testing::value(
                snapshot,
                "azure_devops_build_info",
                &[("buildID", "11"), ("requestedBy", "Jane Doe"), ("agentPoolID", "9")]
            ),
            Some(1.0)
        );
        assert_eq!(
            testing::value(
                snapshot,
                "azure_devops_build_status",
                &[("buildID", "11"), ("type", "jobDuration")]
            ),
            Some(300.0)
        );
        // The running build has no start, finish or duration samples yet.
        assert!(
            testing::value(
                snapshot,
                "azure_devops_build_status",
                &[("buildID", "12"), ("type", "finished")]
            )
            .is_none()
        );
        assert_eq!(
            testing::value(
                snapshot,
                "azure_devops_build_status",
                &[("buildID", "12"), ("type", "queued")]
            ),
            Some(1_704_070_800.0)
        );
    }

    #[tokio::test]
    async fn test_builds_per_project_limit_truncates() {
        let server = MockServer::start().await;
        testing::mount_projects(&server, &[("p1", "Website")]).await;
        Mock::given(method("GET"))
            .and(path("/org/p1/_apis/build/definitions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testing::list(vec![])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/org/p1/_apis/build/builds"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testing::list(vec![
                build_json(1, 3),
                build_json(2, 3),
                build_json(3, 3),
            ])))
            .mount(&server)
            .await;

        let client = testing::client(&server).await;
        let limits = LimitsConfig {
            builds_per_project: 2,
            ..LimitsConfig::default()
        };
        let collection = BuildCollector::new(ProjectFilter::new(vec![], vec![], 100), limits)
            .collect(&client)
            .await
            .unwrap();

        assert_eq!(testing::count(&collection.snapshot, "azure_devops_build_info"), 2);
    }

    #[tokio::test]
    async fn test_every_project_failing_fails_tick() {
        let server = MockServer::start().await;
        testing::mount_projects(&server, &[("p1", "Website"), ("p2", "Backend")]).await;

        let client = testing::client(&server).await;
        let collector = BuildCollector::new(
            ProjectFilter::new(vec![], vec![], 100),
            LimitsConfig::default(),
        );

        // No build endpoints mounted: every project fetch gets a 404.
        assert!(matches!(
            collector.collect(&client).await,
            Err(CollectorError::NothingCollected { failures }) if failures.len() == 2
        ));
    }
}
