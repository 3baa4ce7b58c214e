//! Deployments of every release definition.

use futures_util::future::try_join_all;
use serde::Deserialize;

use crate::client::{ApiError, ApiRequest, DevOpsClient};
use crate::config::LimitsConfig;
use crate::metrics::{Labels, MetricSnapshot};

use super::build::{DefinitionRef, IdentityRef};
use super::discovery::{Project, ProjectFilter, discover_projects};
use super::release::list_definitions;
use super::{Collection, Collector, CollectorError, duration_secs, fan_out, parse_time};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Deployment {
    id: i64,
    #[serde(default)]
    release: Option<DefinitionRef>,
    #[serde(default)]
    release_definition: DefinitionRef,
    #[serde(default)]
    release_environment: Option<DefinitionRef>,
    #[serde(default)]
    deployment_status: Option<String>,
    #[serde(default)]
    operation_status: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    attempt: i64,
    #[serde(default)]
    requested_by: Option<IdentityRef>,
    #[serde(default)]
    requested_for: Option<IdentityRef>,
    #[serde(default)]
    queued_on: Option<String>,
    #[serde(default)]
    started_on: Option<String>,
    #[serde(default)]
    completed_on: Option<String>,
}

/// Deployments per release definition, newest first.
pub struct DeploymentCollector {
    filter: ProjectFilter,
    limits: LimitsConfig,
}

impl DeploymentCollector {
    /// Create the collector.
    pub fn new(filter: ProjectFilter, limits: LimitsConfig) -> Self {
        Self { filter, limits }
    }
}

async fn fetch_project(
    client: &DevOpsClient,
    project: &Project,
    limits: &LimitsConfig,
) -> Result<Vec<Deployment>, ApiError> {
    let definitions =
        list_definitions(client, project, limits.release_definitions_per_project).await?;
    let limit = limits.deployments_per_definition;

    let per_definition = try_join_all(definitions.iter().map(|definition| {
        client.list::<Deployment>(
            ApiRequest::release(format!("{}/_apis/release/deployments", project.id))
                .query("definitionId", definition.id)
                .query("queryOrder", "descending")
                .query("$top", limit),
            limit,
        )
    }))
    .await?;
    Ok(per_definition.into_iter().flatten().collect())
}

fn record_deployment(snapshot: &mut MetricSnapshot, project: &Project, deployment: &Deployment) {
    let environment = deployment.release_environment.as_ref();
    let key = Labels::new()
        .with("projectID", &project.id)
        .with("deploymentID", deployment.id)
        .with("releaseID", deployment.release.as_ref().map(|r| r.id).unwrap_or_default())
        .with("releaseDefinitionID", deployment.release_definition.id)
        .with("environmentID", environment.map(|e| e.id).unwrap_or_default());

    snapshot.gauge("azure_devops_deployment_info", "Release deployment").info(
        key.clone()
            .with("environmentName", environment.map(|e| e.name.as_str()).unwrap_or_default())
            .with("requestedBy", IdentityRef::label(deployment.requested_by.as_ref()))
            .with("deployedBy", IdentityRef::label(deployment.requested_for.as_ref()))
            .with("status", deployment.deployment_status.as_deref().unwrap_or_default())
            .with(
                "operationStatus",
                deployment.operation_status.as_deref().unwrap_or_default(),
            )
            .with("reason", deployment.reason.as_deref().unwrap_or_default())
            .with("attempt", deployment.attempt),
    );

    let queued = parse_time(deployment.queued_on.as_deref());
    let started = parse_time(deployment.started_on.as_deref());
    let finished = parse_time(deployment.completed_on.as_deref());
    let family = snapshot.gauge(
        "azure_devops_deployment_status",
        "Deployment timestamps and duration by type",
    );
    family
        .timestamp(key.clone().with("type", "queued"), queued)
        .timestamp(key.clone().with("type", "started"), started)
        .timestamp(key.clone().with("type", "finished"), finished);
    if let Some(seconds) = duration_secs(started, finished) {
        family.add(key.with("type", "jobDuration"), seconds);
    }
}

#[async_trait::async_trait]
impl Collector for DeploymentCollector {
    fn name(&self) -> &str {
        "Deployment"
    }

    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError> {
        let projects = discover_projects(client, &self.filter).await?;
        let limits = &self.limits;

        let mut collection = Collection::new();
        let results = fan_out(&projects, |project| fetch_project(client, project, limits)).await;
        for (project, result) in results {
            match result {
                Ok(deployments) => {
                    for deployment in &deployments {
                        record_deployment(&mut collection.snapshot, project, deployment);
                    }
                }
                Err(e) => collection.fail(format_args!("project {}", project.name), e),
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
    async fn test_collects_deployments_per_definition() {
        let server = MockServer::start().await;
        testing::mount_projects(&server, &[("p1", "Website")]).await;
        Mock::given(method("GET"))
            .and(path("/org/p1/_apis/release/definitions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testing::list(vec![
                json!({ "id": 1, "name": "Deploy" }),
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/org/p1/_apis/release/deployments"))
            .and(query_param("definitionId", "1"))
            .and(query_param("$top", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testing::list(vec![
                json!({
                    "id": 31,
                    "release": { "id": 5, "name": "Release-5" },
                    "releaseDefinition": { "id": 1, "name": "Deploy" },
                    "releaseEnvironment": { "id": 105, "name": "Production" },
                    "deploymentStatus": "succeeded",
                    "operationStatus": "Approved",
                    "reason": "automated",
                    "attempt": 1,
                    "requestedFor": { "displayName": "Jane Doe" },
                    "queuedOn": "2024-01-01T00:00:00Z",
                    "startedOn": "2024-01-01T00:00:10Z",
                    "completedOn": "2024-01-01T00:02:10Z"
                }),
                json!({ "id": 30, "releaseDefinition": { "id": 1 }, "deploymentStatus": "failed" }),
                json!({ "id": 29, "releaseDefinition": { "id": 1 }, "deploymentStatus": "failed" }),
            ])))
            .mount(&server)
            .await;

        let client = testing::client(&server).await;
        let limits = LimitsConfig {
            deployments_per_definition: 2,
            ..LimitsConfig::default()
        };
        let collection = DeploymentCollector::new(ProjectFilter::new(vec![], vec![], 100), limits)
            .collect(&client)
            .await
            .unwrap();
        let snapshot = &collection.snapshot;

        assert_eq!(testing::count(snapshot, "azure_devops_deployment_info"), 2);
        assert_eq!(
            testing::value(
                snapshot,
                "azure_devops_deployment_info",
                &[("deploymentID", "31"), ("environmentName", "Production"), ("deployedBy", "Jane Doe")]
            ),
            Some(1.0)
        );
        assert_eq!(
            testing::value(
                snapshot,
                "azure_devops_deployment_status",
                &[("deploymentID", "31"), ("type", "jobDuration")]
            ),
            Some(120.0)
        );
    }

    #[tokio::test]
    async fn test_definition_listing_failure_is_partial() {
        let server = MockServer::start().await;
        testing::mount_projects(&server, &[("p1", "Website"), ("p2", "Backend")]).await;
        Mock::given(method("GET"))
            .and(path("/org/p1/_apis/release/definitions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testing::list(vec![])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/org/p2/_apis/release/definitions"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let client = testing::client(&server).await;
        let collection = DeploymentCollector::new(
            ProjectFilter::new(vec![], vec![], 100),
            LimitsConfig::default(),
        )
        .collect(&client)
        .await
        .unwrap();

        assert_eq!(collection.failures().len(), 1);
        assert!(collection.failures()[0].contains("Backend"));
    }
}
