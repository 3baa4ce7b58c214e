//! Release definitions and recent releases, served by the release management host.

use serde::Deserialize;

use crate::client::{ApiError, ApiRequest, DevOpsClient};
use crate::config::LimitsConfig;
use crate::metrics::{Labels, MetricSnapshot};

use super::build::{DefinitionRef, IdentityRef, min_time};
use super::discovery::{Project, ProjectFilter, discover_projects};
use super::{Collection, Collector, CollectorError, fan_out, parse_time};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReleaseDefinition {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub release_name_format: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

/// Release definitions of `project`, at most `limit`.
pub(crate) async fn list_definitions(
    client: &DevOpsClient,
    project: &Project,
    limit: usize,
) -> Result<Vec<ReleaseDefinition>, ApiError> {
    client
        .list(
            ApiRequest::release(format!("{}/_apis/release/definitions", project.id))
                .query("$top", limit),
            limit,
        )
        .await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Release {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    created_on: Option<String>,
    #[serde(default)]
    created_by: Option<IdentityRef>,
    #[serde(default)]
    release_definition: DefinitionRef,
    #[serde(default)]
    artifacts: Vec<Artifact>,
    #[serde(default)]
    environments: Vec<Environment>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Artifact {
    #[serde(default)]
    source_id: String,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    definition_reference: Option<ArtifactReference>,
}

#[derive(Debug, Default, Deserialize)]
struct ArtifactReference {
    #[serde(default)]
    version: Option<NamedRef>,
    #[serde(default)]
    branch: Option<NamedRef>,
    #[serde(default)]
    repository: Option<NamedRef>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

impl NamedRef {
    fn name(named: Option<&NamedRef>) -> &str {
        named.and_then(|n| n.name.as_deref()).unwrap_or_default()
    }

    fn id(named: Option<&NamedRef>) -> &str {
        named.and_then(|n| n.id.as_deref()).unwrap_or_default()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Environment {
    id: i64,
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    rank: i64,
    #[serde(default)]
    trigger_reason: Option<String>,
    #[serde(default)]
    created_on: Option<String>,
    #[serde(default)]
    modified_on: Option<String>,
    /// Minutes.
    #[serde(default)]
    time_to_deploy: Option<f64>,
}

/// Release definitions and the releases created within the history window.
pub struct ReleaseCollector {
    filter: ProjectFilter,
    limits: LimitsConfig,
}

impl ReleaseCollector {
    /// Create the collector.
    pub fn new(filter: ProjectFilter, limits: LimitsConfig) -> Self {
        Self { filter, limits }
    }
}

async fn fetch_project(
    client: &DevOpsClient,
    project: &Project,
    limits: &LimitsConfig,
) -> Result<(Vec<ReleaseDefinition>, Vec<Release>), ApiError> {
    let definitions =
        list_definitions(client, project, limits.release_definitions_per_project).await?;
    let since = min_time(limits.release_history);

    // The per-project cap spans definitions in definition order, so later
    // definitions are only asked for the room that is left.
    let mut releases = Vec::new();
    for definition in &definitions {
        let room = limits
            .releases_per_project
            .saturating_sub(releases.len())
            .min(limits.releases_per_definition);
        if room == 0 {
            break;
        }
        let batch = client
            .list::<Release>(
                ApiRequest::release(format!("{}/_apis/release/releases", project.id))
                    .query("definitionId", definition.id)
                    .query("minCreatedTime", &since)
                    .query("$expand", "environments,artifacts")
                    .query("$top", room),
                room,
            )
            .await?;
        releases.extend(batch);
    }
    Ok((definitions, releases))
}

fn record_release(snapshot: &mut MetricSnapshot, project: &Project, release: &Release) {
    let key = Labels::new()
        .with("projectID", &project.id)
        .with("releaseID", release.id)
        .with("releaseDefinitionID", release.release_definition.id);

    snapshot.gauge("azure_devops_release_info", "Release").info(
        key.clone()
            .with("releaseName", &release.name)
            .with("requestedBy", IdentityRef::label(release.created_by.as_ref()))
            .with("status", release.status.as_deref().unwrap_or_default())
            .with("reason", release.reason.as_deref().unwrap_or_default()),
    );
    snapshot
        .gauge("azure_devops_release_status", "Release timestamps by type")
        .timestamp(
            key.clone().with("type", "created"),
            parse_time(release.created_on.as_deref()),
        );

    for artifact in &release.artifacts {
        let reference = artifact.definition_reference.as_ref();
        snapshot
            .gauge("azure_devops_release_artifact", "Artifact consumed by a release")
            .info(
                key.clone()
                    .with("sourceId", &artifact.source_id)
                    .with("repositoryID", NamedRef::id(reference.and_then(|r| r.repository.as_ref())))
                    .with("branch", NamedRef::name(reference.and_then(|r| r.branch.as_ref())))
                    .with("type", &artifact.kind)
                    .with("alias", &artifact.alias)
                    .with("version", NamedRef::name(reference.and_then(|r| r.version.as_ref()))),
            );
    }

    for environment in &release.environments {
        let labels = key.clone().with("environmentID", environment.id);
        snapshot
            .gauge("azure_devops_release_environment", "Release stage")
            .info(
                labels
                    .clone()
                    .with("environmentName", &environment.name)
                    .with("status", environment.status.as_deref().unwrap_or_default())
                    .with(
                        "triggerReason",
                        environment.trigger_reason.as_deref().unwrap_or_default(),
                    )
                    .with("rank", environment.rank),
            );

        let family = snapshot.gauge(
            "azure_devops_release_environment_status",
            "Release stage timestamps and durations by type",
        );
        family
            .timestamp(
                labels.clone().with("type", "created"),
                parse_time(environment.created_on.as_deref()),
            )
            .timestamp(
                labels.clone().with("type", "modified"),
                parse_time(environment.modified_on.as_deref()),
            );
        if let Some(minutes) = environment.time_to_deploy {
            family.add(labels.with("type", "timeToDeploy"), minutes * 60.0);
        }
    }
}

#[async_trait::async_trait]
impl Collector for ReleaseCollector {
    fn name(&self) -> &str {
        "Release"
    }

    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError> {
        let projects = discover_projects(client, &self.filter).await?;
        let limits = &self.limits;

        let mut collection = Collection::new();
        let results = fan_out(&projects, |project| fetch_project(client, project, limits)).await;
        for (project, result) in results {
            let (definitions, releases) = match result {
                Ok(fetched) => fetched,
                Err(e) => {
                    collection.fail(format_args!("project {}", project.name), e);
                    continue;
                }
            };

            for definition in &definitions {
                collection
                    .snapshot
                    .gauge("azure_devops_release_definition_info", "Release definition")
                    .info(
                        Labels::new()
                            .with("projectID", &project.id)
                            .with("releaseDefinitionID", definition.id)
                            .with("releaseDefinitionName", &definition.name)
                            .with(
                                "releaseNameFormat",
                                definition.release_name_format.as_deref().unwrap_or_default(),
                            )
                            .with("path", definition.path.as_deref().unwrap_or_default())
                            .with("url", definition.url.as_deref().unwrap_or_default()),
                    );
            }
            for release in &releases {
                record_release(&mut collection.snapshot, project, release);
            }
        }

        collection.finish(projects.len())
    }
}
