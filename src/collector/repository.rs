//! Git repositories with recent commit and push activity.

use std::time::Duration;

use serde::Deserialize;

use crate::client::{ApiError, ApiRequest, DevOpsClient, UNLIMITED};
use crate::metrics::Labels;

use super::build::min_time;
use super::discovery::{Project, ProjectFilter, discover_projects};
use super::{Collection, Collector, CollectorError, fan_out};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Repository {
    id: String,
    name: String,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    is_disabled: bool,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Activity {}

/// Repository inventory, size and activity within the last interval.
pub struct RepositoryCollector {
    filter: ProjectFilter,
    window: Duration,
}

impl RepositoryCollector {
    /// Create the collector. Activity is counted over `window`, normally the
    /// collector's own interval.
    pub fn new(filter: ProjectFilter, window: Duration) -> Self {
        Self { filter, window }
    }
}

async fn fetch_activity(
    client: &DevOpsClient,
    project: &Project,
    repository: &Repository,
    since: &str,
) -> Result<(usize, usize), ApiError> {
    let base = format!("{}/_apis/git/repositories/{}", project.id, repository.id);
    let commits = client.list::<Activity>(
        ApiRequest::get(format!("{base}/commits")).query("searchCriteria.fromDate", since),
        UNLIMITED,
    );
    let pushes = client.list::<Activity>(
        ApiRequest::get(format!("{base}/pushes")).query("searchCriteria.fromDate", since),
        UNLIMITED,
    );
    let (commits, pushes) = tokio::try_join!(commits, pushes)?;
    Ok((commits.len(), pushes.len()))
}

#[async_trait::async_trait]
impl Collector for RepositoryCollector {
    fn name(&self) -> &str {
        "Repository"
    }

    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError> {
        let projects = discover_projects(client, &self.filter).await?;
        let since = min_time(self.window);

        let listings = fan_out(&projects, |project| {
            client.list::<Repository>(
                ApiRequest::get(format!("{}/_apis/git/repositories", project.id)),
                UNLIMITED,
            )
        })
        .await;

        let mut collection = Collection::new();
        let mut attempted = projects.len();
        let mut active: Vec<(&Project, Repository)> = Vec::new();

        for (project, result) in listings {
            match result {
                Ok(repositories) => active.extend(
                    repositories
                        .into_iter()
                        .filter(|r| !r.is_disabled)
                        .map(|r| (project, r)),
                ),
                Err(e) => collection.fail(format_args!("project {}", project.name), e),
            }
        }

        for (project, repository) in &active {
            collection
                .snapshot
                .gauge("azure_devops_repository_info", "Git repository")
                .info(
                    Labels::new()
                        .with("projectID", &project.id)
                        .with("repositoryID", &repository.id)
                        .with("repositoryName", &repository.name)
                        .with(
                            "defaultBranch",
                            repository.default_branch.as_deref().unwrap_or_default(),
                        ),
                );
            if let Some(size) = repository.size {
                collection
                    .snapshot
                    .gauge("azure_devops_repository_stats", "Repository statistics by type")
                    .add(
                        Labels::new()
                            .with("projectID", &project.id)
                            .with("repositoryID", &repository.id)
                            .with("type", "size"),
                        size as f64,
                    );
            }
        }

        attempted += active.len();
        let activity = fan_out(&active, |(project, repository)| {
            fetch_activity(client, project, repository, &since)
        })
        .await;

        for ((project, repository), result) in activity {
            match result {
                Ok((commits, pushes)) => {
                    let labels = Labels::new()
                        .with("projectID", &project.id)
                        .with("repositoryID", &repository.id);
                    collection
                        .snapshot
                        .gauge(
                            "azure_devops_repository_commits",
                            "Commits within the last collection interval",
                        )
                        .add(labels.clone(), commits as f64);
                    collection
                        .snapshot
                        .gauge(
                            "azure_devops_repository_pushes",
                            "Pushes within the last collection interval",
                        )
                        .add(labels, pushes as f64);
                }
                Err(e) => collection.fail(format_args!("repository {}", repository.name), e),
            }
        }

        collection.finish(attempted)
    }
}
