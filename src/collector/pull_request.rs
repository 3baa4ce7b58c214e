//! Active pull requests.

use serde::Deserialize;

use crate::client::{ApiRequest, DevOpsClient, UNLIMITED};
use crate::metrics::Labels;

use super::build::IdentityRef;
use super::discovery::{ProjectFilter, discover_projects};
use super::{Collection, Collector, CollectorError, fan_out, parse_time};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    pull_request_id: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    is_draft: bool,
    #[serde(default)]
    creation_date: Option<String>,
    #[serde(default)]
    source_ref_name: Option<String>,
    #[serde(default)]
    target_ref_name: Option<String>,
    #[serde(default)]
    created_by: Option<IdentityRef>,
    #[serde(default)]
    repository: Option<RepositoryRef>,
    #[serde(default)]
    reviewers: Vec<Reviewer>,
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
struct RepositoryRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Reviewer {
    #[serde(default)]
    vote: i64,
}

#[derive(Debug, Deserialize)]
struct Label {
    name: String,
    #[serde(default)]
    active: Option<bool>,
}

impl PullRequest {
    /// Aggregate reviewer votes; a rejection outweighs everything else.
    fn vote_status(&self) -> &'static str {
        let votes: Vec<i64> = self.reviewers.iter().map(|r| r.vote).collect();
        if votes.contains(&-10) {
            "rejected"
        } else if votes.contains(&-5) {
            "waitingForAuthor"
        } else if votes.contains(&10) {
            "approved"
        } else if votes.contains(&5) {
            "approvedWithSuggestions"
        } else {
            "none"
        }
    }
}

/// Active pull requests of every selected project.
pub struct PullRequestCollector {
    filter: ProjectFilter,
}

impl PullRequestCollector {
    /// Create the collector.
    pub fn new(filter: ProjectFilter) -> Self {
        Self { filter }
    }
}

#[async_trait::async_trait]
impl Collector for PullRequestCollector {
    fn name(&self) -> &str {
        "PullRequest"
    }

    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError> {
        let projects = discover_projects(client, &self.filter).await?;

        let results = fan_out(&projects, |project| {
            client.list::<PullRequest>(
                ApiRequest::get(format!("{}/_apis/git/pullrequests", project.id))
                    .query("searchCriteria.status", "active"),
                UNLIMITED,
            )
        })
        .await;

        let mut collection = Collection::new();
        for (project, result) in results {
            let pull_requests = match result {
                Ok(pull_requests) => pull_requests,
                Err(e) => {
                    collection.fail(format_args!("project {}", project.name), e);
                    continue;
                }
            };

            let snapshot = &mut collection.snapshot;
            for pr in &pull_requests {
                let repository = pr.repository.as_ref().map(|r| r.id.as_str()).unwrap_or_default();
                let key = Labels::new()
                    .with("projectID", &project.id)
                    .with("repositoryID", repository)
                    .with("pullrequestID", pr.pull_request_id);

                snapshot
                    .gauge("azure_devops_pullrequest_info", "Active pull request")
                    .info(
                        key.clone()
                            .with("pullrequestTitle", &pr.title)
                            .with("status", pr.status.as_deref().unwrap_or_default())
                            .with("voteStatus", pr.vote_status())
                            .with("creator", IdentityRef::label(pr.created_by.as_ref()))
                            .with("isDraft", pr.is_draft)
                            .with("sourceBranch", pr.source_ref_name.as_deref().unwrap_or_default())
                            .with("targetBranch", pr.target_ref_name.as_deref().unwrap_or_default()),
                    );
                snapshot
                    .gauge(
                        "azure_devops_pullrequest_status",
                        "Pull request timestamps by type",
                    )
                    .timestamp(
                        key.clone().with("type", "created"),
                        parse_time(pr.creation_date.as_deref()),
                    );

                for label in &pr.labels {
                    snapshot
                        .gauge("azure_devops_pullrequest_label", "Pull request label")
                        .info(
                            key.clone()
                                .with("label", &label.name)
                                .with("active", label.active.unwrap_or(true)),
                        );
                }
            }
        }

        collection.finish(projects.len())
    }
}
