//! Project discovery shared by every per-project collector.

use serde::Deserialize;

use crate::client::{ApiError, ApiRequest, DevOpsClient};
use crate::config::AppConfig;

/// A team project.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    /// Project id (UUID).
    pub id: String,
    /// Display name.
    pub name: String,
    /// `wellFormed`, `createPending`, ...
    #[serde(default)]
    pub state: Option<String>,
    /// `private` or `public`.
    #[serde(default)]
    pub visibility: Option<String>,
    /// Last modification time.
    #[serde(default)]
    pub last_update_time: Option<String>,
}

/// Which projects the per-project collectors look at.
///
/// The listing is bounded by `limit` first; include and exclude lists are then
/// applied to that bounded list. Entries match a project id or, case
/// insensitively, its name.
#[derive(Debug, Clone)]
pub struct ProjectFilter {
    include: Vec<String>,
    exclude: Vec<String>,
    limit: usize,
}

impl ProjectFilter {
    /// Build a filter.
    pub fn new(include: Vec<String>, exclude: Vec<String>, limit: usize) -> Self {
        Self {
            include,
            exclude,
            limit,
        }
    }

    /// Filter described by `devops.projects`, `devops.exclude_projects` and `limits.project`.
    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.devops.projects.clone(),
            config.devops.exclude_projects.clone(),
            config.limits.project,
        )
    }

    /// Maximum projects listed.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether `project` passes the include and exclude lists.
    pub fn matches(&self, project: &Project) -> bool {
        let hit = |entry: &String| entry == &project.id || entry.eq_ignore_ascii_case(&project.name);

        if self.exclude.iter().any(hit) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(hit)
    }
}

/// List projects and apply `filter`.
///
/// # Errors
/// Returns `ApiError` if the project listing fails.
pub async fn discover_projects(
    client: &DevOpsClient,
    filter: &ProjectFilter,
) -> Result<Vec<Project>, ApiError> {
    let request = ApiRequest::get("_apis/projects")
        .query("$top", filter.limit)
        .query("stateFilter", "wellFormed");
    let listed: Vec<Project> = client.list(request, filter.limit).await?;
    let total = listed.len();

    let projects: Vec<Project> = listed.into_iter().filter(|p| filter.matches(p)).collect();
    tracing::debug!(
        listed = total,
        selected = projects.len(),
        "Discovered projects"
    );
    Ok(projects)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn project(id: &str, name: &str) -> Project {
        Project {
            id: id.to_string(),
            name: name.to_string(),
            state: None,
            visibility: None,
            last_update_time: None,
        }
    }

    #[test]
    fn test_filter_include_exclude() {
        let all = ProjectFilter::new(vec![], vec![], 10);
        assert!(all.matches(&project("1", "Website")));

        let include = ProjectFilter::new(vec!["website".into(), "2".into()], vec![], 10);
        assert!(include.matches(&project("1", "Website")));
        assert!(include.matches(&project("2", "Backend")));
        assert!(!include.matches(&project("3", "Legacy")));

        let exclude = ProjectFilter::new(vec!["Website".into()], vec!["1".into()], 10);
        assert!(!exclude.matches(&project("1", "Website")));
    }

    #[tokio::test]
    async fn test_discovery_limits_then_filters() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/org/_apis/projects"))
            .and(query_param("$top", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(testing::list(vec![
                json!({ "id": "1", "name": "Website" }),
                json!({ "id": "2", "name": "Legacy" }),
                json!({ "id": "3", "name": "Backend" }),
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = testing::client(&server).await;
        let filter = ProjectFilter::new(vec![], vec!["legacy".into()], 2);
        let projects = discover_projects(&client, &filter).await.unwrap();

        // Limit keeps the first two in server order, exclusion drops one of them.
        assert_eq!(projects, vec![project("1", "Website")]);
    }
}
