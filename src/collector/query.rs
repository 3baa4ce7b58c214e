//! Saved work item queries.

use std::collections::BTreeSet;

use serde::Deserialize;

use crate::client::{ApiRequest, DevOpsClient};
use crate::config::QueryRef;
use crate::metrics::Labels;

use super::{Collection, Collector, CollectorError, fan_out};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResult {
    #[serde(default)]
    work_items: Vec<WorkItemRef>,
    #[serde(default)]
    work_item_relations: Vec<WorkItemLink>,
}

#[derive(Debug, Deserialize)]
struct WorkItemRef {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct WorkItemLink {
    #[serde(default)]
    target: Option<WorkItemRef>,
}

impl QueryResult {
    /// Distinct work item ids; link queries report their items as relation targets.
    fn ids(&self) -> BTreeSet<i64> {
        self.work_items
            .iter()
            .chain(self.work_item_relations.iter().filter_map(|l| l.target.as_ref()))
            .map(|w| w.id)
            .collect()
    }
}

/// Result sizes and members of the configured saved queries.
pub struct QueryCollector {
    queries: Vec<QueryRef>,
}

impl QueryCollector {
    /// Create the collector.
    pub fn new(queries: Vec<QueryRef>) -> Self {
        Self { queries }
    }
}

#[async_trait::async_trait]
impl Collector for QueryCollector {
    fn name(&self) -> &str {
        "Query"
    }

    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError> {
        let results = fan_out(&self.queries, |query| async move {
            client
                .get_json::<QueryResult>(&ApiRequest::get(format!(
                    "{}/_apis/wit/wiql/{}",
                    query.project_id, query.query_id
                )))
                .await
        })
        .await;

        let mut collection = Collection::new();
        for (query, result) in results {
            let ids = match result {
                Ok(result) => result.ids(),
                Err(e) => {
                    collection.fail(format_args!("query {query}"), e);
                    continue;
                }
            };

            let labels = Labels::new()
                .with("projectID", query.project_id)
                .with("queryID", query.query_id);
            collection
                .snapshot
                .gauge("azure_devops_query_result", "Work items returned by a saved query")
                .add(labels.clone(), ids.len() as f64);

            let family = collection
                .snapshot
                .gauge("azure_devops_query_workitem", "Work item returned by a saved query");
            for id in ids {
                family.info(labels.clone().with("workItemID", id));
            }
        }

        collection.finish(self.queries.len())
    }
}
