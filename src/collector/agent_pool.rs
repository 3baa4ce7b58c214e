//! Agent pools, their agents and queued jobs.

use serde::Deserialize;

use crate::client::{ApiRequest, DevOpsClient, UNLIMITED};
use crate::metrics::{Labels, MetricSnapshot};

use super::{Collection, Collector, CollectorError, fan_out, flag, parse_time};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentPool {
    id: i64,
    name: String,
    #[serde(default)]
    pool_type: Option<String>,
    #[serde(default)]
    is_hosted: bool,
    #[serde(default)]
    size: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Agent {
    id: i64,
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    created_on: Option<String>,
    #[serde(default)]
    assigned_request: Option<JobRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobRequest {
    request_id: i64,
    #[serde(default)]
    queue_time: Option<String>,
    #[serde(default)]
    assign_time: Option<String>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    definition: Option<Reference>,
}

#[derive(Debug, Deserialize)]
struct Reference {
    #[serde(default)]
    name: Option<String>,
}

/// Agent pool sizes, agent status and queue lengths.
///
/// An empty pool id list means every pool is collected.
pub struct AgentPoolCollector {
    pools: Vec<i64>,
}

impl AgentPoolCollector {
    /// Create the collector.
    pub fn new(pools: Vec<i64>) -> Self {
        Self { pools }
    }

    fn selected(&self, pool: &AgentPool) -> bool {
        self.pools.is_empty() || self.pools.contains(&pool.id)
    }
}

async fn fetch_pool(
    client: &DevOpsClient,
    pool: &AgentPool,
) -> Result<(Vec<Agent>, Vec<JobRequest>), crate::client::ApiError> {
    let agents = client.list(
        ApiRequest::get(format!("_apis/distributedtask/pools/{}/agents", pool.id))
            .query("includeCapabilities", false)
            .query("includeAssignedRequest", true),
        UNLIMITED,
    );
    let jobs = client.list(
        ApiRequest::get(format!("_apis/distributedtask/pools/{}/jobrequests", pool.id)),
        UNLIMITED,
    );
    tokio::try_join!(agents, jobs)
}

fn record_pool(snapshot: &mut MetricSnapshot, pool: &AgentPool, agents: &[Agent], jobs: &[JobRequest]) {
    let pool_id = pool.id.to_string();

    snapshot
        .gauge("azure_devops_agentpool_info", "Azure DevOps agent pool")
        .info(
            Labels::new()
                .with("agentPoolID", &pool_id)
                .with("agentPoolName", &pool.name)
                .with("agentPoolType", pool.pool_type.as_deref().unwrap_or_default())
                .with("isHosted", pool.is_hosted),
        );
    snapshot
        .gauge("azure_devops_agentpool_size", "Agents in an agent pool")
        .add(Labels::new().with("agentPoolID", &pool_id), pool.size as f64);

    for agent in agents {
        let agent_labels = || {
            Labels::new()
                .with("agentPoolID", &pool_id)
                .with("agentPoolAgentID", agent.id)
        };

        snapshot
            .gauge("azure_devops_agentpool_agent_info", "Agent of an agent pool")
            .info(
                agent_labels()
                    .with("agentPoolAgentName", &agent.name)
                    .with("agentPoolAgentVersion", agent.version.as_deref().unwrap_or_default()),
            );

        let online = agent.status.as_deref() == Some("online");
        snapshot
            .gauge(
                "azure_devops_agentpool_agent_status",
                "Agent status (1 = yes) by type",
            )
            .add(agent_labels().with("type", "enabled"), flag(agent.enabled))
            .add(agent_labels().with("type", "online"), flag(online))
            .timestamp(
                agent_labels().with("type", "created"),
                parse_time(agent.created_on.as_deref()),
            );

        if let Some(ref job) = agent.assigned_request {
            snapshot
                .gauge(
                    "azure_devops_agentpool_agent_job",
                    "Unix time the running job was assigned to the agent",
                )
                .timestamp(
                    agent_labels()
                        .with("jobRequestID", job.request_id)
                        .with(
                            "definitionName",
                            job.definition
                                .as_ref()
                                .and_then(|d| d.name.as_deref())
                                .unwrap_or_default(),
                        ),
                    parse_time(job.assign_time.as_deref()),
                );
        }
    }

    let queued = jobs
        .iter()
        .filter(|job| job.result.is_none() && job.assign_time.is_none())
        .count();
    let oldest_queued = jobs
        .iter()
        .filter(|job| job.result.is_none() && job.assign_time.is_none())
        .filter_map(|job| parse_time(job.queue_time.as_deref()))
        .min();

    snapshot
        .gauge(
            "azure_devops_agentpool_queue_length",
            "Job requests waiting for an agent",
        )
        .add(Labels::new().with("agentPoolID", &pool_id), queued as f64);
    snapshot
        .gauge(
            "azure_devops_agentpool_queue_oldest",
            "Unix time the oldest waiting job request was queued",
        )
        .timestamp(Labels::new().with("agentPoolID", &pool_id), oldest_queued);
}

#[async_trait::async_trait]
impl Collector for AgentPoolCollector {
    fn name(&self) -> &str {
        "AgentPool"
    }

    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError> {
        let pools: Vec<AgentPool> = client
            .list(ApiRequest::get("_apis/distributedtask/pools"), UNLIMITED)
            .await?;
        let pools: Vec<AgentPool> = pools.into_iter().filter(|p| self.selected(p)).collect();

        let mut collection = Collection::new();
        for (pool, result) in fan_out(&pools, |pool| fetch_pool(client, pool)).await {
            match result {
                Ok((agents, jobs)) => record_pool(&mut collection.snapshot, pool, &agents, &jobs),
                Err(e) => collection.fail(format_args!("agent pool {}", pool.name), e),
            }
        }

        collection.finish(pools.len())
    }
}
