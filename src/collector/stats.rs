//! Per-project build and release statistics over a rolling window.
//!
//! Every tick recomputes the aggregates from the builds and release stages that
//! finished within the window, so the published values always describe the
//! last `summary_max_age`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::client::{ApiError, ApiRequest, DevOpsClient};
use crate::config::LimitsConfig;
use crate::metrics::{Labels, MetricSnapshot};

use super::build::{Build, DefinitionRef, min_time};
use super::discovery::{Project, ProjectFilter, discover_projects};
use super::{Collection, Collector, CollectorError, duration_secs, fan_out, parse_time};

/// Release stage states that end a deployment.
const FINISHED_STAGES: &[&str] = &["succeeded", "partiallySucceeded", "rejected", "canceled"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Release {
    #[serde(default)]
    release_definition: DefinitionRef,
    #[serde(default)]
    environments: Vec<Stage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stage {
    #[serde(default)]
    name: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    modified_on: Option<String>,
    /// Minutes.
    #[serde(default)]
    time_to_deploy: Option<f64>,
}

/// Count plus summed duration of the observations of one label set.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Aggregate {
    count: u64,
    seconds: f64,
    timed: u64,
}

impl Aggregate {
    fn observe(&mut self, seconds: Option<f64>) {
        self.count += 1;
        if let Some(seconds) = seconds {
            self.seconds += seconds;
            self.timed += 1;
        }
    }
}

/// Success ratio accumulator.
#[derive(Debug, Default, Clone, Copy)]
struct Ratio {
    hits: u64,
    total: u64,
}

impl Ratio {
    fn observe(&mut self, hit: bool) {
        self.total += 1;
        if hit {
            self.hits += 1;
        }
    }

    fn value(self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.hits as f64 / self.total as f64
        }
    }
}

/// Aggregates of one project.
#[derive(Debug, Default)]
struct ProjectStats {
    /// By result.
    builds: BTreeMap<String, Aggregate>,
    /// Queue wait by result.
    build_wait: BTreeMap<String, Aggregate>,
    /// Run time by (definition id, result).
    build_duration: BTreeMap<(i64, String), Aggregate>,
    /// By definition id.
    build_success: BTreeMap<i64, Ratio>,
    /// By stage status.
    stages: BTreeMap<String, Aggregate>,
    /// Deploy time by (definition id, stage name, status).
    stage_duration: BTreeMap<(i64, String, String), Aggregate>,
    /// By (definition id, stage name).
    stage_success: BTreeMap<(i64, String), Ratio>,
}

impl ProjectStats {
    fn add_build(&mut self, build: &Build) {
        let result = build.result.clone().unwrap_or_default();
        let queued = parse_time(build.queue_time.as_deref());
        let started = parse_time(build.start_time.as_deref());
        let finished = parse_time(build.finish_time.as_deref());

        self.builds.entry(result.clone()).or_default().observe(None);
        self.build_wait
            .entry(result.clone())
            .or_default()
            .observe(duration_secs(queued, started));
        self.build_duration
            .entry((build.definition.id, result.clone()))
            .or_default()
            .observe(duration_secs(started, finished));
        self.build_success
            .entry(build.definition.id)
            .or_default()
            .observe(result == "succeeded");
    }

    fn add_stage(&mut self, definition: i64, stage: &Stage) {
        let status = stage.status.clone().unwrap_or_default();
        let seconds = stage.time_to_deploy.map(|minutes| minutes * 60.0);

        self.stages.entry(status.clone()).or_default().observe(None);
        self.stage_duration
            .entry((definition, stage.name.clone(), status.clone()))
            .or_default()
            .observe(seconds);
        self.stage_success
            .entry((definition, stage.name.clone()))
            .or_default()
            .observe(status == "succeeded");
    }

    fn record(&self, snapshot: &mut MetricSnapshot, project: &Project) {
        let base = || Labels::new().with("projectID", &project.id);

        let family = snapshot.gauge(
            "azure_devops_stats_project_builds",
            "Builds finished within the summary window, by result",
        );
        for (result, agg) in &self.builds {
            family.add(base().with("result", result), agg.count as f64);
        }

        for (result, agg) in &self.build_wait {
            let labels = base().with("result", result);
            snapshot
                .gauge(
                    "azure_devops_stats_project_builds_wait_seconds_sum",
                    "Total queue wait of finished builds, by result",
                )
                .add(labels.clone(), agg.seconds);
            snapshot
                .gauge(
                    "azure_devops_stats_project_builds_wait_seconds_count",
                    "Finished builds with a known queue wait, by result",
                )
                .add(labels, agg.timed as f64);
        }

        for ((definition, result), agg) in &self.build_duration {
            let labels = base()
                .with("buildDefinitionID", definition)
                .with("result", result);
            snapshot
                .gauge(
                    "azure_devops_stats_project_builds_duration_seconds_sum",
                    "Total run time of finished builds, by definition and result",
                )
                .add(labels.clone(), agg.seconds);
            snapshot
                .gauge(
                    "azure_devops_stats_project_builds_duration_seconds_count",
                    "Finished builds with a known run time, by definition and result",
                )
                .add(labels, agg.timed as f64);
        }

        let family = snapshot.gauge(
            "azure_devops_stats_project_builds_success",
            "Share of finished builds that succeeded, by definition",
        );
        for (definition, ratio) in &self.build_success {
            family.add(base().with("buildDefinitionID", definition), ratio.value());
        }

        let family = snapshot.gauge(
            "azure_devops_stats_project_release_stages",
            "Release stages finished within the summary window, by status",
        );
        for (status, agg) in &self.stages {
            family.add(base().with("status", status), agg.count as f64);
        }

        for ((definition, stage, status), agg) in &self.stage_duration {
            let labels = base()
                .with("releaseDefinitionID", definition)
                .with("environmentName", stage)
                .with("status", status);
            snapshot
                .gauge(
                    "azure_devops_stats_project_release_duration_seconds_sum",
                    "Total deploy time of finished release stages",
                )
                .add(labels.clone(), agg.seconds);
            snapshot
                .gauge(
                    "azure_devops_stats_project_release_duration_seconds_count",
                    "Finished release stages with a known deploy time",
                )
                .add(labels, agg.timed as f64);
        }

        let family = snapshot.gauge(
            "azure_devops_stats_project_release_success",
            "Share of finished release stages that succeeded",
        );
        for ((definition, stage), ratio) in &self.stage_success {
            family.add(
                base()
                    .with("releaseDefinitionID", definition)
                    .with("environmentName", stage),
                ratio.value(),
            );
        }
    }
}

/// Build and release aggregates per project over the summary window.
pub struct StatsCollector {
    filter: ProjectFilter,
    limits: LimitsConfig,
    window: Duration,
}

impl StatsCollector {
    /// Create the collector aggregating over `window`.
    pub fn new(filter: ProjectFilter, limits: LimitsConfig, window: Duration) -> Self {
        Self {
            filter,
            limits,
            window,
        }
    }

    fn since(&self) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.window)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
    }
}

async fn fetch_project(
    client: &DevOpsClient,
    project: &Project,
    limits: &LimitsConfig,
    window: Duration,
) -> Result<(Vec<Build>, Vec<Release>), ApiError> {
    let since = min_time(window);
    let builds = client.list(
        ApiRequest::get(format!("{}/_apis/build/builds", project.id))
            .query("minTime", &since)
            .query("statusFilter", "completed")
            .query("queryOrder", "finishTimeDescending")
            .query("$top", limits.builds_per_project),
        limits.builds_per_project,
    );
    let releases = client.list(
        ApiRequest::release(format!("{}/_apis/release/releases", project.id))
            .query("minCreatedTime", &since)
            .query("$expand", "environments")
            .query("$top", limits.releases_per_project),
        limits.releases_per_project,
    );
    tokio::try_join!(builds, releases)
}

fn within(at: Option<DateTime<Utc>>, since: Option<DateTime<Utc>>) -> bool {
    match (at, since) {
        (Some(at), Some(since)) => at >= since,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

#[async_trait::async_trait]
impl Collector for StatsCollector {
    fn name(&self) -> &str {
        "Stats"
    }

    async fn collect(&self, client: &DevOpsClient) -> Result<Collection, CollectorError> {
        let projects = discover_projects(client, &self.filter).await?;
        let since = self.since();

        let mut collection = Collection::new();
        let results = fan_out(&projects, |project| {
            fetch_project(client, project, &self.limits, self.window)
        })
        .await;
        for (project, result) in results {
            let (builds, releases) = match result {
                Ok(fetched) => fetched,
                Err(e) => {
                    collection.fail(format_args!("project {}", project.name), e);
                    continue;
                }
            };

            let mut stats = ProjectStats::default();
            for build in &builds {
                if within(parse_time(build.finish_time.as_deref()), since) {
                    stats.add_build(build);
                }
            }
            for release in &releases {
                let finished = release.environments.iter().filter(|stage| {
                    stage
                        .status
                        .as_deref()
                        .is_some_and(|status| FINISHED_STAGES.contains(&status))
                        && within(parse_time(stage.modified_on.as_deref()), since)
                });
                for stage in finished {
                    stats.add_stage(release.release_definition.id, stage);
                }
            }
            stats.record(&mut collection.snapshot, project);
        }

        collection.finish(projects.len())
    }
}
