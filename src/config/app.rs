//! Application configuration structures.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::client::{BackoffStrategy, Credentials, RetryPolicy, ServicePrincipal};

use super::validation::{ConfigError, QueryRef, expand_env_vars, parse_queries};

// =============================================================================
// Constants
// =============================================================================

/// Default scrape interval shared by every collector without an override (30 minutes).
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Default Azure DevOps REST API version.
pub const DEFAULT_API_VERSION: &str = "7.1";

/// Default number of concurrent outbound requests.
pub const DEFAULT_CONCURRENCY_LIMIT: usize = 10;

/// Default number of retries after the first attempt.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default per-attempt request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default history window for builds and releases (48 hours).
pub const DEFAULT_HISTORY: Duration = Duration::from_secs(48 * 60 * 60);

/// Environment variable replaced by `AZURE_DEVOPS_AGENTPOOL`.
pub const DEPRECATED_AGENTPOOL_ENV: &str = "AZURE_DEVOPS_FILTER_AGENTPOOL";

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

fn default_concurrency_limit() -> usize {
    DEFAULT_CONCURRENCY_LIMIT
}

fn default_retries() -> u32 {
    DEFAULT_RETRIES
}

fn default_request_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

fn default_interval() -> Duration {
    DEFAULT_INTERVAL
}

fn default_history() -> Duration {
    DEFAULT_HISTORY
}

fn default_backoff_initial() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(10)
}

// =============================================================================
// Server Configuration
// =============================================================================

/// Web server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server bind address (default: "0.0.0.0").
    pub bind: String,

    /// Server port (default: 8080).
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

// =============================================================================
// Azure DevOps Configuration
// =============================================================================

/// Remote organization, credentials and filters.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevOpsConfig {
    /// Organization name.
    pub organisation: String,

    /// Server URL for on-premises installations (default: Azure DevOps Services).
    pub url: Option<String>,

    /// REST API version sent with every request.
    #[serde(default = "default_api_version")]
    pub api_version: String,

    /// Personal access token.
    pub access_token: Option<String>,

    /// File holding the personal access token.
    pub access_token_file: Option<PathBuf>,

    /// Service principal tenant id.
    pub tenant_id: Option<String>,

    /// Service principal client id.
    pub client_id: Option<String>,

    /// Service principal client secret.
    pub client_secret: Option<String>,

    /// Only collect these projects (ids or names). Empty means all.
    pub projects: Vec<String>,

    /// Never collect these projects (ids or names).
    pub exclude_projects: Vec<String>,

    /// Only collect these agent pool ids. Empty means all.
    pub agent_pools: Vec<i64>,

    /// Work item queries, `<query UUID>@<project UUID>`.
    pub queries: Vec<String>,
}

impl std::fmt::Debug for DevOpsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevOpsConfig")
            .field("organisation", &self.organisation)
            .field("url", &self.url)
            .field("api_version", &self.api_version)
            .field("access_token", &self.access_token.as_ref().map(|_| "***"))
            .field("access_token_file", &self.access_token_file)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &self.client_secret.as_ref().map(|_| "***"))
            .field("projects", &self.projects)
            .field("exclude_projects", &self.exclude_projects)
            .field("agent_pools", &self.agent_pools)
            .field("queries", &self.queries)
            .finish()
    }
}

impl DevOpsConfig {
    /// Resolve the single active authentication mode.
    ///
    /// A personal access token wins over service principal settings.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if neither a token nor the full
    /// tenant id, client id and client secret triple is present.
    pub fn credentials(&self) -> Result<Credentials, ConfigError> {
        if let Some(token) = non_empty(&self.access_token) {
            return Ok(Credentials::AccessToken(token.to_string()));
        }

        match (
            non_empty(&self.tenant_id),
            non_empty(&self.client_id),
            non_empty(&self.client_secret),
        ) {
            (Some(tenant), Some(client), Some(secret)) => Ok(Credentials::ServicePrincipal(
                ServicePrincipal::new(tenant, client, secret),
            )),
            _ => Err(ConfigError::Invalid(
                "neither an Azure DevOps access token nor service principal credentials \
                 (tenant id, client id, client secret) have been provided"
                    .to_string(),
            )),
        }
    }

    /// Parsed work item queries.
    pub fn parsed_queries(&self) -> Result<Vec<QueryRef>, ConfigError> {
        parse_queries(&self.queries)
    }

    /// Replace `access_token` with the trimmed contents of `access_token_file`, if set.
    fn load_access_token_file(&mut self) -> Result<(), ConfigError> {
        let Some(path) = self.access_token_file.as_ref() else {
            return Ok(());
        };

        tracing::info!(path = %path.display(), "Reading access token from file");
        let token = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::Invalid(format!(
                "unable to read access token file '{}': {}",
                path.display(),
                e
            ))
        })?;
        self.access_token = Some(token.trim().to_string());
        Ok(())
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

// =============================================================================
// Request Configuration
// =============================================================================

/// Outbound request budget and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Maximum concurrent requests across all collectors.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    /// Retries after the first attempt of a logical request.
    #[serde(default = "default_retries")]
    pub retries: u32,

    /// Per-attempt timeout.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Delay between attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            retries: DEFAULT_RETRIES,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            backoff: BackoffConfig::default(),
        }
    }
}

impl RequestConfig {
    /// Retry policy for the API client.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            strategy: self.backoff.strategy,
            initial: self.backoff.initial,
            max: self.backoff.max,
        }
    }
}

/// Backoff between retry attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// `fixed` or `exponential` (default).
    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// First delay (default: 500ms).
    #[serde(default = "default_backoff_initial", with = "humantime_serde")]
    pub initial: Duration,

    /// Delay cap (default: 10s).
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::default(),
            initial: default_backoff_initial(),
            max: default_backoff_max(),
        }
    }
}

// =============================================================================
// Limits Configuration
// =============================================================================

/// Result-count ceilings per resource kind and history windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Projects returned by discovery.
    pub project: usize,
    /// Builds fetched per project.
    pub builds_per_project: usize,
    /// Builds fetched per build definition.
    pub builds_per_definition: usize,
    /// Releases fetched per release definition.
    pub releases_per_definition: usize,
    /// Releases fetched per project, across all definitions.
    pub releases_per_project: usize,
    /// Deployments fetched per release definition.
    pub deployments_per_definition: usize,
    /// Release definitions fetched per project.
    pub release_definitions_per_project: usize,
    /// Only builds queued within this window are fetched.
    #[serde(default = "default_history", with = "humantime_serde")]
    pub build_history: Duration,
    /// Only releases created within this window are fetched.
    #[serde(default = "default_history", with = "humantime_serde")]
    pub release_history: Duration,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            project: 100,
            builds_per_project: 100,
            builds_per_definition: 10,
            releases_per_definition: 100,
            releases_per_project: 100,
            deployments_per_definition: 100,
            release_definitions_per_project: 100,
            build_history: DEFAULT_HISTORY,
            release_history: DEFAULT_HISTORY,
        }
    }
}

impl LimitsConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let counts = [
            ("project", self.project),
            ("builds_per_project", self.builds_per_project),
            ("builds_per_definition", self.builds_per_definition),
            ("releases_per_definition", self.releases_per_definition),
            ("releases_per_project", self.releases_per_project),
            ("deployments_per_definition", self.deployments_per_definition),
            (
                "release_definitions_per_project",
                self.release_definitions_per_project,
            ),
        ];

        for (name, value) in counts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "limits.{name} must be positive"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Scrape Configuration
// =============================================================================

/// Collection intervals. A zero interval disables the collector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Default interval for every collector (default: 30m).
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Project collector.
    #[serde(default, with = "humantime_serde")]
    pub projects: Option<Duration>,

    /// Agent pool collector.
    #[serde(default, with = "humantime_serde")]
    pub agent_pools: Option<Duration>,

    /// Repository collector.
    #[serde(default, with = "humantime_serde")]
    pub repository: Option<Duration>,

    /// Pull request collector.
    #[serde(default, with = "humantime_serde")]
    pub pull_request: Option<Duration>,

    /// Build and latest build collectors.
    #[serde(default, with = "humantime_serde")]
    pub build: Option<Duration>,

    /// Release collector.
    #[serde(default, with = "humantime_serde")]
    pub release: Option<Duration>,

    /// Deployment collector.
    #[serde(default, with = "humantime_serde")]
    pub deployment: Option<Duration>,

    /// Resource usage collector.
    #[serde(default, with = "humantime_serde")]
    pub resource_usage: Option<Duration>,

    /// Work item query collector.
    #[serde(default, with = "humantime_serde")]
    pub query: Option<Duration>,

    /// Build and release statistics collector.
    #[serde(default, with = "humantime_serde")]
    pub stats: Option<Duration>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            projects: None,
            agent_pools: None,
            repository: None,
            pull_request: None,
            build: None,
            release: None,
            deployment: None,
            resource_usage: None,
            query: None,
            stats: None,
        }
    }
}

impl ScrapeConfig {
    /// Interval for a collector, falling back to the default interval.
    pub fn resolve(&self, specific: Option<Duration>) -> Duration {
        specific.unwrap_or(self.interval)
    }
}

// =============================================================================
// Stats Configuration
// =============================================================================

/// Aggregation settings of the statistics collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Builds and releases finished within this window are aggregated.
    /// Defaults to the statistics collector interval.
    #[serde(default, with = "humantime_serde")]
    pub summary_max_age: Option<Duration>,
}

impl StatsConfig {
    /// Aggregation window, falling back to the stats interval.
    pub fn window(&self, scrape: &ScrapeConfig) -> Duration {
        self.summary_max_age
            .unwrap_or_else(|| scrape.resolve(scrape.stats))
    }
}

// =============================================================================
// Cache Configuration
// =============================================================================

/// On-disk snapshot cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding one file per collector (default: "./cache").
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./cache"),
        }
    }
}

// =============================================================================
// Application Configuration
// =============================================================================

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Web server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Azure DevOps organization, credentials and filters.
    #[serde(default)]
    pub devops: DevOpsConfig,

    /// Outbound request settings.
    #[serde(default)]
    pub request: RequestConfig,

    /// Result-count limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Collector intervals.
    #[serde(default)]
    pub scrape: ScrapeConfig,

    /// Statistics aggregation.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Snapshot cache.
    #[serde(default)]
    pub cache: CacheConfig,
}

impl AppConfig {
    /// Load configuration from a YAML file, expanding `${VAR}` references first.
    ///
    /// The result is not validated; call [`AppConfig::finalize`] after applying
    /// command line overrides.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&expand_env_vars(&content))?;
        Ok(config)
    }

    /// Resolve file-based secrets, reject deprecated settings and validate.
    ///
    /// # Errors
    /// Returns `ConfigError` if anything is missing or malformed.
    pub fn finalize(&mut self) -> Result<(), ConfigError> {
        if std::env::var_os(DEPRECATED_AGENTPOOL_ENV).is_some() {
            return Err(ConfigError::Invalid(format!(
                "deprecated env var {DEPRECATED_AGENTPOOL_ENV} detected, please use AZURE_DEVOPS_AGENTPOOL"
            )));
        }

        self.devops.load_access_token_file()?;
        self.validate()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind.parse::<IpAddr>().map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid server bind address: '{}'",
                self.server.bind
            ))
        })?;

        if self.server.port == 0 {
            return Err(ConfigError::Invalid(
                "server port must be non-zero".to_string(),
            ));
        }

        if self.devops.organisation.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "devops organisation must be set".to_string(),
            ));
        }

        if let Some(ref url) = self.devops.url {
            url::Url::parse(url).map_err(|e| {
                ConfigError::Invalid(format!("invalid devops url '{url}': {e}"))
            })?;
        }

        if self.devops.api_version.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "devops api_version must be set".to_string(),
            ));
        }

        self.devops.credentials()?;
        self.devops.parsed_queries()?;

        if self.request.concurrency_limit == 0 {
            return Err(ConfigError::Invalid(
                "request concurrency_limit must be positive".to_string(),
            ));
        }

        if self.request.timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "request timeout must be positive".to_string(),
            ));
        }

        if self.request.backoff.initial > self.request.backoff.max {
            return Err(ConfigError::Invalid(
                "request backoff initial delay exceeds max delay".to_string(),
            ));
        }

        self.limits.validate()?;

        if self.stats.summary_max_age.is_some_and(|age| age.is_zero()) {
            return Err(ConfigError::Invalid(
                "stats summary_max_age must be positive".to_string(),
            ));
        }

        Ok(())
    }
}
