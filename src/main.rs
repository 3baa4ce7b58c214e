//! Azure DevOps exporter binary entry point.
//!
//! Core functionality is provided by the `devops_exporter` library crate.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use devops_exporter::{
    AppConfig, ConfigError, ConfigFingerprint, FileCacheStore, MetricRegistry, Runtime,
    collector::catalog, config::parse_duration, server::create_router,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Prometheus exporter for Azure DevOps
#[derive(Parser, Debug)]
#[command(name = "devops-exporter", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "DEVOPS_EXPORTER_CONFIG")]
    config: Option<PathBuf>,

    /// Server bind address (overrides config file)
    #[arg(long, env = "DEVOPS_EXPORTER_SERVER_BIND")]
    server_bind: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, env = "DEVOPS_EXPORTER_SERVER_PORT")]
    server_port: Option<u16>,

    /// Azure DevOps organization
    #[arg(long, env = "AZURE_DEVOPS_ORGANISATION")]
    organisation: Option<String>,

    /// Azure DevOps URL, only needed for on-premises servers
    #[arg(long, env = "AZURE_DEVOPS_URL")]
    url: Option<String>,

    /// REST API version
    #[arg(long, env = "AZURE_DEVOPS_APIVERSION")]
    api_version: Option<String>,

    /// Personal access token
    #[arg(long, env = "AZURE_DEVOPS_ACCESS_TOKEN", hide_env_values = true)]
    access_token: Option<String>,

    /// File holding the personal access token
    #[arg(long, env = "AZURE_DEVOPS_ACCESS_TOKEN_FILE")]
    access_token_file: Option<PathBuf>,

    /// Service principal tenant id
    #[arg(long, env = "AZURE_TENANT_ID")]
    tenant_id: Option<String>,

    /// Service principal client id
    #[arg(long, env = "AZURE_CLIENT_ID")]
    client_id: Option<String>,

    /// Service principal client secret
    #[arg(long, env = "AZURE_CLIENT_SECRET", hide_env_values = true)]
    client_secret: Option<String>,

    /// Only collect these projects (ids or names)
    #[arg(long, env = "AZURE_DEVOPS_FILTER_PROJECT", value_delimiter = ' ')]
    filter_project: Vec<String>,

    /// Never collect these projects (ids or names)
    #[arg(long, env = "AZURE_DEVOPS_BLACKLIST_PROJECT", value_delimiter = ' ')]
    blacklist_project: Vec<String>,

    /// Only collect these agent pool ids
    #[arg(long, env = "AZURE_DEVOPS_AGENTPOOL", value_delimiter = ' ')]
    agentpool: Vec<i64>,

    /// Work item queries as `<query UUID>@<project UUID>`
    #[arg(long, env = "AZURE_DEVOPS_QUERIES", value_delimiter = ' ')]
    query: Vec<String>,

    /// Default scrape interval, `0` disables every collector without an override
    #[arg(long, env = "SCRAPE_TIME", value_parser = parse_duration)]
    scrape_interval: Option<Duration>,

    /// Window of the build and release statistics (default: the stats interval)
    #[arg(long, env = "STATS_SUMMARY_MAX_AGE", value_parser = parse_duration)]
    stats_summary_max_age: Option<Duration>,

    /// Directory holding the collector caches
    #[arg(long, env = "CACHE_PATH")]
    cache_path: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Cli {
    /// Load the config file, if any, and apply overrides (CLI > ENV > config file).
    fn into_config(self) -> Result<AppConfig, ConfigError> {
        let mut config = match self.config {
            Some(ref path) => {
                tracing::info!(path = %path.display(), "Loading configuration");
                AppConfig::load(path)?
            }
            None => AppConfig::default(),
        };

        if let Some(bind) = self.server_bind {
            config.server.bind = bind;
        }
        if let Some(port) = self.server_port {
            config.server.port = port;
        }

        let devops = &mut config.devops;
        if let Some(organisation) = self.organisation {
            devops.organisation = organisation;
        }
        if self.url.is_some() {
            devops.url = self.url;
        }
        if let Some(api_version) = self.api_version {
            devops.api_version = api_version;
        }
        if self.access_token.is_some() {
            devops.access_token = self.access_token;
        }
        if self.access_token_file.is_some() {
            devops.access_token_file = self.access_token_file;
        }
        if self.tenant_id.is_some() {
            devops.tenant_id = self.tenant_id;
        }
        if self.client_id.is_some() {
            devops.client_id = self.client_id;
        }
        if self.client_secret.is_some() {
            devops.client_secret = self.client_secret;
        }
        if !self.filter_project.is_empty() {
            devops.projects = self.filter_project;
        }
        if !self.blacklist_project.is_empty() {
            devops.exclude_projects = self.blacklist_project;
        }
        if !self.agentpool.is_empty() {
            devops.agent_pools = self.agentpool;
        }
        if !self.query.is_empty() {
            devops.queries = self.query;
        }

        if let Some(interval) = self.scrape_interval {
            config.scrape.interval = interval;
        }
        if self.stats_summary_max_age.is_some() {
            config.stats.summary_max_age = self.stats_summary_max_age;
        }
        if let Some(path) = self.cache_path {
            config.cache.path = path;
        }

        config.finalize()?;
        Ok(config)
    }
}

fn init_tracing(json: bool) {
    let (plain, json) = if json {
        (None, Some(tracing_subscriber::fmt::layer().json()))
    } else {
        (Some(tracing_subscriber::fmt::layer()), None)
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,devops_exporter=debug".into()),
        )
        .with(plain)
        .with(json)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_tracing(cli.log_json);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Azure DevOps exporter");

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Exporter failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let client = devops_exporter::client_from_config(&config).await?;

    let registry = Arc::new(MetricRegistry::new()?);
    let fingerprint = ConfigFingerprint::from_config(&config);
    tracing::info!(
        path = %config.cache.path.display(),
        fingerprint = %fingerprint,
        "Using snapshot cache"
    );

    let runtime = Runtime::new(
        client,
        Arc::clone(&registry),
        Arc::new(FileCacheStore::new(&config.cache.path)),
        fingerprint,
    )
    .await?;
    for (spec, collector) in catalog(&config)? {
        runtime.register(spec, collector).await?;
    }

    // Bind before the first tick so a port conflict fails fast.
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    runtime.start().await?;

    tracing::info!("Metrics server listening on: http://{}", addr);
    tracing::info!("Press Ctrl+C to shutdown");

    axum::serve(listener, create_router(registry))
        .with_graceful_shutdown(shutdown_signal(runtime))
        .await?;
    Ok(())
}

/// Setup graceful shutdown signal handler.
async fn shutdown_signal(runtime: Runtime) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    tracing::info!("Shutting down collectors...");
    if let Err(e) = runtime.shutdown().await {
        tracing::error!(error = %e, "Failed to shutdown collectors");
    }
}
