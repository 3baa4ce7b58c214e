//! Configuration fingerprints.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::{AppConfig, LimitsConfig};

/// Bumped whenever the snapshot format changes, invalidating every cache file.
pub const CACHE_FORMAT: &str = "v1";

/// Every configuration value that changes what a collector produces.
///
/// Credentials, intervals and server settings are left out: they change how or
/// when data is fetched, not which data.
#[derive(Serialize)]
struct FingerprintInput<'a> {
    format: &'static str,
    organisation: &'a str,
    url: Option<&'a str>,
    api_version: &'a str,
    projects: &'a [String],
    exclude_projects: &'a [String],
    agent_pools: &'a [i64],
    queries: &'a [String],
    limits: &'a LimitsConfig,
    stats_window_secs: u64,
}

/// Hex encoded SHA-256 digest identifying a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigFingerprint(String);

impl ConfigFingerprint {
    /// Derive the fingerprint of `config`.
    pub fn from_config(config: &AppConfig) -> Self {
        let devops = &config.devops;
        let input = FingerprintInput {
            format: CACHE_FORMAT,
            organisation: &devops.organisation,
            url: devops.url.as_deref(),
            api_version: &devops.api_version,
            projects: &devops.projects,
            exclude_projects: &devops.exclude_projects,
            agent_pools: &devops.agent_pools,
            queries: &devops.queries,
            limits: &config.limits,
            stats_window_secs: config.stats.window(&config.scrape).as_secs(),
        };

        // Struct fields serialize in declaration order, so the encoding is stable.
        let canonical = serde_json::to_vec(&input).unwrap_or_default();
        Self(hex::encode(Sha256::digest(&canonical)))
    }

    /// Wrap a stored fingerprint.
    pub fn from_hex(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConfigFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.devops.organisation = "contoso".to_string();
        config.devops.access_token = Some("pat".to_string());
        config
    }

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = ConfigFingerprint::from_config(&config());
        let b = ConfigFingerprint::from_config(&config());
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_output_affecting_fields_change_fingerprint() {
        let base = ConfigFingerprint::from_config(&config());

        let mut changes: Vec<Box<dyn Fn(&mut AppConfig)>> = vec![
            Box::new(|c| c.devops.organisation = "fabrikam".into()),
            Box::new(|c| c.devops.url = Some("https://tfs.example.test".into())),
            Box::new(|c| c.devops.api_version = "6.0".into()),
            Box::new(|c| c.devops.projects = vec!["Website".into()]),
            Box::new(|c| c.devops.exclude_projects = vec!["Legacy".into()]),
            Box::new(|c| c.devops.agent_pools = vec![1]),
            Box::new(|c| c.devops.queries = vec!["a@b".into()]),
            Box::new(|c| c.limits.builds_per_definition = 1),
            Box::new(|c| c.limits.release_history = Duration::from_secs(60)),
            Box::new(|c| c.stats.summary_max_age = Some(Duration::from_secs(60))),
        ];

        for (i, change) in changes.drain(..).enumerate() {
            let mut changed = config();
            change(&mut changed);
            assert_ne!(
                ConfigFingerprint::from_config(&changed),
                base,
                "change #{i} kept the fingerprint"
            );
        }
    }

    #[test]
    fn test_credentials_and_intervals_do_not_change_fingerprint() {
        // The stats window falls back to an interval; pin it so only the
        // intervals themselves change.
        let mut pinned = config();
        pinned.stats.summary_max_age = Some(Duration::from_secs(3600));
        let base = ConfigFingerprint::from_config(&pinned);

        let mut changed = pinned.clone();
        changed.devops.access_token = Some("rotated".into());
        changed.scrape.interval = Duration::from_secs(60);
        changed.request.retries = 9;
        changed.server.port = 9999;

        assert_eq!(ConfigFingerprint::from_config(&changed), base);
    }
}
