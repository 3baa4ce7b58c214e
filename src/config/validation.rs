//! Configuration errors and value parsers shared by the file and CLI layers.

use std::sync::LazyLock;
use std::time::Duration;

use regex::{Captures, Regex};
use thiserror::Error;
use uuid::Uuid;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse configuration YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A value was present but unusable. Startup aborts with exit code 1.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A work item query reference in the form `<query UUID>@<project UUID>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryRef {
    /// Saved query id.
    pub query_id: Uuid,
    /// Project the query belongs to.
    pub project_id: Uuid,
}

impl std::str::FromStr for QueryRef {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || {
            ConfigError::Invalid(format!(
                "query path '{s}' is malformed; should be '<query UUID>@<project UUID>'"
            ))
        };

        let mut parts = s.split('@');
        let (Some(query), Some(project), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(malformed());
        };

        let query_id = Uuid::parse_str(query.trim()).map_err(|_| malformed())?;
        let project_id = Uuid::parse_str(project.trim()).map_err(|_| malformed())?;

        Ok(Self {
            query_id,
            project_id,
        })
    }
}

impl std::fmt::Display for QueryRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.query_id, self.project_id)
    }
}

/// Parse every query reference, collecting all malformed entries into one error.
pub fn parse_queries(queries: &[String]) -> Result<Vec<QueryRef>, ConfigError> {
    let mut parsed = Vec::with_capacity(queries.len());
    let mut errors = Vec::new();

    for query in queries {
        match query.parse::<QueryRef>() {
            Ok(q) => parsed.push(q),
            Err(e) => errors.push(e.to_string()),
        }
    }

    if errors.is_empty() {
        Ok(parsed)
    } else {
        Err(ConfigError::Invalid(errors.join("\n")))
    }
}

/// Parse an interval such as `15m`, `1h30m` or `90s`.
///
/// A bare `0` is accepted and means "disabled"; any other value needs a unit.
///
/// ```
/// use devops_exporter::config::parse_duration;
///
/// assert_eq!(parse_duration("1h30m").unwrap().as_secs(), 5400);
/// assert!(parse_duration("0").unwrap().is_zero());
/// ```
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    match s.trim() {
        "" => Err("empty interval".to_string()),
        "0" => Ok(Duration::ZERO),
        value => humantime::parse_duration(value).map_err(|e| format!("'{value}': {e}")),
    }
}

static ENV_REFERENCE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").ok());

/// Substitute `${NAME}` and `${NAME:-fallback}` references in raw config text.
///
/// Unset variables without a fallback expand to an empty string so the YAML
/// layer reports the missing value, not this one.
pub fn expand_env_vars(input: &str) -> String {
    let Some(pattern) = ENV_REFERENCE.as_ref() else {
        return input.to_string();
    };
    pattern
        .replace_all(input, |caps: &Captures| {
            std::env::var(&caps[1])
                .ok()
                .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))
                .unwrap_or_default()
        })
        .into_owned()
}
