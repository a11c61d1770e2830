//! Router settings.
//!
//! Loaded from a best-effort `.env` file and then from `QUERY_ROUTER_*`
//! environment variables, falling back to defaults.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::errors::{AppError, AppResult};
use crate::models::DataSourceConfig;

const ENV_PREFIX: &str = "QUERY_ROUTER_";

/// Router-wide settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterConfig {
    /// Data source used when a request names none.
    pub default_data_source: Option<String>,
    /// Pool size for pooled backends.
    pub max_connections: u32,
    /// Connect / pool acquire timeout in seconds.
    pub connect_timeout_secs: u64,
    /// Router-level query deadline in seconds.
    pub query_timeout_secs: Option<u64>,
    /// Maximum rows returned per query.
    pub max_rows: Option<usize>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_data_source: None,
            max_connections: 5,
            connect_timeout_secs: 30,
            query_timeout_secs: None,
            max_rows: None,
        }
    }
}

impl RouterConfig {
    /// Reads the environment, with `.env` (if present) filling unset variables.
    pub fn load() -> Self {
        Self::load_from(Path::new(".env"))
    }

    /// Like [`RouterConfig::load`] with an explicit `.env` path.
    ///
    /// The file is read into a lookup table; the process environment is
    /// never modified.
    pub fn load_from(path: &Path) -> Self {
        let dotenv = read_dotenv(path);
        Self::from_lookup(|key| std::env::var(key).ok().or_else(|| dotenv.get(key).cloned()))
    }

    /// Reads settings from `QUERY_ROUTER_*` variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads settings through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        Self {
            default_data_source: var("DEFAULT_DATA_SOURCE"),
            max_connections: var("MAX_CONNECTIONS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
            connect_timeout_secs: var("CONNECT_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.connect_timeout_secs),
            query_timeout_secs: var("QUERY_TIMEOUT_SECS").and_then(|v| v.parse().ok()),
            max_rows: var("MAX_ROWS").and_then(|v| v.parse().ok()),
        }
    }

    /// Sets the default data source.
    pub fn with_default_data_source(mut self, name: impl Into<String>) -> Self {
        self.default_data_source = Some(name.into());
        self
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Router-level query deadline, if configured.
    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_secs.map(Duration::from_secs)
    }
}

/// Parses a JSON array of data source configs and validates each entry.
pub fn load_data_sources_from_json(json: &str) -> AppResult<Vec<DataSourceConfig>> {
    let configs: Vec<DataSourceConfig> = serde_json::from_str(json)
        .map_err(|e| AppError::Configuration(format!("Invalid data source document: {}", e)))?;
    for config in &configs {
        config.check()?;
    }
    Ok(configs)
}

/// Reads a `.env` file (best-effort, empty if missing).
fn read_dotenv(path: &Path) -> HashMap<String, String> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_dotenv(&content).into_iter().collect(),
        Err(_) => HashMap::new(),
    }
}

fn parse_dotenv(content: &str) -> Vec<(String, String)> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            (key.trim().to_string(), value.to_string())
        })
        .collect()
}
