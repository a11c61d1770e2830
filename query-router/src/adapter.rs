//! The adapter contract shared by every backend.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use common::config::RouterConfig;
use common::errors::{AppError, AppResult};
use common::models::{AdapterQueryResult, Credentials, DataSourceType};

/// Uniform query contract implemented by each backend.
///
/// Lifecycle: `Uninitialized -> Connected` on a successful [`initialize`],
/// `Connected -> Closed` on [`close`]. [`query`] and [`test_connection`]
/// fail with [`AppError::NotConnected`] outside `Connected`.
///
/// [`initialize`]: DatabaseAdapter::initialize
/// [`close`]: DatabaseAdapter::close
/// [`query`]: DatabaseAdapter::query
/// [`test_connection`]: DatabaseAdapter::test_connection
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Validates `credentials` and connects.
    async fn initialize(&self, credentials: &Credentials) -> AppResult<()>;

    /// Runs one statement with positional parameters.
    async fn query(&self, sql: &str, params: &[Value]) -> AppResult<AdapterQueryResult>;

    /// Checks that the backend answers.
    async fn test_connection(&self) -> AppResult<bool>;

    /// Releases the native resource. Idempotent.
    async fn close(&self) -> AppResult<()>;

    /// Backend type this adapter serves.
    fn data_source_type(&self) -> DataSourceType;

    /// Backend name used to prefix errors.
    fn backend_name(&self) -> &'static str {
        self.data_source_type().display_name()
    }

    /// Rejects credentials tagged for another backend, before any network call.
    fn validate_credentials(&self, credentials: &Credentials) -> AppResult<()> {
        let expected = self.data_source_type();
        if credentials.data_source_type() != expected {
            return Err(credential_mismatch(expected, credentials));
        }
        Ok(())
    }
}

/// Error for `credentials` tagged for a backend other than `expected`.
pub fn credential_mismatch(expected: DataSourceType, credentials: &Credentials) -> AppError {
    AppError::CredentialValidation {
        expected,
        actual: credentials.data_source_type(),
    }
}

/// Returns the live handle or a `NotConnected` error for `backend`.
pub fn ensure_connected<T>(handle: Option<T>, backend: &'static str) -> AppResult<T> {
    handle.ok_or(AppError::NotConnected { backend })
}

/// Driver settings the factory hands to every adapter it builds.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOptions {
    /// Pool size for pooled backends.
    pub max_connections: u32,
    /// Connect timeout used when credentials carry none.
    pub connect_timeout: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self::from(&RouterConfig::default())
    }
}

impl From<&RouterConfig> for AdapterOptions {
    fn from(config: &RouterConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            connect_timeout: config.connect_timeout(),
        }
    }
}

impl AdapterOptions {
    /// Credential-level timeout (milliseconds) if set, else the default.
    pub fn connect_timeout_or(&self, millis: Option<u64>) -> Duration {
        millis.map(Duration::from_millis).unwrap_or(self.connect_timeout)
    }
}
