//! Error types shared by every crate in the workspace.

use thiserror::Error;

use crate::models::credentials::DataSourceType;

/// Result alias used across the workspace.
pub type AppResult<T> = Result<T, AppError>;

/// Errors raised by the router, the adapter factory and the adapters.
#[derive(Debug, Error)]
pub enum AppError {
    /// Invalid router setup (duplicate names in the initial list, etc.).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Request named a data source that is not registered.
    #[error("Specified data source '{0}' not found")]
    DataSourceNotFound(String),

    /// The configured default points at a data source that is not registered.
    #[error("Default data source '{0}' not found")]
    DefaultDataSourceNotFound(String),

    /// A data source with the same name is already registered.
    #[error("Data source with name '{0}' already exists")]
    DataSourceExists(String),

    /// Resolution could not pick a target.
    #[error(
        "No data source specified in request and no default data source configured. \
         Available data sources: [{}]",
        .available.join(", ")
    )]
    NoDataSourceSpecified { available: Vec<String> },

    /// Input failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown backend type tag.
    #[error("Unsupported data source type: {0}")]
    UnsupportedDataSourceType(String),

    /// Credential tag does not match the adapter it was handed to.
    #[error("Invalid credentials: expected {expected} credentials, got {actual}")]
    CredentialValidation {
        expected: DataSourceType,
        actual: DataSourceType,
    },

    /// Connecting or authenticating to a backend failed.
    #[error("{backend} connection failed: {message}")]
    Connection {
        backend: &'static str,
        message: String,
    },

    /// A statement failed on the backend.
    #[error("{backend} query failed: {message}")]
    QueryExecution {
        backend: &'static str,
        message: String,
    },

    /// Adapter used before `initialize` or after `close`.
    #[error("{backend} adapter is not connected")]
    NotConnected { backend: &'static str },

    /// The factory could not build an initialized adapter.
    #[error("Failed to create {data_source_type} adapter: {source}")]
    AdapterCreation {
        data_source_type: DataSourceType,
        #[source]
        source: Box<AppError>,
    },

    /// The router-level deadline elapsed before the backend answered.
    #[error("Query timed out after {timeout_ms}ms")]
    QueryTimeout { timeout_ms: u64 },
}

impl AppError {
    /// Builds a connection error for `backend`.
    pub fn connection(backend: &'static str, message: impl ToString) -> Self {
        Self::Connection {
            backend,
            message: message.to_string(),
        }
    }

    /// Builds a query execution error for `backend`.
    pub fn query(backend: &'static str, message: impl ToString) -> Self {
        Self::QueryExecution {
            backend,
            message: message.to_string(),
        }
    }

    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::DataSourceNotFound(_) | AppError::DefaultDataSourceNotFound(_) => {
                "DATA_SOURCE_NOT_FOUND"
            }
            AppError::DataSourceExists(_) => "DATA_SOURCE_EXISTS",
            AppError::NoDataSourceSpecified { .. } => "NO_DATA_SOURCE_SPECIFIED",
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::UnsupportedDataSourceType(_) => "UNSUPPORTED_DATA_SOURCE_TYPE",
            AppError::CredentialValidation { .. } => "CREDENTIAL_VALIDATION_ERROR",
            AppError::Connection { .. } => "CONNECTION_ERROR",
            AppError::QueryExecution { .. } => "QUERY_EXECUTION_ERROR",
            AppError::NotConnected { .. } => "NOT_CONNECTED",
            AppError::AdapterCreation { .. } => "ADAPTER_CREATION_ERROR",
            AppError::QueryTimeout { .. } => "QUERY_TIMEOUT",
        }
    }

    /// Whether the error stems from a caller mistake rather than a backend failure.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            AppError::Configuration(_)
                | AppError::DataSourceNotFound(_)
                | AppError::DefaultDataSourceNotFound(_)
                | AppError::DataSourceExists(_)
                | AppError::NoDataSourceSpecified { .. }
                | AppError::Validation(_)
        )
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        AppError::Validation(errors.to_string())
    }
}
