//! Data source configuration models.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::errors::{AppError, AppResult};
use crate::models::credentials::{Credentials, DataSourceType};

/// A named, configured connection target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Validate)]
#[validate(schema(function = "validate_type_matches_credentials", skip_on_field_errors = false))]
pub struct DataSourceConfig {
    /// Unique registry key.
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    pub name: String,
    /// Backend type; must match `credentials`.
    #[serde(rename = "type")]
    pub data_source_type: DataSourceType,
    /// Backend credentials.
    pub credentials: Credentials,
    /// Free-form extra configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

fn validate_type_matches_credentials(config: &DataSourceConfig) -> Result<(), ValidationError> {
    if config.data_source_type == config.credentials.data_source_type() {
        return Ok(());
    }
    let mut err = ValidationError::new("type_mismatch");
    err.message = Some(
        format!(
            "type '{}' does not match credentials type '{}'",
            config.data_source_type,
            config.credentials.data_source_type()
        )
        .into(),
    );
    Err(err)
}

impl DataSourceConfig {
    /// Creates a config whose type is taken from the credentials.
    pub fn new(name: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            name: name.into(),
            data_source_type: credentials.data_source_type(),
            credentials,
            config: None,
        }
    }

    /// Validates the config, returning an `AppError` on failure.
    pub fn check(&self) -> AppResult<()> {
        self.validate().map_err(AppError::from)
    }

    /// Returns a copy with `update` merged in. The name never changes.
    pub fn merged(&self, update: &DataSourceUpdate) -> Self {
        let mut merged = self.clone();
        if let Some(credentials) = &update.credentials {
            merged.credentials = credentials.clone();
            // The type follows the credentials unless stated explicitly.
            merged.data_source_type = credentials.data_source_type();
        }
        if let Some(data_source_type) = update.data_source_type {
            merged.data_source_type = data_source_type;
        }
        if let Some(config) = &update.config {
            merged.config = Some(config.clone());
        }
        merged
    }
}

/// Partial update for a registered data source.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DataSourceUpdate {
    /// New backend type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub data_source_type: Option<DataSourceType>,
    /// New credentials.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// New extra configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

impl DataSourceUpdate {
    /// Whether applying this update requires a new connection.
    pub fn touches_connection(&self) -> bool {
        self.data_source_type.is_some() || self.credentials.is_some()
    }
}
