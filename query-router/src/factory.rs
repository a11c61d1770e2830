//! Adapter factory.
//!
//! The only place that maps a backend type to a concrete adapter.

use std::sync::Arc;

use async_trait::async_trait;

use common::config::RouterConfig;
use common::errors::{AppError, AppResult};
use common::models::Credentials;

use crate::adapter::{AdapterOptions, DatabaseAdapter};
use crate::adapters::{
    BigQueryAdapter, MySqlAdapter, PostgresAdapter, RedshiftAdapter, SnowflakeAdapter,
    SqlServerAdapter,
};

/// Builds connected adapters from credentials.
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    /// Returns an initialized adapter for `credentials`.
    async fn create_adapter(&self, credentials: &Credentials) -> AppResult<Arc<dyn DatabaseAdapter>>;
}

/// Factory for the built-in backends.
#[derive(Debug, Clone, Default)]
pub struct DefaultAdapterFactory {
    options: AdapterOptions,
}

impl DefaultAdapterFactory {
    pub fn new(options: AdapterOptions) -> Self {
        Self { options }
    }

    /// Factory using the driver settings of `config`.
    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(AdapterOptions::from(config))
    }

    fn build(&self, credentials: &Credentials) -> Arc<dyn DatabaseAdapter> {
        let options = self.options.clone();
        match credentials {
            Credentials::Postgres(_) => Arc::new(PostgresAdapter::new(options)),
            Credentials::Redshift(_) => Arc::new(RedshiftAdapter::new(options)),
            Credentials::MySql(_) => Arc::new(MySqlAdapter::new(options)),
            Credentials::BigQuery(_) => Arc::new(BigQueryAdapter::new(options)),
            Credentials::Snowflake(_) => Arc::new(SnowflakeAdapter::new(options)),
            Credentials::SqlServer(_) => Arc::new(SqlServerAdapter::new(options)),
        }
    }
}

#[async_trait]
impl AdapterFactory for DefaultAdapterFactory {
    async fn create_adapter(&self, credentials: &Credentials) -> AppResult<Arc<dyn DatabaseAdapter>> {
        let data_source_type = credentials.data_source_type();
        let adapter = self.build(credentials);

        if let Err(e) = adapter.initialize(credentials).await {
            tracing::warn!(
                %data_source_type,
                code = e.code(),
                error = %e,
                "Adapter initialization failed"
            );
            return Err(AppError::AdapterCreation {
                data_source_type,
                source: Box::new(e),
            });
        }

        tracing::info!(%data_source_type, "Adapter created");
        Ok(adapter)
    }
}
