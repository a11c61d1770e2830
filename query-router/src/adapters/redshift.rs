//! Amazon Redshift adapter.
//!
//! Redshift speaks the Postgres wire protocol; this adapter reuses the Postgres
//! pool with Redshift defaults (port 5439, TLS required).

use async_trait::async_trait;
use serde_json::Value;

use common::errors::AppResult;
use common::models::{AdapterQueryResult, Credentials, DataSourceType};

use crate::adapter::{credential_mismatch, AdapterOptions, DatabaseAdapter};
use crate::adapters::postgres::{PgBackend, PgTarget};

/// Redshift adapter.
pub struct RedshiftAdapter {
    inner: PgBackend,
}

impl RedshiftAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self {
            inner: PgBackend::new(DataSourceType::Redshift, options),
        }
    }
}

#[async_trait]
impl DatabaseAdapter for RedshiftAdapter {
    async fn initialize(&self, credentials: &Credentials) -> AppResult<()> {
        let Credentials::Redshift(creds) = credentials else {
            return Err(credential_mismatch(DataSourceType::Redshift, credentials));
        };
        if let Some(cluster) = &creds.cluster_identifier {
            tracing::debug!(cluster = %cluster, "Connecting to Redshift cluster");
        }
        self.inner.connect(PgTarget::from(creds)).await
    }

    async fn query(&self, sql: &str, params: &[Value]) -> AppResult<AdapterQueryResult> {
        self.inner.query(sql, params).await
    }

    async fn test_connection(&self) -> AppResult<bool> {
        self.inner.test_connection().await
    }

    async fn close(&self) -> AppResult<()> {
        self.inner.close().await;
        Ok(())
    }

    fn data_source_type(&self) -> DataSourceType {
        DataSourceType::Redshift
    }
}
