//! Multi-backend query router.
//!
//! Presents one query-execution interface over several SQL backends:
//! - [`adapter`]: the contract every backend implements
//! - [`adapters`]: PostgreSQL, Redshift, MySQL, BigQuery, Snowflake and SQL Server
//! - [`factory`]: the single dispatch from credentials to an initialized adapter
//! - [`router`]: the registry of named data sources and the `execute` boundary

pub mod adapter;
pub mod adapters;
pub mod factory;
pub mod router;

pub use adapter::DatabaseAdapter;
pub use factory::{AdapterFactory, DefaultAdapterFactory};
pub use router::QueryRouter;

pub use common::config::RouterConfig;
pub use common::errors::{AppError, AppResult};
pub use common::models::{
    Credentials, DataSourceConfig, DataSourceType, DataSourceUpdate, QueryRequest, QueryResult,
};
