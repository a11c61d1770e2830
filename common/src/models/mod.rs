//! Shared data models.

pub mod credentials;
pub mod data_source;
pub mod query;

// Re-export commonly used types
pub use credentials::{
    BigQueryCredentials, Credentials, DataSourceType, MySqlCredentials, PostgresCredentials,
    RedshiftCredentials, SnowflakeCredentials, SqlServerCredentials, SslOptions, SslSetting,
};
pub use data_source::{DataSourceConfig, DataSourceUpdate};
pub use query::{
    AdapterQueryResult, ColumnInfo, QueryError, QueryOptions, QueryRequest, QueryResult, Row,
    QUERY_EXECUTION_ERROR,
};
