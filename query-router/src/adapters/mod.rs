//! Backend adapters.

mod sqlx_support;

pub mod bigquery;
pub mod mysql;
pub mod postgres;
pub mod redshift;
pub mod snowflake;
pub mod sqlserver;

pub use bigquery::BigQueryAdapter;
pub use mysql::MySqlAdapter;
pub use postgres::PostgresAdapter;
pub use redshift::RedshiftAdapter;
pub use snowflake::SnowflakeAdapter;
pub use sqlserver::SqlServerAdapter;
