//! MySQL adapter.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlRow, MySqlSslMode};
use sqlx::{Executor, MySql, MySqlPool, Row, Statement};
use tokio::sync::RwLock;

use common::errors::{AppError, AppResult};
use common::models::{AdapterQueryResult, Credentials, DataSourceType, MySqlCredentials, SslSetting};

use crate::adapter::{credential_mismatch, ensure_connected, AdapterOptions, DatabaseAdapter};
use crate::adapters::sqlx_support::{
    bind_params, column_info, decode_as, drain, naive_timestamp, raw_text, row_to_json, to_hex,
};

const BACKEND: &str = "MySQL";

/// MySQL adapter backed by a sqlx pool.
pub struct MySqlAdapter {
    options: AdapterOptions,
    pool: RwLock<Option<MySqlPool>>,
}

impl MySqlAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self {
            options,
            pool: RwLock::new(None),
        }
    }

    fn resolve_port(creds: &MySqlCredentials) -> u16 {
        creds
            .port
            .or_else(|| DataSourceType::MySql.default_port())
            .unwrap_or(3306)
    }

    fn ssl_mode(ssl: Option<&SslSetting>) -> MySqlSslMode {
        match ssl {
            None => MySqlSslMode::Preferred,
            Some(SslSetting::Enabled(false)) => MySqlSslMode::Disabled,
            Some(SslSetting::Enabled(true)) => MySqlSslMode::Required,
            Some(SslSetting::Options(opts)) if opts.reject_unauthorized == Some(false) => {
                MySqlSslMode::Required
            }
            Some(SslSetting::Options(_)) => MySqlSslMode::VerifyIdentity,
        }
    }

    fn connect_options(creds: &MySqlCredentials) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&creds.host)
            .port(Self::resolve_port(creds))
            .username(&creds.username)
            .password(&creds.password)
            .ssl_mode(Self::ssl_mode(creds.ssl.as_ref()));

        if let Some(database) = &creds.database {
            options = options.database(database);
        }
        if let Some(SslSetting::Options(opts)) = &creds.ssl {
            if let Some(ca) = &opts.ca {
                options = options.ssl_ca_from_pem(ca.clone().into_bytes());
            }
        }
        options
    }

    async fn pool(&self) -> AppResult<MySqlPool> {
        ensure_connected(self.pool.read().await.clone(), BACKEND)
    }
}

/// Decodes one MySQL column into JSON by its type name.
///
/// Values without a typed decoder come back raw rather than as null.
fn decode_mysql_value(row: &MySqlRow, idx: usize, type_name: &str) -> Value {
    let decoded = match type_name {
        "BOOLEAN" => decode_as(row, idx, Value::Bool),
        "TINYINT" | "SMALLINT" | "MEDIUMINT" | "INT" | "BIGINT" => {
            decode_as(row, idx, |v: i64| Value::from(v))
        }
        name if name.ends_with(" UNSIGNED") => decode_as(row, idx, |v: u64| Value::from(v)),
        "FLOAT" => decode_as(row, idx, |v: f32| Value::from(f64::from(v))),
        "DOUBLE" => decode_as(row, idx, |v: f64| Value::from(v)),
        "DECIMAL" => decode_as(row, idx, |v: rust_decimal::Decimal| Value::String(v.to_string())),
        "JSON" => decode_as(row, idx, |v: Value| v),
        "DATE" => decode_as(row, idx, |v: chrono::NaiveDate| Value::String(v.to_string())),
        "TIME" => decode_as(row, idx, |v: chrono::NaiveTime| Value::String(v.to_string())),
        "DATETIME" => decode_as(row, idx, naive_timestamp),
        "TIMESTAMP" => decode_as(row, idx, |v: chrono::DateTime<chrono::Utc>| {
            Value::String(v.to_rfc3339())
        }),
        "YEAR" => unchecked(row, idx, |v: u16| Value::from(v)),
        "BIT" => unchecked(row, idx, |bits: Vec<u8>| {
            Value::from(bits.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
        }),
        "BINARY" | "VARBINARY" | "TINYBLOB" | "BLOB" | "MEDIUMBLOB" | "LONGBLOB" => {
            decode_as(row, idx, |v: Vec<u8>| Value::String(to_hex(&v)))
        }
        _ => decode_as(row, idx, Value::String),
    };
    decoded
        .or_else(|| unchecked(row, idx, |raw: Vec<u8>| raw_text(&raw)))
        .unwrap_or(Value::Null)
}

/// Decodes without the driver's type compatibility check.
fn unchecked<'r, T>(
    row: &'r MySqlRow,
    idx: usize,
    convert: impl FnOnce(T) -> Value,
) -> Option<Value>
where
    T: sqlx::Decode<'r, MySql>,
{
    match row.try_get_unchecked::<Option<T>, usize>(idx) {
        Ok(value) => Some(value.map(convert).unwrap_or(Value::Null)),
        Err(e) => {
            tracing::warn!(column = idx, error = %e, "Column is not readable");
            None
        }
    }
}

#[async_trait]
impl DatabaseAdapter for MySqlAdapter {
    async fn initialize(&self, credentials: &Credentials) -> AppResult<()> {
        let Credentials::MySql(creds) = credentials else {
            return Err(credential_mismatch(DataSourceType::MySql, credentials));
        };

        let pool = MySqlPoolOptions::new()
            .max_connections(self.options.max_connections)
            .acquire_timeout(self.options.connect_timeout_or(creds.connection_timeout))
            .connect_with(Self::connect_options(creds))
            .await
            .map_err(|e| AppError::connection(BACKEND, e))?;

        let previous = self.pool.write().await.replace(pool);
        if let Some(previous) = previous {
            previous.close().await;
        }
        tracing::info!(backend = BACKEND, host = %creds.host, "Pool created");
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> AppResult<AdapterQueryResult> {
        let pool = self.pool().await?;
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| AppError::connection(BACKEND, e))?;
        let statement = (&mut *conn)
            .prepare(sql)
            .await
            .map_err(|e| AppError::query(BACKEND, e))?;
        let query = bind_params(statement.query(), params);

        // Procedures may answer with result sets and OK packets in one stream.
        let (rows, done) = drain::<MySql>((&mut *conn).fetch_many(query))
            .await
            .map_err(|e| AppError::query(BACKEND, e))?;

        if statement.columns().is_empty() && rows.is_empty() {
            return Ok(AdapterQueryResult::affected(done.rows_affected()));
        }
        let fields = match rows.first() {
            Some(row) if statement.columns().is_empty() => column_info(row.columns()),
            _ => column_info(statement.columns()),
        };
        let rows = rows
            .iter()
            .map(|row| row_to_json(row, decode_mysql_value))
            .collect();
        Ok(AdapterQueryResult::with_rows(rows, fields))
    }

    async fn test_connection(&self) -> AppResult<bool> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| AppError::connection(BACKEND, e))?;
        Ok(true)
    }

    async fn close(&self) -> AppResult<()> {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            tracing::info!(backend = BACKEND, "Pool closed");
        }
        Ok(())
    }

    fn data_source_type(&self) -> DataSourceType {
        DataSourceType::MySql
    }
}
