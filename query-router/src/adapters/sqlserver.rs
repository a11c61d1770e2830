//! Microsoft SQL Server adapter.
//!
//! A single `tiberius` TDS client over a tokio `TcpStream`. Named instances are
//! resolved through the SQL Browser service, and an Azure gateway redirect is
//! followed once during connect.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use futures::TryStreamExt;
use tiberius::{
    AuthMethod, Client, Column, ColumnData, Config, EncryptionLevel, FromSql, Query, QueryItem,
    SqlBrowser,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

use common::errors::{AppError, AppResult};
use common::models::{
    AdapterQueryResult, ColumnInfo, Credentials, DataSourceType, Row, SqlServerCredentials,
};
use common::utils::SqlClassifier;

use crate::adapter::{credential_mismatch, AdapterOptions, DatabaseAdapter};

const BACKEND: &str = "SQL Server";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

type TdsClient = Client<Compat<TcpStream>>;

/// SQL Server adapter holding one TDS connection.
pub struct SqlServerAdapter {
    options: AdapterOptions,
    request_timeout: Mutex<Duration>,
    client: Mutex<Option<TdsClient>>,
}

impl SqlServerAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self {
            options,
            request_timeout: Mutex::new(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS)),
            client: Mutex::new(None),
        }
    }

    fn authentication(creds: &SqlServerCredentials) -> AppResult<AuthMethod> {
        match &creds.domain {
            None => Ok(AuthMethod::sql_server(&creds.username, &creds.password)),
            #[cfg(windows)]
            Some(domain) => Ok(AuthMethod::windows(
                format!("{}\\{}", domain, creds.username),
                &creds.password,
            )),
            #[cfg(not(windows))]
            Some(domain) => Err(AppError::connection(
                BACKEND,
                format!(
                    "Windows authentication for domain '{}' is only available on Windows builds",
                    domain
                ),
            )),
        }
    }

    fn build_config(creds: &SqlServerCredentials) -> AppResult<Config> {
        let mut config = Config::new();
        config.host(&creds.server);
        config.database(&creds.database);
        config.application_name("query-router");
        config.authentication(Self::authentication(creds)?);

        match &creds.instance_name {
            Some(instance) => config.instance_name(instance),
            None => config.port(
                creds
                    .port
                    .or_else(|| DataSourceType::SqlServer.default_port())
                    .unwrap_or(1433),
            ),
        }

        if creds.encrypt.unwrap_or(true) {
            config.encryption(EncryptionLevel::Required);
        } else {
            config.encryption(EncryptionLevel::Off);
        }
        if creds.trust_server_certificate.unwrap_or(false) {
            config.trust_cert();
        }
        Ok(config)
    }

    async fn open_stream(config: &Config, named: bool) -> AppResult<TcpStream> {
        let tcp = if named {
            TcpStream::connect_named(config)
                .await
                .map_err(|e| AppError::connection(BACKEND, e))?
        } else {
            TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| AppError::connection(BACKEND, e))?
        };
        tcp.set_nodelay(true)
            .map_err(|e| AppError::connection(BACKEND, e))?;
        Ok(tcp)
    }

    async fn connect(config: Config, named: bool) -> AppResult<TdsClient> {
        let tcp = Self::open_stream(&config, named).await?;
        match Client::connect(config.clone(), tcp.compat_write()).await {
            Ok(client) => Ok(client),
            Err(tiberius::error::Error::Routing { host, port }) => {
                tracing::debug!(host = %host, port, "Following SQL Server routing redirect");
                let mut config = config;
                config.host(&host);
                config.port(port);
                let tcp = Self::open_stream(&config, false).await?;
                Client::connect(config, tcp.compat_write())
                    .await
                    .map_err(|e| AppError::connection(BACKEND, e))
            }
            Err(e) => Err(AppError::connection(BACKEND, e)),
        }
    }

    async fn run(client: &mut TdsClient, sql: &str, params: &[Value]) -> AppResult<AdapterQueryResult> {
        let mut query = Query::new(rewrite_placeholders(sql));
        for param in params {
            match param {
                Value::Null => query.bind(Option::<String>::None),
                Value::Bool(b) => query.bind(*b),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64().unwrap_or_default()),
                },
                Value::String(s) => query.bind(s.clone()),
                Value::Array(_) | Value::Object(_) => query.bind(param.to_string()),
            }
        }

        // TDS reports affected counts only on the execute path, which drops
        // result sets; every other statement is streamed.
        if SqlClassifier::is_row_count_only(sql) {
            let done = query
                .execute(client)
                .await
                .map_err(|e| AppError::query(BACKEND, e))?;
            return Ok(AdapterQueryResult::affected(done.total()));
        }

        let mut stream = query
            .query(client)
            .await
            .map_err(|e| AppError::query(BACKEND, e))?;
        let mut first_set: Option<(usize, Vec<Column>)> = None;
        let mut rows: Vec<Row> = Vec::new();
        // The stream is drained to the end so the connection stays usable.
        while let Some(item) = stream
            .try_next()
            .await
            .map_err(|e| AppError::query(BACKEND, e))?
        {
            match item {
                QueryItem::Metadata(meta) if first_set.is_none() => {
                    first_set = Some((meta.result_index(), meta.columns().to_vec()));
                }
                QueryItem::Metadata(_) => {}
                QueryItem::Row(row) => {
                    if first_set.as_ref().map(|(index, _)| *index) == Some(row.result_index()) {
                        rows.push(
                            row.cells()
                                .map(|(column, data)| (column.name().to_string(), column_value(data)))
                                .collect(),
                        );
                    }
                }
            }
        }

        match first_set {
            Some((_, columns)) => {
                let fields = columns
                    .iter()
                    .map(|c| ColumnInfo::new(c.name(), format!("{:?}", c.column_type())))
                    .collect();
                Ok(AdapterQueryResult::with_rows(rows, fields))
            }
            None => Ok(AdapterQueryResult::affected(0)),
        }
    }
}

/// Rewrites `?` placeholders to `@P1..@Pn`, leaving string literals,
/// bracketed or quoted identifiers and comments untouched.
pub(crate) fn rewrite_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut chars = sql.chars().peekable();
    let mut index = 0;

    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | '[' => {
                let close = if c == '[' { ']' } else { c };
                out.push(c);
                while let Some(inner) = chars.next() {
                    out.push(inner);
                    if inner == close {
                        // Doubled delimiter is an escape, stay inside.
                        if chars.peek() == Some(&close) {
                            if let Some(escaped) = chars.next() {
                                out.push(escaped);
                            }
                            continue;
                        }
                        break;
                    }
                }
            }
            '-' if chars.peek() == Some(&'-') => {
                out.push(c);
                for inner in chars.by_ref() {
                    out.push(inner);
                    if inner == '\n' {
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                out.push(c);
                let mut prev = '\0';
                for inner in chars.by_ref() {
                    out.push(inner);
                    if prev == '*' && inner == '/' {
                        break;
                    }
                    prev = inner;
                }
            }
            '?' => {
                index += 1;
                out.push_str(&format!("@P{}", index));
            }
            _ => out.push(c),
        }
    }
    out
}

/// Converts one TDS value into JSON.
fn column_value(data: &ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I16(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I32(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::I64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::F32(v) => v.map(|f| Value::from(f64::from(f))).unwrap_or(Value::Null),
        ColumnData::F64(v) => v.map(Value::from).unwrap_or(Value::Null),
        ColumnData::Bit(v) => v.map(Value::Bool).unwrap_or(Value::Null),
        ColumnData::String(v) => v
            .as_ref()
            .map(|s| Value::String(s.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Guid(v) => v
            .as_ref()
            .map(|g| Value::String(g.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Numeric(v) => v
            .as_ref()
            .map(|n| Value::String(n.to_string()))
            .unwrap_or(Value::Null),
        ColumnData::Binary(v) => v
            .as_ref()
            .map(|b| Value::String(b.iter().map(|x| format!("{:02x}", x)).collect()))
            .unwrap_or(Value::Null),
        ColumnData::Xml(v) => v
            .as_ref()
            .map(|x| Value::String(x.clone().into_owned().into_string()))
            .unwrap_or(Value::Null),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal::<chrono::NaiveDateTime>(data, |ts| {
                ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
            })
        }
        ColumnData::Date(_) => temporal::<chrono::NaiveDate>(data, |d| d.to_string()),
        ColumnData::Time(_) => temporal::<chrono::NaiveTime>(data, |t| t.to_string()),
        ColumnData::DateTimeOffset(_) => {
            temporal::<chrono::DateTime<chrono::Utc>>(data, |ts| ts.to_rfc3339())
        }
    }
}

fn temporal<'a, T>(data: &'a ColumnData<'static>, render: impl FnOnce(T) -> String) -> Value
where
    T: FromSql<'a>,
{
    match T::from_sql(data) {
        Ok(Some(value)) => Value::String(render(value)),
        Ok(None) => Value::Null,
        Err(e) => {
            tracing::debug!(error = %e, "Temporal column could not be decoded, returning null");
            Value::Null
        }
    }
}

#[async_trait]
impl DatabaseAdapter for SqlServerAdapter {
    async fn initialize(&self, credentials: &Credentials) -> AppResult<()> {
        let Credentials::SqlServer(creds) = credentials else {
            return Err(credential_mismatch(DataSourceType::SqlServer, credentials));
        };

        let config = Self::build_config(creds)?;
        let named = creds.instance_name.is_some();
        let connect_timeout = self.options.connect_timeout_or(creds.connection_timeout);
        let client = tokio::time::timeout(connect_timeout, Self::connect(config, named))
            .await
            .map_err(|_| {
                AppError::connection(
                    BACKEND,
                    format!("timed out after {}ms", connect_timeout.as_millis()),
                )
            })??;

        *self.request_timeout.lock().await = Duration::from_millis(
            creds.request_timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT_MS),
        );
        let previous = self.client.lock().await.replace(client);
        if let Some(previous) = previous {
            if let Err(e) = previous.close().await {
                tracing::warn!(backend = BACKEND, error = %e, "Failed to close replaced client");
            }
        }
        tracing::info!(backend = BACKEND, server = %creds.server, database = %creds.database, "Client connected");
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> AppResult<AdapterQueryResult> {
        let request_timeout = *self.request_timeout.lock().await;
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or(AppError::NotConnected { backend: BACKEND })?;
        tracing::debug!(sql = %sql, "Running SQL Server statement");

        tokio::time::timeout(request_timeout, Self::run(client, sql, params))
            .await
            .map_err(|_| {
                AppError::query(
                    BACKEND,
                    format!("request timed out after {}ms", request_timeout.as_millis()),
                )
            })?
    }

    async fn test_connection(&self) -> AppResult<bool> {
        let mut guard = self.client.lock().await;
        let client = guard
            .as_mut()
            .ok_or(AppError::NotConnected { backend: BACKEND })?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(|e| AppError::connection(BACKEND, e))?
            .into_results()
            .await
            .map_err(|e| AppError::connection(BACKEND, e))?;
        Ok(true)
    }

    async fn close(&self) -> AppResult<()> {
        let client = self.client.lock().await.take();
        if let Some(client) = client {
            if let Err(e) = client.close().await {
                tracing::warn!(backend = BACKEND, error = %e, "Error while closing client");
            }
            tracing::info!(backend = BACKEND, "Client closed");
        }
        Ok(())
    }

    fn data_source_type(&self) -> DataSourceType {
        DataSourceType::SqlServer
    }
}
