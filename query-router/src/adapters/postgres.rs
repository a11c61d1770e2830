//! PostgreSQL adapter.
//!
//! Also hosts [`PgBackend`], the sqlx Postgres implementation shared with the
//! Redshift adapter.

use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::types::{Oid, PgInterval, PgMoney, PgTimeTz};
use sqlx::postgres::{
    PgArguments, PgConnectOptions, PgPoolOptions, PgRow, PgSslMode, PgTypeInfo, PgValueFormat,
};
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Either, Executor, PgPool, Postgres, Row, Statement, TypeInfo, ValueRef};
use tokio::sync::RwLock;
use uuid::Uuid;

use common::errors::{AppError, AppResult};
use common::models::{
    AdapterQueryResult, Credentials, DataSourceType, PostgresCredentials, RedshiftCredentials,
    SslSetting,
};

use crate::adapter::{credential_mismatch, ensure_connected, AdapterOptions, DatabaseAdapter};
use crate::adapters::sqlx_support::{
    bind_params, column_info, decode_as, drain, naive_timestamp, raw_text, row_to_json, to_hex,
};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Connection target for the Postgres wire protocol.
#[derive(Debug, Clone)]
pub(crate) struct PgTarget {
    pub host: String,
    pub port: Option<u16>,
    pub database: String,
    pub username: String,
    pub password: String,
    pub schema: Option<String>,
    pub ssl: Option<SslSetting>,
    pub connection_timeout: Option<u64>,
}

impl From<&PostgresCredentials> for PgTarget {
    fn from(creds: &PostgresCredentials) -> Self {
        Self {
            host: creds.host.clone(),
            port: creds.port,
            database: creds.database.clone(),
            username: creds.username.clone(),
            password: creds.password.clone(),
            schema: creds.schema.clone(),
            ssl: creds.ssl.clone(),
            connection_timeout: creds.connection_timeout,
        }
    }
}

impl From<&RedshiftCredentials> for PgTarget {
    fn from(creds: &RedshiftCredentials) -> Self {
        Self {
            host: creds.host.clone(),
            port: creds.port,
            database: creds.database.clone(),
            username: creds.username.clone(),
            password: creds.password.clone(),
            schema: creds.schema.clone(),
            ssl: creds.ssl.clone(),
            connection_timeout: creds.connection_timeout,
        }
    }
}

/// Sqlx Postgres pool behind the adapter contract, parameterized by backend type.
pub(crate) struct PgBackend {
    data_source_type: DataSourceType,
    options: AdapterOptions,
    pool: RwLock<Option<PgPool>>,
}

impl PgBackend {
    pub(crate) fn new(data_source_type: DataSourceType, options: AdapterOptions) -> Self {
        Self {
            data_source_type,
            options,
            pool: RwLock::new(None),
        }
    }

    fn backend(&self) -> &'static str {
        self.data_source_type.display_name()
    }

    /// TLS is off by default for Postgres and required by default for Redshift.
    fn default_ssl_mode(&self) -> PgSslMode {
        match self.data_source_type {
            DataSourceType::Redshift => PgSslMode::Require,
            _ => PgSslMode::Disable,
        }
    }

    /// Session tag visible in `pg_stat_activity` / `stv_sessions`.
    fn application_name(&self) -> &'static str {
        match self.data_source_type {
            DataSourceType::Redshift => "query-router-redshift",
            _ => "query-router",
        }
    }

    pub(crate) fn resolve_port(&self, target: &PgTarget) -> u16 {
        target
            .port
            .or_else(|| self.data_source_type.default_port())
            .unwrap_or(5432)
    }

    pub(crate) fn ssl_mode(&self, ssl: Option<&SslSetting>) -> PgSslMode {
        match ssl {
            None => self.default_ssl_mode(),
            Some(SslSetting::Enabled(false)) => PgSslMode::Disable,
            Some(SslSetting::Enabled(true)) => PgSslMode::Require,
            Some(SslSetting::Options(opts)) if opts.reject_unauthorized == Some(false) => {
                PgSslMode::Require
            }
            Some(SslSetting::Options(_)) => PgSslMode::VerifyFull,
        }
    }

    pub(crate) fn connect_options(&self, target: &PgTarget) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(&target.host)
            .port(self.resolve_port(target))
            .database(&target.database)
            .username(&target.username)
            .password(&target.password)
            .ssl_mode(self.ssl_mode(target.ssl.as_ref()))
            .application_name(self.application_name());

        if let Some(SslSetting::Options(opts)) = &target.ssl {
            if let Some(ca) = &opts.ca {
                options = options.ssl_root_cert_from_pem(ca.clone().into_bytes());
            }
        }
        if let Some(schema) = &target.schema {
            options = options.options([("search_path", schema.as_str())]);
        }
        options
    }

    pub(crate) async fn connect(&self, target: PgTarget) -> AppResult<()> {
        let options = self.connect_options(&target);
        let pool = PgPoolOptions::new()
            .max_connections(self.options.max_connections)
            .acquire_timeout(self.options.connect_timeout_or(target.connection_timeout))
            .connect_with(options)
            .await
            .map_err(|e| AppError::connection(self.backend(), e))?;

        let previous = self.pool.write().await.replace(pool);
        if let Some(previous) = previous {
            previous.close().await;
        }
        tracing::info!(
            backend = self.backend(),
            host = %target.host,
            database = %target.database,
            "Pool created"
        );
        Ok(())
    }

    async fn pool(&self) -> AppResult<PgPool> {
        ensure_connected(self.pool.read().await.clone(), self.backend())
    }

    /// Prepares `sql` so parameters can be encoded to the server-inferred
    /// types and the result shape is known even when no row comes back.
    pub(crate) async fn query(&self, sql: &str, params: &[Value]) -> AppResult<AdapterQueryResult> {
        let pool = self.pool().await?;
        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| AppError::connection(self.backend(), e))?;
        let statement = (&mut *conn)
            .prepare(sql)
            .await
            .map_err(|e| AppError::query(self.backend(), e))?;

        let parameter_types: &[PgTypeInfo] = match statement.parameters() {
            Some(Either::Left(types)) => types,
            _ => &[],
        };
        let mut query = statement.query();
        for (idx, value) in params.iter().enumerate() {
            let param = PgParam::from_json(value, parameter_types.get(idx)).map_err(|e| {
                AppError::query(self.backend(), format!("parameter ${}: {}", idx + 1, e))
            })?;
            query = param.bind(query);
        }

        let (rows, done) = drain::<Postgres>((&mut *conn).fetch_many(query))
            .await
            .map_err(|e| AppError::query(self.backend(), e))?;

        if statement.columns().is_empty() && rows.is_empty() {
            return Ok(AdapterQueryResult::affected(done.rows_affected()));
        }
        let fields = column_info(statement.columns());
        let rows = rows
            .iter()
            .map(|row| row_to_json(row, decode_pg_value))
            .collect();
        Ok(AdapterQueryResult::with_rows(rows, fields))
    }

    pub(crate) async fn test_connection(&self) -> AppResult<bool> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1")
            .execute(&pool)
            .await
            .map_err(|e| AppError::connection(self.backend(), e))?;
        Ok(true)
    }

    pub(crate) async fn close(&self) {
        let pool = self.pool.write().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            tracing::info!(backend = self.backend(), "Pool closed");
        }
    }
}

/// A JSON parameter encoded to the type the server inferred for its placeholder.
#[derive(Debug, Clone, PartialEq)]
enum PgParam {
    Bool(Option<bool>),
    Int2(Option<i16>),
    Int4(Option<i32>),
    Int8(Option<i64>),
    Float4(Option<f32>),
    Float8(Option<f64>),
    Numeric(Option<Decimal>),
    Text(Option<String>),
    Json(Option<Value>),
    Bytea(Option<Vec<u8>>),
    Uuid(Option<Uuid>),
    Date(Option<NaiveDate>),
    Time(Option<NaiveTime>),
    Timestamp(Option<NaiveDateTime>),
    Timestamptz(Option<DateTime<Utc>>),
    BoolArray(Option<Vec<bool>>),
    Int4Array(Option<Vec<i32>>),
    Int8Array(Option<Vec<i64>>),
    Float8Array(Option<Vec<f64>>),
    TextArray(Option<Vec<String>>),
    /// No placeholder type is known; the JSON type decides.
    Untyped(Value),
}

impl PgParam {
    fn from_json(value: &Value, type_info: Option<&PgTypeInfo>) -> Result<Self, String> {
        let Some(type_info) = type_info else {
            return Ok(Self::Untyped(value.clone()));
        };
        let name = type_info.name();
        let param = match name {
            "BOOL" => Self::Bool(typed(value, name, json_bool)?),
            "INT2" => Self::Int2(typed(value, name, |v| {
                json_i64(v).and_then(|i| i16::try_from(i).ok())
            })?),
            "INT4" => Self::Int4(typed(value, name, |v| {
                json_i64(v).and_then(|i| i32::try_from(i).ok())
            })?),
            "INT8" => Self::Int8(typed(value, name, json_i64)?),
            "FLOAT4" => Self::Float4(typed(value, name, |v| json_f64(v).map(|f| f as f32))?),
            "FLOAT8" => Self::Float8(typed(value, name, json_f64)?),
            "NUMERIC" => Self::Numeric(typed(value, name, json_decimal)?),
            "JSON" | "JSONB" => Self::Json(typed(value, name, |v| {
                // A string holding a JSON document is sent as that document.
                Some(match v {
                    Value::String(s) => serde_json::from_str(s).unwrap_or_else(|_| v.clone()),
                    _ => v.clone(),
                })
            })?),
            "BYTEA" => Self::Bytea(typed(value, name, json_bytes)?),
            "UUID" => Self::Uuid(typed(value, name, |v| {
                v.as_str().and_then(|s| Uuid::parse_str(s.trim()).ok())
            })?),
            "DATE" => Self::Date(typed(value, name, |v| v.as_str().and_then(parse_date))?),
            "TIME" => Self::Time(typed(value, name, |v| {
                v.as_str().and_then(|s| NaiveTime::from_str(s.trim()).ok())
            })?),
            "TIMESTAMP" => Self::Timestamp(typed(value, name, |v| {
                v.as_str().and_then(parse_naive_timestamp)
            })?),
            "TIMESTAMPTZ" => Self::Timestamptz(typed(value, name, |v| {
                v.as_str().and_then(parse_timestamptz)
            })?),
            "BOOL[]" => Self::BoolArray(typed(value, name, |v| json_array(v, json_bool))?),
            "INT4[]" => Self::Int4Array(typed(value, name, |v| {
                json_array(v, |item| json_i64(item).and_then(|i| i32::try_from(i).ok()))
            })?),
            "INT8[]" => Self::Int8Array(typed(value, name, |v| json_array(v, json_i64))?),
            "FLOAT8[]" => Self::Float8Array(typed(value, name, |v| json_array(v, json_f64))?),
            "TEXT[]" | "VARCHAR[]" => Self::TextArray(typed(value, name, |v| {
                json_array(v, |item| Some(json_text(item)))
            })?),
            // Text-like, enums and domains over text take the text encoding.
            _ => Self::Text(typed(value, name, |v| Some(json_text(v)))?),
        };
        Ok(param)
    }

    fn bind(self, query: PgQuery<'_>) -> PgQuery<'_> {
        match self {
            Self::Bool(v) => query.bind(v),
            Self::Int2(v) => query.bind(v),
            Self::Int4(v) => query.bind(v),
            Self::Int8(v) => query.bind(v),
            Self::Float4(v) => query.bind(v),
            Self::Float8(v) => query.bind(v),
            Self::Numeric(v) => query.bind(v),
            Self::Text(v) => query.bind(v),
            Self::Json(v) => query.bind(v.map(Json)),
            Self::Bytea(v) => query.bind(v),
            Self::Uuid(v) => query.bind(v),
            Self::Date(v) => query.bind(v),
            Self::Time(v) => query.bind(v),
            Self::Timestamp(v) => query.bind(v),
            Self::Timestamptz(v) => query.bind(v),
            Self::BoolArray(v) => query.bind(v),
            Self::Int4Array(v) => query.bind(v),
            Self::Int8Array(v) => query.bind(v),
            Self::Float8Array(v) => query.bind(v),
            Self::TextArray(v) => query.bind(v),
            Self::Untyped(v) => bind_params(query, std::slice::from_ref(&v)),
        }
    }
}

/// JSON null is SQL NULL of the placeholder type; anything else must convert.
fn typed<T>(
    value: &Value,
    type_name: &str,
    convert: impl FnOnce(&Value) -> Option<T>,
) -> Result<Option<T>, String> {
    if value.is_null() {
        return Ok(None);
    }
    convert(value)
        .map(Some)
        .ok_or_else(|| format!("cannot encode {} as {}", value, type_name))
}

fn json_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" | "yes" | "on" => Some(true),
            "false" | "f" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn json_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn json_decimal(value: &Value) -> Option<Decimal> {
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return None,
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

fn json_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// `\x`-prefixed hex, other strings as their UTF-8 bytes, or an array of octets.
fn json_bytes(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::String(s) => match s.strip_prefix("\\x") {
            Some(hex) if hex.len() % 2 == 0 => (0..hex.len())
                .step_by(2)
                .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
                .collect(),
            Some(_) => None,
            None => Some(s.as_bytes().to_vec()),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect(),
        _ => None,
    }
}

fn json_array<T>(value: &Value, item: impl Fn(&Value) -> Option<T>) -> Option<Vec<T>> {
    value.as_array()?.iter().map(item).collect()
}

fn parse_date(text: &str) -> Option<NaiveDate> {
    let text = text.trim();
    NaiveDate::from_str(text)
        .ok()
        .or_else(|| parse_naive_timestamp(text).map(|ts| ts.date()))
}

fn parse_naive_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|ts| ts.naive_utc()))
        .or_else(|| NaiveDate::from_str(text).ok().and_then(|d| d.and_hms_opt(0, 0, 0)))
}

fn parse_timestamptz(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z"))
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
        .or_else(|| parse_naive_timestamp(text).map(|ts| ts.and_utc()))
}

/// Decodes one Postgres column into JSON by its type name.
///
/// A non-null value is never dropped: anything without a typed decoder comes
/// back as its raw text, or as hex when it is not printable.
fn decode_pg_value(row: &PgRow, idx: usize, type_name: &str) -> Value {
    let decoded = match type_name {
        "BOOL" => decode_as(row, idx, Value::Bool),
        "INT2" => decode_as(row, idx, |v: i16| Value::from(v)),
        "INT4" => decode_as(row, idx, |v: i32| Value::from(v)),
        "INT8" => decode_as(row, idx, |v: i64| Value::from(v)),
        "OID" => decode_as(row, idx, |v: Oid| Value::from(v.0)),
        "FLOAT4" => decode_as(row, idx, |v: f32| Value::from(f64::from(v))),
        "FLOAT8" => decode_as(row, idx, |v: f64| Value::from(v)),
        "NUMERIC" => decode_as(row, idx, |v: Decimal| Value::String(v.to_string())),
        "MONEY" => decode_as(row, idx, |v: PgMoney| Value::String(v.to_decimal(2).to_string())),
        "JSON" | "JSONB" => decode_as(row, idx, |v: Value| v),
        "UUID" => decode_as(row, idx, |v: Uuid| Value::String(v.to_string())),
        "TIMESTAMPTZ" => decode_as(row, idx, |v: DateTime<Utc>| Value::String(v.to_rfc3339())),
        "TIMESTAMP" => decode_as(row, idx, naive_timestamp),
        "DATE" => decode_as(row, idx, |v: NaiveDate| Value::String(v.to_string())),
        "TIME" => decode_as(row, idx, |v: NaiveTime| Value::String(v.to_string())),
        "TIMETZ" => decode_as(row, idx, |v: PgTimeTz<NaiveTime, FixedOffset>| {
            Value::String(format!("{}{}", v.time, v.offset))
        }),
        "INTERVAL" => decode_as(row, idx, |v: PgInterval| Value::String(iso_interval(&v))),
        "INET" | "CIDR" => decode_inet(row, idx),
        "BYTEA" => decode_as(row, idx, |v: Vec<u8>| Value::String(format!("\\x{}", to_hex(&v)))),
        "BOOL[]" => decode_as(row, idx, |v: Vec<bool>| Value::from(v)),
        "INT2[]" => decode_as(row, idx, |v: Vec<i16>| Value::from(v)),
        "INT4[]" => decode_as(row, idx, |v: Vec<i32>| Value::from(v)),
        "INT8[]" => decode_as(row, idx, |v: Vec<i64>| Value::from(v)),
        "FLOAT4[]" => decode_as(row, idx, |v: Vec<f32>| {
            Value::from(v.into_iter().map(f64::from).collect::<Vec<_>>())
        }),
        "FLOAT8[]" => decode_as(row, idx, |v: Vec<f64>| Value::from(v)),
        "NUMERIC[]" => decode_as(row, idx, |v: Vec<Decimal>| {
            Value::from(v.iter().map(Decimal::to_string).collect::<Vec<_>>())
        }),
        "UUID[]" => decode_as(row, idx, |v: Vec<Uuid>| {
            Value::from(v.iter().map(Uuid::to_string).collect::<Vec<_>>())
        }),
        "TEXT[]" | "VARCHAR[]" => decode_as(row, idx, |v: Vec<String>| Value::from(v)),
        _ => decode_as(row, idx, Value::String),
    };
    decoded.unwrap_or_else(|| pg_raw_value(row, idx))
}

fn decode_inet(row: &PgRow, idx: usize) -> Option<Value> {
    let raw = row.try_get_raw(idx).ok()?;
    if raw.is_null() {
        return Some(Value::Null);
    }
    if raw.format() == PgValueFormat::Text {
        return raw.as_str().ok().map(|s| Value::String(s.to_string()));
    }
    inet_text(raw.as_bytes().ok()?).map(Value::String)
}

/// Renders the binary `inet`/`cidr` layout: family, bits, is_cidr, length, address.
fn inet_text(bytes: &[u8]) -> Option<String> {
    let [family, bits, is_cidr, _len, address @ ..] = bytes else {
        return None;
    };
    let ip = match (*family, address.len()) {
        (2, 4) => IpAddr::from(<[u8; 4]>::try_from(address).ok()?),
        (3, 16) => IpAddr::from(<[u8; 16]>::try_from(address).ok()?),
        _ => return None,
    };
    let full = if ip.is_ipv4() { 32 } else { 128 };
    Some(if *is_cidr != 0 || *bits != full {
        format!("{}/{}", ip, bits)
    } else {
        ip.to_string()
    })
}

/// ISO-8601 duration, e.g. `P1Y2M3DT4H5M6.5S`.
fn iso_interval(interval: &PgInterval) -> String {
    let mut out = String::from("P");
    let (years, months) = (interval.months / 12, interval.months % 12);
    if years != 0 {
        out.push_str(&format!("{}Y", years));
    }
    if months != 0 {
        out.push_str(&format!("{}M", months));
    }
    if interval.days != 0 {
        out.push_str(&format!("{}D", interval.days));
    }

    let micros = interval.microseconds;
    if micros != 0 {
        out.push('T');
        let hours = micros / 3_600_000_000;
        let minutes = (micros % 3_600_000_000) / 60_000_000;
        let rest = micros % 60_000_000;
        if hours != 0 {
            out.push_str(&format!("{}H", hours));
        }
        if minutes != 0 {
            out.push_str(&format!("{}M", minutes));
        }
        if rest != 0 {
            let sign = if rest < 0 { "-" } else { "" };
            let (secs, frac) = (rest.abs() / 1_000_000, rest.abs() % 1_000_000);
            if frac == 0 {
                out.push_str(&format!("{}{}S", sign, secs));
            } else {
                let frac = format!("{:06}", frac);
                out.push_str(&format!("{}{}.{}S", sign, secs, frac.trim_end_matches('0')));
            }
        }
    }
    if out == "P" {
        out.push_str("T0S");
    }
    out
}

fn pg_raw_value(row: &PgRow, idx: usize) -> Value {
    let raw = match row.try_get_raw(idx) {
        Ok(raw) => raw,
        Err(e) => {
            tracing::warn!(column = idx, error = %e, "Column is not readable");
            return Value::Null;
        }
    };
    if raw.is_null() {
        return Value::Null;
    }
    if raw.format() == PgValueFormat::Text {
        if let Ok(text) = raw.as_str() {
            return Value::String(text.to_string());
        }
    }
    raw.as_bytes().map(raw_text).unwrap_or(Value::Null)
}

/// PostgreSQL adapter.
pub struct PostgresAdapter {
    inner: PgBackend,
}

impl PostgresAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self {
            inner: PgBackend::new(DataSourceType::Postgres, options),
        }
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    async fn initialize(&self, credentials: &Credentials) -> AppResult<()> {
        let Credentials::Postgres(creds) = credentials else {
            return Err(credential_mismatch(DataSourceType::Postgres, credentials));
        };
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
        DataSourceType::Postgres
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::{MySqlCredentials, SslOptions};
    use serde_json::json;

    fn pg_credentials(port: Option<u16>) -> PostgresCredentials {
        PostgresCredentials {
            host: "127.0.0.1".into(),
            port,
            database: "app".into(),
            username: "postgres".into(),
            password: "secret".into(),
            schema: Some("analytics".into()),
            ssl: None,
            connection_timeout: Some(300),
        }
    }

    #[test]
    fn test_default_port_and_ssl() {
        let backend = PgBackend::new(DataSourceType::Postgres, AdapterOptions::default());
        let target = PgTarget::from(&pg_credentials(None));
        assert_eq!(backend.resolve_port(&target), 5432);
        assert!(matches!(backend.ssl_mode(None), PgSslMode::Disable));
    }

    #[test]
    fn test_ssl_mapping() {
        let backend = PgBackend::new(DataSourceType::Postgres, AdapterOptions::default());
        assert!(matches!(
            backend.ssl_mode(Some(&SslSetting::Enabled(true))),
            PgSslMode::Require
        ));
        assert!(matches!(
            backend.ssl_mode(Some(&SslSetting::Options(SslOptions {
                reject_unauthorized: Some(false),
                ca: None,
            }))),
            PgSslMode::Require
        ));
        assert!(matches!(
            backend.ssl_mode(Some(&SslSetting::Options(SslOptions::default()))),
            PgSslMode::VerifyFull
        ));
    }

    #[test]
    fn test_application_name_tags_the_backend() {
        let target = PgTarget::from(&pg_credentials(None));
        let postgres = PgBackend::new(DataSourceType::Postgres, AdapterOptions::default());
        let redshift = PgBackend::new(DataSourceType::Redshift, AdapterOptions::default());
        assert_eq!(
            postgres.connect_options(&target).get_application_name(),
            Some("query-router")
        );
        assert_eq!(
            redshift.connect_options(&target).get_application_name(),
            Some("query-router-redshift")
        );
    }

    #[test]
    fn test_explicit_port_wins() {
        let backend = PgBackend::new(DataSourceType::Postgres, AdapterOptions::default());
        let target = PgTarget::from(&pg_credentials(Some(6543)));
        assert_eq!(backend.resolve_port(&target), 6543);
    }

    #[tokio::test]
    async fn test_query_before_initialize_is_rejected() {
        let adapter = PostgresAdapter::new(AdapterOptions::default());
        let err = adapter.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, AppError::NotConnected { backend: "PostgreSQL" }));
        assert!(adapter.test_connection().await.is_err());
    }

    #[tokio::test]
    async fn test_mismatched_credentials_fail_validation() {
        let adapter = PostgresAdapter::new(AdapterOptions::default());
        let creds = Credentials::MySql(MySqlCredentials {
            host: "127.0.0.1".into(),
            port: None,
            database: None,
            username: "root".into(),
            password: "secret".into(),
            ssl: None,
            connection_timeout: None,
        });
        let err = adapter.initialize(&creds).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::CredentialValidation {
                expected: DataSourceType::Postgres,
                actual: DataSourceType::MySql,
            }
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let adapter = PostgresAdapter::new(AdapterOptions::default());
        adapter.close().await.unwrap();
        adapter.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_connection_error() {
        let adapter = PostgresAdapter::new(AdapterOptions::default());
        let creds = Credentials::Postgres(pg_credentials(Some(1)));
        let err = adapter.initialize(&creds).await.unwrap_err();
        assert!(err.to_string().starts_with("PostgreSQL connection failed"));
        assert!(matches!(
            adapter.query("SELECT 1", &[]).await,
            Err(AppError::NotConnected { .. })
        ));
    }

    fn pg_type<T: sqlx::Type<Postgres>>() -> PgTypeInfo {
        T::type_info()
    }

    #[test]
    fn test_params_follow_placeholder_types() {
        assert_eq!(
            PgParam::from_json(&json!("2024-01-01"), Some(&pg_type::<NaiveDate>())),
            Ok(PgParam::Date(NaiveDate::from_ymd_opt(2024, 1, 1)))
        );
        assert_eq!(
            PgParam::from_json(&Value::Null, Some(&pg_type::<i32>())),
            Ok(PgParam::Int4(None))
        );
        assert_eq!(
            PgParam::from_json(&json!("42"), Some(&pg_type::<i64>())),
            Ok(PgParam::Int8(Some(42)))
        );
        assert_eq!(
            PgParam::from_json(&json!(12.5), Some(&pg_type::<Decimal>())),
            Ok(PgParam::Numeric(Decimal::from_str("12.5").ok()))
        );
        assert_eq!(
            PgParam::from_json(&json!(7), Some(&pg_type::<String>())),
            Ok(PgParam::Text(Some("7".into())))
        );
        assert_eq!(
            PgParam::from_json(&json!("{\"a\": 1}"), Some(&pg_type::<Json<Value>>())),
            Ok(PgParam::Json(Some(json!({ "a": 1 }))))
        );
        assert_eq!(
            PgParam::from_json(&json!([1, 2]), Some(&pg_type::<Vec<i32>>())),
            Ok(PgParam::Int4Array(Some(vec![1, 2])))
        );
        assert_eq!(
            PgParam::from_json(&json!("x"), None),
            Ok(PgParam::Untyped(json!("x")))
        );
    }

    #[test]
    fn test_params_that_do_not_fit_are_rejected() {
        let err = PgParam::from_json(&json!("soon"), Some(&pg_type::<NaiveDate>())).unwrap_err();
        assert_eq!(err, "cannot encode \"soon\" as DATE");
        assert!(PgParam::from_json(&json!(70_000), Some(&pg_type::<i16>())).is_err());
        assert!(PgParam::from_json(&json!("\\xzz"), Some(&pg_type::<Vec<u8>>())).is_err());
    }

    #[test]
    fn test_timestamp_params() {
        let expected = NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();
        assert_eq!(parse_naive_timestamp("2024-03-01 12:30:00"), Some(expected));
        assert_eq!(parse_naive_timestamp("2024-03-01T12:30"), Some(expected));
        assert_eq!(
            parse_timestamptz("2024-03-01T14:30:00+02:00"),
            Some(expected.and_utc())
        );
        assert_eq!(json_bytes(&json!("\\xdead")), Some(vec![0xde, 0xad]));
    }

    #[test]
    fn test_iso_interval() {
        let interval = |months, days, microseconds| PgInterval {
            months,
            days,
            microseconds,
        };
        assert_eq!(iso_interval(&interval(0, 1, 0)), "P1D");
        assert_eq!(iso_interval(&interval(14, 3, 3_723_500_000)), "P1Y2M3DT1H2M3.5S");
        assert_eq!(iso_interval(&interval(0, 0, -1_500_000)), "PT-1.5S");
        assert_eq!(iso_interval(&interval(0, 0, 0)), "PT0S");
    }

    #[test]
    fn test_inet_text() {
        assert_eq!(inet_text(&[2, 32, 0, 4, 10, 0, 0, 1]).as_deref(), Some("10.0.0.1"));
        assert_eq!(
            inet_text(&[2, 24, 1, 4, 192, 168, 1, 0]).as_deref(),
            Some("192.168.1.0/24")
        );
        let mut v6 = vec![3, 128, 0, 16];
        v6.extend([0u8; 15]);
        v6.push(1);
        assert_eq!(inet_text(&v6).as_deref(), Some("::1"));
        assert_eq!(inet_text(&[9, 0]), None);
    }

    /// Runs against a live server described by `QUERY_ROUTER_TEST_POSTGRES`,
    /// a JSON credentials document such as
    /// `{"type":"postgres","host":"localhost","database":"postgres","username":"postgres","password":"postgres"}`.
    #[tokio::test]
    #[ignore = "needs a running PostgreSQL server"]
    async fn test_live_round_trip() {
        let Ok(document) = std::env::var("QUERY_ROUTER_TEST_POSTGRES") else {
            return;
        };
        let creds: Credentials = serde_json::from_str(&document).unwrap();
        let options = AdapterOptions {
            max_connections: 1,
            ..AdapterOptions::default()
        };
        let adapter = PostgresAdapter::new(options);
        adapter.initialize(&creds).await.unwrap();

        let result = adapter.query("SELECT 1 as x", &[]).await.unwrap();
        assert_eq!(result.rows, vec![json!({ "x": 1 }).as_object().unwrap().clone()]);

        let result = adapter.query("SELECT 1 AS zeta, 2 AS alpha", &[]).await.unwrap();
        let keys: Vec<&String> = result.rows[0].keys().collect();
        assert_eq!(keys, ["zeta", "alpha"]);

        adapter
            .query(
                "CREATE TEMP TABLE router_notes (id int, n int, d date, note text)",
                &[],
            )
            .await
            .unwrap();
        let inserted = adapter
            .query(
                "INSERT INTO router_notes VALUES (1, $1, $2, 'new'), (2, 5, '2024-01-02', 'new')",
                &[Value::Null, json!("2024-01-01")],
            )
            .await
            .unwrap();
        assert_eq!(inserted.row_count, 2);

        let updated = adapter
            .query("UPDATE router_notes SET note = 'returning customer'", &[])
            .await
            .unwrap();
        assert_eq!(updated.row_count, 2);
        assert!(updated.rows.is_empty());

        let returned = adapter
            .query("UPDATE router_notes SET n = 9 WHERE id = $1 RETURNING id", &[json!(1)])
            .await
            .unwrap();
        assert_eq!(returned.rows[0]["id"], json!(1));

        let empty = adapter
            .query("SELECT id FROM router_notes WHERE id = $1", &[json!(99)])
            .await
            .unwrap();
        assert_eq!(empty.row_count, 0);
        assert_eq!(empty.fields.len(), 1);

        let exotic = adapter
            .query("SELECT '1 day'::interval AS iv, inet '10.0.0.1' AS ip", &[])
            .await
            .unwrap();
        assert_eq!(exotic.rows[0]["iv"], json!("P1D"));
        assert_eq!(exotic.rows[0]["ip"], json!("10.0.0.1"));

        adapter.close().await.unwrap();
    }
}
