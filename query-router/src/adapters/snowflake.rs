//! Snowflake adapter.
//!
//! Uses the Snowflake session REST endpoints: a login request opens a session
//! bound to the configured warehouse, database, schema and role, and every
//! statement is posted to `queries/v1/query-request` with the session token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeDelta};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

use common::errors::{AppError, AppResult};
use common::models::{
    AdapterQueryResult, ColumnInfo, Credentials, DataSourceType, Row, SnowflakeCredentials,
};
use common::utils::IdGenerator;

use crate::adapter::{credential_mismatch, ensure_connected, AdapterOptions, DatabaseAdapter};
use crate::adapters::sqlx_support::naive_timestamp;

const BACKEND: &str = "Snowflake";
const CLIENT_APP_ID: &str = "query-router";

/// Response code for a statement still running server-side.
const QUERY_IN_PROGRESS: &str = "333333";
const QUERY_IN_PROGRESS_ASYNC: &str = "333334";

/// Response code for an expired session token.
const SESSION_EXPIRED: &str = "390112";

const POLL_INITIAL_DELAY: Duration = Duration::from_millis(100);
const POLL_MAX_DELAY: Duration = Duration::from_secs(2);

/// `timestamp_tz` offsets are sent as minutes plus this bias.
const TZ_OFFSET_BIAS: i32 = 1440;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

impl<T> Envelope<T> {
    fn error_message(&self) -> String {
        let message = self.message.as_deref().unwrap_or("unknown error");
        match &self.code {
            Some(code) => format!("{} ({})", message, code),
            None => message.to_string(),
        }
    }

    fn in_progress(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some(QUERY_IN_PROGRESS) | Some(QUERY_IN_PROGRESS_ASYNC)
        )
    }

    fn session_expired(&self) -> bool {
        self.code.as_deref() == Some(SESSION_EXPIRED)
    }
}

#[derive(Debug, Deserialize)]
struct LoginData {
    token: String,
    #[serde(rename = "masterToken", default)]
    master_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenewData {
    session_token: String,
    #[serde(default)]
    master_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
    #[serde(default = "nullable_default")]
    nullable: bool,
    #[serde(default)]
    precision: Option<u32>,
    #[serde(default)]
    scale: Option<u32>,
    #[serde(default)]
    length: Option<u32>,
}

fn nullable_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct Chunk {
    url: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    #[serde(default)]
    rowtype: Vec<RowType>,
    #[serde(default)]
    rowset: Vec<Vec<Value>>,
    #[serde(default)]
    chunks: Vec<Chunk>,
    #[serde(default)]
    chunk_headers: Option<Map<String, Value>>,
    #[serde(default)]
    qrmk: Option<String>,
    #[serde(default)]
    get_result_url: Option<String>,
}

/// An open Snowflake session. The master token renews the session token.
struct SnowflakeSession {
    base_url: String,
    token: String,
    master_token: Option<String>,
}

impl SnowflakeSession {
    fn authorization(&self) -> String {
        format!("Snowflake Token=\"{}\"", self.token)
    }
}

/// Snowflake adapter over the session REST API.
pub struct SnowflakeAdapter {
    client: Client,
    base_url: Option<String>,
    options: AdapterOptions,
    sequence: AtomicU64,
    session: RwLock<Option<Arc<SnowflakeSession>>>,
}

impl SnowflakeAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self {
            client: Client::new(),
            base_url: None,
            options,
            sequence: AtomicU64::new(0),
            session: RwLock::new(None),
        }
    }

    /// Adapter pointed at a fixed endpoint instead of the account host.
    pub fn with_base_url(options: AdapterOptions, base_url: impl Into<String>) -> Self {
        Self {
            base_url: Some(base_url.into().trim_end_matches('/').to_string()),
            ..Self::new(options)
        }
    }

    fn account_url(&self, account_id: &str) -> String {
        match &self.base_url {
            Some(url) => url.clone(),
            None => format!("https://{}.snowflakecomputing.com", account_id),
        }
    }

    async fn session(&self) -> AppResult<Arc<SnowflakeSession>> {
        ensure_connected(self.session.read().await.clone(), BACKEND)
    }

    async fn login(&self, creds: &SnowflakeCredentials) -> AppResult<SnowflakeSession> {
        let base_url = self.account_url(&creds.account_id);
        let mut params: Vec<(&str, String)> = vec![
            ("requestId", IdGenerator::request_id()),
            ("warehouse", creds.warehouse_id.clone()),
            ("databaseName", creds.default_database.clone()),
        ];
        if let Some(schema) = &creds.default_schema {
            params.push(("schemaName", schema.clone()));
        }
        if let Some(role) = &creds.role {
            params.push(("roleName", role.clone()));
        }

        let body = json!({
            "data": {
                "ACCOUNT_NAME": creds.account_id,
                "LOGIN_NAME": creds.username,
                "PASSWORD": creds.password,
                "CLIENT_APP_ID": CLIENT_APP_ID,
                "CLIENT_APP_VERSION": env!("CARGO_PKG_VERSION"),
            }
        });

        let response = self
            .client
            .post(format!("{}/session/v1/login-request", base_url))
            .query(&params)
            .header(ACCEPT, "application/json")
            .timeout(self.options.connect_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::connection(BACKEND, e))?;
        let envelope: Envelope<LoginData> = read_envelope(response)
            .await
            .map_err(|message| AppError::connection(BACKEND, message))?;

        match envelope.data {
            Some(data) if envelope.success => Ok(SnowflakeSession {
                base_url,
                token: data.token,
                master_token: data.master_token,
            }),
            _ => Err(AppError::connection(BACKEND, envelope.error_message())),
        }
    }

    /// Exchanges the master token for a fresh session token.
    ///
    /// Concurrent callers holding the same stale session share one renewal.
    async fn renew_session(
        &self,
        stale: &Arc<SnowflakeSession>,
    ) -> AppResult<Arc<SnowflakeSession>> {
        let mut current = self.session.write().await;
        match &*current {
            None => return Err(AppError::NotConnected { backend: BACKEND }),
            Some(session) if !Arc::ptr_eq(session, stale) => return Ok(session.clone()),
            Some(_) => {}
        }
        let master_token = stale
            .master_token
            .as_deref()
            .ok_or_else(|| AppError::connection(BACKEND, "session expired and cannot be renewed"))?;

        let response = self
            .client
            .post(format!("{}/session/token-request", stale.base_url))
            .query(&[("requestId", IdGenerator::request_id())])
            .header(AUTHORIZATION, format!("Snowflake Token=\"{}\"", master_token))
            .header(ACCEPT, "application/json")
            .timeout(self.options.connect_timeout)
            .json(&json!({ "oldSessionToken": stale.token, "requestType": "RENEW" }))
            .send()
            .await
            .map_err(|e| AppError::connection(BACKEND, e))?;
        let envelope: Envelope<RenewData> = read_envelope(response)
            .await
            .map_err(|message| AppError::connection(BACKEND, message))?;

        let data = match envelope.data {
            Some(data) if envelope.success => data,
            _ => return Err(AppError::connection(BACKEND, envelope.error_message())),
        };
        let renewed = Arc::new(SnowflakeSession {
            base_url: stale.base_url.clone(),
            token: data.session_token,
            master_token: data.master_token.or_else(|| stale.master_token.clone()),
        });
        *current = Some(renewed.clone());
        tracing::info!(backend = BACKEND, "Session renewed");
        Ok(renewed)
    }

    async fn post_query(
        &self,
        session: &SnowflakeSession,
        sql: &str,
        params: &[Value],
    ) -> AppResult<Envelope<QueryData>> {
        let mut body = json!({
            "sqlText": sql,
            "asyncExec": false,
            "sequenceId": self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
        });
        if !params.is_empty() {
            body["bindings"] = bindings(params);
        }

        let response = self
            .client
            .post(format!("{}/queries/v1/query-request", session.base_url))
            .query(&[("requestId", IdGenerator::request_id())])
            .header(AUTHORIZATION, session.authorization())
            .header(ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::query(BACKEND, e))?;
        read_envelope(response)
            .await
            .map_err(|message| AppError::query(BACKEND, message))
    }

    /// Polls the result URL until the statement leaves the running state.
    async fn await_result(
        &self,
        session: &SnowflakeSession,
        mut envelope: Envelope<QueryData>,
    ) -> AppResult<Envelope<QueryData>> {
        let mut delay = POLL_INITIAL_DELAY;
        while envelope.in_progress() {
            let result_url = envelope
                .data
                .as_ref()
                .and_then(|d| d.get_result_url.clone())
                .ok_or_else(|| AppError::query(BACKEND, "query in progress without result URL"))?;
            tracing::debug!(
                result_url = %result_url,
                delay_ms = delay.as_millis() as u64,
                "Snowflake query still running, polling"
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(POLL_MAX_DELAY);

            let response = self
                .client
                .get(format!("{}{}", session.base_url, result_url))
                .header(AUTHORIZATION, session.authorization())
                .header(ACCEPT, "application/json")
                .send()
                .await
                .map_err(|e| AppError::query(BACKEND, e))?;
            envelope = read_envelope(response)
                .await
                .map_err(|message| AppError::query(BACKEND, message))?;
        }
        Ok(envelope)
    }

    /// Submits a statement, renewing an expired session once, and waits for
    /// its result.
    async fn submit(&self, sql: &str, params: &[Value]) -> AppResult<QueryData> {
        let mut session = self.session().await?;
        let mut envelope = self.post_query(&session, sql, params).await?;
        if envelope.session_expired() {
            tracing::debug!(backend = BACKEND, "Session token expired, renewing");
            session = self.renew_session(&session).await?;
            envelope = self.post_query(&session, sql, params).await?;
        }

        let envelope = self.await_result(&session, envelope).await?;
        if !envelope.success {
            return Err(AppError::query(BACKEND, envelope.error_message()));
        }
        Ok(envelope.data.unwrap_or_default())
    }

    /// Downloads the extra result chunks of a large result set.
    async fn fetch_chunks(&self, data: &QueryData) -> AppResult<Vec<Vec<Value>>> {
        let mut rows = Vec::new();
        for chunk in &data.chunks {
            let mut request = self.client.get(&chunk.url);
            match (&data.chunk_headers, &data.qrmk) {
                (Some(headers), _) => {
                    for (name, value) in headers {
                        if let Some(value) = value.as_str() {
                            request = request.header(name.as_str(), value);
                        }
                    }
                }
                (None, Some(qrmk)) => {
                    request = request
                        .header("x-amz-server-side-encryption-customer-algorithm", "AES256")
                        .header("x-amz-server-side-encryption-customer-key", qrmk.as_str());
                }
                (None, None) => {}
            }
            let body = request
                .send()
                .await
                .and_then(Response::error_for_status)
                .map_err(|e| AppError::query(BACKEND, e))?
                .text()
                .await
                .map_err(|e| AppError::query(BACKEND, e))?;
            // Chunks are comma-separated arrays without the enclosing brackets.
            let parsed: Vec<Vec<Value>> = serde_json::from_str(&format!("[{}]", body))
                .map_err(|e| AppError::query(BACKEND, format!("invalid result chunk: {}", e)))?;
            rows.extend(parsed);
        }
        Ok(rows)
    }

    async fn run(&self, sql: &str, params: &[Value]) -> AppResult<AdapterQueryResult> {
        let mut data = self.submit(sql, params).await?;
        if !data.chunks.is_empty() {
            tracing::debug!(chunks = data.chunks.len(), "Fetching Snowflake result chunks");
            let extra = self.fetch_chunks(&data).await?;
            data.rowset.extend(extra);
        }

        let rows: Vec<Row> = data
            .rowset
            .iter()
            .map(|raw| decode_row(&data.rowtype, raw))
            .collect();

        if let Some(affected) = affected_rows(&data.rowtype, &rows) {
            return Ok(AdapterQueryResult::affected(affected));
        }

        let fields = data.rowtype.iter().map(column_info).collect();
        Ok(AdapterQueryResult::with_rows(rows, fields))
    }
}

/// Reads a response body as a Snowflake envelope.
async fn read_envelope<T: DeserializeOwned>(response: Response) -> Result<Envelope<T>, String> {
    let status = response.status();
    let body = response.text().await.map_err(|e| e.to_string())?;
    match serde_json::from_str::<Envelope<T>>(&body) {
        Ok(envelope) => Ok(envelope),
        Err(_) if !status.is_success() => Err(format!("HTTP {}: {}", status.as_u16(), body)),
        Err(e) => Err(format!("invalid response: {}", e)),
    }
}

/// Positional bindings keyed `"1"`, `"2"`, ... as the REST API expects.
fn bindings(params: &[Value]) -> Value {
    let map: Map<String, Value> = params
        .iter()
        .enumerate()
        .map(|(idx, value)| {
            let (kind, text) = match value {
                Value::Null => ("TEXT", Value::Null),
                Value::Bool(b) => ("BOOLEAN", json!(b.to_string())),
                Value::Number(n) if n.is_i64() || n.is_u64() => ("FIXED", json!(n.to_string())),
                Value::Number(n) => ("REAL", json!(n.to_string())),
                Value::String(s) => ("TEXT", json!(s)),
                Value::Array(_) | Value::Object(_) => ("TEXT", json!(value.to_string())),
            };
            ((idx + 1).to_string(), json!({ "type": kind, "value": text }))
        })
        .collect();
    Value::Object(map)
}

fn column_info(row_type: &RowType) -> ColumnInfo {
    ColumnInfo {
        nullable: row_type.nullable,
        precision: row_type.precision,
        scale: row_type.scale,
        length: row_type.length,
        ..ColumnInfo::new(&row_type.name, &row_type.column_type)
    }
}

fn decode_row(rowtype: &[RowType], raw: &[Value]) -> Row {
    rowtype
        .iter()
        .zip(raw)
        .map(|(column, value)| (column.name.clone(), decode_value(column, value)))
        .collect()
}

/// Converts a rowset string by its column type.
fn decode_value(column: &RowType, raw: &Value) -> Value {
    let Some(text) = raw.as_str() else {
        return raw.clone();
    };
    match column.column_type.as_str() {
        "fixed" if column.scale.unwrap_or(0) == 0 => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        "fixed" | "real" => text
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        "boolean" => match text {
            "1" | "true" | "TRUE" => Value::Bool(true),
            "0" | "false" | "FALSE" => Value::Bool(false),
            _ => Value::String(text.to_string()),
        },
        "date" | "time" | "timestamp_ntz" | "timestamp_ltz" | "timestamp_tz" => {
            decode_temporal(&column.column_type, text)
                .unwrap_or_else(|| Value::String(text.to_string()))
        }
        _ => Value::String(text.to_string()),
    }
}

/// Temporal values arrive as epoch days (`date`), seconds since midnight
/// (`time`) or epoch seconds. `timestamp_tz` appends the biased offset in
/// minutes: `"1700000000.000000000 1500"`.
fn decode_temporal(column_type: &str, text: &str) -> Option<Value> {
    let rendered = match column_type {
        "date" => {
            let days = TimeDelta::try_days(text.parse().ok()?)?;
            NaiveDate::from_ymd_opt(1970, 1, 1)?
                .checked_add_signed(days)?
                .to_string()
        }
        "time" => {
            let (secs, nanos) = epoch_seconds(text)?;
            NaiveTime::from_num_seconds_from_midnight_opt(u32::try_from(secs).ok()?, nanos)?
                .to_string()
        }
        "timestamp_ntz" => {
            let (secs, nanos) = epoch_seconds(text)?;
            return Some(naive_timestamp(DateTime::from_timestamp(secs, nanos)?.naive_utc()));
        }
        "timestamp_ltz" => {
            let (secs, nanos) = epoch_seconds(text)?;
            DateTime::from_timestamp(secs, nanos)?.to_rfc3339()
        }
        "timestamp_tz" => {
            let (instant, offset) = text.split_once(' ')?;
            let (secs, nanos) = epoch_seconds(instant)?;
            let minutes = offset.trim().parse::<i32>().ok()? - TZ_OFFSET_BIAS;
            let offset = FixedOffset::east_opt(minutes * 60)?;
            DateTime::from_timestamp(secs, nanos)?
                .with_timezone(&offset)
                .to_rfc3339()
        }
        _ => return None,
    };
    Some(Value::String(rendered))
}

/// Splits `"-1.250000000"` into whole seconds and a non-negative nanosecond
/// part: `(-2, 750_000_000)`.
fn epoch_seconds(text: &str) -> Option<(i64, u32)> {
    let (whole, fraction) = text.split_once('.').unwrap_or((text, ""));
    let negative = whole.starts_with('-');
    let whole: i64 = whole.trim_start_matches('-').parse().ok()?;
    if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let nanos: u32 = if fraction.is_empty() {
        0
    } else {
        format!("{:0<9}", fraction).parse().ok()?
    };

    match (negative, nanos) {
        (false, _) => Some((whole, nanos)),
        (true, 0) => Some((-whole, 0)),
        (true, _) => Some((-whole - 1, 1_000_000_000 - nanos)),
    }
}

/// DML answers with one row of `number of ... rows ...` counters and nothing
/// else. The affected count sums the `number of rows ...` columns.
fn affected_rows(rowtype: &[RowType], rows: &[Row]) -> Option<u64> {
    let is_counter = |column: &RowType| {
        column.name.starts_with("number of ") && column.name.contains("rows")
    };
    if rowtype.is_empty() || !rowtype.iter().all(is_counter) || rows.len() != 1 {
        return None;
    }
    let first = &rows[0];
    let total = rowtype
        .iter()
        .filter(|column| column.name.starts_with("number of rows"))
        .map(|column| first.get(&column.name).and_then(Value::as_u64).unwrap_or(0))
        .sum();
    Some(total)
}

#[async_trait]
impl DatabaseAdapter for SnowflakeAdapter {
    async fn initialize(&self, credentials: &Credentials) -> AppResult<()> {
        let Credentials::Snowflake(creds) = credentials else {
            return Err(credential_mismatch(DataSourceType::Snowflake, credentials));
        };

        let session = self.login(creds).await?;
        let previous = self.session.write().await.replace(Arc::new(session));
        if previous.is_some() {
            tracing::debug!(backend = BACKEND, "Replaced existing session");
        }
        tracing::info!(
            backend = BACKEND,
            account = %creds.account_id,
            warehouse = %creds.warehouse_id,
            "Session opened"
        );
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> AppResult<AdapterQueryResult> {
        tracing::debug!(sql = %sql, "Running Snowflake statement");
        self.run(sql, params).await
    }

    async fn test_connection(&self) -> AppResult<bool> {
        self.session().await?;
        self.run("SELECT 1", &[])
            .await
            .map_err(|e| AppError::connection(BACKEND, e))?;
        Ok(true)
    }

    async fn close(&self) -> AppResult<()> {
        let Some(session) = self.session.write().await.take() else {
            return Ok(());
        };
        let result = self
            .client
            .post(format!("{}/session", session.base_url))
            .query(&[("delete", "true")])
            .header(AUTHORIZATION, session.authorization())
            .header(ACCEPT, "application/json")
            .send()
            .await
            .and_then(Response::error_for_status);
        if let Err(e) = result {
            tracing::warn!(backend = BACKEND, error = %e, "Failed to delete session");
        }
        tracing::info!(backend = BACKEND, "Session closed");
        Ok(())
    }

    fn data_source_type(&self) -> DataSourceType {
        DataSourceType::Snowflake
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn snowflake_credentials() -> Credentials {
        Credentials::Snowflake(SnowflakeCredentials {
            account_id: "xy12345".into(),
            warehouse_id: "COMPUTE_WH".into(),
            username: "analyst".into(),
            password: "secret".into(),
            role: Some("ANALYST".into()),
            default_database: "SALES".into(),
            default_schema: Some("PUBLIC".into()),
        })
    }

    async fn mount_login(mock_server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/session/v1/login-request"))
            .and(query_param("warehouse", "COMPUTE_WH"))
            .and(query_param("databaseName", "SALES"))
            .and(query_param("schemaName", "PUBLIC"))
            .and(query_param("roleName", "ANALYST"))
            .and(body_partial_json(json!({
                "data": { "ACCOUNT_NAME": "xy12345", "LOGIN_NAME": "analyst" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "token": "tok-1", "masterToken": "master-1" }
            })))
            .mount(mock_server)
            .await;
    }

    async fn create_mock_adapter(mock_server: &MockServer) -> SnowflakeAdapter {
        mount_login(mock_server).await;
        let adapter = SnowflakeAdapter::with_base_url(AdapterOptions::default(), mock_server.uri());
        adapter.initialize(&snowflake_credentials()).await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn test_select_converts_by_rowtype() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .and(header("authorization", "Snowflake Token=\"tok-1\""))
            .and(body_partial_json(json!({
                "sqlText": "SELECT * FROM orders WHERE id = ?",
                "bindings": { "1": { "type": "FIXED", "value": "10" } }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "rowtype": [
                        { "name": "ID", "type": "fixed", "scale": 0, "precision": 38, "nullable": false },
                        { "name": "AMOUNT", "type": "fixed", "scale": 2, "precision": 10, "nullable": true },
                        { "name": "RATE", "type": "real", "nullable": true },
                        { "name": "PAID", "type": "boolean", "nullable": true },
                        { "name": "NOTE", "type": "text", "length": 100, "nullable": true }
                    ],
                    "rowset": [["10", "12.50", "0.5", "1", "first"], ["11", null, "2", "0", null]]
                }
            })))
            .mount(&mock_server)
            .await;

        let adapter = create_mock_adapter(&mock_server).await;
        let result = adapter
            .query("SELECT * FROM orders WHERE id = ?", &[json!(10)])
            .await
            .unwrap();

        assert_eq!(result.row_count, 2);
        assert_eq!(result.rows[0]["ID"], json!(10));
        assert_eq!(result.rows[0]["AMOUNT"], json!(12.5));
        assert_eq!(result.rows[0]["RATE"], json!(0.5));
        assert_eq!(result.rows[0]["PAID"], json!(true));
        assert_eq!(result.rows[0]["NOTE"], json!("first"));
        assert_eq!(result.rows[1]["AMOUNT"], Value::Null);
        assert_eq!(result.rows[1]["PAID"], json!(false));

        assert!(!result.fields[0].nullable);
        assert_eq!(result.fields[1].scale, Some(2));
        assert_eq!(result.fields[4].length, Some(100));
    }

    #[tokio::test]
    async fn test_dml_reports_affected_rows() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "rowtype": [{ "name": "number of rows updated", "type": "fixed", "scale": 0 }],
                    "rowset": [["4"]]
                }
            })))
            .mount(&mock_server)
            .await;

        let adapter = create_mock_adapter(&mock_server).await;
        let result = adapter.query("UPDATE orders SET paid = true", &[]).await.unwrap();
        assert_eq!(result.row_count, 4);
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_failed_statement_is_a_query_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "code": "001003",
                "message": "SQL compilation error: syntax error line 1 at position 0 unexpected 'SELEC'."
            })))
            .mount(&mock_server)
            .await;

        let adapter = create_mock_adapter(&mock_server).await;
        let err = adapter.query("SELEC 1", &[]).await.unwrap_err();
        assert!(matches!(err, AppError::QueryExecution { backend: "Snowflake", .. }));
        assert!(err.to_string().contains("001003"));
    }

    #[tokio::test]
    async fn test_rejected_login_is_a_connection_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session/v1/login-request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "code": "390100",
                "message": "Incorrect username or password was specified."
            })))
            .mount(&mock_server)
            .await;

        let adapter = SnowflakeAdapter::with_base_url(AdapterOptions::default(), mock_server.uri());
        let err = adapter.initialize(&snowflake_credentials()).await.unwrap_err();
        assert!(err.to_string().starts_with("Snowflake connection failed"));
        assert!(matches!(
            adapter.test_connection().await,
            Err(AppError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_deletes_session_once() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/session"))
            .and(query_param("delete", "true"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let adapter = create_mock_adapter(&mock_server).await;
        adapter.close().await.unwrap();
        adapter.close().await.unwrap();
        assert!(matches!(
            adapter.query("SELECT 1", &[]).await,
            Err(AppError::NotConnected { backend: "Snowflake" })
        ));
    }

    #[test]
    fn test_bindings_are_one_based() {
        let b = bindings(&[json!("a"), json!(true), json!(1.5), Value::Null]);
        assert_eq!(b["1"], json!({ "type": "TEXT", "value": "a" }));
        assert_eq!(b["2"], json!({ "type": "BOOLEAN", "value": "true" }));
        assert_eq!(b["3"]["type"], "REAL");
        assert_eq!(b["4"]["value"], Value::Null);
    }

    #[tokio::test]
    async fn test_expired_session_is_renewed_once() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .and(header("authorization", "Snowflake Token=\"tok-1\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "code": "390112",
                "message": "Your session has expired. Please login again."
            })))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/token-request"))
            .and(header("authorization", "Snowflake Token=\"master-1\""))
            .and(body_partial_json(json!({
                "oldSessionToken": "tok-1",
                "requestType": "RENEW"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": { "sessionToken": "tok-2", "masterToken": "master-2" }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .and(header("authorization", "Snowflake Token=\"tok-2\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "rowtype": [{ "name": "X", "type": "fixed", "scale": 0 }],
                    "rowset": [["1"]]
                }
            })))
            .expect(2)
            .mount(&mock_server)
            .await;

        let adapter = create_mock_adapter(&mock_server).await;
        let result = adapter.query("SELECT 1 AS x", &[]).await.unwrap();
        assert_eq!(result.rows[0]["X"], json!(1));

        let result = adapter.query("SELECT 1 AS x", &[]).await.unwrap();
        assert_eq!(result.row_count, 1);
    }

    #[tokio::test]
    async fn test_failed_renewal_is_a_connection_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "code": "390112",
                "message": "Your session has expired. Please login again."
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/token-request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": false,
                "code": "390114",
                "message": "Authentication token has expired."
            })))
            .mount(&mock_server)
            .await;

        let adapter = create_mock_adapter(&mock_server).await;
        let err = adapter.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, AppError::Connection { backend: "Snowflake", .. }));
        assert!(err.to_string().contains("390114"));
    }

    #[tokio::test]
    async fn test_running_statement_is_polled() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "code": "333334",
                "message": "Asynchronous execution in progress.",
                "data": { "queryId": "01b2", "getResultUrl": "/queries/01b2/result" }
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queries/01b2/result"))
            .and(header("authorization", "Snowflake Token=\"tok-1\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "code": "333333",
                "data": { "queryId": "01b2", "getResultUrl": "/queries/01b2/result" }
            })))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/queries/01b2/result"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "rowtype": [{ "name": "N", "type": "fixed", "scale": 0 }],
                    "rowset": [["7"]]
                }
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let adapter = create_mock_adapter(&mock_server).await;
        let result = adapter.query("SELECT COUNT(*) AS n FROM big_table", &[]).await.unwrap();
        assert_eq!(result.rows[0]["N"], json!(7));
    }

    #[tokio::test]
    async fn test_result_chunks_are_appended() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "rowtype": [
                        { "name": "ID", "type": "fixed", "scale": 0 },
                        { "name": "NAME", "type": "text" }
                    ],
                    "rowset": [["1", "a"]],
                    "chunks": [
                        { "url": format!("{}/chunks/0", mock_server.uri()), "rowCount": 2 },
                        { "url": format!("{}/chunks/1", mock_server.uri()), "rowCount": 1 }
                    ],
                    "chunkHeaders": { "x-amz-server-side-encryption-customer-key": "key-1" }
                }
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/chunks/0"))
            .and(header("x-amz-server-side-encryption-customer-key", "key-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"["2","b"],["3",null]"#))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/chunks/1"))
            .and(header("x-amz-server-side-encryption-customer-key", "key-1"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"["4","d"]"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        let adapter = create_mock_adapter(&mock_server).await;
        let result = adapter.query("SELECT id, name FROM items", &[]).await.unwrap();
        assert_eq!(result.row_count, 4);
        let ids: Vec<&Value> = result.rows.iter().map(|row| &row["ID"]).collect();
        assert_eq!(ids, [&json!(1), &json!(2), &json!(3), &json!(4)]);
        assert_eq!(result.rows[2]["NAME"], Value::Null);
    }

    #[tokio::test]
    async fn test_literal_does_not_change_result_shape() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/queries/v1/query-request"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "data": {
                    "rowtype": [
                        { "name": "number of rows updated", "type": "fixed", "scale": 0 },
                        { "name": "number of multi-joined rows updated", "type": "fixed", "scale": 0 }
                    ],
                    "rowset": [["3", "0"]]
                }
            })))
            .mount(&mock_server)
            .await;

        let adapter = create_mock_adapter(&mock_server).await;
        let result = adapter
            .query("UPDATE customers SET note = 'returning customer'", &[])
            .await
            .unwrap();
        assert_eq!(result.row_count, 3);
        assert!(result.rows.is_empty());
    }

    fn row_type(column_type: &str) -> RowType {
        RowType {
            name: "V".into(),
            column_type: column_type.into(),
            nullable: true,
            precision: None,
            scale: Some(9),
            length: None,
        }
    }

    #[test]
    fn test_temporal_values() {
        let cases = [
            ("date", "19723", "2024-01-01"),
            ("date", "-1", "1969-12-31"),
            ("time", "45296.123000000", "12:34:56.123"),
            ("timestamp_ntz", "1704112496.500000000", "2024-01-01T12:34:56.500"),
            ("timestamp_ntz", "-1.250000000", "1969-12-31T23:59:58.750"),
            ("timestamp_ltz", "1704112496.000000000", "2024-01-01T12:34:56+00:00"),
            ("timestamp_tz", "1704112496.000000000 1500", "2024-01-01T13:34:56+01:00"),
            ("timestamp_tz", "1704112496.000000000 1140", "2024-01-01T07:34:56-05:00"),
        ];
        for (column_type, raw, expected) in cases {
            assert_eq!(
                decode_value(&row_type(column_type), &json!(raw)),
                json!(expected),
                "{column_type} {raw}"
            );
        }
    }

    #[test]
    fn test_unparseable_temporal_value_is_kept() {
        assert_eq!(
            decode_value(&row_type("date"), &json!("2024-01-01")),
            json!("2024-01-01")
        );
        assert_eq!(
            decode_value(&row_type("timestamp_tz"), &json!("17.5")),
            json!("17.5")
        );
        assert_eq!(decode_value(&row_type("time"), &Value::Null), Value::Null);
    }

    #[test]
    fn test_rows_keep_column_order() {
        let rowtype = vec![
            RowType { name: "ZETA".into(), ..row_type("text") },
            RowType { name: "ALPHA".into(), ..row_type("text") },
        ];
        let row = decode_row(&rowtype, &[json!("z"), json!("a")]);
        let keys: Vec<&String> = row.keys().collect();
        assert_eq!(keys, ["ZETA", "ALPHA"]);
    }

    #[test]
    fn test_epoch_seconds() {
        assert_eq!(epoch_seconds("12"), Some((12, 0)));
        assert_eq!(epoch_seconds("1.5"), Some((1, 500_000_000)));
        assert_eq!(epoch_seconds("-0.5"), Some((-1, 500_000_000)));
        assert_eq!(epoch_seconds("-2.000000000"), Some((-2, 0)));
        assert_eq!(epoch_seconds("1.x"), None);
    }

    #[test]
    fn test_select_with_counter_alias_keeps_rows() {
        let alias = RowType {
            name: "number of rows".into(),
            ..row_type("fixed")
        };
        let rowtype = vec![row_type("fixed"), alias];
        let rows = vec![Row::new()];
        assert_eq!(affected_rows(&rowtype, &rows), None);
    }
}
