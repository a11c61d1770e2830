//! Google BigQuery adapter.
//!
//! Talks to the BigQuery v2 REST API: a query job is inserted with
//! `jobs.insert`, then `jobs.getQueryResults` is polled until the job
//! completes and every result page has been read.
//!
//! Authentication uses a caller-supplied OAuth access token, or a service
//! account key whose signed JWT is exchanged for a token at the key's
//! `token_uri`. Tokens are cached until shortly before they expire.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};

use common::errors::{AppError, AppResult};
use common::models::{
    AdapterQueryResult, BigQueryCredentials, ColumnInfo, Credentials, DataSourceType, Row,
};
use common::utils::IdGenerator;

use crate::adapter::{credential_mismatch, ensure_connected, AdapterOptions, DatabaseAdapter};

const BACKEND: &str = "BigQuery";
const DEFAULT_BASE_URL: &str = "https://bigquery.googleapis.com/bigquery/v2";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const BIGQUERY_SCOPE: &str = "https://www.googleapis.com/auth/bigquery";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Long-poll window for one `getQueryResults` call.
const POLL_TIMEOUT_MS: u64 = 10_000;

/// Tokens are refreshed this long before they expire.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Service account key file, as downloaded from the Cloud console.
#[derive(Debug, Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Option<Instant>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() + TOKEN_REFRESH_MARGIN < at,
            None => true,
        }
    }
}

/// Where access tokens come from.
enum TokenSource {
    Static(String),
    ServiceAccount(ServiceAccountKey),
}

/// Connected state: project settings plus the token cache.
struct BigQuerySession {
    project_id: String,
    default_dataset: Option<String>,
    location: Option<String>,
    source: TokenSource,
    token: Mutex<Option<CachedToken>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertJobResponse {
    job_reference: JobReference,
}

#[derive(Debug, Clone, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

impl FieldSchema {
    fn is_repeated(&self) -> bool {
        self.mode.as_deref() == Some("REPEATED")
    }
}

#[derive(Debug, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResultsResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    rows: Vec<Value>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    num_dml_affected_rows: Option<String>,
}

/// BigQuery adapter over the REST API.
pub struct BigQueryAdapter {
    client: Client,
    base_url: String,
    options: AdapterOptions,
    session: RwLock<Option<Arc<BigQuerySession>>>,
}

impl BigQueryAdapter {
    pub fn new(options: AdapterOptions) -> Self {
        Self::with_base_url(options, DEFAULT_BASE_URL)
    }

    /// Adapter pointed at another API root (emulators, tests).
    pub fn with_base_url(options: AdapterOptions, base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            options,
            session: RwLock::new(None),
        }
    }

    async fn session(&self) -> AppResult<Arc<BigQuerySession>> {
        ensure_connected(self.session.read().await.clone(), BACKEND)
    }

    /// Picks the token source: explicit token, inline key, key file, then the
    /// `GOOGLE_APPLICATION_CREDENTIALS` file.
    fn token_source(creds: &BigQueryCredentials) -> AppResult<TokenSource> {
        if let Some(token) = &creds.access_token {
            return Ok(TokenSource::Static(token.clone()));
        }
        if let Some(key) = &creds.service_account_key {
            return match serde_json::from_str::<ServiceAccountKey>(key) {
                Ok(key) => Ok(TokenSource::ServiceAccount(key)),
                Err(_) => Self::read_key_file(key).map(TokenSource::ServiceAccount),
            };
        }
        if let Some(path) = &creds.key_file_path {
            return Self::read_key_file(path).map(TokenSource::ServiceAccount);
        }
        match std::env::var(CREDENTIALS_ENV) {
            Ok(path) if !path.is_empty() => {
                Self::read_key_file(&path).map(TokenSource::ServiceAccount)
            }
            _ => Err(AppError::connection(
                BACKEND,
                "no access token, service account key or GOOGLE_APPLICATION_CREDENTIALS provided",
            )),
        }
    }

    fn read_key_file(path: &str) -> AppResult<ServiceAccountKey> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::connection(BACKEND, format!("cannot read key file {}: {}", path, e))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            AppError::connection(BACKEND, format!("invalid service account key {}: {}", path, e))
        })
    }

    async fn fetch_service_account_token(&self, key: &ServiceAccountKey) -> AppResult<CachedToken> {
        let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        let now = chrono::Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &key.client_email,
            scope: BIGQUERY_SCOPE,
            aud: token_uri,
            iat: now,
            exp: now + 3600,
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| AppError::connection(BACKEND, format!("invalid private key: {}", e)))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| AppError::connection(BACKEND, format!("failed to sign JWT: {}", e)))?;

        let response = self
            .client
            .post(token_uri)
            .timeout(self.options.connect_timeout)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| AppError::connection(BACKEND, e))?;
        let response = check_status(response)
            .await
            .map_err(|message| AppError::connection(BACKEND, message))?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AppError::connection(BACKEND, e))?;

        tracing::debug!(client_email = %key.client_email, "Obtained BigQuery access token");
        Ok(CachedToken {
            value: token.access_token,
            expires_at: token
                .expires_in
                .map(|secs| Instant::now() + Duration::from_secs(secs)),
        })
    }

    async fn access_token(&self, session: &BigQuerySession) -> AppResult<String> {
        let mut cached = session.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| t.is_fresh()) {
            return Ok(token.value.clone());
        }
        let token = match &session.source {
            TokenSource::Static(value) => CachedToken {
                value: value.clone(),
                expires_at: None,
            },
            TokenSource::ServiceAccount(key) => self.fetch_service_account_token(key).await?,
        };
        let value = token.value.clone();
        *cached = Some(token);
        Ok(value)
    }

    async fn authorized(
        &self,
        session: &BigQuerySession,
        request: RequestBuilder,
    ) -> AppResult<Response> {
        let token = self.access_token(session).await?;
        request
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| AppError::query(BACKEND, e))
    }

    fn job_body(session: &BigQuerySession, job_id: &str, sql: &str, params: &[Value]) -> Value {
        let mut query = json!({
            "query": sql,
            "useLegacySql": false,
        });
        if !params.is_empty() {
            query["parameterMode"] = json!("POSITIONAL");
            query["queryParameters"] = Value::Array(params.iter().map(query_parameter).collect());
        }
        if let Some(dataset) = &session.default_dataset {
            query["defaultDataset"] = json!({
                "projectId": session.project_id,
                "datasetId": dataset,
            });
        }

        let mut job_reference = json!({
            "projectId": session.project_id,
            "jobId": job_id,
        });
        if let Some(location) = &session.location {
            job_reference["location"] = json!(location);
        }

        json!({
            "jobReference": job_reference,
            "configuration": { "query": query },
        })
    }

    async fn insert_job(
        &self,
        session: &BigQuerySession,
        sql: &str,
        params: &[Value],
    ) -> AppResult<JobReference> {
        let url = format!("{}/projects/{}/jobs", self.base_url, session.project_id);
        let body = Self::job_body(session, &IdGenerator::job_id(), sql, params);
        let response = self.authorized(session, self.client.post(url).json(&body)).await?;
        let response = check_status(response)
            .await
            .map_err(|message| AppError::query(BACKEND, message))?;
        let inserted: InsertJobResponse = response
            .json()
            .await
            .map_err(|e| AppError::query(BACKEND, e))?;
        Ok(inserted.job_reference)
    }

    async fn fetch_results(
        &self,
        session: &BigQuerySession,
        job: &JobReference,
        page_token: Option<&str>,
    ) -> AppResult<QueryResultsResponse> {
        let url = format!(
            "{}/projects/{}/queries/{}",
            self.base_url, session.project_id, job.job_id
        );
        let mut query: Vec<(&str, String)> = vec![("timeoutMs", POLL_TIMEOUT_MS.to_string())];
        if let Some(location) = job.location.as_ref().or(session.location.as_ref()) {
            query.push(("location", location.clone()));
        }
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let response = self
            .authorized(session, self.client.get(url).query(&query))
            .await?;
        let response = check_status(response)
            .await
            .map_err(|message| AppError::query(BACKEND, message))?;
        response
            .json()
            .await
            .map_err(|e| AppError::query(BACKEND, e))
    }

    async fn run(
        &self,
        session: &BigQuerySession,
        sql: &str,
        params: &[Value],
    ) -> AppResult<AdapterQueryResult> {
        let job = self.insert_job(session, sql, params).await?;
        tracing::debug!(job_id = %job.job_id, "BigQuery job inserted");

        let mut page = self.fetch_results(session, &job, None).await?;
        while !page.job_complete {
            page = self.fetch_results(session, &job, None).await?;
        }

        let schema = page.schema.take().map(|s| s.fields).unwrap_or_default();
        if let Some(affected) = &page.num_dml_affected_rows {
            let affected = affected.parse::<u64>().unwrap_or_default();
            return Ok(AdapterQueryResult::affected(affected));
        }

        let mut rows: Vec<Row> = decode_rows(&schema, &page.rows);
        while let Some(token) = page.page_token.take() {
            page = self.fetch_results(session, &job, Some(&token)).await?;
            rows.extend(decode_rows(&schema, &page.rows));
        }

        let fields = schema.iter().map(column_info).collect();
        Ok(AdapterQueryResult::with_rows(rows, fields))
    }
}

/// Returns the response on 2xx, else the API's error message.
async fn check_status(response: Response) -> Result<Response, String> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.get("error_description"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or(body);
    Err(format!("HTTP {}: {}", status.as_u16(), message))
}

/// Typed positional parameter for `jobs.insert`.
fn query_parameter(value: &Value) -> Value {
    let (kind, param_value) = match value {
        Value::Null => ("STRING", json!({})),
        Value::Bool(b) => ("BOOL", json!({ "value": b.to_string() })),
        Value::Number(n) if n.is_i64() || n.is_u64() => ("INT64", json!({ "value": n.to_string() })),
        Value::Number(n) => ("FLOAT64", json!({ "value": n.to_string() })),
        Value::String(s) => ("STRING", json!({ "value": s })),
        Value::Array(_) | Value::Object(_) => ("JSON", json!({ "value": value.to_string() })),
    };
    json!({
        "parameterType": { "type": kind },
        "parameterValue": param_value,
    })
}

fn column_info(field: &FieldSchema) -> ColumnInfo {
    ColumnInfo {
        nullable: field.mode.as_deref() != Some("REQUIRED"),
        ..ColumnInfo::new(&field.name, &field.field_type)
    }
}

fn decode_rows(schema: &[FieldSchema], rows: &[Value]) -> Vec<Row> {
    rows.iter().map(|row| decode_record(schema, row)).collect()
}

/// Decodes one `{"f": [{"v": ...}, ...]}` record against its schema.
fn decode_record(schema: &[FieldSchema], record: &Value) -> Row {
    let cells = record
        .get("f")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    schema
        .iter()
        .zip(cells)
        .map(|(field, cell)| {
            let raw = cell.get("v").unwrap_or(&Value::Null);
            (field.name.clone(), decode_field(field, raw))
        })
        .collect()
}

fn decode_field(field: &FieldSchema, raw: &Value) -> Value {
    if field.is_repeated() {
        let items = raw.as_array().map(Vec::as_slice).unwrap_or_default();
        return Value::Array(
            items
                .iter()
                .map(|item| decode_scalar(field, item.get("v").unwrap_or(&Value::Null)))
                .collect(),
        );
    }
    decode_scalar(field, raw)
}

fn decode_scalar(field: &FieldSchema, raw: &Value) -> Value {
    if raw.is_null() {
        return Value::Null;
    }
    match field.field_type.as_str() {
        "RECORD" | "STRUCT" => Value::Object(decode_record(&field.fields, raw)),
        "INTEGER" | "INT64" => raw
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .map(Value::from)
            .unwrap_or_else(|| raw.clone()),
        "FLOAT" | "FLOAT64" => raw
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .map(Value::from)
            .unwrap_or_else(|| raw.clone()),
        "BOOLEAN" | "BOOL" => match raw.as_str() {
            Some("true") => Value::Bool(true),
            Some("false") => Value::Bool(false),
            _ => raw.clone(),
        },
        _ => raw.clone(),
    }
}

#[async_trait]
impl DatabaseAdapter for BigQueryAdapter {
    async fn initialize(&self, credentials: &Credentials) -> AppResult<()> {
        let Credentials::BigQuery(creds) = credentials else {
            return Err(credential_mismatch(DataSourceType::BigQuery, credentials));
        };

        let session = BigQuerySession {
            project_id: creds.project_id.clone(),
            default_dataset: creds.default_dataset.clone(),
            location: creds.location.clone(),
            source: Self::token_source(creds)?,
            token: Mutex::new(None),
        };
        // Fail now on bad key material rather than on the first query.
        self.access_token(&session).await?;

        *self.session.write().await = Some(Arc::new(session));
        tracing::info!(backend = BACKEND, project_id = %creds.project_id, "Client initialized");
        Ok(())
    }

    async fn query(&self, sql: &str, params: &[Value]) -> AppResult<AdapterQueryResult> {
        let session = self.session().await?;
        tracing::debug!(project_id = %session.project_id, sql = %sql, "Running BigQuery job");
        self.run(&session, sql, params).await
    }

    async fn test_connection(&self) -> AppResult<bool> {
        let session = self.session().await?;
        self.run(&session, "SELECT 1", &[])
            .await
            .map_err(|e| AppError::connection(BACKEND, e))?;
        Ok(true)
    }

    async fn close(&self) -> AppResult<()> {
        if self.session.write().await.take().is_some() {
            tracing::info!(backend = BACKEND, "Client closed");
        }
        Ok(())
    }

    fn data_source_type(&self) -> DataSourceType {
        DataSourceType::BigQuery
    }
}
