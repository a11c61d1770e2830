//! Backend credential models.
//!
//! One credential shape per supported backend, discriminated by the `type` tag.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::AppError;

/// Supported backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceType {
    /// PostgreSQL.
    Postgres,
    /// MySQL or MariaDB.
    MySql,
    /// Google BigQuery.
    BigQuery,
    /// Snowflake.
    Snowflake,
    /// Microsoft SQL Server.
    SqlServer,
    /// Amazon Redshift.
    Redshift,
}

impl DataSourceType {
    /// Every supported type, in declaration order.
    pub const ALL: [DataSourceType; 6] = [
        DataSourceType::Postgres,
        DataSourceType::MySql,
        DataSourceType::BigQuery,
        DataSourceType::Snowflake,
        DataSourceType::SqlServer,
        DataSourceType::Redshift,
    ];

    /// Returns the default port for this backend, if it speaks a TCP wire protocol.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            DataSourceType::Postgres => Some(5432),
            DataSourceType::MySql => Some(3306),
            DataSourceType::SqlServer => Some(1433),
            DataSourceType::Redshift => Some(5439),
            DataSourceType::BigQuery | DataSourceType::Snowflake => None,
        }
    }

    /// Human-readable backend name, used as the prefix of backend errors.
    pub fn display_name(&self) -> &'static str {
        match self {
            DataSourceType::Postgres => "PostgreSQL",
            DataSourceType::MySql => "MySQL",
            DataSourceType::BigQuery => "BigQuery",
            DataSourceType::Snowflake => "Snowflake",
            DataSourceType::SqlServer => "SQL Server",
            DataSourceType::Redshift => "Redshift",
        }
    }
}

impl fmt::Display for DataSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceType::Postgres => write!(f, "postgres"),
            DataSourceType::MySql => write!(f, "mysql"),
            DataSourceType::BigQuery => write!(f, "bigquery"),
            DataSourceType::Snowflake => write!(f, "snowflake"),
            DataSourceType::SqlServer => write!(f, "sqlserver"),
            DataSourceType::Redshift => write!(f, "redshift"),
        }
    }
}

impl FromStr for DataSourceType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(DataSourceType::Postgres),
            "mysql" | "mariadb" => Ok(DataSourceType::MySql),
            "bigquery" => Ok(DataSourceType::BigQuery),
            "snowflake" => Ok(DataSourceType::Snowflake),
            "sqlserver" | "mssql" => Ok(DataSourceType::SqlServer),
            "redshift" => Ok(DataSourceType::Redshift),
            other => Err(AppError::UnsupportedDataSourceType(other.to_string())),
        }
    }
}

/// TLS settings for the network SQL backends.
///
/// Accepts either a plain boolean or an options object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum SslSetting {
    /// `true` requires TLS, `false` disables it.
    Enabled(bool),
    /// Fine-grained TLS options.
    Options(SslOptions),
}

/// TLS options object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SslOptions {
    /// Verify the server certificate against trusted roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_unauthorized: Option<bool>,
    /// PEM-encoded CA certificate to trust.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

/// PostgreSQL credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PostgresCredentials {
    /// Server host.
    pub host: String,
    /// Server port (default 5432).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Database name.
    pub database: String,
    /// Login user.
    pub username: String,
    /// Login password (never serialized).
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Default schema, applied as the connection search path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// TLS settings (disabled when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<SslSetting>,
    /// Connection timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<u64>,
}

/// Amazon Redshift credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedshiftCredentials {
    /// Cluster endpoint host.
    pub host: String,
    /// Cluster port (default 5439).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Database name.
    pub database: String,
    /// Login user.
    pub username: String,
    /// Login password (never serialized).
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Default schema, applied as the connection search path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    /// TLS settings (required when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<SslSetting>,
    /// Cluster identifier, informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_identifier: Option<String>,
    /// Connection timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<u64>,
}

/// MySQL credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MySqlCredentials {
    /// Server host.
    pub host: String,
    /// Server port (default 3306).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Default database.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    /// Login user.
    pub username: String,
    /// Login password (never serialized).
    #[serde(skip_serializing, default)]
    pub password: String,
    /// TLS settings (preferred when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<SslSetting>,
    /// Connection timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<u64>,
}

/// Google BigQuery credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BigQueryCredentials {
    /// GCP project that owns the query jobs.
    pub project_id: String,
    /// Service account key, either inline JSON or a path to a key file.
    #[serde(skip_serializing, default)]
    pub service_account_key: Option<String>,
    /// Path to a service account key file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file_path: Option<String>,
    /// Pre-issued OAuth access token.
    #[serde(skip_serializing, default)]
    pub access_token: Option<String>,
    /// Dataset used to qualify unqualified table names.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_dataset: Option<String>,
    /// Job location (e.g. `US`, `EU`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Snowflake credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnowflakeCredentials {
    /// Account identifier (`<org>-<account>` or locator).
    pub account_id: String,
    /// Virtual warehouse to run queries on.
    pub warehouse_id: String,
    /// Login user.
    pub username: String,
    /// Login password (never serialized).
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Role to assume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Session database.
    pub default_database: String,
    /// Session schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_schema: Option<String>,
}

/// Microsoft SQL Server credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SqlServerCredentials {
    /// Server host.
    pub server: String,
    /// Server port (default 1433).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Database name.
    pub database: String,
    /// Login user.
    pub username: String,
    /// Login password (never serialized).
    #[serde(skip_serializing, default)]
    pub password: String,
    /// Windows domain; selects NTLM authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Named instance, resolved through SQL Browser.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
    /// Encrypt the connection (default true).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypt: Option<bool>,
    /// Trust the server certificate without validation (default false).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_server_certificate: Option<bool>,
    /// Connection timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout: Option<u64>,
    /// Per-request timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
}

/// Credentials for one data source, tagged by backend type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Credentials {
    Postgres(PostgresCredentials),
    MySql(MySqlCredentials),
    BigQuery(BigQueryCredentials),
    Snowflake(SnowflakeCredentials),
    SqlServer(SqlServerCredentials),
    Redshift(RedshiftCredentials),
}

impl Credentials {
    /// Returns the backend type tag of these credentials.
    pub fn data_source_type(&self) -> DataSourceType {
        match self {
            Credentials::Postgres(_) => DataSourceType::Postgres,
            Credentials::MySql(_) => DataSourceType::MySql,
            Credentials::BigQuery(_) => DataSourceType::BigQuery,
            Credentials::Snowflake(_) => DataSourceType::Snowflake,
            Credentials::SqlServer(_) => DataSourceType::SqlServer,
            Credentials::Redshift(_) => DataSourceType::Redshift,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_type_aliases() {
        assert_eq!("PostgreSQL".parse::<DataSourceType>().unwrap(), DataSourceType::Postgres);
        assert_eq!("mssql".parse::<DataSourceType>().unwrap(), DataSourceType::SqlServer);
        assert!(matches!(
            "oracle".parse::<DataSourceType>(),
            Err(AppError::UnsupportedDataSourceType(t)) if t == "oracle"
        ));
    }

    #[test]
    fn test_display_roundtrips_through_from_str() {
        for ty in DataSourceType::ALL {
            assert_eq!(ty.to_string().parse::<DataSourceType>().unwrap(), ty);
        }
    }

    #[test]
    fn test_default_ports() {
        assert_eq!(DataSourceType::Postgres.default_port(), Some(5432));
        assert_eq!(DataSourceType::Redshift.default_port(), Some(5439));
        assert_eq!(DataSourceType::MySql.default_port(), Some(3306));
        assert_eq!(DataSourceType::SqlServer.default_port(), Some(1433));
        assert_eq!(DataSourceType::BigQuery.default_port(), None);
    }

    #[test]
    fn test_deserialize_tagged_credentials() {
        let creds: Credentials = serde_json::from_value(serde_json::json!({
            "type": "mysql",
            "host": "db.internal",
            "username": "app",
            "password": "secret",
            "ssl": { "reject_unauthorized": true }
        }))
        .unwrap();

        assert_eq!(creds.data_source_type(), DataSourceType::MySql);
        let Credentials::MySql(mysql) = creds else {
            panic!("expected mysql credentials");
        };
        assert_eq!(mysql.port, None);
        assert_eq!(
            mysql.ssl,
            Some(SslSetting::Options(SslOptions {
                reject_unauthorized: Some(true),
                ca: None,
            }))
        );
    }

    #[test]
    fn test_ssl_accepts_boolean() {
        let creds: Credentials = serde_json::from_value(serde_json::json!({
            "type": "redshift",
            "host": "cluster.redshift.amazonaws.com",
            "database": "dev",
            "username": "admin",
            "password": "secret",
            "ssl": false
        }))
        .unwrap();
        let Credentials::Redshift(redshift) = creds else {
            panic!("expected redshift credentials");
        };
        assert_eq!(redshift.ssl, Some(SslSetting::Enabled(false)));
    }

    #[test]
    fn test_password_is_not_serialized() {
        let creds = Credentials::Snowflake(SnowflakeCredentials {
            account_id: "acme-xy12345".into(),
            warehouse_id: "COMPUTE_WH".into(),
            username: "analyst".into(),
            password: "hunter2".into(),
            role: None,
            default_database: "ANALYTICS".into(),
            default_schema: None,
        });
        let json = serde_json::to_string(&creds).unwrap();
        assert!(json.contains("\"type\":\"snowflake\""));
        assert!(!json.contains("hunter2"));
    }
}
