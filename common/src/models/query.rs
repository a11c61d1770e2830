//! SQL query models.
//!
//! Request/result contract exposed to callers, plus the backend-native result
//! shape adapters produce.

use serde::{Deserialize, Serialize};

/// A result row: column name to JSON value, in column order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Error code attached to results whose query failed on the backend.
pub const QUERY_EXECUTION_ERROR: &str = "QUERY_EXECUTION_ERROR";

/// Request to run one SQL statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryRequest {
    /// SQL statement to execute.
    pub sql: String,

    /// Positional parameters in the backend's placeholder syntax.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Vec<serde_json::Value>>,

    /// Explicit target data source name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse: Option<String>,

    /// Per-request overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<QueryOptions>,
}

impl QueryRequest {
    /// Creates a request for `sql` with no params and no explicit target.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            ..Default::default()
        }
    }

    /// Sets the positional parameters.
    pub fn with_params(mut self, params: Vec<serde_json::Value>) -> Self {
        self.params = Some(params);
        self
    }

    /// Targets a named data source.
    pub fn on(mut self, warehouse: impl Into<String>) -> Self {
        self.warehouse = Some(warehouse.into());
        self
    }

    /// Sets per-request options.
    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// Per-request execution options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Maximum rows returned to the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rows: Option<usize>,

    /// Deadline for the query in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Column metadata, best effort per backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,

    /// Backend type name.
    #[serde(rename = "type")]
    pub data_type: String,

    /// Whether the column is nullable (`true` when the backend cannot tell).
    pub nullable: bool,

    /// Numeric precision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,

    /// Numeric scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,

    /// Character length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
}

impl ColumnInfo {
    /// Column with only a name and type known.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            precision: None,
            scale: None,
            length: None,
        }
    }
}

/// Backend-native result produced by an adapter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdapterQueryResult {
    /// Returned rows (empty for statements that only affect rows).
    pub rows: Vec<Row>,
    /// Rows returned, or rows affected for non-query statements.
    pub row_count: u64,
    /// Column metadata.
    pub fields: Vec<ColumnInfo>,
}

impl AdapterQueryResult {
    /// Result of a row-returning statement.
    pub fn with_rows(rows: Vec<Row>, fields: Vec<ColumnInfo>) -> Self {
        Self {
            row_count: rows.len() as u64,
            rows,
            fields,
        }
    }

    /// Result of a statement that only reports affected rows.
    pub fn affected(affected: u64) -> Self {
        Self {
            rows: vec![],
            row_count: affected,
            fields: vec![],
        }
    }
}

/// Error details attached to a failed result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryError {
    /// Machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

/// Normalized result of a routed query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    /// Whether the query ran successfully.
    pub success: bool,

    /// Row data.
    pub rows: Vec<Row>,

    /// Column information.
    pub columns: Vec<ColumnInfo>,

    /// Rows returned or affected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    /// Execution time in milliseconds.
    pub execution_time_ms: u64,

    /// Data source that served the request.
    pub warehouse: String,

    /// Failure details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<QueryError>,
}

impl QueryResult {
    /// Successful result built from an adapter result.
    pub fn from_adapter(
        result: AdapterQueryResult,
        warehouse: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            success: true,
            rows: result.rows,
            columns: result.fields,
            rows_affected: Some(result.row_count),
            execution_time_ms,
            warehouse: warehouse.into(),
            error: None,
        }
    }

    /// Failed result carrying `code` and `message`.
    pub fn failure(
        warehouse: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            success: false,
            rows: vec![],
            columns: vec![],
            rows_affected: None,
            execution_time_ms,
            warehouse: warehouse.into(),
            error: Some(QueryError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Drops rows beyond `max_rows`.
    pub fn truncate(&mut self, max_rows: usize) {
        self.rows.truncate(max_rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_deserializes_optional_fields() {
        let req: QueryRequest = serde_json::from_value(json!({ "sql": "SELECT 1" })).unwrap();
        assert_eq!(req.sql, "SELECT 1");
        assert!(req.params.is_none());
        assert!(req.warehouse.is_none());
    }

    #[test]
    fn test_affected_result_has_no_rows() {
        let result = AdapterQueryResult::affected(3);
        assert!(result.rows.is_empty());
        assert_eq!(result.row_count, 3);
    }

    #[test]
    fn test_failure_serialization() {
        let result = QueryResult::failure("pg1", QUERY_EXECUTION_ERROR, "boom", 12);
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["success"], json!(false));
        assert_eq!(value["error"]["code"], json!("QUERY_EXECUTION_ERROR"));
        assert_eq!(value["warehouse"], json!("pg1"));
        assert!(value.get("rows_affected").is_none());
    }

    #[test]
    fn test_from_adapter_maps_fields_to_columns() {
        let mut row = Row::new();
        row.insert("x".into(), json!(1));
        let adapter_result =
            AdapterQueryResult::with_rows(vec![row], vec![ColumnInfo::new("x", "INT4")]);

        let result = QueryResult::from_adapter(adapter_result, "pg1", 5);
        assert!(result.success);
        assert_eq!(result.rows_affected, Some(1));
        assert_eq!(result.columns[0].name, "x");
        assert_eq!(result.rows[0]["x"], json!(1));
    }
}
