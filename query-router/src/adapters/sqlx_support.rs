//! Parameter binding, result collection and row decoding shared by the
//! sqlx-backed adapters.

use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::types::Json;
use sqlx::{Column, ColumnIndex, Database, Decode, Either, Encode, Row, Type, TypeInfo};

use common::models::{ColumnInfo, Row as JsonRow};

/// Binds each JSON parameter in order, picking the closest native type.
pub(crate) fn bind_params<'q, DB>(
    mut query: Query<'q, DB, <DB as Database>::Arguments<'q>>,
    params: &[Value],
) -> Query<'q, DB, <DB as Database>::Arguments<'q>>
where
    DB: Database,
    bool: Encode<'q, DB> + Type<DB>,
    i64: Encode<'q, DB> + Type<DB>,
    f64: Encode<'q, DB> + Type<DB>,
    String: Encode<'q, DB> + Type<DB>,
    Option<String>: Encode<'q, DB> + Type<DB>,
    Json<Value>: Encode<'q, DB> + Type<DB>,
{
    for param in params {
        query = match param {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => query.bind(i),
                None => query.bind(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => query.bind(s.clone()),
            Value::Array(_) | Value::Object(_) => query.bind(Json(param.clone())),
        };
    }
    query
}

/// Collects every row and every completion of a `fetch_many` stream.
///
/// Completions are merged, so the returned result carries the total
/// affected-row count.
pub(crate) async fn drain<DB: Database>(
    mut stream: BoxStream<'_, Result<Either<DB::QueryResult, DB::Row>, sqlx::Error>>,
) -> Result<(Vec<DB::Row>, DB::QueryResult), sqlx::Error> {
    let mut rows = Vec::new();
    let mut done = DB::QueryResult::default();
    while let Some(item) = stream.try_next().await? {
        match item {
            Either::Left(result) => done.extend(Some(result)),
            Either::Right(row) => rows.push(row),
        }
    }
    Ok((rows, done))
}

/// Converts a row into a JSON object using `decode` for each column.
pub(crate) fn row_to_json<R>(row: &R, decode: impl Fn(&R, usize, &str) -> Value) -> JsonRow
where
    R: Row,
{
    row.columns()
        .iter()
        .map(|column| {
            let value = decode(row, column.ordinal(), column.type_info().name());
            (column.name().to_string(), value)
        })
        .collect()
}

/// Column metadata. The drivers do not report nullability.
pub(crate) fn column_info<C: Column>(columns: &[C]) -> Vec<ColumnInfo> {
    columns
        .iter()
        .map(|column| ColumnInfo::new(column.name(), column.type_info().name()))
        .collect()
}

/// Decodes column `idx` as `T` and converts it, mapping SQL NULL to JSON null.
///
/// Returns `None` when the value does not decode as `T`, so the caller can
/// fall back to the raw value.
pub(crate) fn decode_as<'r, R, T>(
    row: &'r R,
    idx: usize,
    convert: impl FnOnce(T) -> Value,
) -> Option<Value>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: Decode<'r, R::Database> + Type<R::Database>,
{
    match row.try_get::<Option<T>, usize>(idx) {
        Ok(Some(value)) => Some(convert(value)),
        Ok(None) => Some(Value::Null),
        Err(e) => {
            tracing::debug!(column = idx, error = %e, "Typed decode failed, using raw value");
            None
        }
    }
}

/// Renders raw column bytes: printable UTF-8 as a string, anything else as
/// `\x`-prefixed hex.
pub(crate) fn raw_text(bytes: &[u8]) -> Value {
    match std::str::from_utf8(bytes) {
        Ok(text) if !text.chars().any(|c| c.is_control() && !c.is_whitespace()) => {
            Value::String(text.to_string())
        }
        _ => Value::String(format!("\\x{}", to_hex(bytes))),
    }
}

/// Lower-case hex encoding of binary column data.
pub(crate) fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// ISO-8601 rendering of a timestamp without zone.
pub(crate) fn naive_timestamp(ts: chrono::NaiveDateTime) -> Value {
    Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
}
