use chrono::{DateTime, Utc};
use sqlx::Row;

use super::DatabaseError;

/// Parses a millisecond INTEGER timestamp column.
pub(crate) fn parse_timestamp<'r, R>(
    row: &'r R,
    column_name: &'r str,
) -> Result<DateTime<Utc>, sqlx::Error>
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    let timestamp_ms: i64 = row.try_get(column_name)?;
    DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
        create_column_decode_error(
            column_name,
            DatabaseError::InvalidTimestamp {
                timestamp: timestamp_ms,
            },
        )
    })
}

/// Like [`parse_timestamp`], but `0` (the column default) means "never".
pub(crate) fn parse_optional_timestamp<'r, R>(
    row: &'r R,
    column_name: &'r str,
) -> Result<Option<DateTime<Utc>>, sqlx::Error>
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    let timestamp_ms: i64 = row.try_get(column_name)?;
    if timestamp_ms == 0 {
        return Ok(None);
    }
    parse_timestamp(row, column_name).map(Some)
}

/// Reads a 0/1 INTEGER column.
pub(crate) fn parse_flag<'r, R>(row: &'r R, column_name: &'r str) -> Result<bool, sqlx::Error>
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    let value: i64 = row.try_get(column_name)?;
    Ok(value != 0)
}

/// Inverse of [`parse_optional_timestamp`].
pub(crate) fn optional_timestamp_millis(timestamp: Option<DateTime<Utc>>) -> i64 {
    timestamp.map(|t| t.timestamp_millis()).unwrap_or(0)
}

/// `?, ?, ?` with `count` placeholders, for `IN (...)` lists.
pub(crate) fn placeholders(count: usize) -> String {
    let placeholders = "?,".repeat(count);
    placeholders.trim_end_matches(',').to_string()
}

pub(crate) fn create_column_decode_error(
    column_name: &str,
    source: impl std::error::Error + Send + Sync + 'static,
) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column_name.to_string(),
        source: Box::new(source),
    }
}
