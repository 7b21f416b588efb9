//! Declarative merge policies.
//!
//! Every entity table has one [`MergePolicy`] listing, per column, how a stored value
//! combines with an incoming one when the row already exists. [`upsert`] turns a policy
//! into a single `INSERT ... ON CONFLICT ... DO UPDATE` statement, so a later save can
//! only add information: flags never clear, counters from stubs never land, and known
//! text is never replaced with blanks.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteArguments;
use sqlx::{
    Sqlite, SqliteConnection,
    query::{Query, QueryAs},
};

use crate::archivist::ids::{
    AccountId, AudioRoomId, ChatMessageId, ChatRoomId, ListId, NotificationId, PostId, RepostId,
};

/// How a single column combines on conflict. `col` is the stored value,
/// `excluded.col` the incoming one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Take the incoming value.
    Overwrite,
    /// Never change after the first write.
    Keep,
    /// `col OR excluded.col`
    Or,
    /// `col AND excluded.col`
    And,
    /// `max(col, excluded.col)`
    Max,
    /// Keep the stored value when the incoming row has the named flag set, otherwise overwrite.
    KeepIf(&'static str),
    /// Overwrite only when the incoming row has the named flag set.
    OverwriteIf(&'static str),
    /// Overwrite unless the incoming value is blank or NULL.
    KeepIfBlank,
    /// Fixed once set: only a blank or NULL stored value takes the incoming one.
    FillIfBlank,
    /// Overwrite unless the incoming value is NULL.
    PreferIncoming,
    /// Post text: replaced only while the stored post is a stub, or when it becomes
    /// expandable for the first time.
    ReplaceTextIfStubOrNewlyExpandable,
    /// Tombstones: a move to the generic `unavailable` classification never replaces a
    /// more specific stored one, and a stub carrying no classification clears nothing.
    NoDowngradeToGenericTombstone,
}

impl MergeRule {
    /// The `DO UPDATE SET` expression for `column`, or `None` when the column is left alone.
    pub fn update_expression(&self, column: &str) -> Option<String> {
        let c = column;
        match self {
            MergeRule::Overwrite => Some(format!("excluded.{c}")),
            MergeRule::Keep => None,
            MergeRule::Or => Some(format!("({c} OR excluded.{c})")),
            MergeRule::And => Some(format!("({c} AND excluded.{c})")),
            MergeRule::Max => Some(format!("max({c}, excluded.{c})")),
            MergeRule::KeepIf(flag) => {
                Some(format!("CASE WHEN excluded.{flag} THEN {c} ELSE excluded.{c} END"))
            }
            MergeRule::OverwriteIf(flag) => {
                Some(format!("CASE WHEN excluded.{flag} THEN excluded.{c} ELSE {c} END"))
            }
            MergeRule::KeepIfBlank => Some(format!("COALESCE(NULLIF(excluded.{c}, ''), {c})")),
            MergeRule::FillIfBlank => Some(format!(
                "CASE WHEN COALESCE({c}, '') = '' THEN excluded.{c} ELSE {c} END"
            )),
            MergeRule::PreferIncoming => Some(format!("COALESCE(excluded.{c}, {c})")),
            MergeRule::ReplaceTextIfStubOrNewlyExpandable => Some(format!(
                "CASE WHEN is_stub OR (excluded.is_expandable AND NOT is_expandable) \
                 THEN excluded.{c} ELSE {c} END"
            )),
            MergeRule::NoDowngradeToGenericTombstone => Some(format!(
                "CASE WHEN (excluded.{c} = 'unavailable' \
                 AND COALESCE({c}, '') NOT IN ('', 'unavailable')) \
                 OR (excluded.{c} IS NULL AND excluded.is_stub) \
                 THEN {c} ELSE excluded.{c} END"
            )),
        }
    }
}

/// The merge rules of one table. Columns without a rule are overwritten.
#[derive(Debug, Clone, Copy)]
pub struct MergePolicy {
    pub table: &'static str,
    pub conflict_target: &'static [&'static str],
    pub rules: &'static [(&'static str, MergeRule)],
}

impl MergePolicy {
    pub fn rule_for(&self, column: &str) -> MergeRule {
        if self.conflict_target.contains(&column) {
            return MergeRule::Keep;
        }
        self.rules
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, rule)| *rule)
            .unwrap_or(MergeRule::Overwrite)
    }

    /// Builds the upsert statement for the given column list, in that bind order.
    pub fn upsert_sql(&self, columns: &[&str]) -> String {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let assignments: Vec<String> = columns
            .iter()
            .filter_map(|column| {
                self.rule_for(column)
                    .update_expression(column)
                    .map(|expr| format!("{column} = {expr}"))
            })
            .collect();

        let on_conflict = if assignments.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", assignments.join(", "))
        };

        format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            self.table,
            columns.join(", "),
            placeholders,
            self.conflict_target.join(", "),
            on_conflict
        )
    }
}

/// A bindable column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Int(i64),
    Bool(bool),
    Text(String),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Int(value.timestamp_millis())
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

macro_rules! sql_value_from_id {
    (int: $($id:ty),*; text: $($sid:ty),*) => {
        $(impl From<$id> for SqlValue {
            fn from(value: $id) -> Self {
                SqlValue::Int(value.0)
            }
        })*
        $(impl From<$sid> for SqlValue {
            fn from(value: $sid) -> Self {
                SqlValue::Text(value.0)
            }
        })*
    };
}

sql_value_from_id!(
    int: AccountId, PostId, RepostId, NotificationId, ChatMessageId, ListId;
    text: AudioRoomId, ChatRoomId
);

pub(crate) fn bind_value<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q SqlValue,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<i64>),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
    }
}

pub(crate) fn bind_value_as<'q, O: Send>(
    query: QueryAs<'q, Sqlite, O, SqliteArguments<'q>>,
    value: &'q SqlValue,
) -> QueryAs<'q, Sqlite, O, SqliteArguments<'q>> {
    match value {
        SqlValue::Null => query.bind(None::<i64>),
        SqlValue::Int(v) => query.bind(*v),
        SqlValue::Bool(v) => query.bind(*v),
        SqlValue::Text(v) => query.bind(v.as_str()),
    }
}

/// Inserts `values` into the policy's table, merging with any existing row per the policy.
///
/// Returns the number of rows written (0 when a `DO NOTHING` policy hit an existing row).
pub(crate) async fn upsert(
    conn: &mut SqliteConnection,
    policy: &MergePolicy,
    values: &[(&str, SqlValue)],
) -> Result<u64, sqlx::Error> {
    let columns: Vec<&str> = values.iter().map(|(column, _)| *column).collect();
    let sql = policy.upsert_sql(&columns);

    let mut query = sqlx::query(&sql);
    for (_, value) in values {
        query = bind_value(query, value);
    }

    let result = query.execute(&mut *conn).await?;
    Ok(result.rows_affected())
}
