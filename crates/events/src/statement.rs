//! Relational statements produced by projection reducers.
//!
//! Reducers never talk to storage. They return a [`Statement`] and the
//! projection store executes it together with the cursor update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A typed column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Json(JsonValue),
}

impl SqlValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            SqlValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            SqlValue::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&JsonValue> {
        match self {
            SqlValue::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<u64> for SqlValue {
    fn from(value: u64) -> Self {
        SqlValue::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<DateTime<Utc>> for SqlValue {
    fn from(value: DateTime<Utc>) -> Self {
        SqlValue::Timestamp(value)
    }
}

impl From<JsonValue> for SqlValue {
    fn from(value: JsonValue) -> Self {
        SqlValue::Json(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: &'static str,
    pub value: SqlValue,
}

impl Column {
    pub fn new(name: &'static str, value: impl Into<SqlValue>) -> Self {
        Self {
            name,
            value: value.into(),
        }
    }
}

/// Equality condition on a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub column: &'static str,
    pub value: SqlValue,
}

impl Condition {
    pub fn new(column: &'static str, value: impl Into<SqlValue>) -> Self {
        Self {
            column,
            value: value.into(),
        }
    }
}

/// One unit of projection work, executed atomically with the cursor update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Nothing to write; the cursor still advances.
    NoOp,
    Create {
        table: &'static str,
        columns: Vec<Column>,
    },
    Update {
        table: &'static str,
        values: Vec<Column>,
        conditions: Vec<Condition>,
    },
    Delete {
        table: &'static str,
        conditions: Vec<Condition>,
    },
    /// Insert, or update the non-conflict columns on conflict.
    Upsert {
        table: &'static str,
        columns: Vec<Column>,
        conflict_columns: Vec<&'static str>,
    },
    /// Ordered batch executed in one transaction.
    Multi(Vec<Statement>),
}

impl Statement {
    pub fn is_noop(&self) -> bool {
        match self {
            Statement::NoOp => true,
            Statement::Multi(statements) => statements.iter().all(Statement::is_noop),
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Text,
    Int64,
    Bool,
    Timestamp,
    Jsonb,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    pub name: &'static str,
    pub columns: Vec<&'static str>,
}

/// Schema a projection owns. Creating it is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub name: &'static str,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<&'static str>,
    pub indexes: Vec<Index>,
}

impl Table {
    pub fn new(name: &'static str, columns: Vec<ColumnDef>, primary_key: Vec<&'static str>) -> Self {
        Self {
            name,
            columns,
            primary_key,
            indexes: Vec::new(),
        }
    }

    pub fn with_index(mut self, name: &'static str, columns: Vec<&'static str>) -> Self {
        self.indexes.push(Index { name, columns });
        self
    }
}
