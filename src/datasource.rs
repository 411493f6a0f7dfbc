use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Positional bind parameter for a parameterised statement (`$1`, `$2`, ...).
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    Text(String),
    Int(i64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    TextList(Vec<String>),
    IntList(Vec<i64>),
}

impl From<&str> for Param {
    fn from(value: &str) -> Self {
        Param::Text(value.to_string())
    }
}

impl From<String> for Param {
    fn from(value: String) -> Self {
        Param::Text(value)
    }
}

impl From<i64> for Param {
    fn from(value: i64) -> Self {
        Param::Int(value)
    }
}

impl From<f64> for Param {
    fn from(value: f64) -> Self {
        Param::Float(value)
    }
}

impl From<DateTime<Utc>> for Param {
    fn from(value: DateTime<Utc>) -> Self {
        Param::Timestamp(value)
    }
}

impl From<Vec<String>> for Param {
    fn from(value: Vec<String>) -> Self {
        Param::TextList(value)
    }
}

impl From<Vec<i64>> for Param {
    fn from(value: Vec<i64>) -> Self {
        Param::IntList(value)
    }
}

/// A decoded column value. Types the engine never reads are kept as `Unsupported`
/// with the Postgres type name so dumps can still show something useful.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Unsupported(String),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Text(v) => v.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v),
            _ => None,
        }
    }

    fn type_label(&self) -> &str {
        match self {
            Value::Null => "UNKNOWN",
            Value::Bool(_) => "BOOL",
            Value::Int(_) => "INT8",
            Value::Float(_) => "FLOAT8",
            Value::Text(_) => "TEXT",
            Value::Timestamp(_) => "TIMESTAMPTZ",
            Value::Unsupported(name) => name,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Text(v) => f.write_str(v),
            Value::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Value::Unsupported(name) => write!(f, "<{name}>"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Column metadata carried alongside every row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

/// One result row: shared column metadata plus positional values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[Column]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Build a row from `(name, value)` pairs, inferring the column type from the value.
    pub fn from_pairs<I, S, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, V)>,
        S: Into<String>,
        V: Into<Value>,
    {
        let (columns, values): (Vec<Column>, Vec<Value>) = pairs
            .into_iter()
            .map(|(name, value)| {
                let value = value.into();
                let column = Column {
                    name: name.into(),
                    type_name: value.type_label().to_string(),
                };
                (column, value)
            })
            .unzip();
        Self {
            columns: columns.into(),
            values,
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|column| column.name == name)
            .and_then(|idx| self.values.get(idx))
    }

    fn require(&self, name: &str) -> Result<&Value> {
        self.get(name)
            .ok_or_else(|| anyhow!("result set has no column named {name}"))
    }

    pub fn text(&self, name: &str) -> Result<String> {
        self.opt_text(name)?
            .ok_or_else(|| anyhow!("column {name} is NULL"))
    }

    pub fn opt_text(&self, name: &str) -> Result<Option<String>> {
        match self.require(name)? {
            Value::Null => Ok(None),
            Value::Text(v) => Ok(Some(v.clone())),
            other => Ok(Some(other.to_string())),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64> {
        self.opt_int(name)?
            .ok_or_else(|| anyhow!("column {name} is NULL"))
    }

    pub fn opt_int(&self, name: &str) -> Result<Option<i64>> {
        let value = self.require(name)?;
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_i64()
            .map(Some)
            .ok_or_else(|| anyhow!("column {name} is not an integer: {value}"))
    }

    pub fn float(&self, name: &str) -> Result<f64> {
        self.opt_float(name)?
            .ok_or_else(|| anyhow!("column {name} is NULL"))
    }

    pub fn opt_float(&self, name: &str) -> Result<Option<f64>> {
        let value = self.require(name)?;
        if value.is_null() {
            return Ok(None);
        }
        value
            .as_f64()
            .map(Some)
            .ok_or_else(|| anyhow!("column {name} is not numeric: {value}"))
    }

    pub fn bool(&self, name: &str) -> Result<bool> {
        match self.require(name)? {
            Value::Bool(v) => Ok(*v),
            other => Err(anyhow!("column {name} is not a boolean: {other}")),
        }
    }

    pub fn timestamp(&self, name: &str) -> Result<DateTime<Utc>> {
        match self.require(name)? {
            Value::Timestamp(v) => Ok(*v),
            other => Err(anyhow!("column {name} is not a timestamp: {other}")),
        }
    }
}

/// Anything that can answer SQL for the engine. The live implementation wraps an sqlx
/// pool; tests script responses.
pub trait DataSource: Send + Sync {
    fn query_rows(&self, sql: &str, params: &[Param])
    -> impl Future<Output = Result<Vec<Row>>> + Send;

    /// First column of the first row, or `Value::Null` for an empty result.
    fn query_scalar(&self, sql: &str, params: &[Param])
    -> impl Future<Output = Result<Value>> + Send;

    /// Run a statement that returns no rows; yields the affected row count.
    fn exec(&self, sql: &str, params: &[Param]) -> impl Future<Output = Result<u64>> + Send;

    fn database_name(&self) -> &str;

    fn schema(&self) -> &str;
}
