use crate::error::{DataError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Row limit applied when a request asks for zero rows
pub const DEFAULT_LIMIT: usize = 10;

/// Resolve a requested row limit, substituting the default for zero
pub fn effective_limit(limit: usize) -> usize {
    if limit == 0 {
        DEFAULT_LIMIT
    } else {
        limit
    }
}

/// Supported backend kinds
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Postgres,
    Sqlite,
    #[serde(rename = "mongodb")]
    MongoDb,
    Elasticsearch,
    Redis,
}

/// Data-store category a backend kind belongs to
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendFamily {
    /// SQL engines (Postgres, SQLite)
    Relational,
    /// Document stores (MongoDB)
    Document,
    /// Search engines (Elasticsearch)
    Search,
    /// Caches (Redis)
    Cache,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Postgres,
        BackendKind::Sqlite,
        BackendKind::MongoDb,
        BackendKind::Elasticsearch,
        BackendKind::Redis,
    ];

    pub fn family(&self) -> BackendFamily {
        match self {
            BackendKind::Postgres | BackendKind::Sqlite => BackendFamily::Relational,
            BackendKind::MongoDb => BackendFamily::Document,
            BackendKind::Elasticsearch => BackendFamily::Search,
            BackendKind::Redis => BackendFamily::Cache,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Postgres => write!(f, "postgres"),
            BackendKind::Sqlite => write!(f, "sqlite"),
            BackendKind::MongoDb => write!(f, "mongodb"),
            BackendKind::Elasticsearch => write!(f, "elasticsearch"),
            BackendKind::Redis => write!(f, "redis"),
        }
    }
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendFamily::Relational => write!(f, "relational"),
            BackendFamily::Document => write!(f, "document"),
            BackendFamily::Search => write!(f, "search"),
            BackendFamily::Cache => write!(f, "cache"),
        }
    }
}

/// A backend-independent scalar: record cells and bound parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Convert a JSON value, rendering arrays and objects as JSON text
    pub fn from_json(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::Text(s),
            other => Value::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Text(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

/// One result row as column name to value
pub type Record = HashMap<String, Value>;

/// Column metadata as reported by the backend driver
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Native type name (e.g. `int4`, `VARCHAR`); empty when unknown
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Scan target a column is decoded into
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScanKind {
    Text,
    Bool,
    Int64,
    Float64,
}

impl ScanKind {
    /// Select the scan target for a native type name. Unrecognized names scan as text.
    pub fn for_type_name(type_name: &str) -> Self {
        match type_name.trim().to_ascii_uppercase().as_str() {
            "BOOL" | "BOOLEAN" => ScanKind::Bool,
            "INT2" | "INT4" | "INT8" | "INT" | "INTEGER" | "SMALLINT" | "BIGINT" | "TINYINT"
            | "MEDIUMINT" => ScanKind::Int64,
            "FLOAT4" | "FLOAT8" | "REAL" | "DOUBLE" | "DOUBLE PRECISION" | "FLOAT" => {
                ScanKind::Float64
            }
            // VARCHAR, TEXT, UUID, TIMESTAMP and everything unknown
            _ => ScanKind::Text,
        }
    }
}

impl fmt::Display for ScanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanKind::Text => write!(f, "text"),
            ScanKind::Bool => write!(f, "bool"),
            ScanKind::Int64 => write!(f, "int64"),
            ScanKind::Float64 => write!(f, "float64"),
        }
    }
}

/// A decoded, possibly-null cell
#[derive(Debug, Clone, PartialEq)]
pub enum Scanned {
    Text(Option<String>),
    Bool(Option<bool>),
    Int64(Option<i64>),
    Float64(Option<f64>),
}

impl Scanned {
    /// A null cell of the given scan kind
    pub fn null(kind: ScanKind) -> Self {
        match kind {
            ScanKind::Text => Scanned::Text(None),
            ScanKind::Bool => Scanned::Bool(None),
            ScanKind::Int64 => Scanned::Int64(None),
            ScanKind::Float64 => Scanned::Float64(None),
        }
    }

    pub fn kind(&self) -> ScanKind {
        match self {
            Scanned::Text(_) => ScanKind::Text,
            Scanned::Bool(_) => ScanKind::Bool,
            Scanned::Int64(_) => ScanKind::Int64,
            Scanned::Float64(_) => ScanKind::Float64,
        }
    }

    /// Null becomes the zero value of the scan kind, never `Value::Null`
    pub fn coerce(self) -> Value {
        match self {
            Scanned::Text(v) => Value::Text(v.unwrap_or_default()),
            Scanned::Bool(v) => Value::Bool(v.unwrap_or_default()),
            Scanned::Int64(v) => Value::Int(v.unwrap_or_default()),
            Scanned::Float64(v) => Value::Float(v.unwrap_or_default()),
        }
    }
}

/// Request payload: query text or a structured filter, interpreted by the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Query {
    Text(String),
    Structured(serde_json::Value),
}

impl Query {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Query::Text(text) => Some(text),
            Query::Structured(_) => None,
        }
    }

    /// Structured payload, parsing text as JSON when needed
    pub fn to_json(&self) -> Result<serde_json::Value> {
        match self {
            Query::Structured(value) => Ok(value.clone()),
            Query::Text(text) => serde_json::from_str(text).map_err(|e| {
                DataError::invalid_query(format!("Expected a JSON payload: {}", e))
            }),
        }
    }

    /// Text payload, rejecting structured filters
    pub fn require_text(&self, kind: BackendKind) -> Result<&str> {
        self.as_text().ok_or_else(|| {
            DataError::invalid_query(format!(
                "{} expects query text, got a structured filter",
                kind
            ))
        })
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Text(text) => f.write_str(text),
            Query::Structured(value) => write!(f, "{}", value),
        }
    }
}

impl From<&str> for Query {
    fn from(text: &str) -> Self {
        Query::Text(text.to_string())
    }
}

impl From<String> for Query {
    fn from(text: String) -> Self {
        Query::Text(text)
    }
}

impl From<serde_json::Value> for Query {
    fn from(value: serde_json::Value) -> Self {
        Query::Structured(value)
    }
}
