//! Row materialization: turning a backend cursor into generic records.

use crate::error::{DataError, Result};
use crate::types::{effective_limit, Column, Record, ScanKind, Scanned};
use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// An executed, tabular result positioned before its first row
#[async_trait]
pub trait RowCursor: Send {
    /// Column metadata in source order
    fn columns(&self) -> Result<Vec<Column>>;

    /// Decode the next row into the given scan targets, one per column.
    /// Returns `None` once the cursor is exhausted.
    async fn next_row(&mut self, targets: &[ScanKind]) -> Result<Option<Vec<Scanned>>>;

    /// Drain any remaining rows and release the underlying resources
    async fn close(&mut self) -> Result<()>;
}

/// Materialize at most `limit` rows (zero means the default limit) from a cursor.
///
/// The cursor is always closed, including when the limit truncates the output or
/// a row fails to decode. Any failure discards the rows assembled so far.
pub async fn materialize(mut cursor: Box<dyn RowCursor>, limit: usize) -> Result<Vec<Record>> {
    let limit = effective_limit(limit);

    let columns = match cursor.columns() {
        Ok(columns) => columns,
        Err(e) => {
            release(cursor.as_mut()).await;
            return Err(as_read_error(e));
        }
    };

    let targets: Vec<ScanKind> = columns
        .iter()
        .map(|column| ScanKind::for_type_name(&column.type_name))
        .collect();

    let mut records = Vec::new();
    while records.len() < limit {
        let scanned = match cursor.next_row(&targets).await {
            Ok(Some(scanned)) => scanned,
            Ok(None) => break,
            Err(e) => {
                release(cursor.as_mut()).await;
                return Err(as_read_error(e));
            }
        };

        if scanned.len() != columns.len() {
            release(cursor.as_mut()).await;
            return Err(DataError::read_failed(format!(
                "Row has {} values for {} columns",
                scanned.len(),
                columns.len()
            )));
        }

        let record: Record = columns
            .iter()
            .zip(scanned)
            .map(|(column, cell)| (column.name.clone(), cell.coerce()))
            .collect();
        records.push(record);
    }

    cursor.close().await.map_err(as_read_error)?;

    debug!("Materialized {} rows (limit {})", records.len(), limit);
    Ok(records)
}

async fn release(cursor: &mut dyn RowCursor) {
    if let Err(e) = cursor.close().await {
        warn!("Failed to release cursor after error: {}", e);
    }
}

fn as_read_error(e: DataError) -> DataError {
    match e {
        DataError::ReadFailed(_) => e,
        other => DataError::ReadFailed(other.to_string()),
    }
}

/// In-memory cursor over rows that were already fetched from the backend
#[derive(Debug, Clone, Default)]
pub struct BufferedCursor {
    columns: Vec<Column>,
    rows: VecDeque<Vec<serde_json::Value>>,
}

impl BufferedCursor {
    /// Create a cursor from columns and row-major cells
    pub fn new(columns: Vec<Column>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self {
            columns,
            rows: rows.into(),
        }
    }

    /// Build a cursor from documents. Columns are the union of top-level keys in
    /// first-seen order; a key missing from a document reads as null.
    pub fn from_documents(documents: Vec<serde_json::Map<String, serde_json::Value>>) -> Self {
        let mut names: Vec<String> = Vec::new();
        for document in &documents {
            for key in document.keys() {
                if !names.iter().any(|name| name == key) {
                    names.push(key.clone());
                }
            }
        }

        let columns: Vec<Column> = names
            .iter()
            .map(|name| {
                let values = documents.iter().filter_map(|document| document.get(name));
                Column::new(name.clone(), infer_type_name(values))
            })
            .collect();

        let rows = documents
            .into_iter()
            .map(|mut document| {
                names
                    .iter()
                    .map(|name| document.remove(name).unwrap_or(serde_json::Value::Null))
                    .collect()
            })
            .collect();

        Self { columns, rows }
    }

    pub fn remaining(&self) -> usize {
        self.rows.len()
    }
}

#[async_trait]
impl RowCursor for BufferedCursor {
    fn columns(&self) -> Result<Vec<Column>> {
        Ok(self.columns.clone())
    }

    async fn next_row(&mut self, targets: &[ScanKind]) -> Result<Option<Vec<Scanned>>> {
        let Some(row) = self.rows.pop_front() else {
            return Ok(None);
        };

        if row.len() != targets.len() {
            return Err(DataError::read_failed(format!(
                "Row has {} cells for {} scan targets",
                row.len(),
                targets.len()
            )));
        }

        row.iter()
            .zip(targets)
            .zip(&self.columns)
            .map(|((cell, kind), column)| {
                decode_json(cell, *kind).map_err(|e| {
                    DataError::read_failed(format!("Column '{}': {}", column.name, e))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    async fn close(&mut self) -> Result<()> {
        self.rows.clear();
        Ok(())
    }
}

/// Infer a native type name from the non-null values of a document field
fn infer_type_name<'a>(values: impl Iterator<Item = &'a serde_json::Value>) -> &'static str {
    let mut inferred: Option<&'static str> = None;

    for value in values {
        let current = match value {
            serde_json::Value::Null => continue,
            serde_json::Value::Bool(_) => "BOOL",
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => "INT8",
            serde_json::Value::Number(_) => "FLOAT8",
            serde_json::Value::String(_) => "TEXT",
            _ => return "JSON",
        };

        inferred = match (inferred, current) {
            (None, current) => Some(current),
            (Some(previous), current) if previous == current => Some(previous),
            (Some("INT8"), "FLOAT8") | (Some("FLOAT8"), "INT8") => Some("FLOAT8"),
            _ => return "JSON",
        };
    }

    inferred.unwrap_or("TEXT")
}

/// Decode a JSON cell into a scan target
pub fn decode_json(cell: &serde_json::Value, kind: ScanKind) -> Result<Scanned> {
    use serde_json::Value as Json;

    if cell.is_null() {
        return Ok(Scanned::null(kind));
    }

    let mismatch = || {
        DataError::read_failed(format!("cannot decode {} into {}", cell, kind))
    };

    let scanned = match kind {
        ScanKind::Text => Scanned::Text(Some(match cell {
            Json::String(s) => s.clone(),
            other => other.to_string(),
        })),
        ScanKind::Bool => Scanned::Bool(Some(match cell {
            Json::Bool(b) => *b,
            Json::String(s) => s.parse::<bool>().map_err(|_| mismatch())?,
            _ => return Err(mismatch()),
        })),
        ScanKind::Int64 => Scanned::Int64(Some(match cell {
            Json::Number(n) => n.as_i64().ok_or_else(mismatch)?,
            Json::String(s) => s.trim().parse::<i64>().map_err(|_| mismatch())?,
            _ => return Err(mismatch()),
        })),
        ScanKind::Float64 => Scanned::Float64(Some(match cell {
            Json::Number(n) => n.as_f64().ok_or_else(mismatch)?,
            Json::String(s) => s.trim().parse::<f64>().map_err(|_| mismatch())?,
            _ => return Err(mismatch()),
        })),
    };

    Ok(scanned)
}
