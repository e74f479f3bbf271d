use crate::types::PgText;
use async_trait::async_trait;
use dbfan_query::{Column, DataError, Result, RowCursor, ScanKind, Scanned};
use futures::TryStreamExt;
use std::pin::Pin;
use tokio_postgres::types::FromSql;
use tokio_postgres::{Row, RowStream, Statement};
use tracing::debug;

/// Streams rows of a prepared statement straight from the connection
pub struct PgCursor {
    columns: Vec<Column>,
    stream: Pin<Box<RowStream>>,
}

impl PgCursor {
    pub fn new(statement: &Statement, stream: RowStream) -> Self {
        let columns = statement
            .columns()
            .iter()
            .map(|column| Column::new(column.name(), column.type_().name().to_ascii_uppercase()))
            .collect();

        Self {
            columns,
            stream: Box::pin(stream),
        }
    }
}

fn cell<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Result<T> {
    row.try_get::<_, T>(idx).map_err(|e| {
        DataError::read_failed(format!("Column '{}': {}", row.columns()[idx].name(), e))
    })
}

fn decode(row: &Row, idx: usize, kind: ScanKind) -> Result<Scanned> {
    let type_name = row.columns()[idx].type_().name();

    let scanned = match kind {
        ScanKind::Text => Scanned::Text(cell::<Option<PgText>>(row, idx)?.map(|text| text.0)),
        ScanKind::Bool => Scanned::Bool(cell::<Option<bool>>(row, idx)?),
        ScanKind::Int64 => Scanned::Int64(match type_name {
            "int2" => cell::<Option<i16>>(row, idx)?.map(i64::from),
            "int4" => cell::<Option<i32>>(row, idx)?.map(i64::from),
            _ => cell::<Option<i64>>(row, idx)?,
        }),
        ScanKind::Float64 => Scanned::Float64(match type_name {
            "float4" => cell::<Option<f32>>(row, idx)?.map(f64::from),
            _ => cell::<Option<f64>>(row, idx)?,
        }),
    };

    Ok(scanned)
}

#[async_trait]
impl RowCursor for PgCursor {
    fn columns(&self) -> Result<Vec<Column>> {
        Ok(self.columns.clone())
    }

    async fn next_row(&mut self, targets: &[ScanKind]) -> Result<Option<Vec<Scanned>>> {
        let row = self
            .stream
            .as_mut()
            .try_next()
            .await
            .map_err(|e| DataError::read_failed(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };

        if row.len() != targets.len() {
            return Err(DataError::read_failed(format!(
                "Row has {} columns for {} scan targets",
                row.len(),
                targets.len()
            )));
        }

        targets
            .iter()
            .enumerate()
            .map(|(idx, kind)| decode(&row, idx, *kind))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    async fn close(&mut self) -> Result<()> {
        let mut discarded = 0usize;
        while self
            .stream
            .as_mut()
            .try_next()
            .await
            .map_err(|e| DataError::read_failed(e.to_string()))?
            .is_some()
        {
            discarded += 1;
        }

        if discarded > 0 {
            debug!("Discarded {} unread rows", discarded);
        }
        Ok(())
    }
}
