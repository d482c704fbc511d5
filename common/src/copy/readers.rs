//! Código de usuario de los jobs de copia. En un clúster real cada job
//! ejecuta el script de `scripts`; el ejecutor local despacha estos tipos.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::cluster::{ClusterClient, TablePath, TxId};
use crate::config::Context;
use crate::error::{Result, TmError};
use crate::format::{Format, Row};
use crate::job::{Aggregator, JobContext, Mapper};
use crate::ranges::{RowRange, TableRange};

/// Filas `{start, end}` de la tabla de rangos.
pub fn range_rows(ranges: &[RowRange]) -> Vec<Row> {
    ranges
        .iter()
        .map(|r| {
            let mut row = Row::new();
            row.insert("start".into(), json!(r.lower));
            row.insert("end".into(), json!(r.upper));
            row
        })
        .collect()
}

fn bound(row: &Row, column: &str) -> Result<u64> {
    let parsed = match row.get(column) {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| {
        TmError::format(format!("range row has no numeric {column:?}: {}", json!(row)))
    })
}

/// Lee `[lower, upper)` de una fila de rangos. Acepta números o texto, que
/// es lo que llega desde formatos como schemaful_dsv o yamr.
pub fn row_range(row: &Row, lower: &str, upper: &str) -> Result<RowRange> {
    let range = RowRange::new(bound(row, lower)?, bound(row, upper)?);
    if range.lower > range.upper {
        return Err(TmError::format(format!(
            "range [{}, {}) is inverted",
            range.lower, range.upper
        )));
    }
    Ok(range)
}

/// Convierte una fila a `{key, subkey, value}`. Solo admite columnas de texto.
pub fn to_yamr_row(row: Row) -> Result<Row> {
    let mut out = Row::new();
    for (column, required) in [("key", true), ("subkey", false), ("value", true)] {
        match row.get(column) {
            Some(Value::String(s)) => {
                out.insert(column.into(), json!(s));
            }
            None if !required => {
                out.insert(column.into(), json!(""));
            }
            other => {
                return Err(TmError::format(format!(
                    "column {column:?} must be a string to be written as yamr, got {other:?}"
                )))
            }
        }
    }
    if let Some(extra) = row.keys().find(|k| !["key", "subkey", "value"].contains(&k.as_str())) {
        return Err(TmError::format(format!(
            "column {extra:?} cannot be represented in yamr format"
        )));
    }
    Ok(out)
}

/// Mapper que, para cada fila de rangos, lee ese rango de la tabla de origen.
pub struct RangeReader {
    source: Arc<dyn ClusterClient>,
    table: String,
    transaction: Option<TxId>,
    lower_column: String,
    upper_column: String,
    yamr_output: bool,
}

impl RangeReader {
    pub fn new(source: Arc<dyn ClusterClient>, table: &str, transaction: Option<TxId>) -> Self {
        Self {
            source,
            table: table.to_string(),
            transaction,
            lower_column: "start".into(),
            upper_column: "end".into(),
            yamr_output: false,
        }
    }

    pub fn with_columns(mut self, lower: &str, upper: &str) -> Self {
        self.lower_column = lower.to_string();
        self.upper_column = upper.to_string();
        self
    }

    /// Emite las filas como `{key, subkey, value}`.
    pub fn to_yamr(mut self) -> Self {
        self.yamr_output = true;
        self
    }
}

#[async_trait]
impl Mapper for RangeReader {
    async fn map(&self, row: Row, _ctx: &JobContext) -> Result<Vec<Row>> {
        let range = row_range(&row, &self.lower_column, &self.upper_column)?;
        let ctx = Context {
            transaction: self.transaction.clone(),
            ping_ancestors: false,
        };
        let path = TablePath::new(&self.table).with_ranges(vec![TableRange::Rows(range)]);
        let rows = self.source.read_rows(&ctx, &path).await?;
        if self.yamr_output {
            rows.into_iter().map(to_yamr_row).collect()
        } else {
            Ok(rows)
        }
    }
}

/// Escribe toda la entrada del job, en formato yamr, al final de una tabla
/// de otro clúster. No emite filas.
pub struct YamrWriter {
    pub target: Arc<dyn ClusterClient>,
    pub table: String,
}

#[async_trait]
impl Aggregator for YamrWriter {
    async fn aggregate(&self, rows: Vec<Row>, _ctx: &JobContext) -> Result<Vec<Row>> {
        let rows = rows.into_iter().map(to_yamr_row).collect::<Result<Vec<_>>>()?;
        let path = TablePath::new(&self.table).with_append(true);
        self.target.write_rows(&Context::new(), &path, &rows).await?;
        Ok(Vec::new())
    }
}

/// Mapper que lee un fichero exportado de hive por fila `{file}`.
pub struct HiveFileReader {
    pub hive: Arc<dyn ClusterClient>,
    pub format: Format,
}

#[async_trait]
impl Mapper for HiveFileReader {
    async fn map(&self, row: Row, _ctx: &JobContext) -> Result<Vec<Row>> {
        let file = row
            .get("file")
            .and_then(Value::as_str)
            .ok_or_else(|| TmError::format("hive file row has no \"file\" column"))?;
        let data = self.hive.read_file(&Context::new(), file).await?;
        self.format.decode_rows(&data)
    }
}
