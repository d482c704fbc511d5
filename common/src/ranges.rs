//! Partición de tablas en rangos: por índice de fila según el peso de los
//! datos, o por claves pivote de tablets y particiones.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{cmp::Ordering, fmt, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cluster::{ClusterClient, OperationOptions, TablePath, OPERATION_POLL_PERIOD};
use crate::config::Context;
use crate::error::{Result, TmError};
use crate::format::Row;
use crate::job::{JobContext, JobFile, Mapper, UserJob};

/// A partir de cuántos tablets la recolección de pivotes se hace con una
/// operación map en vez de llamadas secuenciales.
pub const SEQUENTIAL_PIVOT_TABLETS_LIMIT: usize = 10;

/// Rango semiabierto de índices de fila `[lower, upper)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRange {
    pub lower: u64,
    pub upper: u64,
}

impl RowRange {
    pub fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    pub fn len(&self) -> u64 {
        self.upper.saturating_sub(self.lower)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Rango semiabierto de claves; `None` es no acotado.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: Option<Vec<Value>>,
    pub upper: Option<Vec<Value>>,
}

impl KeyRange {
    pub fn contains(&self, key: &[Value]) -> bool {
        if let Some(lower) = &self.lower {
            if compare_keys(key, lower).is_lt() {
                return false;
            }
        }
        match &self.upper {
            Some(upper) => compare_keys(key, upper).is_lt(),
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableRange {
    Rows(RowRange),
    Keys(KeyRange),
}

impl fmt::Display for TableRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = |k: &Option<Vec<Value>>| match k {
            None => String::new(),
            Some(values) => format!(
                "({})",
                values
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            ),
        };
        match self {
            TableRange::Rows(r) => write!(f, "#{}:#{}", r.lower, r.upper),
            TableRange::Keys(k) => write!(f, "{}:{}", key(&k.lower), key(&k.upper)),
        }
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Orden total sobre valores: null < bool < número < string < lista < mapa.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => match (x.as_u64(), y.as_u64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(f64::NAN);
                    let y = y.as_f64().unwrap_or(f64::NAN);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            },
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => compare_keys(x, y),
        _ if type_rank(a) != type_rank(b) => type_rank(a).cmp(&type_rank(b)),
        _ => a.to_string().cmp(&b.to_string()),
    }
}

/// Comparación lexicográfica de claves; un prefijo es menor que la clave.
pub fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b) {
        match compare_values(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    a.len().cmp(&b.len())
}

/// Compara dos filas por las columnas `key_columns`.
pub fn compare_rows(a: &Row, b: &Row, key_columns: &[String]) -> Ordering {
    for column in key_columns {
        let x = a.get(column).unwrap_or(&Value::Null);
        let y = b.get(column).unwrap_or(&Value::Null);
        match compare_values(x, y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Filas por rango: `max(1, row_count * target / data_size)`.
pub fn split_rows_count(row_count: u64, data_size: u64, target_size_per_job: u64) -> u64 {
    if data_size == 0 {
        return row_count.max(1);
    }
    let rows = (row_count as u128 * target_size_per_job.max(1) as u128) / data_size as u128;
    u64::try_from(rows).unwrap_or(u64::MAX).max(1)
}

/// Parte `[0, row_count)` en `ceil(row_count / split_rows)` rangos contiguos.
pub fn split_row_ranges(row_count: u64, data_size: u64, target_size_per_job: u64) -> Vec<RowRange> {
    if row_count == 0 {
        return Vec::new();
    }
    let step = split_rows_count(row_count, data_size, target_size_per_job);
    let mut ranges = Vec::with_capacity(row_count.div_ceil(step) as usize);
    let mut lower = 0;
    while lower < row_count {
        let upper = (lower + step).min(row_count);
        ranges.push(RowRange::new(lower, upper));
        lower = upper;
    }
    ranges
}

/// Quita los componentes nulos finales de una clave.
pub fn strip_trailing_nulls(mut key: Vec<Value>) -> Vec<Value> {
    while matches!(key.last(), Some(Value::Null)) {
        key.pop();
    }
    key
}

/// Normaliza pivotes: sin nulos finales ni claves vacías, ordenados y sin
/// duplicados adyacentes.
pub fn normalize_pivots(pivots: Vec<Vec<Value>>) -> Vec<Vec<Value>> {
    let mut keys: Vec<Vec<Value>> = pivots
        .into_iter()
        .map(strip_trailing_nulls)
        .filter(|k| !k.is_empty())
        .collect();
    keys.sort_by(|a, b| compare_keys(a, b));
    keys.dedup_by(|a, b| compare_keys(a, b) == Ordering::Equal);
    keys
}

/// Rangos de clave delimitados por pivotes ya normalizados.
pub fn key_ranges_from_pivots(pivots: &[Vec<Value>]) -> Vec<KeyRange> {
    let mut ranges = Vec::with_capacity(pivots.len() + 1);
    let mut lower: Option<Vec<Value>> = None;
    for pivot in pivots {
        ranges.push(KeyRange {
            lower: lower.take(),
            upper: Some(pivot.clone()),
        });
        lower = Some(pivot.clone());
    }
    ranges.push(KeyRange { lower, upper: None });
    ranges
}

/// Estadísticas de la tabla que se quiere partir.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableStats {
    pub row_count: u64,
    pub data_size: u64,
}

/// Elige la partición final: por claves si hay pivotes y caben en
/// `max_partition_count`, si no por índice de fila.
pub fn plan_ranges(
    pivots: Vec<Vec<Value>>,
    max_partition_count: usize,
    stats: TableStats,
    target_size_per_job: u64,
) -> Vec<TableRange> {
    if stats.row_count == 0 {
        return Vec::new();
    }
    let pivots = normalize_pivots(pivots);
    if !pivots.is_empty() && pivots.len() < max_partition_count {
        return key_ranges_from_pivots(&pivots)
            .into_iter()
            .map(TableRange::Keys)
            .collect();
    }
    if !pivots.is_empty() {
        debug!(
            pivots = pivots.len(),
            max_partition_count, "demasiados pivotes, partición por índice de fila"
        );
    }
    split_row_ranges(stats.row_count, stats.data_size, target_size_per_job)
        .into_iter()
        .map(TableRange::Rows)
        .collect()
}

/// Mapper que, para cada tablet de entrada `{tablet_id}`, emite las claves
/// pivote de sus particiones.
pub struct PivotCollector {
    pub source: Arc<dyn ClusterClient>,
}

#[async_trait]
impl Mapper for PivotCollector {
    async fn map(&self, row: Row, _ctx: &JobContext) -> Result<Vec<Row>> {
        let tablet_id = row
            .get("tablet_id")
            .and_then(Value::as_str)
            .ok_or_else(|| TmError::format("pivot row has no tablet_id"))?;
        let pivots = self
            .source
            .tablet_partitions(&Context::new(), tablet_id)
            .await?;
        Ok(pivots
            .into_iter()
            .map(|pivot| {
                let mut out = Row::new();
                out.insert("pivot_key".into(), Value::Array(pivot));
                out
            })
            .collect())
    }
}

/// Claves pivote de tablets y particiones de una tabla dinámica.
///
/// Con más de `SEQUENTIAL_PIVOT_TABLETS_LIMIT` tablets la lectura de las
/// particiones se reparte en una operación map sobre una tabla temporal con
/// un tablet por fila.
pub async fn collect_pivot_keys(
    client: &Arc<dyn ClusterClient>,
    ctx: &Context,
    path: &str,
    cancel: &CancellationToken,
) -> Result<Vec<Vec<Value>>> {
    let tablets = client.tablets(ctx, path).await?;
    let mut pivots: Vec<Vec<Value>> = tablets.iter().map(|t| t.pivot_key.clone()).collect();

    if tablets.len() <= SEQUENTIAL_PIVOT_TABLETS_LIMIT {
        for tablet in &tablets {
            pivots.extend(client.tablet_partitions(ctx, &tablet.tablet_id).await?);
        }
        return Ok(normalize_pivots(pivots));
    }

    info!(
        table = path,
        tablets = tablets.len(),
        "recolectando pivotes con una operación map"
    );
    let input = client.create_temp_table(ctx, None).await?;
    let output = client.create_temp_table(ctx, None).await?;
    let rows: Vec<Row> = tablets
        .iter()
        .map(|t| {
            let mut row = Row::new();
            row.insert("tablet_id".into(), json!(t.tablet_id));
            row
        })
        .collect();
    client.write_rows(ctx, &TablePath::new(&input), &rows).await?;

    let mut job = UserJob::mapper(
        PivotCollector {
            source: client.clone(),
        },
        format!(
            "tm-collect-pivots --proxy {} --token-file yt_token",
            client.proxy_address()
        ),
    );
    if let Some(token) = client.token() {
        job = job.with_file(JobFile::secret("yt_token", token.to_string()));
    }

    let options = OperationOptions {
        data_size_per_job: Some(1),
        title: Some(format!("Collect pivot keys of {path}")),
        ..Default::default()
    };
    client
        .run_map(ctx, job, vec![TablePath::new(&input)], TablePath::new(&output), options)
        .await?
        .wait(cancel, OPERATION_POLL_PERIOD, |_| {})
        .await?;

    for row in client.read_rows(ctx, &TablePath::new(&output)).await? {
        match row.get("pivot_key") {
            Some(Value::Array(key)) => pivots.push(key.clone()),
            other => {
                return Err(TmError::format(format!(
                    "unexpected pivot row value: {other:?}"
                )))
            }
        }
    }
    client.remove(ctx, &input, false, true).await?;
    client.remove(ctx, &output, false, true).await?;
    Ok(normalize_pivots(pivots))
}
