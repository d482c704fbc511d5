//! Operaciones map sobre tablas dinámicas.
//!
//! La tabla se parte por las claves pivote de sus tablets y particiones;
//! cada job hace un `select_rows` por rango de claves. La escritura hacia
//! una tabla dinámica se hace con `insert_rows` en lotes.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use std::{sync::Arc, time::Duration};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{
    ClusterClient, OperationOptions, SelectQuery, TablePath, TabletState, OPERATION_POLL_PERIOD,
};
use crate::config::Context;
use crate::error::{ErrorKind, Result, TmError};
use crate::format::Row;
use crate::job::{Aggregator, JobContext, JobDescriptor, Mapper, UserJob};
use crate::ranges::{collect_pivot_keys, key_ranges_from_pivots};
use crate::retry::{RetryEngine, RetryPolicy};

pub const DEFAULT_BATCH_SIZE: usize = 50_000;
pub const DEFAULT_ROW_LIMIT: u64 = 100_000_000;
pub const DEFAULT_STATE_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_STATE_PAUSE: Duration = Duration::from_secs(1);
/// Tope de `max_partition_data_size` para tablas con `optimize_for=scan`.
const MAX_SCAN_PARTITION_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct DynamicTableOptions {
    pub job_count: Option<u64>,
    /// Jobs simultáneos como máximo.
    pub user_slots: Option<u64>,
    pub job_memory_limit: Option<u64>,
    pub max_failed_job_count: Option<u64>,
    pub data_size_per_job: Option<u64>,
    pub batch_size: usize,
    pub input_row_limit: u64,
    pub output_row_limit: u64,
    pub pool: Option<String>,
}

impl Default for DynamicTableOptions {
    fn default() -> Self {
        Self {
            job_count: None,
            user_slots: None,
            job_memory_limit: None,
            max_failed_job_count: None,
            data_size_per_job: None,
            batch_size: DEFAULT_BATCH_SIZE,
            input_row_limit: DEFAULT_ROW_LIMIT,
            output_row_limit: DEFAULT_ROW_LIMIT,
            pool: None,
        }
    }
}

impl DynamicTableOptions {
    /// Spec de la operación map a partir de las opciones.
    pub fn build_spec(&self, title: String) -> OperationOptions {
        let mut options = OperationOptions {
            job_count: self.job_count,
            data_size_per_job: self.data_size_per_job,
            max_failed_job_count: self.max_failed_job_count,
            pool: self.pool.clone(),
            title: Some(title),
            ..Default::default()
        };
        options.extra.insert("enable_job_proxy_memory_control".into(), json!(false));
        options.extra.insert("job_proxy_memory_control".into(), json!(false));
        if let Some(slots) = self.user_slots {
            options.extra.insert("resource_limits".into(), json!({ "user_slots": slots }));
        }
        options
    }

    fn job(&self, descriptor: JobDescriptor, command: String) -> UserJob {
        let job = UserJob::new(descriptor, command);
        match self.job_memory_limit {
            Some(limit) => job.with_memory_limit(limit),
            None => job,
        }
    }
}

/* ---------------- jobs ---------------- */

fn bound(row: &Row, column: &str) -> Result<Option<Vec<Value>>> {
    match row.get(column) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(key)) => Ok(Some(key.clone())),
        Some(other) => Err(TmError::format(format!(
            "partition bound {column:?} must be a list, got {other}"
        ))),
    }
}

/// Para cada fila `{left, right}` selecciona ese rango de claves de la
/// tabla de origen y, si hay `mapper`, lo aplica al lote.
struct BoundsSelector {
    client: Arc<dyn ClusterClient>,
    table: String,
    key_columns: Vec<String>,
    columns: Option<Vec<String>>,
    row_limit: u64,
    mapper: Option<Arc<dyn Aggregator>>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

#[async_trait]
impl Aggregator for BoundsSelector {
    async fn aggregate(&self, rows: Vec<Row>, ctx: &JobContext) -> Result<Vec<Row>> {
        let engine = RetryEngine::new(self.retry.clone(), self.cancel.clone());
        let root = Context::new();
        let mut out = Vec::new();
        for row in rows {
            let query = SelectQuery {
                table: self.table.clone(),
                columns: self.columns.clone(),
                key_columns: self.key_columns.clone(),
                lower: bound(&row, "left")?,
                upper: bound(&row, "right")?,
                limit: Some(self.row_limit),
            };
            let selected = engine
                .run(|_| self.client.select_rows(&root, &query))
                .await?;
            match &self.mapper {
                Some(mapper) => out.extend(mapper.aggregate(selected, ctx).await?),
                None => out.extend(selected),
            }
        }
        Ok(out)
    }
}

/// Inserta la entrada del job, mapeada fila a fila, en una tabla dinámica
/// en lotes de `batch_size`. No emite filas.
struct BatchInserter {
    client: Arc<dyn ClusterClient>,
    table: String,
    mapper: Option<Arc<dyn Mapper>>,
    batch_size: usize,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

#[async_trait]
impl Aggregator for BatchInserter {
    async fn aggregate(&self, rows: Vec<Row>, ctx: &JobContext) -> Result<Vec<Row>> {
        let rows = match &self.mapper {
            Some(mapper) => {
                let mut mapped = Vec::with_capacity(rows.len());
                for row in rows {
                    mapped.extend(mapper.map(row, ctx).await?);
                }
                mapped
            }
            None => rows,
        };
        let engine = RetryEngine::new(self.retry.clone(), self.cancel.clone());
        let root = Context::new();
        for batch in rows.chunks(self.batch_size.max(1)) {
            engine
                .run(|_| self.client.insert_rows(&root, &self.table, batch.to_vec()))
                .await?;
        }
        Ok(Vec::new())
    }
}

/* ---------------- driver ---------------- */

pub struct DynamicTableDriver {
    client: Arc<dyn ClusterClient>,
    options: DynamicTableOptions,
    retry: RetryPolicy,
    cancel: CancellationToken,
    state_timeout: Duration,
    state_pause: Duration,
}

impl DynamicTableDriver {
    pub fn new(client: Arc<dyn ClusterClient>, options: DynamicTableOptions) -> Self {
        Self {
            client,
            options,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            state_timeout: DEFAULT_STATE_TIMEOUT,
            state_pause: DEFAULT_STATE_PAUSE,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_state_wait(mut self, timeout: Duration, pause: Duration) -> Self {
        self.state_timeout = timeout;
        self.state_pause = pause;
        self
    }

    pub fn options(&self) -> &DynamicTableOptions {
        &self.options
    }

    /* ----- estados de tablets ----- */

    async fn tablet_states(&self, ctx: &Context, table: &str) -> Result<Vec<TabletState>> {
        let states: Vec<TabletState> = self
            .client
            .tablets(ctx, table)
            .await?
            .into_iter()
            .map(|t| t.state)
            .collect();
        debug!(table, ?states, "estado de tablets");
        Ok(states)
    }

    async fn wait_for<P>(&self, ctx: &Context, table: &str, what: &str, timeout: Duration, pred: P) -> Result<()>
    where
        P: Fn(&[TabletState]) -> bool,
    {
        let start = Instant::now();
        loop {
            let states = self.tablet_states(ctx, table).await?;
            if pred(&states[..]) {
                return Ok(());
            }
            if start.elapsed() > timeout {
                return Err(TmError::new(
                    ErrorKind::Timeout,
                    format!("Timeout while waiting for \"{what}\""),
                )
                .with_attribute("table", table));
            }
            info!(table, "esperando: {what}");
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(TmError::cancelled()),
                _ = tokio::time::sleep(self.state_pause) => {}
            }
        }
    }

    /// Espera a que todos los tablets estén en `state`.
    pub async fn wait_for_state(&self, ctx: &Context, table: &str, state: TabletState) -> Result<()> {
        let what = format!("All {table} tablets are {state:?}");
        self.wait_for(ctx, table, &what, self.state_timeout, |states| {
            states.iter().all(|s| *s == state)
        })
        .await
    }

    pub async fn mount_table(&self, ctx: &Context, table: &str) -> Result<()> {
        self.set_state(ctx, table, TabletState::Mounted).await
    }

    pub async fn unmount_table(&self, ctx: &Context, table: &str) -> Result<()> {
        self.set_state(ctx, table, TabletState::Unmounted).await
    }

    async fn set_state(&self, ctx: &Context, table: &str, state: TabletState) -> Result<()> {
        let start = Instant::now();
        // 1) nada a medio camino
        let what = format!("All {table} tablets are either mounted or unmounted");
        self.wait_for(ctx, table, &what, self.state_timeout, |states| {
            states
                .iter()
                .all(|s| matches!(s, TabletState::Mounted | TabletState::Unmounted))
        })
        .await?;

        // 2) ya está
        if self.tablet_states(ctx, table).await?.iter().all(|s| *s == state) {
            return Ok(());
        }

        // 3) pedir el cambio y esperar con lo que queda de plazo
        match state {
            TabletState::Unmounted => self.client.unmount_table(ctx, table).await?,
            _ => self.client.mount_table(ctx, table).await?,
        }
        let remaining = self.state_timeout.saturating_sub(start.elapsed());
        let what = format!("All {table} tablets are {state:?}");
        self.wait_for(ctx, table, &what, remaining, |states| {
            states.iter().all(|s| *s == state)
        })
        .await
    }

    /* ----- particiones ----- */

    /// Escribe en `bounds_table` los rangos de clave `{left, right}` que
    /// delimitan tablets y particiones de `table`, en orden aleatorio.
    /// Devuelve cuántos rangos hay.
    pub async fn extract_partition_bounds(&self, ctx: &Context, table: &str, bounds_table: &str) -> Result<usize> {
        let pivots = collect_pivot_keys(&self.client, ctx, table, &self.cancel).await?;
        let mut rows: Vec<Row> = key_ranges_from_pivots(&pivots)
            .into_iter()
            .map(|range| {
                let mut row = Row::new();
                row.insert("left".into(), range.lower.map(Value::Array).unwrap_or(Value::Null));
                row.insert("right".into(), range.upper.map(Value::Array).unwrap_or(Value::Null));
                row
            })
            .collect();
        info!(table, partitions = rows.len(), "límites de partición extraídos");
        rows.shuffle(&mut rand::thread_rng());
        self.client
            .write_rows(ctx, &TablePath::new(bounds_table), &rows)
            .await?;
        Ok(rows.len())
    }

    /* ----- operaciones ----- */

    /// Map sobre una tabla dinámica: un `select_rows` por rango de claves,
    /// y `mapper` aplicado a cada lote. El resultado va a `dst`.
    pub async fn run_map_over_dynamic(
        &self,
        ctx: &Context,
        src: &str,
        dst: &str,
        columns: Option<Vec<String>>,
        mapper: Option<Arc<dyn Aggregator>>,
    ) -> Result<()> {
        let client = &self.client;
        let key_columns: Vec<String> = serde_json::from_value(
            client.get_attribute(ctx, src, "key_columns").await?,
        )?;
        let optimize_for = client.get_attribute(ctx, src, "optimize_for").await?;
        if optimize_for.as_str() == Some("scan") {
            let size = client
                .get_attribute(ctx, src, "max_partition_data_size")
                .await
                .ok()
                .and_then(|v| v.as_u64());
            if size.map_or(true, |s| s > MAX_SCAN_PARTITION_SIZE) {
                return Err(TmError::invalid_request(
                    "\"max_partition_data_size\" should be less than 10MB for tables with \"optimize_for\"=\"scan\"",
                )
                .with_attribute("table", src));
            }
        }

        let bounds_table = client.create_temp_table(ctx, None).await?;
        self.extract_partition_bounds(ctx, src, &bounds_table).await?;

        let selector = BoundsSelector {
            client: client.clone(),
            table: src.to_string(),
            key_columns,
            columns,
            row_limit: self.options.input_row_limit.min(self.options.output_row_limit),
            mapper,
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
        };
        let job = self.options.job(
            JobDescriptor::Aggregator(Arc::new(selector)),
            format!("tm-dynamic-select --proxy {} --table {src}", client.proxy_address()),
        );
        let result = async {
            client
                .run_map(
                    ctx,
                    job,
                    vec![TablePath::new(&bounds_table)],
                    TablePath::new(dst),
                    self.options.build_spec(format!("Map over dynamic table {src}")),
                )
                .await?
                .wait(&self.cancel, OPERATION_POLL_PERIOD, |_| {})
                .await
        }
        .await;
        if let Err(e) = client.remove(ctx, &bounds_table, false, true).await {
            warn!(table = %bounds_table, "no se pudo borrar la tabla de límites: {e}");
        }
        result.map(|_| ())
    }

    /// Lleva `src` (estática o dinámica) a la tabla dinámica `dst` con
    /// `insert_rows` en lotes, aplicando `mapper` a cada fila.
    pub async fn run_map_dynamic(
        &self,
        ctx: &Context,
        src: &str,
        dst: &str,
        mapper: Option<Arc<dyn Mapper>>,
        batch_size: Option<usize>,
    ) -> Result<()> {
        let client = &self.client;
        let inserter: Arc<dyn Aggregator> = Arc::new(BatchInserter {
            client: client.clone(),
            table: dst.to_string(),
            mapper,
            batch_size: batch_size.unwrap_or(self.options.batch_size),
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
        });

        let out_table = client.create_temp_table(ctx, None).await?;
        let dynamic = client.get_attribute(ctx, src, "dynamic").await?;
        let result = if dynamic.as_bool() == Some(true) {
            self.run_map_over_dynamic(ctx, src, &out_table, None, Some(inserter))
                .await
        } else {
            let job = self.options.job(
                JobDescriptor::Aggregator(inserter),
                format!("tm-dynamic-insert --proxy {} --table {dst}", client.proxy_address()),
            );
            async {
                client
                    .run_map(
                        ctx,
                        job,
                        vec![TablePath::new(src)],
                        TablePath::new(&out_table),
                        self.options.build_spec(format!("Insert {src} into {dst}")),
                    )
                    .await?
                    .wait(&self.cancel, OPERATION_POLL_PERIOD, |_| {})
                    .await
                    .map(|_| ())
            }
            .await
        };
        if let Err(e) = client.remove(ctx, &out_table, false, true).await {
            warn!(table = %out_table, "no se pudo borrar la tabla temporal: {e}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterKind, CreateOptions, InMemoryCluster, NodeType};
    use crate::retry::Backoff;

    fn rows(values: &[Value]) -> Vec<Row> {
        values.iter().map(|v| v.as_object().cloned().unwrap()).collect()
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Backoff {
                jitter: 0.0,
                ..Backoff::default()
            },
        }
    }

    async fn dynamic_table(c: &Arc<dyn ClusterClient>, path: &str, pivots: Vec<Vec<Value>>) {
        let ctx = Context::new();
        let options = CreateOptions::recursive()
            .with_attribute("dynamic", json!(true))
            .with_attribute(
                "schema",
                json!([{"name": "k", "sort_order": "ascending"}, {"name": "v"}]),
            );
        c.create(&ctx, NodeType::Table, path, &options).await.unwrap();
        c.reshard_table(&ctx, path, pivots).await.unwrap();
    }

    fn setup() -> (InMemoryCluster, Arc<dyn ClusterClient>, DynamicTableDriver) {
        let cluster = InMemoryCluster::new("local", ClusterKind::Yt);
        let client: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
        let driver = DynamicTableDriver::new(client.clone(), DynamicTableOptions::default())
            .with_retry(quick_retry())
            .with_state_wait(Duration::from_secs(5), Duration::from_millis(10));
        (cluster, client, driver)
    }

    #[test]
    fn spec_desde_opciones() {
        let options = DynamicTableOptions {
            job_count: Some(7),
            user_slots: Some(50),
            pool: Some("transfer".into()),
            ..Default::default()
        };
        let spec = options.build_spec("t".into());
        assert_eq!(spec.job_count, Some(7));
        assert_eq!(spec.pool.as_deref(), Some("transfer"));
        assert_eq!(spec.extra["resource_limits"], json!({"user_slots": 50}));
        assert_eq!(spec.extra["job_proxy_memory_control"], json!(false));
    }

    #[tokio::test]
    async fn montar_y_desmontar_esperan_el_estado() {
        let (_, c, driver) = setup();
        dynamic_table(&c, "//dyn/t", vec![vec![], vec![json!(10)]]).await;
        let ctx = Context::new();
        driver.mount_table(&ctx, "//dyn/t").await.unwrap();
        driver.wait_for_state(&ctx, "//dyn/t", TabletState::Mounted).await.unwrap();
        // repetir no hace nada
        driver.mount_table(&ctx, "//dyn/t").await.unwrap();
        driver.unmount_table(&ctx, "//dyn/t").await.unwrap();
        assert!(c
            .tablets(&ctx, "//dyn/t")
            .await
            .unwrap()
            .iter()
            .all(|t| t.state == TabletState::Unmounted));
    }

    #[tokio::test]
    async fn estado_que_no_llega_agota_el_plazo() {
        let (_, c, driver) = setup();
        dynamic_table(&c, "//dyn/t", vec![vec![]]).await;
        let driver = driver.with_state_wait(Duration::from_millis(30), Duration::from_millis(10));
        let err = driver
            .wait_for_state(&Context::new(), "//dyn/t", TabletState::Mounted)
            .await
            .unwrap_err();
        assert!(err.is(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn limites_de_particion_cubren_las_claves() {
        let (cluster, c, driver) = setup();
        dynamic_table(&c, "//dyn/t", vec![vec![], vec![json!(10)], vec![json!(20)]]).await;
        cluster
            .set_tablet_partitions("//dyn/t", 1, vec![vec![json!(10)], vec![json!(15), Value::Null]])
            .unwrap();
        let ctx = Context::new();
        c.create(&ctx, NodeType::Table, "//tmp/bounds", &CreateOptions::recursive())
            .await
            .unwrap();
        let count = driver
            .extract_partition_bounds(&ctx, "//dyn/t", "//tmp/bounds")
            .await
            .unwrap();
        assert_eq!(count, 4);
        let mut lefts: Vec<Value> = c
            .read_rows(&ctx, &TablePath::new("//tmp/bounds"))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r["left"].clone())
            .collect();
        lefts.sort_by_key(|v| v.to_string());
        assert_eq!(lefts, vec![json!([10]), json!([15]), json!([20]), Value::Null]);
    }

    struct Upper;

    #[async_trait]
    impl Aggregator for Upper {
        async fn aggregate(&self, rows: Vec<Row>, _ctx: &JobContext) -> Result<Vec<Row>> {
            Ok(rows
                .into_iter()
                .map(|mut r| {
                    let v = r["v"].as_str().unwrap_or_default().to_uppercase();
                    r.insert("v".into(), json!(v));
                    r
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn map_sobre_dinamica_lee_todos_los_rangos() {
        let (cluster, c, driver) = setup();
        dynamic_table(&c, "//dyn/t", vec![vec![], vec![json!(10)], vec![json!(20)]]).await;
        let ctx = Context::new();
        driver.mount_table(&ctx, "//dyn/t").await.unwrap();
        let data: Vec<Value> = (0..30).map(|k| json!({"k": k, "v": format!("v{k}")})).collect();
        c.insert_rows(&ctx, "//dyn/t", rows(&data)).await.unwrap();
        c.mkdir(&ctx, "//out", true).await.unwrap();

        // un select falla una vez y se reintenta
        cluster.inject_request_failure(
            "select_rows",
            TmError::new(ErrorKind::TransportUnavailable, "connection reset"),
        );
        driver
            .run_map_over_dynamic(&ctx, "//dyn/t", "//out/t", None, Some(Arc::new(Upper)))
            .await
            .unwrap();

        let mut out = c.read_rows(&ctx, &TablePath::new("//out/t")).await.unwrap();
        out.sort_by_key(|r| r["k"].as_i64());
        assert_eq!(out.len(), 30);
        assert_eq!(out[29]["v"], "V29");
    }

    #[tokio::test]
    async fn map_dinamico_inserta_en_lotes() {
        let (_, c, driver) = setup();
        dynamic_table(&c, "//dyn/dst", vec![vec![]]).await;
        let ctx = Context::new();
        driver.mount_table(&ctx, "//dyn/dst").await.unwrap();
        let data: Vec<Value> = (0..25).map(|k| json!({"k": k, "v": "x"})).collect();
        c.mkdir(&ctx, "//src", true).await.unwrap();
        c.write_rows(&ctx, &TablePath::new("//src/t"), &rows(&data)).await.unwrap();

        driver
            .run_map_dynamic(&ctx, "//src/t", "//dyn/dst", None, Some(10))
            .await
            .unwrap();

        let found = c
            .lookup_rows(&ctx, "//dyn/dst", rows(&[json!({"k": 0}), json!({"k": 24})]))
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(c.records_count(&ctx, "//dyn/dst").await.unwrap(), 25);
    }

    #[tokio::test]
    async fn scan_con_particiones_grandes_se_rechaza() {
        let (_, c, driver) = setup();
        dynamic_table(&c, "//dyn/t", vec![vec![]]).await;
        let ctx = Context::new();
        c.set_attribute(&ctx, "//dyn/t", "optimize_for", json!("scan")).await.unwrap();
        let err = driver
            .run_map_over_dynamic(&ctx, "//dyn/t", "//out", None, None)
            .await
            .unwrap_err();
        assert!(err.message.contains("max_partition_data_size"));
    }

    #[tokio::test]
    async fn cancelar_durante_la_espera_corta_los_reintentos() {
        let (cluster, c, _) = setup();
        dynamic_table(&c, "//dyn/dst", vec![vec![]]).await;
        cluster.inject_request_failure(
            "insert_rows",
            TmError::new(ErrorKind::RateLimit, "too many requests"),
        );
        let cancel = CancellationToken::new();
        let inserter = BatchInserter {
            client: c.clone(),
            table: "//dyn/dst".into(),
            mapper: None,
            batch_size: 10,
            retry: RetryPolicy {
                max_attempts: 3,
                backoff: Backoff {
                    floor: Duration::from_secs(60),
                    jitter: 0.0,
                    ..Backoff::default()
                },
            },
            cancel: cancel.clone(),
        };

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            inserter.aggregate(rows(&[json!({"k": 1, "v": "x"})]), &JobContext::default()),
        )
        .await
        .expect("la espera entre intentos no atendió la cancelación");
        canceller.await.unwrap();

        assert!(result.unwrap_err().is(ErrorKind::Cancelled));
    }
}
