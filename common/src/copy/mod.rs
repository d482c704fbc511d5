//! Estrategias de copia de una tabla entre dos clústeres.
//!
//! La estrategia se elige por el par (tipo de origen, tipo de destino), por
//! la red de cada clúster y por `copy_method`. Todas comparten el mismo
//! esquema: snapshot del origen dentro de una transacción, escritura del
//! destino dentro de otra, y comprobaciones finales de número de filas,
//! orden y códecs antes de confirmar.

mod hive;
mod kiwi;
mod readers;
pub mod scripts;
mod yamr;
mod yt;

pub use kiwi::{merge_kwworm_options, kwworm_command, KiwiWriter, KIWI_STORAGE_ROOT};
pub use readers::{range_rows, row_range, to_yamr_row, HiveFileReader, RangeReader, YamrWriter};

use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{
    base_name, parent_path, ClusterClient, ClusterEntry, ClusterKind, LockMode, MergeMode,
    Operation, OperationOptions, OperationStatus, TablePath, OPERATION_POLL_PERIOD,
};
use crate::config::{Context, TransactionConfig};
use crate::error::{Result, TmError};
use crate::retry::{RetryEngine, RetryPolicy};
use crate::task::{CopyMethod, OperationProgress, TaskAttributes};

pub const MB: u64 = 1024 * 1024;
pub const GB: u64 = 1024 * MB;

/// Tamaño objetivo de cada rango leído a través del proxy.
pub const RANGE_SIZE: u64 = GB;
pub const KIWI_RANGE_SIZE: u64 = 256 * MB;

/// Aviso de la copia hacia quien la ejecuta (el worker lo reenvía al master).
#[derive(Debug, Clone, PartialEq)]
pub enum CopyEvent {
    OperationStarted { id: String, cluster_name: String },
    Progress(OperationProgress),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyOutcome {
    Completed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    SameCluster,
    YtRemoteCopy,
    YtThroughProxy,
    YamrToYtPull,
    YtToYamrPull,
    YtToYamrPush,
    YtToKiwi,
    HiveToYt,
}

impl CopyStrategy {
    pub fn select(
        source: &ClusterEntry,
        destination: &ClusterEntry,
        method: CopyMethod,
    ) -> Result<Self> {
        use ClusterKind::*;

        if source.client.name() == destination.client.name() && source.kind().has_tables() {
            return Ok(CopyStrategy::SameCluster);
        }
        let strategy = match (source.kind(), destination.kind()) {
            (Yt, Yt) if source.same_network(destination) => CopyStrategy::YtRemoteCopy,
            (Yt, Yt) => CopyStrategy::YtThroughProxy,
            (Yamr, Yt) => CopyStrategy::YamrToYtPull,
            (Yt, Yamr) => match method {
                CopyMethod::Pull => CopyStrategy::YtToYamrPull,
                CopyMethod::Push => CopyStrategy::YtToYamrPush,
            },
            (Yt, Kiwi) => CopyStrategy::YtToKiwi,
            (Hive, Yt) => CopyStrategy::HiveToYt,
            (src, dst) => {
                return Err(TmError::invalid_request(format!(
                    "Copy from {src} to {dst} is not supported"
                ))
                .with_attribute("source_cluster", source.client.name())
                .with_attribute("destination_cluster", destination.client.name()))
            }
        };
        Ok(strategy)
    }

    pub fn name(self) -> &'static str {
        match self {
            CopyStrategy::SameCluster => "same_cluster",
            CopyStrategy::YtRemoteCopy => "yt_remote_copy",
            CopyStrategy::YtThroughProxy => "yt_through_proxy",
            CopyStrategy::YamrToYtPull => "yamr_to_yt_pull",
            CopyStrategy::YtToYamrPull => "yt_to_yamr_pull",
            CopyStrategy::YtToYamrPush => "yt_to_yamr_push",
            CopyStrategy::YtToKiwi => "yt_to_kiwi",
            CopyStrategy::HiveToYt => "hive_to_yt",
        }
    }
}

/// Ruta de tabla en el espacio de nombres del clúster. Las tablas de yamr
/// se nombran sin `//`.
pub fn table_path(kind: ClusterKind, table: &str) -> String {
    if kind == ClusterKind::Yamr && !table.starts_with("//") {
        format!("//{}", table.trim_start_matches('/'))
    } else {
        table.to_string()
    }
}

/// Todo lo que necesita una estrategia para ejecutarse.
pub struct CopyContext {
    pub source: ClusterEntry,
    pub destination: ClusterEntry,
    pub attributes: TaskAttributes,
    pub transaction: TransactionConfig,
    pub retry: RetryPolicy,
    pub cancel: CancellationToken,
    pub events: Option<mpsc::UnboundedSender<CopyEvent>>,
}

impl CopyContext {
    pub fn new(source: ClusterEntry, destination: ClusterEntry, attributes: TaskAttributes) -> Self {
        Self {
            source,
            destination,
            attributes,
            transaction: TransactionConfig::default(),
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<CopyEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_transaction_config(mut self, config: TransactionConfig) -> Self {
        self.transaction = config;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reintentos de las llamadas al clúster; la cancelación de la tarea
    /// corta también las esperas.
    pub fn retry_engine(&self) -> RetryEngine {
        RetryEngine::new(self.retry.clone(), self.cancel.clone())
    }

    pub fn source_path(&self) -> String {
        table_path(self.source.kind(), &self.attributes.source_table)
    }

    /// Tabla de destino; sin `destination_table` se reutiliza el nombre del
    /// origen.
    pub fn destination_path(&self) -> String {
        let table = self
            .attributes
            .destination_table
            .as_deref()
            .unwrap_or(&self.attributes.source_table);
        table_path(self.destination.kind(), table)
    }

    pub fn source_token(&self) -> Option<String> {
        self.attributes
            .source_cluster_token
            .clone()
            .or_else(|| self.source.client.token().map(str::to_string))
    }

    pub fn destination_token(&self) -> Option<String> {
        self.attributes
            .destination_cluster_token
            .clone()
            .or_else(|| self.destination.client.token().map(str::to_string))
    }

    fn notify(&self, event: CopyEvent) {
        if let Some(events) = &self.events {
            // el receptor puede haberse ido si la tarea ya se abortó
            let _ = events.send(event);
        }
    }

    /// Opciones base de las operaciones de copia: `pool`, `job_timeout` y
    /// `copy_spec`. Cada estrategia fija encima los valores que necesita.
    pub fn copy_options(&self, title: String) -> OperationOptions {
        let mut options = OperationOptions {
            pool: self.attributes.pool.clone(),
            title: Some(title),
            ..Default::default()
        };
        if let Some(timeout) = self.attributes.job_timeout {
            options.extra.insert("job_time_limit".into(), json!(timeout));
        }
        apply_spec(options, self.attributes.copy_spec.as_ref())
    }

    /// Opciones de las operaciones de post-proceso (sort, merge).
    pub fn postprocess_options(&self, title: String) -> OperationOptions {
        let options = OperationOptions {
            title: Some(title),
            ..Default::default()
        };
        match &self.attributes.postprocess_spec {
            Some(spec) => apply_spec(options, Some(spec)),
            None => OperationOptions {
                pool: self.attributes.pool.clone(),
                ..options
            },
        }
    }

    /// Espera una operación avisando de su arranque y de su progreso.
    pub async fn wait(&self, op: Operation<'_>, cluster_name: &str) -> Result<OperationStatus> {
        let id = op.id().to_string();
        info!(operation = %id, cluster = cluster_name, "operación en curso");
        self.notify(CopyEvent::OperationStarted {
            id: id.clone(),
            cluster_name: cluster_name.to_string(),
        });
        op.wait(&self.cancel, OPERATION_POLL_PERIOD, |status| {
            self.notify(CopyEvent::Progress(OperationProgress {
                id: id.clone(),
                cluster_name: cluster_name.to_string(),
                state: status.state.as_str().to_string(),
                jobs: status.jobs,
            }))
        })
        .await
    }

    /* ---------------- comprobaciones compartidas ---------------- */

    pub async fn check_row_count(
        &self,
        client: &Arc<dyn ClusterClient>,
        ctx: &Context,
        table: &str,
        expected: u64,
    ) -> Result<()> {
        let actual = client.records_count(ctx, table).await?;
        if actual != expected {
            warn!(table, expected, actual, "número de filas incorrecto");
            return Err(TmError::incorrect_row_count(expected, actual).with_attribute("table", table));
        }
        Ok(())
    }

    /// Ordena `table` en sitio por `sort_by` si no lo está ya.
    pub async fn ensure_sorted(
        &self,
        client: &Arc<dyn ClusterClient>,
        ctx: &Context,
        table: &str,
        sort_by: &[String],
    ) -> Result<()> {
        if sort_by.is_empty() || client.sorted_by(ctx, table).await? == sort_by {
            return Ok(());
        }
        info!(table, ?sort_by, "ordenando destino");
        let op = client
            .run_sort(
                ctx,
                TablePath::new(table),
                TablePath::new(table),
                sort_by.to_vec(),
                self.postprocess_options(format!("Sort {table}")),
            )
            .await?;
        self.wait(op, client.name()).await?;

        let actual = client.sorted_by(ctx, table).await?;
        if actual != sort_by {
            return Err(TmError::generic(format!(
                "Table {table} is not sorted by {sort_by:?} after sort"
            ))
            .with_attribute("sorted_by", json!(actual)));
        }
        Ok(())
    }

    /// Deja `table` con los códecs pedidos. Si alguno cambia, reescribe los
    /// datos con un merge en sitio.
    pub async fn set_codecs(
        &self,
        client: &Arc<dyn ClusterClient>,
        ctx: &Context,
        table: &str,
        compression_codec: Option<&str>,
        erasure_codec: Option<&str>,
    ) -> Result<()> {
        let mut changed = false;
        for (attribute, wanted) in [
            ("compression_codec", compression_codec),
            ("erasure_codec", erasure_codec),
        ] {
            let Some(wanted) = wanted else { continue };
            let current = client.get_attribute(ctx, table, attribute).await?;
            if current.as_str() != Some(wanted) {
                debug!(table, attribute, wanted, "cambiando códec");
                client.set_attribute(ctx, table, attribute, json!(wanted)).await?;
                changed = true;
            }
        }
        if !changed || client.is_empty(ctx, table).await? {
            return Ok(());
        }
        let options = OperationOptions {
            combine_chunks: true,
            ..self.postprocess_options(format!("Convert {table}"))
        };
        let op = client
            .run_merge(ctx, vec![TablePath::new(table)], TablePath::new(table), MergeMode::Auto, options)
            .await?;
        self.wait(op, client.name()).await?;
        Ok(())
    }

    /// Lock compartido sobre el padre del destino, con clave el nombre de la
    /// tabla. Dos tareas con el mismo destino no avanzan a la vez.
    pub async fn lock_destination(
        &self,
        client: &Arc<dyn ClusterClient>,
        ctx: &Context,
        table: &str,
    ) -> Result<()> {
        let parent = parent_path(table).unwrap_or("/");
        let mode = LockMode::Shared {
            child_key: Some(base_name(table).to_string()),
        };
        client.lock(ctx, parent, &mode).await?;
        Ok(())
    }
}

/// Fusiona una spec cruda sobre las opciones. Las claves conocidas van a su
/// campo; el resto se copia tal cual.
fn apply_spec(mut options: OperationOptions, spec: Option<&Map<String, Value>>) -> OperationOptions {
    let Some(spec) = spec else {
        return options;
    };
    for (key, value) in spec {
        match (key.as_str(), value) {
            ("pool", Value::String(pool)) => options.pool = Some(pool.clone()),
            ("title", Value::String(title)) => options.title = Some(title.clone()),
            ("combine_chunks", Value::Bool(flag)) => options.combine_chunks = *flag,
            ("job_count", v) if v.is_u64() => options.job_count = v.as_u64(),
            ("data_size_per_job", v) if v.is_u64() => options.data_size_per_job = v.as_u64(),
            ("max_failed_job_count", v) if v.is_u64() => {
                options.max_failed_job_count = v.as_u64()
            }
            ("max_row_weight", v) if v.is_u64() => options.max_row_weight = v.as_u64(),
            ("locality_timeout", v) if v.is_u64() => options.locality_timeout = v.as_u64(),
            _ => {
                options.extra.insert(key.clone(), value.clone());
            }
        }
    }
    options
}

/// Ejecuta la copia descrita por `ctx`.
///
/// Con `skip_if_destination_exists` y el destino ya presente no se toca nada
/// y el resultado es `Skipped`.
pub async fn execute_task(ctx: &CopyContext) -> Result<CopyOutcome> {
    let strategy = CopyStrategy::select(&ctx.source, &ctx.destination, ctx.attributes.copy_method)?;
    let engine = ctx.retry_engine();
    let root = &Context::new();
    info!(
        strategy = strategy.name(),
        source = %ctx.attributes.source_cluster,
        destination = %ctx.attributes.destination_cluster,
        "copiando {}",
        ctx.attributes.source_table
    );

    // 1) el origen tiene que existir
    if ctx.source.kind().has_tables() {
        let src = ctx.source_path();
        let src = src.as_str();
        let client = &ctx.source.client;
        if !engine.run(move |_| client.exists(root, src)).await? {
            return Err(TmError::resolve(src).with_attribute("cluster", client.name()));
        }
    }

    // 2) destino existente y skip pedido
    if ctx.destination.kind().has_tables() {
        let dst = ctx.destination_path();
        let dst = dst.as_str();
        let client = &ctx.destination.client;
        if ctx.attributes.skip_if_destination_exists && engine.run(move |_| client.exists(root, dst)).await? {
            info!(table = %dst, "el destino ya existe, se omite la copia");
            return Ok(CopyOutcome::Skipped);
        }
        if let Some(parent) = parent_path(dst) {
            engine.run(move |_| client.mkdir(root, parent, true)).await?;
        }
    }

    // 3) la copia en sí
    match strategy {
        CopyStrategy::SameCluster => yt::copy_same_cluster(ctx).await?,
        CopyStrategy::YtRemoteCopy => yt::copy_remote(ctx).await?,
        CopyStrategy::YtThroughProxy => yt::copy_through_proxy(ctx).await?,
        CopyStrategy::YamrToYtPull => yamr::copy_yamr_to_yt_pull(ctx).await?,
        CopyStrategy::YtToYamrPull => yamr::copy_yt_to_yamr_pull(ctx).await?,
        CopyStrategy::YtToYamrPush => yamr::copy_yt_to_yamr_push(ctx).await?,
        CopyStrategy::YtToKiwi => kiwi::copy_yt_to_kiwi(ctx).await?,
        CopyStrategy::HiveToYt => hive::copy_hive_to_yt(ctx).await?,
    }
    info!(strategy = strategy.name(), "copia terminada");
    Ok(CopyOutcome::Completed)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::cluster::{ClusterConfig, InMemoryCluster};
    use crate::format::Row;

    pub fn entry(cluster: &InMemoryCluster, network: Option<&str>) -> ClusterEntry {
        let client: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
        ClusterEntry {
            config: ClusterConfig {
                kind: client.kind(),
                proxy: client.proxy_address().to_string(),
                network: network.map(str::to_string),
                kwworm_options: Vec::new(),
            },
            client,
        }
    }

    pub fn yamr_rows(count: usize) -> Vec<Row> {
        (0..count)
            .map(|i| {
                let mut row = Row::new();
                row.insert("key".into(), json!(format!("k{:04}", count - i)));
                row.insert("subkey".into(), json!(""));
                row.insert("value".into(), json!(format!("v{i}")));
                row
            })
            .collect()
    }

    pub async fn write(cluster: &InMemoryCluster, path: &str, rows: &[Row]) {
        let client: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
        let root = Context::new();
        if let Some(parent) = parent_path(path) {
            client.mkdir(&root, parent, true).await.unwrap();
        }
        client.write_rows(&root, &TablePath::new(path), rows).await.unwrap();
    }

    pub async fn read(cluster: &InMemoryCluster, path: &str) -> Vec<Row> {
        let client: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
        client.read_rows(&Context::new(), &TablePath::new(path)).await.unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::cluster::InMemoryCluster;
    use rstest::rstest;

    fn cluster(name: &str, kind: ClusterKind) -> InMemoryCluster {
        InMemoryCluster::new(name, kind)
    }

    #[rstest]
    #[case(ClusterKind::Yt, ClusterKind::Yt, Some("fb"), Some("fb"), CopyMethod::Pull, "yt_remote_copy")]
    #[case(ClusterKind::Yt, ClusterKind::Yt, Some("fb"), None, CopyMethod::Pull, "yt_through_proxy")]
    #[case(ClusterKind::Yamr, ClusterKind::Yt, None, None, CopyMethod::Pull, "yamr_to_yt_pull")]
    #[case(ClusterKind::Yt, ClusterKind::Yamr, None, None, CopyMethod::Pull, "yt_to_yamr_pull")]
    #[case(ClusterKind::Yt, ClusterKind::Yamr, None, None, CopyMethod::Push, "yt_to_yamr_push")]
    #[case(ClusterKind::Yt, ClusterKind::Kiwi, None, None, CopyMethod::Pull, "yt_to_kiwi")]
    #[case(ClusterKind::Hive, ClusterKind::Yt, None, None, CopyMethod::Pull, "hive_to_yt")]
    fn seleccion_de_estrategia(
        #[case] src_kind: ClusterKind,
        #[case] dst_kind: ClusterKind,
        #[case] src_net: Option<&str>,
        #[case] dst_net: Option<&str>,
        #[case] method: CopyMethod,
        #[case] expected: &str,
    ) {
        let src = entry(&cluster("a", src_kind), src_net);
        let dst = entry(&cluster("b", dst_kind), dst_net);
        let strategy = CopyStrategy::select(&src, &dst, method).unwrap();
        assert_eq!(strategy.name(), expected);
    }

    #[test]
    fn par_no_soportado_es_invalid_request() {
        let src = entry(&cluster("a", ClusterKind::Kiwi), None);
        let dst = entry(&cluster("b", ClusterKind::Yt), None);
        let err = CopyStrategy::select(&src, &dst, CopyMethod::Pull).unwrap_err();
        assert_eq!(err.message, "Copy from kiwi to yt is not supported");
    }

    #[test]
    fn mismo_cluster_usa_copia_local() {
        let hahn = cluster("hahn", ClusterKind::Yt);
        let strategy =
            CopyStrategy::select(&entry(&hahn, None), &entry(&hahn, None), CopyMethod::Pull).unwrap();
        assert_eq!(strategy, CopyStrategy::SameCluster);
    }

    #[test]
    fn rutas_de_yamr_reciben_prefijo() {
        assert_eq!(table_path(ClusterKind::Yamr, "home/t"), "//home/t");
        assert_eq!(table_path(ClusterKind::Yamr, "//home/t"), "//home/t");
        assert_eq!(table_path(ClusterKind::Yt, "//home/t"), "//home/t");
    }

    #[test]
    fn copy_spec_rellena_campos_conocidos_y_extra() {
        let spec = json!({"pool": "transfer", "job_count": 7, "weight": 3});
        let options = apply_spec(OperationOptions::default(), spec.as_object());
        assert_eq!(options.pool.as_deref(), Some("transfer"));
        assert_eq!(options.job_count, Some(7));
        assert_eq!(options.extra["weight"], 3);
    }

    #[tokio::test]
    async fn destino_existente_con_skip_no_copia() {
        let src = cluster("a", ClusterKind::Yt);
        let dst = cluster("b", ClusterKind::Yt);
        write(&src, "//home/t", &yamr_rows(3)).await;
        write(&dst, "//home/t", &yamr_rows(1)).await;

        let mut attrs = TaskAttributes::new("a", "//home/t", "b", Some("//home/t"));
        attrs.skip_if_destination_exists = true;
        let ctx = CopyContext::new(entry(&src, None), entry(&dst, None), attrs);
        assert_eq!(execute_task(&ctx).await.unwrap(), CopyOutcome::Skipped);
        assert_eq!(read(&dst, "//home/t").await.len(), 1);
        assert!(dst.started_operations().is_empty());
    }

    #[tokio::test]
    async fn origen_inexistente_es_error_de_resolucion() {
        let src = cluster("a", ClusterKind::Yt);
        let dst = cluster("b", ClusterKind::Yt);
        let attrs = TaskAttributes::new("a", "//home/missing", "b", None);
        let ctx = CopyContext::new(entry(&src, None), entry(&dst, None), attrs);
        let err = execute_task(&ctx).await.unwrap_err();
        assert!(err.is(crate::error::ErrorKind::Resolve));
    }
}
