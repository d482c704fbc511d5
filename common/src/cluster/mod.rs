//! Capacidad abstracta de un clúster de tablas. El núcleo de copia solo
//! depende de este trait; cada variante de clúster lo implementa.

pub mod directory;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::{fmt, str::FromStr, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::Context;
use crate::error::{ErrorKind, Result, TmError};
use crate::format::{Format, Row};
use crate::job::UserJob;
use crate::ranges::{compare_keys, TableRange};
use crate::task::JobCounters;

pub use directory::{BackendConfig, ClusterConfig, ClusterDirectory, ClusterEntry};
pub use memory::InMemoryCluster;

pub type OperationId = String;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(pub String);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    Yt,
    Yamr,
    Kiwi,
    Hive,
    Hdfs,
    Hbase,
}

impl ClusterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ClusterKind::Yt => "yt",
            ClusterKind::Yamr => "yamr",
            ClusterKind::Kiwi => "kiwi",
            ClusterKind::Hive => "hive",
            ClusterKind::Hdfs => "hdfs",
            ClusterKind::Hbase => "hbase",
        }
    }

    /// Clústeres cuyo destino es una tabla con ruta propia.
    pub fn has_tables(self) -> bool {
        matches!(self, ClusterKind::Yt | ClusterKind::Yamr)
    }
}

impl fmt::Display for ClusterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for ClusterKind {
    type Err = TmError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "yt" => Ok(ClusterKind::Yt),
            "yamr" => Ok(ClusterKind::Yamr),
            "kiwi" => Ok(ClusterKind::Kiwi),
            "hive" => Ok(ClusterKind::Hive),
            "hdfs" => Ok(ClusterKind::Hdfs),
            "hbase" => Ok(ClusterKind::Hbase),
            other => Err(TmError::invalid_request(format!(
                "unknown cluster type {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Table,
    File,
    MapNode,
    ListNode,
    Document,
    Link,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Table => "table",
            NodeType::File => "file",
            NodeType::MapNode => "map_node",
            NodeType::ListNode => "list_node",
            NodeType::Document => "document",
            NodeType::Link => "link",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub recursive: bool,
    pub ignore_existing: bool,
    pub attributes: Map<String, Value>,
}

impl CreateOptions {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, key: &str, value: Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockMode {
    Exclusive,
    Snapshot,
    Shared { child_key: Option<String> },
}

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub node_types: Vec<NodeType>,
    pub depth_bound: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePlacement {
    Hash,
    Random,
    Ignore,
}

/// Ruta de tabla con rangos, columnas y modo append.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TablePath {
    pub path: String,
    pub ranges: Vec<TableRange>,
    pub columns: Option<Vec<String>>,
    pub append: bool,
}

impl TablePath {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn with_ranges(mut self, ranges: Vec<TableRange>) -> Self {
        self.ranges = ranges;
        self
    }

    pub fn with_append(mut self, append: bool) -> Self {
        self.append = append;
        self
    }
}

impl From<&str> for TablePath {
    fn from(path: &str) -> Self {
        TablePath::new(path)
    }
}

impl From<&String> for TablePath {
    fn from(path: &String) -> Self {
        TablePath::new(path)
    }
}

impl fmt::Display for TablePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.append {
            f.write_str("<append=%true>")?;
        }
        f.write_str(&self.path)?;
        if let Some(columns) = &self.columns {
            write!(f, "{{{}}}", columns.join(","))?;
        }
        if !self.ranges.is_empty() {
            let ranges: Vec<String> = self.ranges.iter().map(|r| r.to_string()).collect();
            write!(f, "[{}]", ranges.join(","))?;
        }
        Ok(())
    }
}

/// Consulta estructurada sobre una tabla dinámica ordenada por clave.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectQuery {
    pub table: String,
    pub columns: Option<Vec<String>>,
    pub key_columns: Vec<String>,
    pub lower: Option<Vec<Value>>,
    pub upper: Option<Vec<Value>>,
    pub limit: Option<u64>,
}

impl SelectQuery {
    pub fn all(table: &str) -> Self {
        Self {
            table: table.to_string(),
            ..Default::default()
        }
    }

    /// Si la fila cae en `[lower, upper)` sobre las columnas clave.
    pub fn matches(&self, row: &Row) -> bool {
        let key: Vec<Value> = self
            .key_columns
            .iter()
            .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
            .collect();
        if let Some(lower) = &self.lower {
            if compare_keys(&key, lower).is_lt() {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if !compare_keys(&key, upper).is_lt() {
                return false;
            }
        }
        true
    }
}

impl fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.columns {
            Some(columns) => write!(f, "{}", columns.join(", "))?,
            None => f.write_str("*")?,
        }
        write!(f, " FROM [{}]", self.table)?;

        let tuple = |values: &[Value]| {
            values
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let width = |values: &[Value]| self.key_columns[..values.len().min(self.key_columns.len())].join(", ");

        let mut conditions = Vec::new();
        if let Some(lower) = &self.lower {
            conditions.push(format!("({}) >= ({})", width(lower), tuple(lower)));
        }
        if let Some(upper) = &self.upper {
            conditions.push(format!("({}) < ({})", width(upper), tuple(upper)));
        }
        if !conditions.is_empty() {
            write!(f, " WHERE {}", conditions.join(" AND "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Map,
    Reduce,
    Merge,
    Sort,
    RemoteCopy,
    Erase,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// `sorted` si todas las entradas están ordenadas, `unordered` si no.
    #[default]
    Auto,
    Unordered,
    Ordered,
    Sorted,
}

/// Clúster de origen de un `remote_copy`.
#[derive(Clone)]
pub struct RemoteSource {
    pub cluster_name: String,
    pub network_name: Option<String>,
    pub token: Option<String>,
    pub transaction: Option<TxId>,
    /// Handle directo al origen cuando el planificador corre en proceso.
    pub client: Option<Arc<dyn ClusterClient>>,
}

impl fmt::Debug for RemoteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSource")
            .field("cluster_name", &self.cluster_name)
            .field("network_name", &self.network_name)
            .field("transaction", &self.transaction)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    pub job_count: Option<u64>,
    pub data_size_per_job: Option<u64>,
    pub max_failed_job_count: Option<u64>,
    pub pool: Option<String>,
    pub combine_chunks: bool,
    pub max_row_weight: Option<u64>,
    pub locality_timeout: Option<u64>,
    pub title: Option<String>,
    /// Claves crudas que se fusionan sobre la spec generada.
    pub extra: Map<String, Value>,
}

pub const DEFAULT_MAX_FAILED_JOB_COUNT: u64 = 10;
pub const OPERATION_POLL_PERIOD: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub kind: OperationKind,
    pub inputs: Vec<TablePath>,
    pub output: Option<TablePath>,
    pub job: Option<UserJob>,
    pub sort_by: Vec<String>,
    pub reduce_by: Vec<String>,
    pub merge_mode: MergeMode,
    pub remote: Option<RemoteSource>,
    pub options: OperationOptions,
}

impl OperationSpec {
    pub fn new(kind: OperationKind, inputs: Vec<TablePath>, output: Option<TablePath>) -> Self {
        Self {
            kind,
            inputs,
            output,
            job: None,
            sort_by: Vec::new(),
            reduce_by: Vec::new(),
            merge_mode: MergeMode::Auto,
            remote: None,
            options: OperationOptions::default(),
        }
    }

    pub fn max_failed_job_count(&self) -> u64 {
        self.options
            .max_failed_job_count
            .unwrap_or(DEFAULT_MAX_FAILED_JOB_COUNT)
    }

    /// Spec en la forma que espera el planificador del clúster.
    pub fn to_json(&self) -> Value {
        let mut spec = Map::new();
        let inputs: Vec<Value> = self.inputs.iter().map(|p| json!(p.to_string())).collect();
        spec.insert("input_table_paths".into(), json!(inputs));
        if let Some(output) = &self.output {
            spec.insert("output_table_path".into(), json!(output.to_string()));
        }
        if let Some(job) = &self.job {
            let section = match self.kind {
                OperationKind::Reduce => "reducer",
                _ => "mapper",
            };
            let files: Vec<Value> = job.files.iter().map(|f| json!(f.name)).collect();
            spec.insert(
                section.into(),
                json!({
                    "command": job.command,
                    "file_paths": files,
                    "memory_limit": job.memory_limit,
                    "input_format": job.input_format.name(),
                    "output_format": job.output_format.name(),
                    "environment": job.environment,
                }),
            );
        }
        if !self.sort_by.is_empty() {
            spec.insert("sort_by".into(), json!(self.sort_by));
        }
        if !self.reduce_by.is_empty() {
            spec.insert("reduce_by".into(), json!(self.reduce_by));
        }
        if self.kind == OperationKind::Merge {
            let mode = serde_json::to_value(self.merge_mode).unwrap_or(Value::Null);
            spec.insert("mode".into(), mode);
            spec.insert("combine_chunks".into(), json!(self.options.combine_chunks));
        }
        if let Some(remote) = &self.remote {
            spec.insert("cluster_name".into(), json!(remote.cluster_name));
            if let Some(network) = &remote.network_name {
                spec.insert("network_name".into(), json!(network));
            }
        }
        let opts = &self.options;
        let optional = [
            ("job_count", opts.job_count),
            ("data_size_per_job", opts.data_size_per_job),
            ("max_failed_job_count", opts.max_failed_job_count),
            ("max_row_weight", opts.max_row_weight),
            ("locality_timeout", opts.locality_timeout),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                spec.insert(key.into(), json!(value));
            }
        }
        if let Some(pool) = &opts.pool {
            spec.insert("pool".into(), json!(pool));
        }
        if let Some(title) = &opts.title {
            spec.insert("title".into(), json!(title));
        }
        for (k, v) in &opts.extra {
            spec.insert(k.clone(), v.clone());
        }
        Value::Object(spec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl OperationState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationState::Completed | OperationState::Failed | OperationState::Aborted
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OperationState::Pending => "pending",
            OperationState::Running => "running",
            OperationState::Completed => "completed",
            OperationState::Failed => "failed",
            OperationState::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperationStatus {
    pub id: OperationId,
    pub state: OperationState,
    pub jobs: JobCounters,
    pub error: Option<TmError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabletState {
    Mounted,
    Unmounted,
    Frozen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletInfo {
    pub tablet_id: String,
    pub pivot_key: Vec<Value>,
    pub state: TabletState,
}

/// Exportación de una tabla de hive: configuración del split y ficheros.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiveExport {
    pub config: Value,
    pub files: Vec<String>,
}

#[async_trait]
pub trait ClusterClient: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ClusterKind;
    fn proxy_address(&self) -> &str;
    fn token(&self) -> Option<&str>;

    /* ---------------- namespace ---------------- */

    async fn exists(&self, ctx: &Context, path: &str) -> Result<bool>;
    /// Lee un nodo o un atributo (`path/@attr`). Con `attributes` no vacío
    /// devuelve `{"$attributes": {...}, "$value": ...}`.
    async fn get(&self, ctx: &Context, path: &str, attributes: &[&str]) -> Result<Value>;
    async fn set(&self, ctx: &Context, path: &str, value: Value) -> Result<()>;
    async fn remove(&self, ctx: &Context, path: &str, recursive: bool, force: bool) -> Result<()>;
    async fn create(
        &self,
        ctx: &Context,
        node_type: NodeType,
        path: &str,
        options: &CreateOptions,
    ) -> Result<String>;
    async fn list(&self, ctx: &Context, path: &str) -> Result<Vec<String>>;
    async fn copy(&self, ctx: &Context, src: &str, dst: &str, recursive: bool) -> Result<()>;
    async fn move_node(&self, ctx: &Context, src: &str, dst: &str, recursive: bool)
        -> Result<()>;
    async fn link(&self, ctx: &Context, target: &str, link_path: &str) -> Result<()>;
    async fn lock(&self, ctx: &Context, path: &str, mode: &LockMode) -> Result<String>;
    async fn search(&self, ctx: &Context, root: &str, filter: &SearchFilter)
        -> Result<Vec<String>>;

    /* ---------------- transacciones ---------------- */

    /// Abre una transacción hija de `ctx.transaction` si la hay.
    async fn begin_transaction(&self, ctx: &Context, timeout: Duration) -> Result<TxId>;
    async fn commit_transaction(&self, ctx: &Context, tx: &TxId) -> Result<()>;
    async fn abort_transaction(&self, ctx: &Context, tx: &TxId) -> Result<()>;
    /// Con `ctx.ping_ancestors` se renuevan también todos los ancestros.
    async fn ping_transaction(&self, ctx: &Context, tx: &TxId) -> Result<()>;

    /* ---------------- tablas ---------------- */

    async fn read_table(
        &self,
        ctx: &Context,
        path: &TablePath,
        format: &Format,
    ) -> Result<BoxStream<'static, Result<Bytes>>>;
    async fn write_table(
        &self,
        ctx: &Context,
        path: &TablePath,
        data: Bytes,
        format: &Format,
    ) -> Result<()>;
    async fn create_temp_table(&self, ctx: &Context, prefix: Option<&str>) -> Result<String>;

    async fn mount_table(&self, ctx: &Context, path: &str) -> Result<()>;
    async fn unmount_table(&self, ctx: &Context, path: &str) -> Result<()>;
    async fn freeze_table(&self, ctx: &Context, path: &str) -> Result<()>;
    async fn unfreeze_table(&self, ctx: &Context, path: &str) -> Result<()>;
    async fn reshard_table(&self, ctx: &Context, path: &str, pivot_keys: Vec<Vec<Value>>)
        -> Result<()>;
    async fn tablets(&self, ctx: &Context, path: &str) -> Result<Vec<TabletInfo>>;
    /// Claves pivote de las particiones de un tablet.
    async fn tablet_partitions(&self, ctx: &Context, tablet_id: &str) -> Result<Vec<Vec<Value>>>;
    async fn insert_rows(&self, ctx: &Context, path: &str, rows: Vec<Row>) -> Result<()>;
    async fn lookup_rows(&self, ctx: &Context, path: &str, keys: Vec<Row>) -> Result<Vec<Row>>;
    async fn select_rows(&self, ctx: &Context, query: &SelectQuery) -> Result<Vec<Row>>;

    /* ---------------- ficheros ---------------- */

    async fn read_file(&self, ctx: &Context, path: &str) -> Result<Bytes>;
    async fn write_file(&self, ctx: &Context, path: &str, data: Bytes) -> Result<()>;
    /// Sube un fichero al almacén de ficheros y devuelve su ruta.
    async fn smart_upload_file(
        &self,
        ctx: &Context,
        name: &str,
        data: Bytes,
        placement: FilePlacement,
    ) -> Result<String>;

    /* ---------------- operaciones ---------------- */

    async fn start_operation(&self, ctx: &Context, spec: OperationSpec) -> Result<OperationId>;
    async fn get_operation(&self, ctx: &Context, id: &str) -> Result<OperationStatus>;
    async fn abort_operation(&self, ctx: &Context, id: &str) -> Result<()>;

    async fn hive_table_files(&self, ctx: &Context, table: &str) -> Result<HiveExport> {
        let _ = (ctx, table);
        Err(TmError::invalid_request(format!(
            "cluster {} of type {} does not export hive tables",
            self.name(),
            self.kind()
        )))
    }
}

/// Handle de una operación lanzada en un clúster.
pub struct Operation<'a> {
    client: &'a dyn ClusterClient,
    ctx: Context,
    id: OperationId,
}

impl<'a> Operation<'a> {
    pub fn new(client: &'a dyn ClusterClient, ctx: Context, id: OperationId) -> Self {
        Self { client, ctx, id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> Result<OperationStatus> {
        self.client.get_operation(&self.ctx, &self.id).await
    }

    pub async fn abort(&self) -> Result<()> {
        self.client.abort_operation(&self.ctx, &self.id).await
    }

    /// Espera al estado terminal consultando cada `period`. Si se cancela,
    /// aborta la operación antes de devolver `Cancelled`.
    pub async fn wait<F>(
        &self,
        cancel: &CancellationToken,
        period: Duration,
        mut on_progress: F,
    ) -> Result<OperationStatus>
    where
        F: FnMut(&OperationStatus) + Send,
    {
        loop {
            let status = self.status().await?;
            on_progress(&status);
            match status.state {
                OperationState::Completed => return Ok(status),
                OperationState::Failed => {
                    let mut err = TmError::generic(format!("Operation {} failed", self.id))
                        .with_attribute("operation_id", self.id.as_str());
                    if let Some(inner) = status.error {
                        err = err.with_inner(inner);
                    }
                    return Err(err);
                }
                OperationState::Aborted => {
                    return Err(TmError::new(
                        ErrorKind::Cancelled,
                        format!("Operation {} was aborted", self.id),
                    ));
                }
                OperationState::Pending | OperationState::Running => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(operation = %self.id, "cancelando operación");
                    if let Err(e) = self.abort().await {
                        debug!(operation = %self.id, "no se pudo abortar la operación: {e}");
                    }
                    return Err(TmError::cancelled());
                }
                _ = tokio::time::sleep(period) => {}
            }
        }
    }
}

/// Helpers de alto nivel sobre la capacidad básica.
impl dyn ClusterClient {
    pub async fn run_operation(&self, ctx: &Context, spec: OperationSpec) -> Result<Operation<'_>> {
        debug!(
            cluster = self.name(),
            kind = ?spec.kind,
            "lanzando operación: {}",
            spec.to_json()
        );
        let id = self.start_operation(ctx, spec).await?;
        Ok(Operation::new(self, ctx.clone(), id))
    }

    pub async fn run_map(
        &self,
        ctx: &Context,
        job: UserJob,
        inputs: Vec<TablePath>,
        output: TablePath,
        options: OperationOptions,
    ) -> Result<Operation<'_>> {
        let mut spec = OperationSpec::new(OperationKind::Map, inputs, Some(output));
        spec.job = Some(job);
        spec.options = options;
        self.run_operation(ctx, spec).await
    }

    pub async fn run_reduce(
        &self,
        ctx: &Context,
        job: UserJob,
        inputs: Vec<TablePath>,
        output: TablePath,
        reduce_by: Vec<String>,
        options: OperationOptions,
    ) -> Result<Operation<'_>> {
        let mut spec = OperationSpec::new(OperationKind::Reduce, inputs, Some(output));
        spec.job = Some(job);
        spec.reduce_by = reduce_by;
        spec.options = options;
        self.run_operation(ctx, spec).await
    }

    pub async fn run_merge(
        &self,
        ctx: &Context,
        inputs: Vec<TablePath>,
        output: TablePath,
        mode: MergeMode,
        options: OperationOptions,
    ) -> Result<Operation<'_>> {
        let mut spec = OperationSpec::new(OperationKind::Merge, inputs, Some(output));
        spec.merge_mode = mode;
        spec.options = options;
        self.run_operation(ctx, spec).await
    }

    pub async fn run_sort(
        &self,
        ctx: &Context,
        input: TablePath,
        output: TablePath,
        sort_by: Vec<String>,
        options: OperationOptions,
    ) -> Result<Operation<'_>> {
        let mut spec = OperationSpec::new(OperationKind::Sort, vec![input], Some(output));
        spec.sort_by = sort_by;
        spec.options = options;
        self.run_operation(ctx, spec).await
    }

    pub async fn run_remote_copy(
        &self,
        ctx: &Context,
        input: TablePath,
        output: TablePath,
        remote: RemoteSource,
        options: OperationOptions,
    ) -> Result<Operation<'_>> {
        let mut spec = OperationSpec::new(OperationKind::RemoteCopy, vec![input], Some(output));
        spec.remote = Some(remote);
        spec.options = options;
        self.run_operation(ctx, spec).await
    }

    pub async fn run_erase(
        &self,
        ctx: &Context,
        table: TablePath,
        options: OperationOptions,
    ) -> Result<Operation<'_>> {
        let mut spec = OperationSpec::new(OperationKind::Erase, vec![table], None);
        spec.options = options;
        self.run_operation(ctx, spec).await
    }

    pub async fn get_attribute(&self, ctx: &Context, path: &str, name: &str) -> Result<Value> {
        self.get(ctx, &format!("{path}/@{name}"), &[]).await
    }

    pub async fn set_attribute(
        &self,
        ctx: &Context,
        path: &str,
        name: &str,
        value: Value,
    ) -> Result<()> {
        self.set(ctx, &format!("{path}/@{name}"), value).await
    }

    pub async fn records_count(&self, ctx: &Context, path: &str) -> Result<u64> {
        let v = self.get_attribute(ctx, path, "row_count").await?;
        v.as_u64()
            .ok_or_else(|| TmError::format(format!("row_count of {path} is not a number: {v}")))
    }

    pub async fn data_size(&self, ctx: &Context, path: &str) -> Result<u64> {
        let v = self
            .get_attribute(ctx, path, "uncompressed_data_size")
            .await?;
        v.as_u64().ok_or_else(|| {
            TmError::format(format!("uncompressed_data_size of {path} is not a number: {v}"))
        })
    }

    pub async fn is_sorted(&self, ctx: &Context, path: &str) -> Result<bool> {
        Ok(self
            .get_attribute(ctx, path, "sorted")
            .await?
            .as_bool()
            .unwrap_or(false))
    }

    pub async fn sorted_by(&self, ctx: &Context, path: &str) -> Result<Vec<String>> {
        if !self.is_sorted(ctx, path).await? {
            return Ok(Vec::new());
        }
        let v = self.get_attribute(ctx, path, "sorted_by").await?;
        Ok(serde_json::from_value(v)?)
    }

    pub async fn is_empty(&self, ctx: &Context, path: &str) -> Result<bool> {
        Ok(self.records_count(ctx, path).await? == 0)
    }

    pub async fn mkdir(&self, ctx: &Context, path: &str, recursive: bool) -> Result<()> {
        let options = CreateOptions {
            recursive,
            ignore_existing: true,
            ..Default::default()
        };
        self.create(ctx, NodeType::MapNode, path, &options).await?;
        Ok(())
    }

    pub async fn read_rows(&self, ctx: &Context, path: &TablePath) -> Result<Vec<Row>> {
        let chunks: Vec<Bytes> = self
            .read_table(ctx, path, &Format::Json)
            .await?
            .try_collect()
            .await?;
        let mut rows = Vec::new();
        for chunk in chunks {
            rows.extend(Format::Json.decode_rows(&chunk)?);
        }
        Ok(rows)
    }

    pub async fn write_rows(&self, ctx: &Context, path: &TablePath, rows: &[Row]) -> Result<()> {
        let data = Format::Json.encode_rows(rows)?;
        self.write_table(ctx, path, data, &Format::Json).await
    }
}

/// Padre de una ruta de cypress (`//a/b` → `//a`).
pub fn parent_path(path: &str) -> Option<&str> {
    let idx = path.rfind('/')?;
    if idx <= 1 {
        return None;
    }
    Some(&path[..idx])
}

/// Último componente de una ruta.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
