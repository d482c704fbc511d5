//! Clúster en memoria que implementa la capacidad completa de `ClusterClient`:
//! árbol de nodos con atributos, transacciones anidadas con log de deshacer,
//! locks, tablas estáticas y dinámicas, ficheros y operaciones ejecutadas con
//! los descriptores de job. Es el backend de los tests y de las demos locales.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, stream::BoxStream, StreamExt};
use serde_json::{json, Map, Value};
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, HashMap, VecDeque},
    hash::{Hash, Hasher},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    base_name, ClusterClient, ClusterKind, CreateOptions, FilePlacement, HiveExport, LockMode,
    MergeMode, NodeType, OperationId, OperationKind, OperationSpec, OperationState,
    OperationStatus, SearchFilter, SelectQuery, TablePath, TabletInfo, TabletState, TxId,
};
use crate::config::Context;
use crate::error::{ErrorKind, Result, TmError};
use crate::format::{Format, Row};
use crate::job::{group_by_key, run_job};
use crate::ranges::{compare_keys, compare_rows, TableRange};
use crate::task::JobCounters;

const TEMP_TABLES_PREFIX: &str = "//tmp/yt_wrapper/table_storage";
const FILE_STORAGE_PREFIX: &str = "//tmp/yt_wrapper/file_storage";
const READ_CHUNK_ROWS: usize = 1000;
const DEFAULT_DATA_SIZE_PER_JOB: u64 = 256 * 1024 * 1024;

/* ---------------- nodos ---------------- */

#[derive(Debug, Clone)]
struct Node {
    id: String,
    body: Body,
    attributes: Map<String, Value>,
}

#[derive(Debug, Clone)]
enum Body {
    Map,
    List(Vec<ListItem>),
    Table(Table),
    File(Bytes),
    Document(Value),
    Link(String),
}

#[derive(Debug, Clone)]
struct ListItem {
    id: String,
    value: Value,
}

#[derive(Debug, Clone, Default)]
struct Table {
    rows: Vec<Row>,
    sorted_by: Vec<String>,
    chunk_count: u64,
    dynamic: bool,
    tablets: Vec<Tablet>,
}

#[derive(Debug, Clone)]
struct Tablet {
    id: String,
    pivot_key: Vec<Value>,
    state: TabletState,
    partitions: Option<Vec<Vec<Value>>>,
}

impl Body {
    fn node_type(&self) -> NodeType {
        match self {
            Body::Map => NodeType::MapNode,
            Body::List(_) => NodeType::ListNode,
            Body::Table(_) => NodeType::Table,
            Body::File(_) => NodeType::File,
            Body::Document(_) => NodeType::Document,
            Body::Link(_) => NodeType::Link,
        }
    }
}

fn row_weight(row: &Row) -> u64 {
    serde_json::to_vec(row).map(|v| v.len() as u64).unwrap_or(0)
}

fn rows_weight(rows: &[Row]) -> u64 {
    rows.iter().map(row_weight).sum()
}

fn key_of(row: &Row, columns: &[String]) -> Vec<Value> {
    columns
        .iter()
        .map(|c| row.get(c).cloned().unwrap_or(Value::Null))
        .collect()
}

fn range_hits(range: &TableRange, index: u64, row: &Row, sorted_by: &[String]) -> bool {
    match range {
        TableRange::Rows(r) => r.lower <= index && index < r.upper,
        TableRange::Keys(k) => !sorted_by.is_empty() && k.contains(&key_of(row, sorted_by)),
    }
}

fn is_sorted_by(rows: &[Row], columns: &[String]) -> bool {
    rows.windows(2)
        .all(|w| !compare_rows(&w[0], &w[1], columns).is_gt())
}

/* ---------------- transacciones y locks ---------------- */

#[derive(Debug)]
struct Transaction {
    parent: Option<TxId>,
    timeout: Duration,
    deadline: Instant,
    undo: Vec<(String, Option<Node>)>,
    temp_tables: Vec<String>,
    snapshots: HashMap<String, Node>,
}

#[derive(Debug, Clone)]
struct LockRecord {
    tx: TxId,
    key: String,
    mode: LockMode,
}

fn lock_mode_name(mode: &LockMode) -> &'static str {
    match mode {
        LockMode::Exclusive => "exclusive",
        LockMode::Snapshot => "snapshot",
        LockMode::Shared { .. } => "shared",
    }
}

fn modes_conflict(held: &LockMode, wanted: &LockMode) -> bool {
    match (held, wanted) {
        (LockMode::Snapshot, _) | (_, LockMode::Snapshot) => false,
        (LockMode::Exclusive, _) | (_, LockMode::Exclusive) => true,
        (LockMode::Shared { child_key: Some(a) }, LockMode::Shared { child_key: Some(b) }) => {
            a == b
        }
        _ => false,
    }
}

/* ---------------- operaciones ---------------- */

struct OperationRecord {
    status: OperationStatus,
    tx: Option<TxId>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Faults {
    requests: VecDeque<(String, TmError)>,
    operations: VecDeque<TmError>,
    job_failures: u64,
}

/* ---------------- resolución de rutas ---------------- */

enum Target {
    Node(String),
    Attribute(String, Option<String>),
    Item(String, ListPos),
}

#[derive(Clone, Copy)]
enum ListPos {
    Begin,
    End,
    Index(i64),
}

fn validate_path(path: &str) -> Result<()> {
    if path == "/" || path.starts_with("//") {
        Ok(())
    } else {
        Err(TmError::invalid_request(format!(
            "Path {path:?} must start with //"
        )))
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) if idx > 1 => &path[..idx],
        _ => "/",
    }
}

fn child_prefix(path: &str) -> String {
    if path == "/" {
        "//".to_string()
    } else {
        format!("{path}/")
    }
}

fn resolve_index(pos: ListPos, len: usize) -> Option<usize> {
    match pos {
        ListPos::Begin => None,
        ListPos::End => None,
        ListPos::Index(i) if i < 0 => {
            let idx = len as i64 + i;
            (idx >= 0).then_some(idx as usize)
        }
        ListPos::Index(i) => ((i as usize) < len).then_some(i as usize),
    }
}

fn no_such_transaction(tx: &TxId) -> TmError {
    TmError::new(
        ErrorKind::NoSuchTransaction,
        format!("No such transaction {tx}"),
    )
    .with_attribute("transaction_id", tx.0.as_str())
}

fn already_exists(path: &str) -> TmError {
    TmError::generic(format!("Node {path} already exists")).with_attribute("path", path)
}

/* ---------------- estado ---------------- */

struct State {
    nodes: BTreeMap<String, Node>,
    next_id: u64,
    transactions: HashMap<TxId, Transaction>,
    locks: Vec<LockRecord>,
    operations: HashMap<OperationId, OperationRecord>,
    started_operations: Vec<OperationKind>,
    faults: Faults,
    operation_latency: Duration,
}

impl State {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node {
                id: "0-0-0-0".to_string(),
                body: Body::Map,
                attributes: Map::new(),
            },
        );
        Self {
            nodes,
            next_id: 0,
            transactions: HashMap::new(),
            locks: Vec::new(),
            operations: HashMap::new(),
            started_operations: Vec::new(),
            faults: Faults::default(),
            operation_latency: Duration::ZERO,
        }
    }

    fn alloc_id(&mut self) -> String {
        self.next_id += 1;
        let mut h = DefaultHasher::new();
        self.next_id.hash(&mut h);
        let salt = h.finish();
        format!(
            "{:x}-{:x}-{:x}-{:x}",
            self.next_id,
            salt & 0xffff,
            (salt >> 16) & 0xffff,
            (salt >> 32) & 0xffff_ffff
        )
    }

    fn fault(&mut self, method: &str) -> Result<()> {
        if let Some(pos) = self.faults.requests.iter().position(|(m, _)| m == method) {
            if let Some((_, err)) = self.faults.requests.remove(pos) {
                debug!(method, "fallo inyectado: {err}");
                return Err(err);
            }
        }
        Ok(())
    }

    /* ----- transacciones ----- */

    fn expire_transactions(&mut self) {
        let now = Instant::now();
        let expired: Vec<TxId> = self
            .transactions
            .iter()
            .filter(|(_, tx)| tx.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if self.transactions.contains_key(&id) {
                warn!(transaction = %id, "transacción expirada sin ping");
                self.abort_tx(&id);
            }
        }
    }

    fn check_tx(&mut self, ctx: &Context) -> Result<Option<TxId>> {
        self.expire_transactions();
        match &ctx.transaction {
            None => Ok(None),
            Some(tx) if self.transactions.contains_key(tx) => Ok(Some(tx.clone())),
            Some(tx) => Err(no_such_transaction(tx)),
        }
    }

    /// `tx` y todos sus ancestros, del más cercano al más lejano.
    fn chain(&self, tx: Option<&TxId>) -> Vec<TxId> {
        let mut out = Vec::new();
        let mut current = tx.cloned();
        while let Some(id) = current {
            current = self.transactions.get(&id).and_then(|t| t.parent.clone());
            out.push(id);
        }
        out
    }

    fn related(&self, a: &TxId, b: &TxId) -> bool {
        self.chain(Some(a)).contains(b) || self.chain(Some(b)).contains(a)
    }

    fn begin_tx(&mut self, parent: Option<TxId>, timeout: Duration) -> TxId {
        let id = TxId(self.alloc_id());
        self.transactions.insert(
            id.clone(),
            Transaction {
                parent,
                timeout,
                deadline: Instant::now() + timeout,
                undo: Vec::new(),
                temp_tables: Vec::new(),
                snapshots: HashMap::new(),
            },
        );
        id
    }

    fn children_of(&self, tx: &TxId) -> Vec<TxId> {
        self.transactions
            .iter()
            .filter(|(_, t)| t.parent.as_ref() == Some(tx))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn abort_tx(&mut self, tx: &TxId) {
        for child in self.children_of(tx) {
            self.abort_tx(&child);
        }
        let Some(record) = self.transactions.remove(tx) else {
            return;
        };
        for (path, previous) in record.undo.into_iter().rev() {
            match previous {
                Some(node) => {
                    self.nodes.insert(path, node);
                }
                None => {
                    self.nodes.remove(&path);
                }
            }
        }
        self.locks.retain(|l| &l.tx != tx);
        for op in self.operations.values_mut() {
            if op.tx.as_ref() == Some(tx) && !op.status.state.is_terminal() {
                op.status.state = OperationState::Aborted;
                op.status.error = Some(
                    TmError::new(ErrorKind::Cancelled, "Operation transaction was aborted")
                        .with_inner(no_such_transaction(tx)),
                );
                op.cancel.cancel();
            }
        }
    }

    fn commit_tx(&mut self, tx: &TxId) -> Result<()> {
        for child in self.children_of(tx) {
            self.abort_tx(&child);
        }
        let record = self
            .transactions
            .remove(tx)
            .ok_or_else(|| no_such_transaction(tx))?;
        match &record.parent {
            Some(parent) => {
                if let Some(p) = self.transactions.get_mut(parent) {
                    p.undo.extend(record.undo);
                    p.temp_tables.extend(record.temp_tables);
                }
                for lock in self.locks.iter_mut().filter(|l| &l.tx == tx) {
                    lock.tx = parent.clone();
                }
            }
            None => {
                self.locks.retain(|l| &l.tx != tx);
                for path in record.temp_tables {
                    self.delete_subtree(None, &path);
                }
            }
        }
        Ok(())
    }

    fn ping_tx(&mut self, tx: &TxId, ancestors: bool) -> Result<()> {
        let targets = if ancestors {
            self.chain(Some(tx))
        } else {
            vec![tx.clone()]
        };
        let now = Instant::now();
        for id in targets {
            let record = self
                .transactions
                .get_mut(&id)
                .ok_or_else(|| no_such_transaction(&id))?;
            record.deadline = now + record.timeout;
        }
        Ok(())
    }

    /* ----- nodos ----- */

    fn view(&self, tx: Option<&TxId>, path: &str) -> Option<&Node> {
        for id in self.chain(tx) {
            if let Some(node) = self
                .transactions
                .get(&id)
                .and_then(|t| t.snapshots.get(path))
            {
                return Some(node);
            }
        }
        self.nodes.get(path)
    }

    /// Nodo en `path`, siguiendo un nivel de link.
    fn node(&self, tx: Option<&TxId>, path: &str) -> Result<(String, &Node)> {
        let node = self.view(tx, path).ok_or_else(|| TmError::resolve(path))?;
        if let Body::Link(target) = &node.body {
            let target_node = self.view(tx, target).ok_or_else(|| TmError::resolve(target))?;
            return Ok((target.clone(), target_node));
        }
        Ok((path.to_string(), node))
    }

    fn table(&self, tx: Option<&TxId>, path: &str) -> Result<(String, &Table)> {
        let (real, node) = self.node(tx, path)?;
        match &node.body {
            Body::Table(t) => Ok((real, t)),
            _ => Err(TmError::invalid_request(format!("{path} is not a table"))),
        }
    }

    fn table_mut(&mut self, tx: Option<&TxId>, path: &str) -> Result<&mut Table> {
        self.check_writable(tx, path)?;
        if !self.nodes.contains_key(path) {
            return Err(TmError::resolve(path));
        }
        self.record(tx, path);
        match self.nodes.get_mut(path).map(|n| &mut n.body) {
            Some(Body::Table(t)) => Ok(t),
            _ => Err(TmError::invalid_request(format!("{path} is not a table"))),
        }
    }

    fn target(&self, tx: Option<&TxId>, path: &str) -> Result<Target> {
        validate_path(path)?;
        if let Some(idx) = path.find("/@") {
            let attr = &path[idx + 2..];
            return Ok(Target::Attribute(
                path[..idx].to_string(),
                (!attr.is_empty()).then(|| attr.to_string()),
            ));
        }
        let parent = parent_of(path);
        if let Some(Node {
            body: Body::List(_),
            ..
        }) = self.view(tx, parent)
        {
            let pos = match base_name(path) {
                "begin" => ListPos::Begin,
                "end" => ListPos::End,
                s => ListPos::Index(s.parse().map_err(|_| {
                    TmError::invalid_request(format!("invalid list index in {path}"))
                })?),
            };
            return Ok(Target::Item(parent.to_string(), pos));
        }
        Ok(Target::Node(path.to_string()))
    }

    fn record(&mut self, tx: Option<&TxId>, path: &str) {
        if let Some(tx) = tx {
            let previous = self.nodes.get(path).cloned();
            if let Some(record) = self.transactions.get_mut(tx) {
                record.undo.push((path.to_string(), previous));
            }
        }
    }

    fn subtree(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        let mut keys: Vec<String> = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        if self.nodes.contains_key(path) {
            keys.insert(0, path.to_string());
        }
        keys
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = child_prefix(path);
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter(|(k, _)| !k[prefix.len()..].contains('/'))
            .map(|(k, _)| k[prefix.len()..].to_string())
            .collect()
    }

    fn put(&mut self, tx: Option<&TxId>, path: &str, node: Node) {
        self.record(tx, path);
        self.nodes.insert(path.to_string(), node);
    }

    fn delete_subtree(&mut self, tx: Option<&TxId>, path: &str) {
        for key in self.subtree(path).into_iter().rev() {
            self.record(tx, &key);
            self.nodes.remove(&key);
        }
    }

    /// Falla si otra transacción no relacionada tiene un lock exclusivo.
    fn check_writable(&self, tx: Option<&TxId>, path: &str) -> Result<()> {
        let Some(node) = self.nodes.get(path) else {
            return Ok(());
        };
        for lock in &self.locks {
            if lock.key != node.id || lock.mode != LockMode::Exclusive {
                continue;
            }
            let owned = tx.map(|t| self.related(t, &lock.tx)).unwrap_or(false);
            if !owned {
                return Err(TmError::new(
                    ErrorKind::LockConflict,
                    format!(
                        "Cannot modify node {path} since \"exclusive\" lock is taken by concurrent transaction {}",
                        lock.tx
                    ),
                )
                .with_attribute("path", path));
            }
        }
        Ok(())
    }

    fn ensure_parent(&mut self, tx: Option<&TxId>, path: &str, recursive: bool) -> Result<()> {
        let parent = parent_of(path).to_string();
        match self.nodes.get(&parent) {
            Some(Node {
                body: Body::Map, ..
            }) => Ok(()),
            Some(_) => Err(TmError::invalid_request(format!(
                "{parent} is not a map node"
            ))),
            None if recursive => {
                self.ensure_parent(tx, &parent, true)?;
                let id = self.alloc_id();
                self.put(
                    tx,
                    &parent,
                    Node {
                        id,
                        body: Body::Map,
                        attributes: Map::new(),
                    },
                );
                Ok(())
            }
            None => Err(TmError::resolve(&parent)),
        }
    }

    fn create_node(
        &mut self,
        tx: Option<&TxId>,
        node_type: NodeType,
        path: &str,
        options: &CreateOptions,
    ) -> Result<String> {
        validate_path(path)?;
        if let Some(existing) = self.nodes.get(path) {
            if options.ignore_existing && existing.body.node_type() == node_type {
                return Ok(existing.id.clone());
            }
            return Err(already_exists(path));
        }
        self.ensure_parent(tx, path, options.recursive)?;

        let mut attributes = options.attributes.clone();
        let body = match node_type {
            NodeType::MapNode => Body::Map,
            NodeType::ListNode => Body::List(Vec::new()),
            NodeType::File => Body::File(Bytes::new()),
            NodeType::Document => Body::Document(attributes.remove("value").unwrap_or(Value::Null)),
            NodeType::Link => {
                let target = attributes
                    .remove("target_path")
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| TmError::invalid_request("link requires target_path"))?;
                Body::Link(target)
            }
            NodeType::Table => Body::Table(self.new_table(&mut attributes)),
        };
        let id = self.alloc_id();
        self.put(
            tx,
            path,
            Node {
                id: id.clone(),
                body,
                attributes,
            },
        );
        Ok(id)
    }

    fn new_table(&mut self, attributes: &mut Map<String, Value>) -> Table {
        let mut table = Table::default();
        if let Some(Value::Array(schema)) = attributes.get("schema") {
            table.sorted_by = schema
                .iter()
                .filter(|c| c.get("sort_order").is_some())
                .filter_map(|c| c.get("name").and_then(Value::as_str).map(str::to_string))
                .collect();
        }
        if let Some(Value::Array(sorted_by)) = attributes.remove("sorted_by") {
            table.sorted_by = sorted_by
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect();
        }
        if attributes.remove("dynamic") == Some(Value::Bool(true)) {
            table.dynamic = true;
            table.tablets = vec![Tablet {
                id: self.alloc_id(),
                pivot_key: Vec::new(),
                state: TabletState::Unmounted,
                partitions: None,
            }];
        }
        table
    }

    fn attributes_of(&self, path: &str, node: &Node) -> Map<String, Value> {
        let mut attrs = Map::new();
        if let Body::Table(_) = node.body {
            attrs.insert("compression_codec".into(), json!("lz4"));
            attrs.insert("erasure_codec".into(), json!("none"));
            attrs.insert("optimize_for".into(), json!("lookup"));
        }
        for (k, v) in &node.attributes {
            attrs.insert(k.clone(), v.clone());
        }
        attrs.insert("id".into(), json!(node.id));
        attrs.insert("type".into(), json!(node.body.node_type().as_str()));
        match &node.body {
            Body::Table(t) => {
                let weight = rows_weight(&t.rows);
                attrs.insert("row_count".into(), json!(t.rows.len()));
                attrs.insert("uncompressed_data_size".into(), json!(weight));
                attrs.insert("compressed_data_size".into(), json!(weight / 2));
                attrs.insert("chunk_count".into(), json!(t.chunk_count));
                attrs.insert("sorted".into(), json!(!t.sorted_by.is_empty()));
                if !t.sorted_by.is_empty() {
                    attrs.insert("sorted_by".into(), json!(t.sorted_by));
                }
                attrs.insert("dynamic".into(), json!(t.dynamic));
                if t.dynamic {
                    attrs.insert("key_columns".into(), json!(t.sorted_by));
                    attrs.insert("tablet_count".into(), json!(t.tablets.len()));
                    let state = t
                        .tablets
                        .first()
                        .map(|tb| tb.state)
                        .unwrap_or(TabletState::Unmounted);
                    attrs.insert("tablet_state".into(), json!(state));
                }
            }
            Body::List(items) => {
                attrs.insert("count".into(), json!(items.len()));
            }
            Body::Map => {
                attrs.insert("count".into(), json!(self.children(path).len()));
            }
            Body::File(data) => {
                attrs.insert("uncompressed_data_size".into(), json!(data.len()));
            }
            Body::Link(target) => {
                attrs.insert("target_path".into(), json!(target));
            }
            Body::Document(_) => {}
        }
        attrs
    }

    fn value_of(&self, tx: Option<&TxId>, path: &str, node: &Node) -> Value {
        match &node.body {
            Body::Map => {
                let mut out = Map::new();
                for child in self.children(path) {
                    let child_path = format!("{}{}", child_prefix(path), child);
                    if let Some(n) = self.view(tx, &child_path) {
                        out.insert(child, self.value_of(tx, &child_path, n));
                    }
                }
                Value::Object(out)
            }
            Body::List(items) => Value::Array(items.iter().map(|i| i.value.clone()).collect()),
            Body::Document(v) => v.clone(),
            Body::Table(_) | Body::File(_) | Body::Link(_) => Value::Null,
        }
    }

    /// Escribe un valor JSON creando nodos: mapas, listas o documentos.
    fn insert_value(&mut self, tx: Option<&TxId>, path: &str, value: Value) -> Result<()> {
        self.check_writable(tx, path)?;
        if self.nodes.contains_key(path) {
            self.delete_subtree(tx, path);
        }
        let id = self.alloc_id();
        match value {
            Value::Object(obj) => {
                self.put(
                    tx,
                    path,
                    Node {
                        id,
                        body: Body::Map,
                        attributes: Map::new(),
                    },
                );
                for (k, v) in obj {
                    self.insert_value(tx, &format!("{}{}", child_prefix(path), k), v)?;
                }
            }
            Value::Array(values) => {
                let mut items = Vec::with_capacity(values.len());
                for value in values {
                    items.push(ListItem {
                        id: self.alloc_id(),
                        value,
                    });
                }
                self.put(
                    tx,
                    path,
                    Node {
                        id,
                        body: Body::List(items),
                        attributes: Map::new(),
                    },
                );
            }
            other => self.put(
                tx,
                path,
                Node {
                    id,
                    body: Body::Document(other),
                    attributes: Map::new(),
                },
            ),
        }
        Ok(())
    }

    fn list_mut(&mut self, tx: Option<&TxId>, path: &str) -> Result<&mut Vec<ListItem>> {
        self.check_writable(tx, path)?;
        self.record(tx, path);
        match self.nodes.get_mut(path).map(|n| &mut n.body) {
            Some(Body::List(items)) => Ok(items),
            Some(_) => Err(TmError::invalid_request(format!("{path} is not a list"))),
            None => Err(TmError::resolve(path)),
        }
    }

    /* ----- locks ----- */

    fn acquire_lock(&mut self, tx: &TxId, path: &str, mode: &LockMode) -> Result<String> {
        let (key, node_path) = match self.target(Some(tx), path)? {
            Target::Item(list, pos) => {
                let (_, node) = self.node(Some(tx), &list)?;
                let Body::List(items) = &node.body else {
                    return Err(TmError::invalid_request(format!("{list} is not a list")));
                };
                let idx = resolve_index(pos, items.len()).ok_or_else(|| TmError::resolve(path))?;
                (format!("#{}", items[idx].id), path.to_string())
            }
            Target::Node(p) => {
                let (real, node) = self.node(Some(tx), &p)?;
                (node.id.clone(), real)
            }
            Target::Attribute(..) => {
                return Err(TmError::invalid_request("cannot lock an attribute"));
            }
        };

        for held in &self.locks {
            if held.key == key && !self.related(&held.tx, tx) && modes_conflict(&held.mode, mode)
            {
                return Err(TmError::new(
                    ErrorKind::LockConflict,
                    format!(
                        "Cannot take {:?} lock for node {} since {:?} lock is taken by concurrent transaction {}",
                        lock_mode_name(mode),
                        node_path,
                        lock_mode_name(&held.mode),
                        held.tx
                    ),
                )
                .with_attribute("path", node_path.as_str()));
            }
        }

        if *mode == LockMode::Snapshot {
            if let Some(node) = self.nodes.get(&node_path).cloned() {
                if let Some(record) = self.transactions.get_mut(tx) {
                    record.snapshots.insert(node_path.clone(), node);
                }
            }
        }

        self.locks.push(LockRecord {
            tx: tx.clone(),
            key,
            mode: mode.clone(),
        });
        Ok(self.alloc_id())
    }

    /* ----- tablas ----- */

    fn read_rows(&self, tx: Option<&TxId>, path: &TablePath) -> Result<(Vec<Row>, Vec<String>)> {
        let (_, table) = self.table(tx, &path.path)?;
        let mut rows: Vec<Row> = if path.ranges.is_empty() {
            table.rows.clone()
        } else {
            let mut out = Vec::new();
            for range in &path.ranges {
                match range {
                    TableRange::Rows(r) => {
                        let lower = (r.lower as usize).min(table.rows.len());
                        let upper = (r.upper as usize).min(table.rows.len()).max(lower);
                        out.extend_from_slice(&table.rows[lower..upper]);
                    }
                    TableRange::Keys(k) => {
                        if table.sorted_by.is_empty() {
                            return Err(TmError::invalid_request(format!(
                                "Cannot use key range on unsorted table {}",
                                path.path
                            )));
                        }
                        out.extend(
                            table
                                .rows
                                .iter()
                                .filter(|row| k.contains(&key_of(row, &table.sorted_by)))
                                .cloned(),
                        );
                    }
                }
            }
            out
        };
        if let Some(columns) = &path.columns {
            for row in rows.iter_mut() {
                row.retain(|k, _| columns.contains(k));
            }
        }
        Ok((rows, table.sorted_by.clone()))
    }

    fn write_rows(
        &mut self,
        tx: Option<&TxId>,
        path: &TablePath,
        rows: Vec<Row>,
        sorted_by: Vec<String>,
        chunks: u64,
    ) -> Result<()> {
        if let Some(tx) = tx {
            if !self.transactions.contains_key(tx) {
                return Err(no_such_transaction(tx));
            }
        }
        if !self.nodes.contains_key(&path.path) {
            self.create_node(tx, NodeType::Table, &path.path, &CreateOptions::default())?;
        }
        let table = self.table_mut(tx, &path.path)?;
        if table.dynamic {
            return Err(TmError::invalid_request(format!(
                "{} is dynamic; use insert_rows",
                path.path
            )));
        }
        if path.append {
            if table.rows.is_empty() {
                table.sorted_by = sorted_by;
            } else {
                let ordered = table.sorted_by == sorted_by
                    && match (table.rows.last(), rows.first()) {
                        (Some(last), Some(first)) => {
                            !compare_rows(last, first, &sorted_by).is_gt()
                        }
                        _ => true,
                    };
                if !ordered {
                    table.sorted_by.clear();
                }
            }
            table.rows.extend(rows);
            table.chunk_count += chunks;
        } else {
            table.rows = rows;
            table.sorted_by = sorted_by;
            table.chunk_count = chunks;
        }
        Ok(())
    }
}

/* ---------------- cliente ---------------- */

struct Inner {
    name: String,
    kind: ClusterKind,
    proxy: String,
    token: Option<String>,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| TmError::generic(format!("state of cluster {} is poisoned", self.name)))
    }

    fn set_operation(&self, id: &str, f: impl FnOnce(&mut OperationStatus)) {
        if let Ok(mut st) = self.lock() {
            if let Some(op) = st.operations.get_mut(id) {
                if !op.status.state.is_terminal() {
                    f(&mut op.status);
                }
            }
        }
    }
}

/// Clúster completo en memoria. Los clones comparten estado.
#[derive(Clone)]
pub struct InMemoryCluster {
    inner: Arc<Inner>,
}

impl InMemoryCluster {
    pub fn new(name: &str, kind: ClusterKind) -> Self {
        Self::with_proxy(name, kind, &format!("{name}.local"), None)
    }

    pub fn with_proxy(name: &str, kind: ClusterKind, proxy: &str, token: Option<&str>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_string(),
                kind,
                proxy: proxy.to_string(),
                token: token.map(str::to_string),
                state: Mutex::new(State::new()),
            }),
        }
    }

    /// Hace fallar la próxima llamada a `method` con `err`.
    pub fn inject_request_failure(&self, method: &str, err: TmError) {
        if let Ok(mut st) = self.inner.lock() {
            st.faults.requests.push_back((method.to_string(), err));
        }
    }

    /// Hace fallar la próxima operación con `err`.
    pub fn inject_operation_failure(&self, err: TmError) {
        if let Ok(mut st) = self.inner.lock() {
            st.faults.operations.push_back(err);
        }
    }

    /// Hace fallar los próximos `count` intentos de job.
    pub fn inject_job_failures(&self, count: u64) {
        if let Ok(mut st) = self.inner.lock() {
            st.faults.job_failures += count;
        }
    }

    /// Retardo antes de que arranque cada operación.
    pub fn set_operation_latency(&self, latency: Duration) {
        if let Ok(mut st) = self.inner.lock() {
            st.operation_latency = latency;
        }
    }

    pub fn started_operations(&self) -> Vec<OperationKind> {
        self.inner
            .lock()
            .map(|st| st.started_operations.clone())
            .unwrap_or_default()
    }

    pub fn active_transactions(&self) -> usize {
        self.inner
            .lock()
            .map(|st| st.transactions.len())
            .unwrap_or_default()
    }

    /// Fija las claves pivote de las particiones de un tablet.
    pub fn set_tablet_partitions(
        &self,
        path: &str,
        tablet_index: usize,
        pivots: Vec<Vec<Value>>,
    ) -> Result<()> {
        let mut st = self.inner.lock()?;
        let table = st.table_mut(None, path)?;
        let tablet = table
            .tablets
            .get_mut(tablet_index)
            .ok_or_else(|| TmError::invalid_request(format!("no tablet #{tablet_index}")))?;
        tablet.partitions = Some(pivots);
        Ok(())
    }

    fn spawn_operation(&self, id: OperationId, ctx: Context, spec: OperationSpec, cancel: CancellationToken) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let latency = inner
                .lock()
                .map(|st| st.operation_latency)
                .unwrap_or_default();
            if !latency.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(latency) => {}
                }
            }
            inner.set_operation(&id, |s| s.state = OperationState::Running);

            let result = tokio::select! {
                r = execute_operation(&inner, &id, &ctx, &spec, &cancel) => r,
                _ = cancel.cancelled() => Err(TmError::cancelled()),
            };
            match result {
                Ok(()) => {
                    debug!(cluster = %inner.name, operation = %id, "operación completada");
                    inner.set_operation(&id, |s| {
                        s.state = OperationState::Completed;
                        s.jobs.running = 0;
                        s.jobs.pending = 0;
                    });
                }
                Err(err) => {
                    info!(cluster = %inner.name, operation = %id, "operación fallida: {err}");
                    inner.set_operation(&id, |s| {
                        s.state = OperationState::Failed;
                        s.jobs.running = 0;
                        s.error = Some(err);
                    });
                }
            }
        });
    }
}

fn split_evenly<T: Clone>(items: &[T], parts: usize) -> Vec<Vec<T>> {
    if items.is_empty() || parts == 0 {
        return Vec::new();
    }
    let parts = parts.min(items.len());
    let base = items.len() / parts;
    let extra = items.len() % parts;
    let mut out = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let len = base + usize::from(i < extra);
        out.push(items[start..start + len].to_vec());
        start += len;
    }
    out
}

fn job_count(spec: &OperationSpec, rows: usize, weight: u64) -> usize {
    if rows == 0 {
        return 0;
    }
    let count = match (spec.options.job_count, spec.options.data_size_per_job) {
        (Some(n), _) => n as usize,
        (None, Some(per_job)) => weight.div_ceil(per_job.max(1)) as usize,
        (None, None) => weight.div_ceil(DEFAULT_DATA_SIZE_PER_JOB) as usize,
    };
    count.clamp(1, rows)
}

async fn execute_operation(
    inner: &Inner,
    id: &str,
    ctx: &Context,
    spec: &OperationSpec,
    cancel: &CancellationToken,
) -> Result<()> {
    if let Some(err) = inner.lock()?.faults.operations.pop_front() {
        return Err(err);
    }
    let tx = ctx.transaction.as_ref();

    match spec.kind {
        OperationKind::Erase => {
            let path = spec
                .inputs
                .first()
                .ok_or_else(|| TmError::invalid_request("erase requires a table"))?;
            let mut st = inner.lock()?;
            let (_, table) = st.table(tx, &path.path)?;
            let keep: Vec<Row> = table
                .rows
                .iter()
                .enumerate()
                .filter(|(index, row)| {
                    !path.ranges.is_empty()
                        && !path
                            .ranges
                            .iter()
                            .any(|r| range_hits(r, *index as u64, row, &table.sorted_by))
                })
                .map(|(_, row)| row.clone())
                .collect();
            debug!(table = %path.path, total = table.rows.len(), kept = keep.len(), "erase");
            let table = st.table_mut(tx, &path.path)?;
            table.rows = keep;
            Ok(())
        }
        OperationKind::RemoteCopy => {
            let remote = spec
                .remote
                .as_ref()
                .ok_or_else(|| TmError::invalid_request("remote_copy requires cluster_name"))?;
            let client = remote.client.clone().ok_or_else(|| {
                TmError::new(
                    ErrorKind::TransportUnavailable,
                    format!(
                        "cluster {} is not reachable from {}",
                        remote.cluster_name, inner.name
                    ),
                )
            })?;
            let remote_ctx = Context {
                transaction: remote.transaction.clone(),
                ping_ancestors: false,
            };
            let mut rows = Vec::new();
            let mut sorted_by = Vec::new();
            for input in &spec.inputs {
                rows.extend(client.read_rows(&remote_ctx, input).await?);
                sorted_by = client.sorted_by(&remote_ctx, &input.path).await?;
            }
            if spec.inputs.len() != 1 {
                sorted_by.clear();
            }
            inner.set_operation(id, |s| {
                s.jobs = JobCounters {
                    completed: 1,
                    total: 1,
                    ..Default::default()
                }
            });
            let output = output_of(spec)?;
            inner.lock()?.write_rows(tx, output, rows, sorted_by, 1)
        }
        OperationKind::Merge | OperationKind::Sort => {
            let mut st = inner.lock()?;
            let mut rows = Vec::new();
            let mut sort_keys = Vec::new();
            let mut chunks = 0;
            for input in &spec.inputs {
                let (part, sorted_by) = st.read_rows(tx, input)?;
                chunks += st.table(tx, &input.path)?.1.chunk_count.max(1);
                rows.extend(part);
                sort_keys.push(sorted_by);
            }
            let sorted_by = if spec.kind == OperationKind::Sort {
                spec.sort_by.clone()
            } else {
                let common = sort_keys
                    .first()
                    .filter(|first| !first.is_empty() && sort_keys.iter().all(|k| k == *first))
                    .cloned();
                match (spec.merge_mode, common) {
                    (MergeMode::Sorted, Some(key)) | (MergeMode::Auto, Some(key)) => key,
                    (MergeMode::Sorted, None) => {
                        return Err(TmError::invalid_request(
                            "sorted merge requires sorted inputs",
                        ))
                    }
                    _ => Vec::new(),
                }
            };
            if !sorted_by.is_empty() {
                rows.sort_by(|a, b| compare_rows(a, b, &sorted_by));
            }
            if spec.options.combine_chunks || spec.kind == OperationKind::Sort {
                chunks = 1;
            }
            let output = output_of(spec)?;
            st.write_rows(tx, output, rows, sorted_by, chunks)
        }
        OperationKind::Map | OperationKind::Reduce => {
            let job = spec
                .job
                .as_ref()
                .ok_or_else(|| TmError::invalid_request("operation requires a user job"))?;
            let mut rows = Vec::new();
            {
                let st = inner.lock()?;
                for input in &spec.inputs {
                    rows.extend(st.read_rows(tx, input)?.0);
                }
            }
            let weight = rows_weight(&rows);
            let partitions: Vec<Vec<Row>> = if spec.kind == OperationKind::Reduce {
                rows.sort_by(|a, b| compare_rows(a, b, &spec.reduce_by));
                let groups = group_by_key(rows, &spec.reduce_by);
                let count = job_count(spec, groups.len(), weight);
                split_evenly(&groups, count)
                    .into_iter()
                    .map(|part| part.into_iter().flat_map(|(_, g)| g).collect::<Vec<Row>>())
                    .collect()
            } else {
                let count = job_count(spec, rows.len(), weight);
                split_evenly(&rows, count)
            };

            let total = partitions.len();
            let mut counters = JobCounters {
                pending: total as u64,
                total: total as u64,
                ..Default::default()
            };
            inner.set_operation(id, |s| s.jobs = counters);

            let max_failed = spec.max_failed_job_count();
            let mut output = Vec::new();
            for (index, part) in partitions.into_iter().enumerate() {
                loop {
                    if cancel.is_cancelled() {
                        return Err(TmError::cancelled());
                    }
                    counters.pending = counters.pending.saturating_sub(1);
                    counters.running = 1;
                    inner.set_operation(id, |s| s.jobs = counters);

                    let injected = {
                        let mut st = inner.lock()?;
                        if st.faults.job_failures > 0 {
                            st.faults.job_failures -= 1;
                            true
                        } else {
                            false
                        }
                    };
                    let result = if injected {
                        Err(TmError::generic(format!("Job #{index} failed: process exited with code 1")))
                    } else {
                        let job_ctx = job.context(index, total);
                        run_job(job, part.clone(), &spec.reduce_by, &job_ctx).await
                    };

                    counters.running = 0;
                    match result {
                        Ok(rows) => {
                            output.extend(rows);
                            counters.completed += 1;
                            inner.set_operation(id, |s| s.jobs = counters);
                            break;
                        }
                        Err(err) => {
                            counters.failed += 1;
                            counters.pending += 1;
                            inner.set_operation(id, |s| s.jobs = counters);
                            if counters.failed > max_failed {
                                return Err(TmError::new(
                                    ErrorKind::TooManyFailedJobs,
                                    "Failed jobs limit exceeded",
                                )
                                .with_attribute("max_failed_job_count", max_failed)
                                .with_inner(err));
                            }
                        }
                    }
                }
                tokio::task::yield_now().await;
            }

            let target = output_of(spec)?;
            inner
                .lock()?
                .write_rows(tx, target, output, Vec::new(), total.max(1) as u64)
        }
    }
}

fn output_of(spec: &OperationSpec) -> Result<&TablePath> {
    spec.output
        .as_ref()
        .ok_or_else(|| TmError::invalid_request("operation requires an output table"))
}

fn content_hash(data: &[u8]) -> String {
    let mut h = DefaultHasher::new();
    data.hash(&mut h);
    format!("{:016x}", h.finish())
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn kind(&self) -> ClusterKind {
        self.inner.kind
    }

    fn proxy_address(&self) -> &str {
        &self.inner.proxy
    }

    fn token(&self) -> Option<&str> {
        self.inner.token.as_deref()
    }

    async fn exists(&self, ctx: &Context, path: &str) -> Result<bool> {
        let mut st = self.inner.lock()?;
        st.fault("exists")?;
        let tx = st.check_tx(ctx)?;
        let tx = tx.as_ref();
        Ok(match st.target(tx, path)? {
            Target::Node(p) => st.view(tx, &p).is_some(),
            Target::Attribute(p, attr) => match st.view(tx, &p) {
                None => false,
                Some(node) => match attr {
                    None => true,
                    Some(name) => st.attributes_of(&p, node).contains_key(&name),
                },
            },
            Target::Item(list, pos) => match st.view(tx, &list).map(|n| &n.body) {
                Some(Body::List(items)) => resolve_index(pos, items.len()).is_some(),
                _ => false,
            },
        })
    }

    async fn get(&self, ctx: &Context, path: &str, attributes: &[&str]) -> Result<Value> {
        let mut st = self.inner.lock()?;
        st.fault("get")?;
        let tx = st.check_tx(ctx)?;
        let tx = tx.as_ref();
        match st.target(tx, path)? {
            Target::Attribute(p, attr) => {
                let (real, node) = st.node(tx, &p)?;
                let attrs = st.attributes_of(&real, node);
                match attr {
                    None => Ok(Value::Object(attrs)),
                    Some(name) => attrs.get(&name).cloned().ok_or_else(|| {
                        TmError::new(
                            ErrorKind::Resolve,
                            format!("Attribute {name:?} is not found at {p}"),
                        )
                    }),
                }
            }
            Target::Item(list, pos) => {
                let (_, node) = st.node(tx, &list)?;
                let Body::List(items) = &node.body else {
                    return Err(TmError::resolve(path));
                };
                let idx = resolve_index(pos, items.len()).ok_or_else(|| TmError::resolve(path))?;
                Ok(items[idx].value.clone())
            }
            Target::Node(p) => {
                let (real, node) = st.node(tx, &p)?;
                let value = st.value_of(tx, &real, node);
                if attributes.is_empty() {
                    return Ok(value);
                }
                let all = st.attributes_of(&real, node);
                let selected: Map<String, Value> = attributes
                    .iter()
                    .filter_map(|a| all.get(*a).map(|v| (a.to_string(), v.clone())))
                    .collect();
                Ok(json!({"$attributes": selected, "$value": value}))
            }
        }
    }

    async fn set(&self, ctx: &Context, path: &str, value: Value) -> Result<()> {
        let mut st = self.inner.lock()?;
        st.fault("set")?;
        let tx = st.check_tx(ctx)?;
        let tx = tx.as_ref();
        match st.target(tx, path)? {
            Target::Attribute(p, None) => Err(TmError::invalid_request(format!(
                "cannot replace all attributes of {p}"
            ))),
            Target::Attribute(p, Some(name)) => {
                const READ_ONLY: &[&str] = &[
                    "id",
                    "type",
                    "row_count",
                    "uncompressed_data_size",
                    "compressed_data_size",
                    "chunk_count",
                    "sorted",
                    "sorted_by",
                    "dynamic",
                    "count",
                    "tablet_state",
                ];
                if READ_ONLY.contains(&name.as_str()) {
                    return Err(TmError::invalid_request(format!(
                        "Attribute {name:?} cannot be set"
                    )));
                }
                st.check_writable(tx, &p)?;
                if !st.nodes.contains_key(&p) {
                    return Err(TmError::resolve(&p));
                }
                st.record(tx, &p);
                if let Some(node) = st.nodes.get_mut(&p) {
                    node.attributes.insert(name, value);
                }
                Ok(())
            }
            Target::Item(list, pos) => {
                let id = st.alloc_id();
                let items = st.list_mut(tx, &list)?;
                match pos {
                    ListPos::Begin => items.insert(0, ListItem { id, value }),
                    ListPos::End => items.push(ListItem { id, value }),
                    ListPos::Index(_) => {
                        let idx =
                            resolve_index(pos, items.len()).ok_or_else(|| TmError::resolve(path))?;
                        items[idx].value = value;
                    }
                }
                Ok(())
            }
            Target::Node(p) => {
                if let Some(Node {
                    body: Body::Table(_) | Body::File(_),
                    ..
                }) = st.nodes.get(&p)
                {
                    return Err(TmError::invalid_request(format!(
                        "cannot set a value on {p}"
                    )));
                }
                st.ensure_parent(tx, &p, false)?;
                st.insert_value(tx, &p, value)
            }
        }
    }

    async fn remove(&self, ctx: &Context, path: &str, recursive: bool, force: bool) -> Result<()> {
        let mut st = self.inner.lock()?;
        st.fault("remove")?;
        let tx = st.check_tx(ctx)?;
        let tx = tx.as_ref();
        match st.target(tx, path)? {
            Target::Attribute(p, Some(name)) => {
                st.check_writable(tx, &p)?;
                st.record(tx, &p);
                match st.nodes.get_mut(&p) {
                    Some(node) => {
                        node.attributes.remove(&name);
                        Ok(())
                    }
                    None if force => Ok(()),
                    None => Err(TmError::resolve(&p)),
                }
            }
            Target::Attribute(p, None) => Err(TmError::invalid_request(format!(
                "cannot remove all attributes of {p}"
            ))),
            Target::Item(list, pos) => {
                let items = st.list_mut(tx, &list)?;
                match resolve_index(pos, items.len()) {
                    Some(idx) => {
                        items.remove(idx);
                        Ok(())
                    }
                    None if force => Ok(()),
                    None => Err(TmError::resolve(path)),
                }
            }
            Target::Node(p) => {
                if p == "/" {
                    return Err(TmError::invalid_request("cannot remove the root"));
                }
                if !st.nodes.contains_key(&p) {
                    return if force { Ok(()) } else { Err(TmError::resolve(&p)) };
                }
                if !recursive && !st.children(&p).is_empty() {
                    return Err(TmError::invalid_request(format!(
                        "Cannot remove non-empty composite node {p}"
                    )));
                }
                for key in st.subtree(&p) {
                    st.check_writable(tx, &key)?;
                }
                st.delete_subtree(tx, &p);
                Ok(())
            }
        }
    }

    async fn create(
        &self,
        ctx: &Context,
        node_type: NodeType,
        path: &str,
        options: &CreateOptions,
    ) -> Result<String> {
        let mut st = self.inner.lock()?;
        st.fault("create")?;
        let tx = st.check_tx(ctx)?;
        st.create_node(tx.as_ref(), node_type, path, options)
    }

    async fn list(&self, ctx: &Context, path: &str) -> Result<Vec<String>> {
        let mut st = self.inner.lock()?;
        st.fault("list")?;
        let tx = st.check_tx(ctx)?;
        let (real, node) = st.node(tx.as_ref(), path)?;
        match node.body {
            Body::Map => Ok(st.children(&real)),
            _ => Err(TmError::invalid_request(format!("{path} is not a map node"))),
        }
    }

    async fn copy(&self, ctx: &Context, src: &str, dst: &str, recursive: bool) -> Result<()> {
        let mut st = self.inner.lock()?;
        st.fault("copy")?;
        let tx = st.check_tx(ctx)?;
        let tx = tx.as_ref();
        validate_path(dst)?;
        let (real, _) = st.node(tx, src)?;
        if st.nodes.contains_key(dst) {
            return Err(already_exists(dst));
        }
        st.ensure_parent(tx, dst, recursive)?;
        let copies: Vec<(String, Node)> = st
            .subtree(&real)
            .into_iter()
            .filter_map(|k| {
                let node = st.view(tx, &k)?.clone();
                Some((format!("{dst}{}", &k[real.len()..]), node))
            })
            .collect();
        for (path, mut node) in copies {
            node.id = st.alloc_id();
            st.put(tx, &path, node);
        }
        Ok(())
    }

    async fn move_node(&self, ctx: &Context, src: &str, dst: &str, recursive: bool) -> Result<()> {
        self.copy(ctx, src, dst, recursive).await?;
        self.remove(ctx, src, true, false).await
    }

    async fn link(&self, ctx: &Context, target: &str, link_path: &str) -> Result<()> {
        let options = CreateOptions::default().with_attribute("target_path", json!(target));
        self.create(ctx, NodeType::Link, link_path, &options).await?;
        Ok(())
    }

    async fn lock(&self, ctx: &Context, path: &str, mode: &LockMode) -> Result<String> {
        let mut st = self.inner.lock()?;
        st.fault("lock")?;
        let tx = st.check_tx(ctx)?.ok_or_else(|| {
            TmError::invalid_request(format!("locking {path} requires a transaction"))
        })?;
        st.acquire_lock(&tx, path, mode)
    }

    async fn search(&self, ctx: &Context, root: &str, filter: &SearchFilter) -> Result<Vec<String>> {
        let mut st = self.inner.lock()?;
        st.fault("search")?;
        let tx = st.check_tx(ctx)?;
        let (real, _) = st.node(tx.as_ref(), root)?;
        let root_depth = real.matches('/').count();
        Ok(st
            .subtree(&real)
            .into_iter()
            .filter(|k| {
                let depth = k.matches('/').count().saturating_sub(root_depth);
                filter.depth_bound.map(|d| depth <= d).unwrap_or(true)
            })
            .filter(|k| {
                filter.node_types.is_empty()
                    || st
                        .nodes
                        .get(k)
                        .map(|n| filter.node_types.contains(&n.body.node_type()))
                        .unwrap_or(false)
            })
            .collect())
    }

    async fn begin_transaction(&self, ctx: &Context, timeout: Duration) -> Result<TxId> {
        let mut st = self.inner.lock()?;
        st.fault("begin_transaction")?;
        let parent = st.check_tx(ctx)?;
        let id = st.begin_tx(parent, timeout);
        debug!(cluster = %self.inner.name, transaction = %id, "transacción iniciada");
        Ok(id)
    }

    async fn commit_transaction(&self, _ctx: &Context, tx: &TxId) -> Result<()> {
        let mut st = self.inner.lock()?;
        st.fault("commit_transaction")?;
        st.expire_transactions();
        st.commit_tx(tx)
    }

    async fn abort_transaction(&self, _ctx: &Context, tx: &TxId) -> Result<()> {
        let mut st = self.inner.lock()?;
        st.fault("abort_transaction")?;
        st.expire_transactions();
        if !st.transactions.contains_key(tx) {
            return Err(no_such_transaction(tx));
        }
        st.abort_tx(tx);
        Ok(())
    }

    async fn ping_transaction(&self, ctx: &Context, tx: &TxId) -> Result<()> {
        let mut st = self.inner.lock()?;
        st.fault("ping_transaction")?;
        st.expire_transactions();
        st.ping_tx(tx, ctx.ping_ancestors)
    }

    async fn read_table(
        &self,
        ctx: &Context,
        path: &TablePath,
        format: &Format,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let rows = {
            let mut st = self.inner.lock()?;
            st.fault("read_table")?;
            let tx = st.check_tx(ctx)?;
            st.read_rows(tx.as_ref(), path)?.0
        };
        let mut chunks = Vec::new();
        for chunk in rows.chunks(READ_CHUNK_ROWS) {
            chunks.push(Ok(format.encode_rows(chunk)?));
        }
        Ok(stream::iter(chunks).boxed())
    }

    async fn write_table(
        &self,
        ctx: &Context,
        path: &TablePath,
        data: Bytes,
        format: &Format,
    ) -> Result<()> {
        let rows = format.decode_rows(&data)?;
        let mut st = self.inner.lock()?;
        st.fault("write_table")?;
        let tx = st.check_tx(ctx)?;
        let sorted_by = if path.append {
            st.table(tx.as_ref(), &path.path)
                .map(|(_, t)| t.sorted_by.clone())
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let sorted_by = if is_sorted_by(&rows, &sorted_by) {
            sorted_by
        } else {
            Vec::new()
        };
        st.write_rows(tx.as_ref(), path, rows, sorted_by, 1)
    }

    async fn create_temp_table(&self, ctx: &Context, prefix: Option<&str>) -> Result<String> {
        let mut st = self.inner.lock()?;
        st.fault("create_temp_table")?;
        let tx = st.check_tx(ctx)?;
        let prefix = prefix.unwrap_or(TEMP_TABLES_PREFIX);
        let path = format!("{}/tmp-{}", prefix.trim_end_matches('/'), uuid::Uuid::new_v4());
        st.create_node(tx.as_ref(), NodeType::Table, &path, &CreateOptions::recursive())?;
        if let Some(record) = tx.as_ref().and_then(|t| st.transactions.get_mut(t)) {
            record.temp_tables.push(path.clone());
        }
        Ok(path)
    }

    async fn mount_table(&self, ctx: &Context, path: &str) -> Result<()> {
        set_tablet_state(self, ctx, path, "mount_table", TabletState::Mounted)
    }

    async fn unmount_table(&self, ctx: &Context, path: &str) -> Result<()> {
        set_tablet_state(self, ctx, path, "unmount_table", TabletState::Unmounted)
    }

    async fn freeze_table(&self, ctx: &Context, path: &str) -> Result<()> {
        set_tablet_state(self, ctx, path, "freeze_table", TabletState::Frozen)
    }

    async fn unfreeze_table(&self, ctx: &Context, path: &str) -> Result<()> {
        set_tablet_state(self, ctx, path, "unfreeze_table", TabletState::Mounted)
    }

    async fn reshard_table(
        &self,
        ctx: &Context,
        path: &str,
        pivot_keys: Vec<Vec<Value>>,
    ) -> Result<()> {
        let mut st = self.inner.lock()?;
        st.fault("reshard_table")?;
        let tx = st.check_tx(ctx)?;
        if pivot_keys.first().map(|k| !k.is_empty()).unwrap_or(true) {
            return Err(TmError::invalid_request(
                "First pivot key must be empty",
            ));
        }
        if pivot_keys.windows(2).any(|w| !compare_keys(&w[0], &w[1]).is_lt()) {
            return Err(TmError::invalid_request("Pivot keys must be strictly increasing"));
        }
        let mut ids = Vec::with_capacity(pivot_keys.len());
        for _ in &pivot_keys {
            ids.push(st.alloc_id());
        }
        let table = st.table_mut(tx.as_ref(), path)?;
        if !table.dynamic {
            return Err(TmError::invalid_request(format!("{path} is not dynamic")));
        }
        if table.tablets.iter().any(|t| t.state != TabletState::Unmounted) {
            return Err(TmError::invalid_request(format!(
                "Table {path} must be unmounted to reshard"
            )));
        }
        table.tablets = pivot_keys
            .into_iter()
            .zip(ids)
            .map(|(pivot_key, id)| Tablet {
                id,
                pivot_key,
                state: TabletState::Unmounted,
                partitions: None,
            })
            .collect();
        Ok(())
    }

    async fn tablets(&self, ctx: &Context, path: &str) -> Result<Vec<TabletInfo>> {
        let mut st = self.inner.lock()?;
        st.fault("tablets")?;
        let tx = st.check_tx(ctx)?;
        let (_, table) = st.table(tx.as_ref(), path)?;
        Ok(table
            .tablets
            .iter()
            .map(|t| TabletInfo {
                tablet_id: t.id.clone(),
                pivot_key: t.pivot_key.clone(),
                state: t.state,
            })
            .collect())
    }

    async fn tablet_partitions(&self, _ctx: &Context, tablet_id: &str) -> Result<Vec<Vec<Value>>> {
        let mut st = self.inner.lock()?;
        st.fault("tablet_partitions")?;
        for node in st.nodes.values() {
            if let Body::Table(table) = &node.body {
                if let Some(tablet) = table.tablets.iter().find(|t| t.id == tablet_id) {
                    return Ok(tablet
                        .partitions
                        .clone()
                        .unwrap_or_else(|| vec![tablet.pivot_key.clone()]));
                }
            }
        }
        Err(TmError::new(
            ErrorKind::Resolve,
            format!("No such tablet {tablet_id}"),
        ))
    }

    async fn insert_rows(&self, ctx: &Context, path: &str, rows: Vec<Row>) -> Result<()> {
        let mut st = self.inner.lock()?;
        st.fault("insert_rows")?;
        let tx = st.check_tx(ctx)?;
        let table = mounted_table(&mut st, tx.as_ref(), path)?;
        let key_columns = table.sorted_by.clone();
        for row in rows {
            let key = key_of(&row, &key_columns);
            match table
                .rows
                .binary_search_by(|r| compare_keys(&key_of(r, &key_columns), &key))
            {
                Ok(idx) => table.rows[idx] = row,
                Err(idx) => table.rows.insert(idx, row),
            }
        }
        Ok(())
    }

    async fn lookup_rows(&self, ctx: &Context, path: &str, keys: Vec<Row>) -> Result<Vec<Row>> {
        let mut st = self.inner.lock()?;
        st.fault("lookup_rows")?;
        let tx = st.check_tx(ctx)?;
        let table = mounted_table(&mut st, tx.as_ref(), path)?;
        let key_columns = table.sorted_by.clone();
        Ok(keys
            .iter()
            .filter_map(|k| {
                let key = key_of(k, &key_columns);
                table
                    .rows
                    .iter()
                    .find(|r| compare_keys(&key_of(r, &key_columns), &key).is_eq())
                    .cloned()
            })
            .collect())
    }

    async fn select_rows(&self, ctx: &Context, query: &SelectQuery) -> Result<Vec<Row>> {
        let mut st = self.inner.lock()?;
        st.fault("select_rows")?;
        let tx = st.check_tx(ctx)?;
        let table = mounted_table(&mut st, tx.as_ref(), &query.table)?;
        let mut query = query.clone();
        if query.key_columns.is_empty() {
            query.key_columns = table.sorted_by.clone();
        }
        let mut out: Vec<Row> = table
            .rows
            .iter()
            .filter(|r| query.matches(r))
            .take(query.limit.map(|l| l as usize).unwrap_or(usize::MAX))
            .cloned()
            .collect();
        if let Some(columns) = &query.columns {
            for row in out.iter_mut() {
                row.retain(|k, _| columns.contains(k));
            }
        }
        Ok(out)
    }

    async fn read_file(&self, ctx: &Context, path: &str) -> Result<Bytes> {
        let mut st = self.inner.lock()?;
        st.fault("read_file")?;
        let tx = st.check_tx(ctx)?;
        let (_, node) = st.node(tx.as_ref(), path)?;
        match &node.body {
            Body::File(data) => Ok(data.clone()),
            _ => Err(TmError::invalid_request(format!("{path} is not a file"))),
        }
    }

    async fn write_file(&self, ctx: &Context, path: &str, data: Bytes) -> Result<()> {
        let mut st = self.inner.lock()?;
        st.fault("write_file")?;
        let tx = st.check_tx(ctx)?;
        let tx = tx.as_ref();
        if !st.nodes.contains_key(path) {
            st.create_node(tx, NodeType::File, path, &CreateOptions::default())?;
        }
        st.check_writable(tx, path)?;
        st.record(tx, path);
        match st.nodes.get_mut(path) {
            Some(node) => match &mut node.body {
                Body::File(content) => {
                    *content = data;
                    Ok(())
                }
                _ => Err(TmError::invalid_request(format!("{path} is not a file"))),
            },
            None => Err(TmError::resolve(path)),
        }
    }

    async fn smart_upload_file(
        &self,
        ctx: &Context,
        name: &str,
        data: Bytes,
        placement: FilePlacement,
    ) -> Result<String> {
        let path = match placement {
            FilePlacement::Hash => {
                format!("{FILE_STORAGE_PREFIX}/hash/{}/{name}", content_hash(&data))
            }
            FilePlacement::Random => {
                format!("{FILE_STORAGE_PREFIX}/{name}{}", uuid::Uuid::new_v4().simple())
            }
            FilePlacement::Ignore => format!("{FILE_STORAGE_PREFIX}/{name}"),
        };
        if placement == FilePlacement::Hash && self.exists(ctx, &path).await? {
            return Ok(path);
        }
        self.mkdir_for(ctx, &path)?;
        self.write_file(ctx, &path, data).await?;
        Ok(path)
    }

    async fn start_operation(&self, ctx: &Context, spec: OperationSpec) -> Result<OperationId> {
        let cancel = CancellationToken::new();
        let id = {
            let mut st = self.inner.lock()?;
            st.fault("start_operation")?;
            let tx = st.check_tx(ctx)?;
            for input in &spec.inputs {
                if spec.kind != OperationKind::RemoteCopy {
                    st.table(tx.as_ref(), &input.path)?;
                }
            }
            let id = uuid::Uuid::new_v4().to_string();
            st.started_operations.push(spec.kind);
            st.operations.insert(
                id.clone(),
                OperationRecord {
                    status: OperationStatus {
                        id: id.clone(),
                        state: OperationState::Pending,
                        jobs: JobCounters::default(),
                        error: None,
                    },
                    tx,
                    cancel: cancel.clone(),
                },
            );
            id
        };
        info!(cluster = %self.inner.name, operation = %id, kind = ?spec.kind, "operación iniciada");
        self.spawn_operation(id.clone(), ctx.clone(), spec, cancel);
        Ok(id)
    }

    async fn get_operation(&self, _ctx: &Context, id: &str) -> Result<OperationStatus> {
        let mut st = self.inner.lock()?;
        st.fault("get_operation")?;
        st.expire_transactions();
        st.operations
            .get(id)
            .map(|op| op.status.clone())
            .ok_or_else(|| TmError::new(ErrorKind::Resolve, format!("No such operation {id}")))
    }

    async fn abort_operation(&self, _ctx: &Context, id: &str) -> Result<()> {
        let mut st = self.inner.lock()?;
        st.fault("abort_operation")?;
        let op = st
            .operations
            .get_mut(id)
            .ok_or_else(|| TmError::new(ErrorKind::Resolve, format!("No such operation {id}")))?;
        if !op.status.state.is_terminal() {
            op.status.state = OperationState::Aborted;
            op.cancel.cancel();
        }
        Ok(())
    }

    async fn hive_table_files(&self, ctx: &Context, table: &str) -> Result<HiveExport> {
        if self.inner.kind != ClusterKind::Hive {
            return Err(TmError::invalid_request(format!(
                "cluster {} is not a hive cluster",
                self.inner.name
            )));
        }
        let files: Vec<String> = self
            .list(ctx, table)
            .await?
            .into_iter()
            .map(|name| format!("{table}/{name}"))
            .collect();
        Ok(HiveExport {
            config: json!({"table": table, "format": "json", "files_count": files.len()}),
            files,
        })
    }
}

impl InMemoryCluster {
    fn mkdir_for(&self, ctx: &Context, path: &str) -> Result<()> {
        let mut st = self.inner.lock()?;
        let tx = st.check_tx(ctx)?;
        st.ensure_parent(tx.as_ref(), path, true)
    }
}

fn mounted_table<'a>(st: &'a mut State, tx: Option<&TxId>, path: &str) -> Result<&'a mut Table> {
    let table = st.table_mut(tx, path)?;
    if !table.dynamic {
        return Err(TmError::invalid_request(format!("{path} is not dynamic")));
    }
    if table.tablets.iter().any(|t| t.state != TabletState::Mounted) {
        return Err(TmError::invalid_request(format!(
            "Table {path} is not mounted"
        )));
    }
    Ok(table)
}

fn set_tablet_state(
    cluster: &InMemoryCluster,
    ctx: &Context,
    path: &str,
    method: &str,
    state: TabletState,
) -> Result<()> {
    let mut st = cluster.inner.lock()?;
    st.fault(method)?;
    let tx = st.check_tx(ctx)?;
    let table = st.table_mut(tx.as_ref(), path)?;
    if !table.dynamic {
        return Err(TmError::invalid_request(format!("{path} is not dynamic")));
    }
    for tablet in table.tablets.iter_mut() {
        tablet.state = state;
    }
    debug!(table = path, ?state, "estado de tablets actualizado");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::{KeyRange, RowRange};
    use std::collections::HashSet as Set;

    fn client() -> (InMemoryCluster, Arc<dyn ClusterClient>) {
        let cluster = InMemoryCluster::new("local", ClusterKind::Yt);
        let client: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
        (cluster, client)
    }

    fn rows(values: &[Value]) -> Vec<Row> {
        values.iter().map(|v| v.as_object().cloned().unwrap()).collect()
    }

    const TX_TIMEOUT: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn escribir_y_leer_tabla_con_rangos() {
        let (_, c) = client();
        let ctx = Context::new();
        c.mkdir(&ctx, "//tmp", true).await.unwrap();
        let data = rows(&[json!({"x": 1}), json!({"x": 2}), json!({"x": 3})]);
        c.write_rows(&ctx, &"//tmp/t".into(), &data).await.unwrap();

        assert_eq!(c.records_count(&ctx, "//tmp/t").await.unwrap(), 3);
        let ranged = TablePath::new("//tmp/t")
            .with_ranges(vec![TableRange::Rows(RowRange::new(1, 3))]);
        assert_eq!(c.read_rows(&ctx, &ranged).await.unwrap(), data[1..].to_vec());
        assert_eq!(
            c.get_attribute(&ctx, "//tmp/t", "compression_codec").await.unwrap(),
            json!("lz4")
        );
    }

    #[tokio::test]
    async fn abortar_transaccion_deshace_cambios_y_tablas_temporales() {
        let (cluster, c) = client();
        let root = Context::new();
        c.mkdir(&root, "//home", true).await.unwrap();

        let tx = c.begin_transaction(&root, TX_TIMEOUT).await.unwrap();
        let ctx = Context::in_transaction(tx.clone());
        c.write_rows(&ctx, &"//home/t".into(), &rows(&[json!({"a": 1})]))
            .await
            .unwrap();
        let temp = c.create_temp_table(&ctx, None).await.unwrap();
        assert!(c.exists(&ctx, &temp).await.unwrap());

        c.abort_transaction(&root, &tx).await.unwrap();
        assert!(!c.exists(&root, "//home/t").await.unwrap());
        assert!(!c.exists(&root, &temp).await.unwrap());
        assert_eq!(cluster.active_transactions(), 0);
    }

    #[tokio::test]
    async fn commit_anidado_pasa_cambios_al_padre() {
        let (_, c) = client();
        let root = Context::new();
        let outer = c.begin_transaction(&root, TX_TIMEOUT).await.unwrap();
        let outer_ctx = Context::in_transaction(outer.clone());
        let inner = c.begin_transaction(&outer_ctx, TX_TIMEOUT).await.unwrap();
        let inner_ctx = Context::in_transaction(inner.clone());

        c.set(&inner_ctx, "//doc", json!({"k": [1, 2]})).await.unwrap();
        c.commit_transaction(&root, &inner).await.unwrap();
        assert_eq!(c.get(&root, "//doc/k", &[]).await.unwrap(), json!([1, 2]));

        // abortar el padre deshace también lo que confirmó el hijo
        c.abort_transaction(&root, &outer).await.unwrap();
        assert!(!c.exists(&root, "//doc").await.unwrap());
    }

    #[tokio::test]
    async fn tablas_temporales_desaparecen_al_confirmar() {
        let (_, c) = client();
        let root = Context::new();
        let tx = c.begin_transaction(&root, TX_TIMEOUT).await.unwrap();
        let ctx = Context::in_transaction(tx.clone());
        let temp = c
            .create_temp_table(&ctx, Some("//tmp/transfer_manager/task-1"))
            .await
            .unwrap();
        assert!(temp.starts_with("//tmp/transfer_manager/task-1/"));
        c.commit_transaction(&root, &tx).await.unwrap();
        assert!(!c.exists(&root, &temp).await.unwrap());
    }

    #[tokio::test]
    async fn lock_exclusivo_entra_en_conflicto_y_shared_por_clave() {
        let (_, c) = client();
        let root = Context::new();
        c.mkdir(&root, "//dst", true).await.unwrap();
        let a = Context::in_transaction(c.begin_transaction(&root, TX_TIMEOUT).await.unwrap());
        let b = Context::in_transaction(c.begin_transaction(&root, TX_TIMEOUT).await.unwrap());

        let shared = |k: &str| LockMode::Shared {
            child_key: Some(k.to_string()),
        };
        c.lock(&a, "//dst", &shared("t1")).await.unwrap();
        c.lock(&b, "//dst", &shared("t2")).await.unwrap();
        let err = c.lock(&b, "//dst", &shared("t1")).await.unwrap_err();
        assert!(err.is(ErrorKind::LockConflict));
        let err = c.lock(&b, "//dst", &LockMode::Exclusive).await.unwrap_err();
        assert!(err.is(ErrorKind::LockConflict));
        // snapshot nunca bloquea
        c.lock(&b, "//dst", &LockMode::Snapshot).await.unwrap();
        // sin transacción no se puede bloquear
        assert!(c.lock(&root, "//dst", &LockMode::Exclusive).await.is_err());
    }

    #[tokio::test]
    async fn lock_snapshot_congela_la_vista_de_la_tabla() {
        let (_, c) = client();
        let root = Context::new();
        c.write_rows(&root, &"//t".into(), &rows(&[json!({"x": 1})]))
            .await
            .unwrap();
        let tx = Context::in_transaction(c.begin_transaction(&root, TX_TIMEOUT).await.unwrap());
        c.lock(&tx, "//t", &LockMode::Snapshot).await.unwrap();

        c.write_rows(&root, &TablePath::new("//t").with_append(true), &rows(&[json!({"x": 2})]))
            .await
            .unwrap();
        assert_eq!(c.records_count(&root, "//t").await.unwrap(), 2);
        assert_eq!(c.records_count(&tx, "//t").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn nodo_lista_con_begin_y_indice_negativo() {
        let (_, c) = client();
        let ctx = Context::new();
        c.create(&ctx, NodeType::ListNode, "//queue", &CreateOptions::default())
            .await
            .unwrap();
        c.set(&ctx, "//queue/begin", json!("first")).await.unwrap();
        c.set(&ctx, "//queue/begin", json!("second")).await.unwrap();
        assert_eq!(c.get(&ctx, "//queue/@count", &[]).await.unwrap(), json!(2));
        assert_eq!(c.get(&ctx, "//queue/-1", &[]).await.unwrap(), json!("first"));
        c.remove(&ctx, "//queue/-1", false, false).await.unwrap();
        assert_eq!(c.get(&ctx, "//queue", &[]).await.unwrap(), json!(["second"]));
    }

    #[tokio::test(start_paused = true)]
    async fn transaccion_sin_ping_expira() {
        let (_, c) = client();
        let root = Context::new();
        let tx = c
            .begin_transaction(&root, Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        c.ping_transaction(&root, &tx).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        c.ping_transaction(&root, &tx).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let err = c.ping_transaction(&root, &tx).await.unwrap_err();
        assert!(err.is(ErrorKind::NoSuchTransaction));
    }

    #[tokio::test]
    async fn merge_en_sitio_conserva_filas_y_orden() {
        let (_, c) = client();
        let ctx = Context::new();
        let data = rows(&[json!({"x": 1}), json!({"x": 2}), json!({"x": 100})]);
        c.write_rows(&ctx, &"//t".into(), &data).await.unwrap();
        c.run_sort(&ctx, "//t".into(), "//t".into(), vec!["x".into()], Default::default())
            .await
            .unwrap()
            .wait(&CancellationToken::new(), Duration::from_millis(10), |_| {})
            .await
            .unwrap();

        let options = crate::cluster::OperationOptions {
            combine_chunks: true,
            ..Default::default()
        };
        c.run_merge(&ctx, vec!["//t".into()], "//t".into(), MergeMode::Auto, options)
            .await
            .unwrap()
            .wait(&CancellationToken::new(), Duration::from_millis(10), |_| {})
            .await
            .unwrap();

        assert_eq!(c.read_rows(&ctx, &"//t".into()).await.unwrap(), data);
        assert_eq!(c.sorted_by(&ctx, "//t").await.unwrap(), vec!["x".to_string()]);
        assert_eq!(c.get_attribute(&ctx, "//t", "chunk_count").await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn demasiados_jobs_fallidos_rompen_la_operacion() {
        use crate::job::{JobContext, Mapper, UserJob};

        struct Identity;
        #[async_trait]
        impl Mapper for Identity {
            async fn map(&self, row: Row, _ctx: &JobContext) -> Result<Vec<Row>> {
                Ok(vec![row])
            }
        }

        let (cluster, c) = client();
        let ctx = Context::new();
        c.write_rows(&ctx, &"//in".into(), &rows(&[json!({"a": 1}), json!({"a": 2})]))
            .await
            .unwrap();

        // dos fallos con límite 2: la operación termina bien
        cluster.inject_job_failures(2);
        let options = crate::cluster::OperationOptions {
            data_size_per_job: Some(1),
            max_failed_job_count: Some(2),
            ..Default::default()
        };
        let status = c
            .run_map(&ctx, UserJob::mapper(Identity, "cat"), vec!["//in".into()], "//out".into(), options.clone())
            .await
            .unwrap()
            .wait(&CancellationToken::new(), Duration::from_millis(5), |_| {})
            .await
            .unwrap();
        assert_eq!(status.jobs.completed, 2);
        assert_eq!(status.jobs.failed, 2);
        assert_eq!(c.records_count(&ctx, "//out").await.unwrap(), 2);

        cluster.inject_job_failures(3);
        let err = c
            .run_map(&ctx, UserJob::mapper(Identity, "cat"), vec!["//in".into()], "//out2".into(), options)
            .await
            .unwrap()
            .wait(&CancellationToken::new(), Duration::from_millis(5), |_| {})
            .await
            .unwrap_err();
        assert!(err.contains_code(crate::error::codes::TOO_MANY_FAILED_JOBS));
        assert!(err.to_string().contains("Failed jobs limit exceeded"));
    }

    #[tokio::test]
    async fn tabla_dinamica_montada_admite_insert_lookup_y_select() {
        let (cluster, c) = client();
        let ctx = Context::new();
        let options = CreateOptions::default()
            .with_attribute("dynamic", json!(true))
            .with_attribute(
                "schema",
                json!([{"name": "k", "sort_order": "ascending"}, {"name": "v"}]),
            );
        c.create(&ctx, NodeType::Table, "//dyn", &options).await.unwrap();
        c.reshard_table(&ctx, "//dyn", vec![vec![], vec![json!(10)]])
            .await
            .unwrap();
        assert!(c
            .insert_rows(&ctx, "//dyn", rows(&[json!({"k": 1, "v": "a"})]))
            .await
            .is_err());

        c.mount_table(&ctx, "//dyn").await.unwrap();
        c.insert_rows(
            &ctx,
            "//dyn",
            rows(&[json!({"k": 15, "v": "c"}), json!({"k": 1, "v": "a"}), json!({"k": 1, "v": "b"})]),
        )
        .await
        .unwrap();

        let found = c
            .lookup_rows(&ctx, "//dyn", rows(&[json!({"k": 1})]))
            .await
            .unwrap();
        assert_eq!(found, rows(&[json!({"k": 1, "v": "b"})]));

        let query = SelectQuery {
            lower: Some(vec![json!(10)]),
            ..SelectQuery::all("//dyn")
        };
        assert_eq!(
            c.select_rows(&ctx, &query).await.unwrap(),
            rows(&[json!({"k": 15, "v": "c"})])
        );

        let tablets = c.tablets(&ctx, "//dyn").await.unwrap();
        assert_eq!(tablets.len(), 2);
        cluster
            .set_tablet_partitions("//dyn", 1, vec![vec![json!(10)], vec![json!(12)]])
            .unwrap();
        assert_eq!(
            c.tablet_partitions(&ctx, &tablets[1].tablet_id).await.unwrap(),
            vec![vec![json!(10)], vec![json!(12)]]
        );

        let keyed = TablePath::new("//dyn").with_ranges(vec![TableRange::Keys(KeyRange {
            lower: None,
            upper: Some(vec![json!(10)]),
        })]);
        assert_eq!(c.read_rows(&ctx, &keyed).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_filtra_por_tipo_y_profundidad() {
        let (_, c) = client();
        let ctx = Context::new();
        for path in ["//d/a", "//d/sub/b", "//d/sub/deeper/c"] {
            c.create(&ctx, NodeType::Table, path, &CreateOptions::recursive())
                .await
                .unwrap();
        }
        let filter = SearchFilter {
            node_types: vec![NodeType::Table],
            depth_bound: Some(2),
        };
        let found: Set<String> = c.search(&ctx, "//d", &filter).await.unwrap().into_iter().collect();
        let expected: Set<String> = ["//d/a", "//d/sub/b"].iter().map(|s| s.to_string()).collect();
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn fallo_inyectado_afecta_a_una_sola_llamada() {
        let (cluster, c) = client();
        let ctx = Context::new();
        cluster.inject_request_failure(
            "exists",
            TmError::new(ErrorKind::TransportUnavailable, "connection reset"),
        );
        assert!(c.exists(&ctx, "//x").await.is_err());
        assert!(!c.exists(&ctx, "//x").await.unwrap());
    }

    #[tokio::test]
    async fn smart_upload_por_hash_reutiliza_el_fichero() {
        let (_, c) = client();
        let ctx = Context::new();
        let first = c
            .smart_upload_file(&ctx, "script.sh", Bytes::from_static(b"echo"), FilePlacement::Hash)
            .await
            .unwrap();
        let second = c
            .smart_upload_file(&ctx, "script.sh", Bytes::from_static(b"echo"), FilePlacement::Hash)
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(&c.read_file(&ctx, &first).await.unwrap()[..], b"echo");
    }
}
