// master/src/state.rs

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, SystemTime},
};
use tm_common::task::{StateChange, SubtaskInfo, TaskProgress};
use tm_common::{
    ClusterDirectory, ErrorKind, Result, TaskAttributes, TaskId, TaskInfo, TaskState, TmError,
    WorkerId,
};

use crate::handlers::ApiError;
use crate::{MUTATION_TTL, SWEEP_INTERVAL, WORKER_DEAD_TIMEOUT};

pub const DEFAULT_QUEUE: &str = "default";

/// Parámetros del master que los tests acortan.
#[derive(Debug, Clone)]
pub struct MasterSettings {
    pub worker_dead_timeout: Duration,
    pub sweep_interval: Duration,
    // tiempo que se recuerda la respuesta de un mutation_id
    pub mutation_ttl: Duration,
}

impl Default for MasterSettings {
    fn default() -> Self {
        Self {
            worker_dead_timeout: WORKER_DEAD_TIMEOUT,
            sweep_interval: SWEEP_INTERVAL,
            mutation_ttl: MUTATION_TTL,
        }
    }
}

/// Orden de toma de locks: `tasks`, `in_flight`, `workers`, `mutations`.
#[derive(Clone)]
pub struct AppState {
    pub tasks: Arc<Mutex<TaskArena>>,
    pub workers: Arc<Mutex<HashMap<WorkerId, WorkerMeta>>>,
    // tareas entregadas a un worker que aún no informó del final
    pub in_flight: Arc<Mutex<HashMap<TaskId, InFlight>>>,
    // mutaciones en curso y respuestas ya dadas, por mutation_id
    pub mutations: Arc<Mutex<HashMap<String, MutationRecord>>>,
    pub directory: Arc<ClusterDirectory>,
    pub settings: MasterSettings,
}

impl AppState {
    pub fn new(directory: ClusterDirectory, settings: MasterSettings) -> Self {
        Self {
            tasks: Arc::new(Mutex::new(TaskArena::default())),
            workers: Arc::new(Mutex::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            mutations: Arc::new(Mutex::new(HashMap::new())),
            directory: Arc::new(directory),
            settings,
        }
    }

    pub fn backend_tag(&self) -> &str {
        self.directory.backend_tag()
    }
}

/// Lo que el master recuerda de un `mutation_id`.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationEntry {
    InProgress,
    Done(Value),
}

#[derive(Debug, Clone)]
pub struct MutationRecord {
    pub entry: MutationEntry,
    pub recorded_at: SystemTime,
}

impl MutationRecord {
    pub fn in_progress(now: SystemTime) -> Self {
        Self {
            entry: MutationEntry::InProgress,
            recorded_at: now,
        }
    }

    pub fn done(response: Value, now: SystemTime) -> Self {
        Self {
            entry: MutationEntry::Done(response),
            recorded_at: now,
        }
    }

    /// Las entradas en curso no caducan: las retira quien las creó.
    pub fn expired(&self, now: SystemTime, ttl: Duration) -> bool {
        matches!(self.entry, MutationEntry::Done(_))
            && now
                .duration_since(self.recorded_at)
                .map(|age| age > ttl)
                .unwrap_or(false)
    }
}

/// Un lock envenenado es un fallo interno (500).
pub fn lock<T>(mutex: &Mutex<T>) -> std::result::Result<MutexGuard<'_, T>, ApiError> {
    mutex
        .lock()
        .map_err(|_| ApiError::Internal("estado del master envenenado".to_string()))
}

#[derive(Debug, Clone)]
pub struct WorkerMeta {
    pub hostname: String,
    pub last_heartbeat: SystemTime,
    pub dead: bool,
    pub max_concurrency: u32,

    // Métricas
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub total_task_time_ms: u64,

    pub last_cpu_percent: Option<f32>,
    pub last_mem_bytes: Option<u64>,
}

impl WorkerMeta {
    pub fn new(hostname: String, max_concurrency: u32, now: SystemTime) -> Self {
        Self {
            hostname,
            last_heartbeat: now,
            dead: false,
            max_concurrency,
            tasks_started: 0,
            tasks_succeeded: 0,
            tasks_failed: 0,
            total_task_time_ms: 0,
            last_cpu_percent: None,
            last_mem_bytes: None,
        }
    }

    /// Cuenta el final de una tarea que duró desde `started_at`.
    pub fn record_finish(&mut self, started_at: SystemTime, success: bool) {
        let duration_ms = started_at
            .elapsed()
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.total_task_time_ms += duration_ms;
        if success {
            self.tasks_succeeded += 1;
        } else {
            self.tasks_failed += 1;
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlight {
    pub worker_id: WorkerId,
    pub started_at: SystemTime,
}

/* ---------------- tareas ---------------- */

#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: TaskId,
    // con credenciales: solo salen hacia el worker
    pub attributes: TaskAttributes,
    pub user: String,
    pub state: TaskState,
    pub creation_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub restart_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub error: Option<TmError>,
    pub progress: Option<TaskProgress>,
    pub history: Vec<StateChange>,
    /// Índices en `TaskArena::subtasks`.
    pub subtasks: Vec<usize>,
    pub restarted_as: Option<TaskId>,
    pub lease_deadline: Option<SystemTime>,
}

impl TaskRecord {
    fn new(id: TaskId, attributes: TaskAttributes, user: &str, now: SystemTime) -> Self {
        let created = DateTime::<Utc>::from(now);
        let mut record = Self {
            id,
            attributes,
            user: user.to_string(),
            state: TaskState::Pending,
            creation_time: created,
            start_time: None,
            restart_time: None,
            finish_time: None,
            error: None,
            progress: None,
            history: vec![StateChange {
                state: TaskState::Pending,
                time: created,
            }],
            subtasks: Vec::new(),
            restarted_as: None,
            lease_deadline: None,
        };
        record.renew_lease(now);
        record
    }

    /// Aplica una transición de estado; las no monótonas son error.
    pub fn transition(&mut self, next: TaskState, error: Option<TmError>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(TmError::invalid_request(format!(
                "Task {} cannot change state from {} to {}",
                self.id, self.state, next
            ))
            .with_attribute("task_id", self.id.as_str()));
        }
        let now = Utc::now();
        if next == TaskState::Running {
            self.start_time = Some(now);
        }
        if next.is_terminal() {
            self.finish_time = Some(now);
            self.lease_deadline = None;
        }
        self.state = next;
        self.error = error;
        self.history.push(StateChange { state: next, time: now });
        Ok(())
    }

    pub fn renew_lease(&mut self, now: SystemTime) {
        if self.state.is_terminal() {
            return;
        }
        self.lease_deadline = self
            .attributes
            .lease_timeout
            .map(|secs| now + Duration::from_secs(secs));
    }

    pub fn lease_expired(&self, now: SystemTime) -> bool {
        matches!(self.lease_deadline, Some(deadline) if deadline < now)
    }

    pub fn queue_name(&self) -> &str {
        self.attributes.queue_name.as_deref().unwrap_or(DEFAULT_QUEUE)
    }
}

/// Arena de tareas y subtareas. Las subtareas no apuntan a su tarea: la
/// tarea guarda los índices de las suyas.
#[derive(Debug, Default)]
pub struct TaskArena {
    tasks: HashMap<TaskId, TaskRecord>,
    order: Vec<TaskId>,
    subtasks: Vec<SubtaskInfo>,
    queues: BTreeMap<String, VecDeque<TaskId>>,
    rr_cursor: usize,
}

fn unknown_task(id: &str) -> TmError {
    TmError::new(ErrorKind::Resolve, format!("Task {id} does not exist")).with_attribute("task_id", id)
}

impl TaskArena {
    pub fn add(&mut self, attributes: TaskAttributes, user: &str, now: SystemTime) -> TaskId {
        let id = uuid::Uuid::new_v4().to_string();
        let record = TaskRecord::new(id.clone(), attributes, user, now);
        self.queues
            .entry(record.queue_name().to_string())
            .or_default()
            .push_back(id.clone());
        self.tasks.insert(id.clone(), record);
        self.order.push(id.clone());
        id
    }

    pub fn get(&self, id: &str) -> Result<&TaskRecord> {
        self.tasks.get(id).ok_or_else(|| unknown_task(id))
    }

    pub fn get_mut(&mut self, id: &str) -> Result<&mut TaskRecord> {
        self.tasks.get_mut(id).ok_or_else(|| unknown_task(id))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Vista pública de la tarea, sin credenciales.
    pub fn info(&self, id: &str, backend_tag: &str) -> Result<TaskInfo> {
        let record = self.get(id)?;
        Ok(TaskInfo {
            id: record.id.clone(),
            attributes: record.attributes.without_secrets(),
            state: record.state,
            user: record.user.clone(),
            creation_time: record.creation_time,
            start_time: record.start_time,
            restart_time: record.restart_time,
            finish_time: record.finish_time,
            error: record.error.clone(),
            progress: record.progress.clone(),
            history: record.history.clone(),
            backend_tag: backend_tag.to_string(),
            subtasks: record
                .subtasks
                .iter()
                .filter_map(|&idx| self.subtasks.get(idx).cloned())
                .collect(),
            restarted_as: record.restarted_as.clone(),
        })
    }

    /// Tareas en orden de creación, opcionalmente de un usuario.
    pub fn list(&self, user: Option<&str>, backend_tag: &str) -> Vec<TaskInfo> {
        self.order
            .iter()
            .filter(|id| match (user, self.tasks.get(*id)) {
                (Some(user), Some(record)) => record.user == user,
                (None, Some(_)) => true,
                (_, None) => false,
            })
            .filter_map(|id| self.info(id, backend_tag).ok())
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TaskId> {
        self.order.iter()
    }

    /// Siguiente tarea pendiente. Las colas se sirven por turnos en orden
    /// de nombre; las entradas que ya no están pendientes se descartan.
    pub fn next_pending(&mut self) -> Option<TaskId> {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        if names.is_empty() {
            return None;
        }
        for step in 0..names.len() {
            let idx = (self.rr_cursor + step) % names.len();
            let Some(queue) = self.queues.get_mut(&names[idx]) else {
                continue;
            };
            while let Some(id) = queue.pop_front() {
                let pending = self
                    .tasks
                    .get(&id)
                    .is_some_and(|t| t.state == TaskState::Pending);
                if pending {
                    self.rr_cursor = idx + 1;
                    return Some(id);
                }
            }
        }
        None
    }

    /// Sustituye las subtareas de `id`: las que coinciden en origen y
    /// destino se actualizan en su sitio.
    pub fn upsert_subtasks(&mut self, id: &str, subtasks: Vec<SubtaskInfo>) -> Result<()> {
        let handles = self.get(id)?.subtasks.clone();
        let mut new_handles = Vec::new();
        for subtask in subtasks {
            let existing = handles.iter().copied().find(|&h| {
                self.subtasks
                    .get(h)
                    .is_some_and(|s| s.source == subtask.source && s.destination == subtask.destination)
            });
            match existing {
                Some(h) => self.subtasks[h] = subtask,
                None => {
                    self.subtasks.push(subtask);
                    new_handles.push(self.subtasks.len() - 1);
                }
            }
        }
        self.get_mut(id)?.subtasks.extend(new_handles);
        Ok(())
    }

    /// Reinicia una tarea terminal como tarea nueva con los mismos
    /// atributos. Devuelve el id nuevo.
    pub fn restart(&mut self, id: &str, now: SystemTime) -> Result<TaskId> {
        let record = self.get(id)?;
        if !record.state.is_terminal() {
            return Err(TmError::invalid_request(format!(
                "Task {id} is {} and cannot be restarted",
                record.state
            )));
        }
        if let Some(next) = &record.restarted_as {
            return Err(TmError::invalid_request(format!(
                "Task {id} was already restarted as {next}"
            ))
            .with_attribute("restarted_as", next.as_str()));
        }
        let (attributes, user) = (record.attributes.clone(), record.user.clone());
        let new_id = self.add(attributes, &user, now);
        self.get_mut(&new_id)?.restart_time = Some(DateTime::<Utc>::from(now));
        self.get_mut(id)?.restarted_as = Some(new_id.clone());
        Ok(new_id)
    }
}
