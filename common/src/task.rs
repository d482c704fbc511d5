//! Modelo de tareas: atributos, estados, progreso y subtareas.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::{Result, TmError};

pub type TaskId = String;
pub type WorkerId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Skipped,
    Aborted,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Skipped | TaskState::Aborted | TaskState::Failed
        )
    }

    /// Las transiciones son monótonas: un estado terminal no cambia nunca.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        match self {
            TaskState::Pending => next != TaskState::Pending,
            TaskState::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Skipped => "skipped",
            TaskState::Aborted => "aborted",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyMethod {
    #[default]
    Pull,
    Push,
}

/// Atributos con los que se crea una tarea (cuerpo de `POST /tasks/`).
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskAttributes {
    pub source_cluster: String,
    pub source_table: String,
    pub destination_cluster: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_table: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_cluster_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_cluster_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mr_user: Option<String>,
    pub copy_method: CopyMethod,
    pub skip_if_destination_exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kiwi_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kwworm_options: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy_spec: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postprocess_spec: Option<Map<String, Value>>,
    /// Límite de tiempo por job, en milisegundos.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intermediate_format: Option<String>,
    /// Lease de la tarea en segundos; se renueva con `ping_and_get`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    pub force_copy_with_operation: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_compression_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_erasure_codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_force_sort: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

impl fmt::Debug for TaskAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // los tokens nunca salen en logs
        f.debug_struct("TaskAttributes")
            .field("source_cluster", &self.source_cluster)
            .field("source_table", &self.source_table)
            .field("destination_cluster", &self.destination_cluster)
            .field("destination_table", &self.destination_table)
            .field("copy_method", &self.copy_method)
            .field("queue_name", &self.queue_name)
            .finish_non_exhaustive()
    }
}

impl TaskAttributes {
    pub fn new(
        source_cluster: &str,
        source_table: &str,
        destination_cluster: &str,
        destination_table: Option<&str>,
    ) -> Self {
        Self {
            source_cluster: source_cluster.to_string(),
            source_table: source_table.to_string(),
            destination_cluster: destination_cluster.to_string(),
            destination_table: destination_table.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_cluster.is_empty() {
            return Err(TmError::invalid_request("source_cluster is not specified"));
        }
        if self.source_table.is_empty() {
            return Err(TmError::invalid_request("source_table is not specified"));
        }
        if self.destination_cluster.is_empty() {
            return Err(TmError::invalid_request(
                "destination_cluster is not specified",
            ));
        }
        if let Some(dst) = &self.destination_table {
            if dst.is_empty() {
                return Err(TmError::invalid_request("destination_table is empty"));
            }
        }
        Ok(())
    }

    /// Copia sin credenciales, para devolver al usuario.
    pub fn without_secrets(&self) -> Self {
        Self {
            source_cluster_token: None,
            destination_cluster_token: None,
            ..self.clone()
        }
    }

    /// Aplica los parámetros comunes de `params` sobre una copia de `self`.
    /// Solo se usan las claves presentes en `params`.
    pub fn merged_with(&self, params: &Map<String, Value>) -> Result<Self> {
        let mut base = serde_json::to_value(self)?;
        if let Value::Object(obj) = &mut base {
            for (k, v) in params {
                obj.insert(k.clone(), v.clone());
            }
        }
        Ok(serde_json::from_value(base)?)
    }
}

/// Contadores de jobs de una operación.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub running: u64,
    pub completed: u64,
    pub pending: u64,
    pub failed: u64,
    pub aborted: u64,
    pub lost: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationProgress {
    pub id: String,
    pub cluster_name: String,
    pub state: String,
    #[serde(default)]
    pub jobs: JobCounters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    #[serde(default)]
    pub operations: Vec<OperationProgress>,
}

impl TaskProgress {
    /// Inserta o actualiza la operación con el mismo id.
    pub fn upsert(&mut self, op: OperationProgress) {
        match self.operations.iter_mut().find(|o| o.id == op.id) {
            Some(existing) => *existing = op,
            None => self.operations.push(op),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub state: TaskState,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskInfo {
    pub source: String,
    pub destination: String,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TmError>,
}

/// Respuesta de `GET /tasks/{id}/`: los atributos de creación más el estado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub id: TaskId,
    #[serde(flatten)]
    pub attributes: TaskAttributes,
    pub state: TaskState,
    pub user: String,
    pub creation_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TmError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<TaskProgress>,
    #[serde(default)]
    pub history: Vec<StateChange>,
    pub backend_tag: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<SubtaskInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restarted_as: Option<TaskId>,
}

impl TaskInfo {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
