//! Mensajes entre el master y los workers que ejecutan las copias.

use serde::{Deserialize, Serialize};

use crate::error::TmError;
use crate::task::{SubtaskInfo, TaskAttributes, TaskId, TaskProgress, TaskState, WorkerId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterRequest {
    pub hostname: String,
    pub max_concurrency: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegisterResponse {
    pub worker_id: WorkerId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHeartbeatRequest {
    pub worker_id: WorkerId,
    #[serde(default)]
    pub active_tasks: Vec<TaskId>,
    #[serde(default)]
    pub cpu_percent: Option<f32>,
    #[serde(default)]
    pub mem_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerHeartbeatResponse {
    pub ok: bool,
    /// Tareas activas del worker que ya no están en `running` y deben
    /// cancelarse.
    #[serde(default)]
    pub abort: Vec<TaskId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentRequest {
    pub worker_id: WorkerId,
}

/// Tarea entregada a un worker. Los atributos llevan las credenciales.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub attributes: TaskAttributes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignmentResponse {
    pub task: Option<TaskAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskProgressRequest {
    pub worker_id: WorkerId,
    pub progress: TaskProgress,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<SubtaskInfo>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProgressResponse {
    pub ok: bool,
    /// La tarea dejó de estar en `running`: el worker debe cancelarla.
    #[serde(default)]
    pub abort: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFinishRequest {
    pub worker_id: WorkerId,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TmError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFinishResponse {
    /// `false` si el resultado se descartó (la tarea ya era terminal).
    pub ok: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: WorkerId,
    pub hostname: String,
    pub dead: bool,
    pub max_concurrency: u32,
    pub last_heartbeat_secs_ago: u64,
    pub active_tasks: u32,
    pub tasks_started: u64,
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub avg_task_ms: Option<f64>,
    pub cpu_percent: Option<f32>,
    pub mem_bytes: Option<u64>,
}
