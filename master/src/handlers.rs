use axum::{
    extract::{Path, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::time::SystemTime;
use tm_common::{
    codes, match_src_dst_pattern, BackendConfig, ErrorKind, MatchPair, MatchRequest,
    MutationParams, TaskAssignment, TaskAssignmentRequest, TaskAssignmentResponse,
    TaskAttributes, TaskFinishRequest, TaskFinishResponse, TaskInfo, TaskProgressRequest,
    TaskProgressResponse, TaskState, TmError, WorkerHeartbeatRequest, WorkerHeartbeatResponse,
    WorkerId, WorkerMetrics, WorkerRegisterRequest, WorkerRegisterResponse,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::state::{lock, AppState, InFlight, MutationEntry, MutationRecord, WorkerMeta};

pub const PARAMETERS_HEADER: &str = "X-TM-Parameters";
const DEFAULT_USER: &str = "root";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // API de usuario
        .route("/api/v1/tasks/", post(create_task).get(list_tasks))
        .route("/api/v1/tasks/:id/", get(get_task))
        .route("/api/v1/tasks/:id/abort/", post(abort_task))
        .route("/api/v1/tasks/:id/restart/", post(restart_task))
        .route("/api/v1/tasks/:id/ping_and_get/", post(ping_and_get))
        .route("/api/v1/config/", get(get_config))
        .route("/api/v1/match/", post(match_pattern))
        // API de workers
        .route("/api/v1/workers", get(list_workers))
        .route("/api/v1/workers/register", post(register_worker))
        .route("/api/v1/workers/heartbeat", post(worker_heartbeat))
        .route("/api/v1/workers/next", post(assign_task))
        .route("/api/v1/tasks/:id/progress", post(task_progress))
        .route("/api/v1/tasks/:id/finish", post(finish_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores ---------------- */

#[derive(Debug)]
pub enum ApiError {
    Task(TmError),
    Internal(String),
}

impl From<TmError> for ApiError {
    fn from(e: TmError) -> Self {
        ApiError::Task(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Task(err) => {
                let status = match err.kind() {
                    Some(ErrorKind::Resolve) => StatusCode::NOT_FOUND,
                    Some(ErrorKind::Auth) => StatusCode::UNAUTHORIZED,
                    Some(ErrorKind::AccessDenied) => StatusCode::FORBIDDEN,
                    Some(ErrorKind::RequestBeingProcessed) => StatusCode::SERVICE_UNAVAILABLE,
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, err)
            }
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, TmError::generic(message)),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/* ---------------- cabeceras ---------------- */

fn mutation_params(headers: &HeaderMap) -> Result<Option<MutationParams>, ApiError> {
    let Some(raw) = headers.get(PARAMETERS_HEADER) else {
        return Ok(None);
    };
    let raw = raw
        .to_str()
        .map_err(|_| TmError::invalid_request(format!("{PARAMETERS_HEADER} is not valid UTF-8")))?;
    let params: MutationParams = serde_json::from_str(raw)
        .map_err(|e| TmError::invalid_request(format!("Malformed {PARAMETERS_HEADER}: {e}")))?;
    Ok(Some(params))
}

/// Las mutaciones exigen `Authorization: OAuth <token>`.
fn require_token(headers: &HeaderMap) -> Result<(), ApiError> {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("OAuth "))
        .map(str::trim)
        .unwrap_or_default();
    if token.is_empty() {
        return Err(TmError::new(ErrorKind::Auth, "Authorization token is missing").into());
    }
    Ok(())
}

/// Ejecuta una mutación una sola vez por `mutation_id`: si el id ya se
/// vio, devuelve la respuesta guardada sin repetir el efecto. Un duplicado
/// que llega mientras la primera copia sigue en curso recibe 503.
fn deduplicated<F>(state: &AppState, params: Option<&MutationParams>, mutate: F) -> ApiResult<Value>
where
    F: FnOnce() -> Result<Value, ApiError>,
{
    let Some(params) = params else {
        return Ok(Json(mutate()?));
    };
    let key = params.mutation_id.to_string();
    {
        let mut mutations = lock(&state.mutations)?;
        match mutations.get(&key).map(|record| &record.entry) {
            Some(MutationEntry::Done(previous)) => {
                debug!(mutation_id = %key, retry = params.retry, "mutación repetida");
                return Ok(Json(previous.clone()));
            }
            Some(MutationEntry::InProgress) => {
                debug!(mutation_id = %key, "mutación aún en curso");
                return Err(TmError::new(ErrorKind::RequestBeingProcessed, "Request is already being processed")
                    .with_attribute("mutation_id", key.as_str())
                    .into());
            }
            None => {
                mutations.insert(key.clone(), MutationRecord::in_progress(SystemTime::now()));
            }
        }
    }

    let result = mutate();
    let mut mutations = lock(&state.mutations)?;
    match result {
        Ok(response) => {
            mutations.insert(key, MutationRecord::done(response.clone(), SystemTime::now()));
            Ok(Json(response))
        }
        Err(e) => {
            // un fallo no se recuerda: el reintento vuelve a ejecutar
            mutations.remove(&key);
            Err(e)
        }
    }
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

// Crea una tarea pendiente en la cola `queue_name`
async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(attributes): Json<TaskAttributes>,
) -> ApiResult<Value> {
    require_token(&headers)?;
    let params = mutation_params(&headers)?;
    deduplicated(&state, params.as_ref(), || {
        // 1) atributos y clústeres conocidos
        attributes.validate()?;
        state.directory.get(&attributes.source_cluster)?;
        state.directory.get(&attributes.destination_cluster)?;

        // 2) alta en la arena
        let user = attributes
            .mr_user
            .clone()
            .unwrap_or_else(|| DEFAULT_USER.to_string());
        let mut tasks = lock(&state.tasks)?;
        let id = tasks.add(attributes, &user, SystemTime::now());
        info!(
            "tarea {} creada ({} tareas en total)",
            id,
            tasks.len()
        );
        Ok(json!(id))
    })
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<TaskInfo> {
    let tasks = lock(&state.tasks)?;
    Ok(Json(tasks.info(&id, state.backend_tag())?))
}

// Lista tareas; `fields[]` repetido recorta las claves devueltas
async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<Vec<(String, String)>>,
) -> ApiResult<Vec<Value>> {
    let user = query.iter().find(|(k, _)| k == "user").map(|(_, v)| v.as_str());
    let fields: Vec<&str> = query
        .iter()
        .filter(|(k, _)| k == "fields[]" || k == "fields")
        .map(|(_, v)| v.as_str())
        .collect();

    let infos = lock(&state.tasks)?.list(user, state.backend_tag());
    let mut out = Vec::with_capacity(infos.len());
    for info in infos {
        let value = serde_json::to_value(&info).map_err(TmError::from)?;
        let value = match value {
            Value::Object(obj) if !fields.is_empty() => Value::Object(
                obj.into_iter()
                    .filter(|(k, _)| fields.contains(&k.as_str()))
                    .collect::<Map<String, Value>>(),
            ),
            other => other,
        };
        out.push(value);
    }
    Ok(Json(out))
}

async fn abort_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Value> {
    require_token(&headers)?;
    let params = mutation_params(&headers)?;
    deduplicated(&state, params.as_ref(), || {
        let mut tasks = lock(&state.tasks)?;
        let record = tasks.get_mut(&id)?;
        if record.state.is_terminal() {
            return Err(TmError::invalid_request(format!(
                "Task {id} is already {}",
                record.state
            ))
            .into());
        }
        // el worker se entera en su siguiente heartbeat o progreso
        record.transition(TaskState::Aborted, None)?;
        info!("tarea {} abortada", id);
        Ok(Value::Null)
    })
}

async fn restart_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Value> {
    require_token(&headers)?;
    let params = mutation_params(&headers)?;
    deduplicated(&state, params.as_ref(), || {
        let new_id = lock(&state.tasks)?.restart(&id, SystemTime::now())?;
        info!("tarea {} reiniciada como {}", id, new_id);
        Ok(json!(new_id))
    })
}

// Renueva el lease y devuelve el estado
async fn ping_and_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<TaskInfo> {
    let mut tasks = lock(&state.tasks)?;
    tasks.get_mut(&id)?.renew_lease(SystemTime::now());
    Ok(Json(tasks.info(&id, state.backend_tag())?))
}

async fn get_config(State(state): State<AppState>) -> Json<BackendConfig> {
    Json(state.directory.config())
}

async fn match_pattern(
    State(state): State<AppState>,
    Json(req): Json<MatchRequest>,
) -> ApiResult<Vec<MatchPair>> {
    state.directory.get(&req.destination_cluster)?;
    let source = state.directory.client(&req.source_cluster)?;
    let pairs = match_src_dst_pattern(&source, &req.source_pattern, &req.destination_pattern).await?;
    debug!(
        source = %req.source_pattern,
        destination = %req.destination_pattern,
        pairs = pairs.len(),
        "patrón expandido"
    );
    Ok(Json(pairs))
}

/* ---------------- workers ---------------- */

fn unknown_worker(worker_id: &str) -> ApiError {
    TmError::new(ErrorKind::Resolve, format!("Worker {worker_id} is not registered"))
        .with_attribute("worker_id", worker_id)
        .into()
}

// Registra un worker nuevo
async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<WorkerRegisterRequest>,
) -> ApiResult<WorkerRegisterResponse> {
    let worker_id = uuid::Uuid::new_v4().to_string();
    lock(&state.workers)?.insert(
        worker_id.clone(),
        WorkerMeta::new(req.hostname, req.max_concurrency, SystemTime::now()),
    );
    info!(
        "worker registrado: {} (max_concurrency={})",
        worker_id, req.max_concurrency
    );
    Ok(Json(WorkerRegisterResponse { worker_id }))
}

// Heartbeat de worker: devuelve las tareas que debe cancelar
async fn worker_heartbeat(
    State(state): State<AppState>,
    Json(req): Json<WorkerHeartbeatRequest>,
) -> ApiResult<WorkerHeartbeatResponse> {
    let tasks = lock(&state.tasks)?;
    let in_flight = lock(&state.in_flight)?;
    let mut workers = lock(&state.workers)?;

    let meta = workers
        .get_mut(&req.worker_id)
        .ok_or_else(|| unknown_worker(&req.worker_id))?;
    meta.last_heartbeat = SystemTime::now();
    meta.last_cpu_percent = req.cpu_percent.or(meta.last_cpu_percent);
    meta.last_mem_bytes = req.mem_bytes.or(meta.last_mem_bytes);
    if meta.dead {
        info!("worker {} vuelve a dar señales de vida", req.worker_id);
        meta.dead = false;
    }

    // tareas activas que ya no son de este worker o no siguen en running
    let abort: Vec<_> = req
        .active_tasks
        .iter()
        .filter(|id| {
            let owned = in_flight
                .get(*id)
                .is_some_and(|f| f.worker_id == req.worker_id);
            let running = tasks.get(id).is_ok_and(|t| t.state == TaskState::Running);
            !(owned && running)
        })
        .cloned()
        .collect();

    if !abort.is_empty() {
        info!("worker {}: {} tareas a cancelar", req.worker_id, abort.len());
    }
    Ok(Json(WorkerHeartbeatResponse { ok: true, abort }))
}

// Asigna la siguiente tarea pendiente (si hay)
async fn assign_task(
    State(state): State<AppState>,
    Json(req): Json<TaskAssignmentRequest>,
) -> ApiResult<TaskAssignmentResponse> {
    let mut tasks = lock(&state.tasks)?;
    let mut in_flight = lock(&state.in_flight)?;
    let mut workers = lock(&state.workers)?;

    // 1) Cuántas tareas tiene ya este worker en vuelo
    let active_for_worker = in_flight
        .values()
        .filter(|entry| entry.worker_id == req.worker_id)
        .count();

    // 2) Capacidad máxima de este worker (max_concurrency)
    let meta = workers
        .get_mut(&req.worker_id)
        .ok_or_else(|| unknown_worker(&req.worker_id))?;
    if meta.dead {
        return Ok(Json(TaskAssignmentResponse { task: None }));
    }

    // Si ya está al tope, no le damos más tareas
    if active_for_worker as u32 >= meta.max_concurrency {
        debug!(
            "worker {} pidió tarea pero ya tiene {}/{} en vuelo",
            req.worker_id, active_for_worker, meta.max_concurrency
        );
        return Ok(Json(TaskAssignmentResponse { task: None }));
    }

    // 3) Siguiente tarea de las colas, por turnos
    let Some(task_id) = tasks.next_pending() else {
        return Ok(Json(TaskAssignmentResponse { task: None }));
    };
    let record = tasks.get_mut(&task_id)?;
    record.transition(TaskState::Running, None)?;
    info!(
        "asignando tarea {} ({} -> {}) al worker {} ({}/{} en vuelo -> +1)",
        task_id,
        record.attributes.source_table,
        record.attributes.destination_cluster,
        req.worker_id,
        active_for_worker,
        meta.max_concurrency,
    );

    // 4) Registrar la tarea en in_flight con timestamp de inicio
    in_flight.insert(
        task_id.clone(),
        InFlight {
            worker_id: req.worker_id.clone(),
            started_at: SystemTime::now(),
        },
    );

    // 5) Métricas del worker
    meta.tasks_started += 1;

    Ok(Json(TaskAssignmentResponse {
        task: Some(TaskAssignment {
            task_id,
            attributes: record.attributes.clone(),
        }),
    }))
}

async fn task_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TaskProgressRequest>,
) -> ApiResult<TaskProgressResponse> {
    let mut tasks = lock(&state.tasks)?;
    let record = tasks.get_mut(&id)?;
    if record.state != TaskState::Running {
        return Ok(Json(TaskProgressResponse { ok: false, abort: true }));
    }
    record.progress = Some(req.progress);
    if !req.subtasks.is_empty() {
        tasks.upsert_subtasks(&id, req.subtasks)?;
    }
    Ok(Json(TaskProgressResponse { ok: true, abort: false }))
}

// Worker reporta que terminó una tarea
async fn finish_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TaskFinishRequest>,
) -> ApiResult<TaskFinishResponse> {
    if !req.state.is_terminal() {
        return Err(TmError::invalid_request(format!("State {} is not terminal", req.state)).into());
    }
    let mut tasks = lock(&state.tasks)?;
    let mut in_flight = lock(&state.in_flight)?;
    let mut workers = lock(&state.workers)?;

    // 1) Sacar la tarea de in_flight y contar su duración
    let owned = match in_flight.get(&id) {
        Some(entry) if entry.worker_id == req.worker_id => in_flight.remove(&id),
        _ => None,
    };
    let success = matches!(req.state, TaskState::Completed | TaskState::Skipped);
    if let (Some(entry), Some(meta)) = (&owned, workers.get_mut(&req.worker_id)) {
        meta.record_finish(entry.started_at, success);
    }

    // 2) El resultado solo cuenta si la tarea sigue en running
    let record = tasks.get_mut(&id)?;
    if owned.is_none() || record.state != TaskState::Running {
        debug!(
            "resultado {} de la tarea {} descartado (estado actual {})",
            req.state, id, record.state
        );
        return Ok(Json(TaskFinishResponse { ok: false }));
    }
    if req.state == TaskState::Failed {
        let error = req
            .error
            .unwrap_or_else(|| TmError::generic("Task failed without error"));
        warn!("tarea {} fallida: {}", id, error);
        record.transition(TaskState::Failed, Some(error))?;
    } else {
        info!("tarea {} terminada en estado {}", id, req.state);
        record.transition(req.state, req.error)?;
    }
    Ok(Json(TaskFinishResponse { ok: true }))
}

async fn list_workers(State(state): State<AppState>) -> ApiResult<Vec<WorkerMetrics>> {
    let now = SystemTime::now();

    // Contar tareas activas por worker (desde in_flight)
    let mut active_by_worker: HashMap<WorkerId, u32> = HashMap::new();
    for inf in lock(&state.in_flight)?.values() {
        *active_by_worker.entry(inf.worker_id.clone()).or_insert(0) += 1;
    }

    let workers = lock(&state.workers)?;
    let mut out = Vec::new();
    for (wid, meta) in workers.iter() {
        let age_secs = now
            .duration_since(meta.last_heartbeat)
            .unwrap_or_default()
            .as_secs();
        let finished = meta.tasks_succeeded + meta.tasks_failed;
        let avg_ms = if finished > 0 {
            Some(meta.total_task_time_ms as f64 / finished as f64)
        } else {
            None
        };

        out.push(WorkerMetrics {
            worker_id: wid.clone(),
            hostname: meta.hostname.clone(),
            dead: meta.dead,
            max_concurrency: meta.max_concurrency,
            last_heartbeat_secs_ago: age_secs,
            active_tasks: active_by_worker.get(wid).copied().unwrap_or(0),
            tasks_started: meta.tasks_started,
            tasks_succeeded: meta.tasks_succeeded,
            tasks_failed: meta.tasks_failed,
            avg_task_ms: avg_ms,
            cpu_percent: meta.last_cpu_percent,
            mem_bytes: meta.last_mem_bytes,
        });
    }
    out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
    Ok(Json(out))
}

/// Error con el que el monitor falla las tareas de workers caídos.
pub fn died_silently(worker_id: &str) -> TmError {
    TmError::with_code(codes::TASK_DIED_SILENTLY, "Task died silently")
        .with_attribute("worker_id", worker_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MasterSettings;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tm_common::{ClusterClient, ClusterDirectory, ClusterKind, InMemoryCluster};
    use tower::ServiceExt;

    fn app() -> (Router, AppState) {
        let src: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new("plato", ClusterKind::Yt));
        let dst: Arc<dyn ClusterClient> = Arc::new(InMemoryCluster::new("hahn", ClusterKind::Yt));
        let directory = ClusterDirectory::new("testing").with(src, None).with(dst, None);
        let state = AppState::new(directory, MasterSettings::default());
        (build_router(state.clone()), state)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>, mutation: Option<&str>) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("authorization", "OAuth secret");
        if let Some(id) = mutation {
            builder = builder.header(PARAMETERS_HEADER, json!({"mutation_id": id, "retry": false}).to_string());
        }
        let body = body.map(|b| Body::from(b.to_string())).unwrap_or_else(Body::empty);
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn task_body() -> Value {
        json!({
            "source_cluster": "plato",
            "source_table": "//a/t",
            "destination_cluster": "hahn",
            "destination_table": "//b/t",
            "source_cluster_token": "AQAD-secret",
        })
    }

    #[tokio::test]
    async fn crear_y_leer_tarea_sin_tokens() {
        let (app, _) = app();
        let (status, id) = call(&app, "POST", "/api/v1/tasks/", Some(task_body()), None).await;
        assert_eq!(status, StatusCode::OK);
        let id = id.as_str().unwrap().to_string();

        let (status, info) = call(&app, "GET", &format!("/api/v1/tasks/{id}/"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["state"], "pending");
        assert_eq!(info["backend_tag"], "testing");
        assert!(info.get("source_cluster_token").is_none());
    }

    #[tokio::test]
    async fn mismo_mutation_id_no_duplica_tareas() {
        let (app, state) = app();
        let (_, first) = call(&app, "POST", "/api/v1/tasks/", Some(task_body()), Some("m-1")).await;
        let (_, second) = call(&app, "POST", "/api/v1/tasks/", Some(task_body()), Some("m-1")).await;
        assert_eq!(first, second);
        assert_eq!(state.tasks.lock().unwrap().len(), 1);
        let (_, third) = call(&app, "POST", "/api/v1/tasks/", Some(task_body()), Some("m-2")).await;
        assert_ne!(first, third);
    }

    #[test]
    fn duplicado_durante_la_mutacion_recibe_503() {
        let (_, state) = app();
        let params = MutationParams::fresh();
        let runs = std::cell::Cell::new(0);

        let outer = deduplicated(&state, Some(&params), || {
            runs.set(runs.get() + 1);
            // llega la misma petición mientras esta sigue en curso
            let inner = deduplicated(&state, Some(&params), || {
                runs.set(runs.get() + 1);
                Ok(json!("otra"))
            });
            match inner {
                Err(ApiError::Task(e)) => assert_eq!(e.kind(), Some(ErrorKind::RequestBeingProcessed)),
                other => panic!("se esperaba 503 y llegó {other:?}"),
            }
            Ok(json!("t-1"))
        })
        .unwrap();
        assert_eq!(outer.0, json!("t-1"));
        assert_eq!(runs.get(), 1);

        let again = deduplicated(&state, Some(&params), || Ok(json!("otra"))).unwrap();
        assert_eq!(again.0, json!("t-1"));
        let status = ApiError::Task(TmError::new(ErrorKind::RequestBeingProcessed, "x"))
            .into_response()
            .status();
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn mutacion_fallida_no_se_recuerda() {
        let (_, state) = app();
        let params = MutationParams::fresh();
        let failed = deduplicated(&state, Some(&params), || Err(TmError::invalid_request("mal").into()));
        assert!(failed.is_err());
        assert!(state.mutations.lock().unwrap().is_empty());
        let ok = deduplicated(&state, Some(&params), || Ok(json!("t-1"))).unwrap();
        assert_eq!(ok.0, json!("t-1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn mismo_mutation_id_en_paralelo_crea_una_tarea() {
        let (app, state) = app();
        let calls: Vec<_> = (0..8)
            .map(|_| {
                let app = app.clone();
                tokio::spawn(async move {
                    call(&app, "POST", "/api/v1/tasks/", Some(task_body()), Some("m-par")).await
                })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in calls {
            let (status, body) = handle.await.unwrap();
            match status {
                StatusCode::OK => ids.push(body),
                StatusCode::SERVICE_UNAVAILABLE => {
                    assert_eq!(body["code"], codes::REQUEST_BEING_PROCESSED)
                }
                other => panic!("estado inesperado {other}"),
            }
        }
        assert!(!ids.is_empty());
        assert!(ids.iter().all(|id| *id == ids[0]));
        assert_eq!(state.tasks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn sin_token_es_401_y_tarea_desconocida_404() {
        let (app, _) = app();
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/tasks/")
            .header("content-type", "application/json")
            .body(Body::from(task_body().to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let (status, err) = call(&app, "GET", "/api/v1/tasks/nope/", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(err["code"], codes::RESOLVE);
    }

    #[tokio::test]
    async fn cluster_desconocido_es_400() {
        let (app, _) = app();
        let mut body = task_body();
        body["destination_cluster"] = json!("nowhere");
        let (status, err) = call(&app, "POST", "/api/v1/tasks/", Some(body), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(err["message"].as_str().unwrap().contains("Unknown cluster"));
    }

    #[tokio::test]
    async fn ciclo_de_worker_abort_y_restart() {
        let (app, _) = app();
        let (_, id) = call(&app, "POST", "/api/v1/tasks/", Some(task_body()), None).await;
        let id = id.as_str().unwrap().to_string();

        let (_, reg) = call(
            &app,
            "POST",
            "/api/v1/workers/register",
            Some(json!({"hostname": "h", "max_concurrency": 1})),
            None,
        )
        .await;
        let worker = reg["worker_id"].clone();

        // entrega con credenciales
        let (_, next) = call(&app, "POST", "/api/v1/workers/next", Some(json!({"worker_id": worker})), None).await;
        assert_eq!(next["task"]["task_id"], json!(id));
        assert_eq!(next["task"]["attributes"]["source_cluster_token"], "AQAD-secret");
        // al tope de capacidad
        let (_, none) = call(&app, "POST", "/api/v1/workers/next", Some(json!({"worker_id": worker})), None).await;
        assert!(none["task"].is_null());

        // abort llega por el heartbeat
        let (status, _) = call(&app, "POST", &format!("/api/v1/tasks/{id}/abort/"), None, None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, hb) = call(
            &app,
            "POST",
            "/api/v1/workers/heartbeat",
            Some(json!({"worker_id": worker, "active_tasks": [id]})),
            None,
        )
        .await;
        assert_eq!(hb["abort"], json!([id]));

        // el final tardío no cambia el estado
        let (_, fin) = call(
            &app,
            "POST",
            &format!("/api/v1/tasks/{id}/finish"),
            Some(json!({"worker_id": worker, "state": "completed"})),
            None,
        )
        .await;
        assert_eq!(fin["ok"], false);
        let (_, info) = call(&app, "GET", &format!("/api/v1/tasks/{id}/"), None, None).await;
        assert_eq!(info["state"], "aborted");

        // restart da un id nuevo y pendiente
        let (_, new_id) = call(&app, "POST", &format!("/api/v1/tasks/{id}/restart/"), None, None).await;
        assert_ne!(new_id, json!(id));
        let (_, info) = call(&app, "GET", &format!("/api/v1/tasks/{}/", new_id.as_str().unwrap()), None, None).await;
        assert_eq!(info["state"], "pending");
    }

    #[tokio::test]
    async fn finish_con_error_deja_tarea_fallida() {
        let (app, _) = app();
        let (_, id) = call(&app, "POST", "/api/v1/tasks/", Some(task_body()), None).await;
        let id = id.as_str().unwrap().to_string();
        let (_, reg) = call(
            &app,
            "POST",
            "/api/v1/workers/register",
            Some(json!({"hostname": "h", "max_concurrency": 2})),
            None,
        )
        .await;
        let worker = reg["worker_id"].clone();
        call(&app, "POST", "/api/v1/workers/next", Some(json!({"worker_id": worker})), None).await;

        let (_, progress) = call(
            &app,
            "POST",
            &format!("/api/v1/tasks/{id}/progress"),
            Some(json!({"worker_id": worker, "progress": {"operations": []}})),
            None,
        )
        .await;
        assert_eq!(progress["abort"], false);

        let error = TmError::generic("Operation failed");
        let (_, fin) = call(
            &app,
            "POST",
            &format!("/api/v1/tasks/{id}/finish"),
            Some(json!({"worker_id": worker, "state": "failed", "error": error})),
            None,
        )
        .await;
        assert_eq!(fin["ok"], true);
        let (_, info) = call(&app, "GET", &format!("/api/v1/tasks/{id}/"), None, None).await;
        assert_eq!(info["state"], "failed");
        assert_eq!(info["error"]["message"], "Operation failed");

        let (_, workers) = call(&app, "GET", "/api/v1/workers", None, None).await;
        assert_eq!(workers[0]["tasks_failed"], 1);
        assert_eq!(workers[0]["active_tasks"], 0);
    }

    #[tokio::test]
    async fn listado_filtra_campos_y_usuario() {
        let (app, _) = app();
        let mut body = task_body();
        body["mr_user"] = json!("alice");
        call(&app, "POST", "/api/v1/tasks/", Some(body), None).await;
        call(&app, "POST", "/api/v1/tasks/", Some(task_body()), None).await;

        let (_, all) = call(&app, "GET", "/api/v1/tasks/", None, None).await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let (_, alice) = call(&app, "GET", "/api/v1/tasks/?user=alice&fields[]=id&fields[]=state", None, None).await;
        let alice = alice.as_array().unwrap();
        assert_eq!(alice.len(), 1);
        let keys: Vec<&String> = alice[0].as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn config_y_match() {
        let (app, state) = app();
        let src = state.directory.client("plato").unwrap();
        let root = tm_common::Context::new();
        src.mkdir(&root, "//a", true).await.unwrap();
        src.write_rows(&root, &tm_common::cluster::TablePath::new("//a/t"), &[])
            .await
            .unwrap();

        let (_, config) = call(&app, "GET", "/api/v1/config/", None, None).await;
        assert_eq!(config["backend_tag"], "testing");
        assert_eq!(config["clusters"]["hahn"]["type"], "yt");

        let req = json!({
            "source_cluster": "plato",
            "source_pattern": "//a/t",
            "destination_cluster": "hahn",
            "destination_pattern": "//b/t",
        });
        let (status, pairs) = call(&app, "POST", "/api/v1/match/", Some(req), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pairs, json!([{"source": "//a/t", "destination": "//b/t"}]));
    }
}
