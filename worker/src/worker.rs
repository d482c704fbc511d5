use std::{
    collections::HashMap,
    env,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use sysinfo::{CpuExt, System, SystemExt};
use tm_common::{
    execute_task, ClusterDirectory, Config, CopyContext, CopyEvent, CopyOutcome, ErrorKind,
    TaskAssignment, TaskFinishRequest, TaskId, TaskProgress, TaskProgressRequest, TaskState,
    TmError, TransactionConfig, WorkerHeartbeatRequest, WorkerRegisterRequest,
};
use tokio::sync::{mpsc, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::MasterApi;

const DEFAULT_WORKER_CONCURRENCY: u32 = 2;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub master_url: String,
    pub hostname: String,
    pub max_concurrency: u32,
    pub heartbeat_period: Duration,
    pub idle_sleep: Duration,
    pub request_timeout: Duration,
    pub transaction: TransactionConfig,
}

impl WorkerSettings {
    /// Toma la URL del master y los timeouts de `config`; la concurrencia
    /// sale de `WORKER_CONCURRENCY`.
    pub fn from_config(config: &Config) -> Self {
        let hostname = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();

        let max_concurrency: u32 = env::var("WORKER_CONCURRENCY")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(DEFAULT_WORKER_CONCURRENCY);

        Self {
            master_url: config.master_url.clone(),
            hostname,
            max_concurrency,
            heartbeat_period: Duration::from_secs(5),
            idle_sleep: Duration::from_secs(2),
            request_timeout: config.http.request_timeout,
            transaction: config.transaction.clone(),
        }
    }
}

/// Tokens de cancelación de las tareas que este worker ejecuta.
type Running = Arc<Mutex<HashMap<TaskId, CancellationToken>>>;

fn running_ids(running: &Running) -> Vec<TaskId> {
    running
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .keys()
        .cloned()
        .collect()
}

fn cancel_task(running: &Running, task_id: &str) {
    if let Some(token) = running
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get(task_id)
    {
        info!("cancelando tarea {} a petición del master", task_id);
        token.cancel();
    }
}

/// Loop principal del worker.
/// - Se registra en el master.
/// - Hace heartbeats periódicos.
/// - Pide tareas mientras tenga "slots" libres.
/// - Ejecuta cada copia en paralelo (hasta `max_concurrency`).
pub async fn run(
    settings: WorkerSettings,
    directory: Arc<ClusterDirectory>,
    cancel: CancellationToken,
) -> Result<(), TmError> {
    let api = MasterApi::new(&settings.master_url, settings.request_timeout)?;

    // Registro de worker (enviando max_concurrency)
    let worker_id = api
        .register(&WorkerRegisterRequest {
            hostname: settings.hostname.clone(),
            max_concurrency: settings.max_concurrency,
        })
        .await?
        .worker_id;
    info!(
        "worker {} registrado con concurrency={} contra {}",
        worker_id,
        settings.max_concurrency,
        api.base_url()
    );

    let running: Running = Arc::new(Mutex::new(HashMap::new()));

    // --------- Heartbeat al master con CPU/MEM ---------
    let heartbeat = tokio::spawn(heartbeat_loop(
        api.clone(),
        worker_id.clone(),
        running.clone(),
        settings.heartbeat_period,
        cancel.clone(),
    ));

    let sem = Arc::new(Semaphore::new(settings.max_concurrency as usize));

    loop {
        if cancel.is_cancelled() {
            break;
        }

        // --------- Control de concurrencia local ---------
        let permit = match sem.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                // No hay capacidad para nuevas tareas; esperamos un poco
                idle(&cancel, settings.idle_sleep / 4).await;
                continue;
            }
        };

        // Pedimos tarea al master
        let assignment = match api.next_task(&worker_id).await {
            Ok(Some(assignment)) => assignment,
            Ok(None) => {
                // No hay tarea: devolvemos el permiso y dormimos
                drop(permit);
                debug!("worker {} pidió tarea pero no hay", worker_id);
                idle(&cancel, settings.idle_sleep).await;
                continue;
            }
            Err(e) => {
                drop(permit);
                warn!("error pidiendo tarea al master: {}", e);
                idle(&cancel, settings.idle_sleep).await;
                continue;
            }
        };

        info!(
            "tengo tarea {} ({}:{} -> {})",
            assignment.task_id,
            assignment.attributes.source_cluster,
            assignment.attributes.source_table,
            assignment.attributes.destination_cluster
        );

        let token = cancel.child_token();
        running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(assignment.task_id.clone(), token.clone());

        let api = api.clone();
        let directory = directory.clone();
        let running = running.clone();
        let worker_id = worker_id.clone();
        let transaction = settings.transaction.clone();
        tokio::spawn(async move {
            let task_id = assignment.task_id.clone();
            let (state, error) =
                execute_assignment(&api, &directory, &worker_id, transaction, assignment, token).await;

            // Reportar al master que terminamos
            let finish = TaskFinishRequest {
                worker_id: worker_id.clone(),
                state,
                error,
            };
            match api.finish(&task_id, &finish).await {
                Ok(resp) if !resp.ok => {
                    debug!("el master descartó el resultado de la tarea {}", task_id)
                }
                Ok(_) => info!("tarea {} terminada: {}", task_id, state),
                Err(e) => warn!("no se pudo reportar el final de la tarea {}: {}", task_id, e),
            }
            running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&task_id);

            // Liberar el "slot" de concurrencia al terminar
            drop(permit);
        });
    }

    heartbeat.abort();
    info!("worker {} detenido", worker_id);
    Ok(())
}

async fn idle(cancel: &CancellationToken, period: Duration) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = sleep(period) => {}
    }
}

async fn heartbeat_loop(
    api: MasterApi,
    worker_id: String,
    running: Running,
    period: Duration,
    cancel: CancellationToken,
) {
    // System para leer CPU y memoria
    let mut sys = System::new_all();

    while !cancel.is_cancelled() {
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpu_percent = sys.global_cpu_info().cpu_usage();
        // used_memory devuelve KB -> lo pasamos a bytes
        let mem_bytes = sys.used_memory() * 1024;

        let req = WorkerHeartbeatRequest {
            worker_id: worker_id.clone(),
            active_tasks: running_ids(&running),
            cpu_percent: Some(cpu_percent),
            mem_bytes: Some(mem_bytes),
        };
        match api.heartbeat(&req).await {
            Ok(resp) => {
                for task_id in resp.abort {
                    cancel_task(&running, &task_id);
                }
            }
            Err(e) => warn!("heartbeat fallido: {}", e),
        }
        idle(&cancel, period).await;
    }
}

/// Ejecuta la copia y devuelve el estado final que se reporta al master.
async fn execute_assignment(
    api: &MasterApi,
    directory: &ClusterDirectory,
    worker_id: &str,
    transaction: TransactionConfig,
    assignment: TaskAssignment,
    cancel: CancellationToken,
) -> (TaskState, Option<TmError>) {
    let TaskAssignment { task_id, attributes } = assignment;

    // 1) Clústeres de origen y destino
    let entries = directory
        .get(&attributes.source_cluster)
        .cloned()
        .and_then(|src| Ok((src, directory.get(&attributes.destination_cluster)?.clone())));
    let (source, destination) = match entries {
        Ok(pair) => pair,
        Err(e) => return finish_state(Err(e), false),
    };

    // 2) Progreso hacia el master mientras dura la copia
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_progress(
        api.clone(),
        task_id.clone(),
        worker_id.to_string(),
        events_rx,
        cancel.clone(),
    ));

    let ctx = CopyContext::new(source, destination, attributes)
        .with_events(events_tx)
        .with_cancel(cancel.clone())
        .with_transaction_config(transaction);
    let result = execute_task(&ctx).await;

    // 3) Cerrar el canal y esperar el último envío
    drop(ctx);
    if let Err(e) = forwarder.await {
        warn!("el envío de progreso de la tarea {} terminó mal: {}", task_id, e);
    }

    finish_state(result, cancel.is_cancelled())
}

async fn forward_progress(
    api: MasterApi,
    task_id: TaskId,
    worker_id: String,
    mut events: mpsc::UnboundedReceiver<CopyEvent>,
    cancel: CancellationToken,
) {
    let mut progress = TaskProgress::default();
    while let Some(event) = events.recv().await {
        match event {
            CopyEvent::OperationStarted { id, cluster_name } => {
                debug!("tarea {}: operación {} en {}", task_id, id, cluster_name);
                continue;
            }
            CopyEvent::Progress(op) => progress.upsert(op),
        }
        let req = TaskProgressRequest {
            worker_id: worker_id.clone(),
            progress: progress.clone(),
            subtasks: Vec::new(),
        };
        match api.progress(&task_id, &req).await {
            Ok(resp) if resp.abort => {
                info!("tarea {} ya no está en running, se cancela", task_id);
                cancel.cancel();
            }
            Ok(_) => {}
            Err(e) => debug!("progreso de la tarea {} no enviado: {}", task_id, e),
        }
    }
}

/// Estado final de una copia: los errores tras una cancelación cuentan
/// como aborto.
pub fn finish_state(
    result: Result<CopyOutcome, TmError>,
    cancelled: bool,
) -> (TaskState, Option<TmError>) {
    match result {
        Ok(CopyOutcome::Completed) => (TaskState::Completed, None),
        Ok(CopyOutcome::Skipped) => (TaskState::Skipped, None),
        Err(e) if cancelled || e.is(ErrorKind::Cancelled) => (TaskState::Aborted, Some(e)),
        Err(e) => (TaskState::Failed, Some(e)),
    }
}
