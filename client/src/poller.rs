//! Envío con concurrencia acotada y seguimiento de muchas tareas.
//!
//! El que llama crea las tareas en orden, cada una con un slot del
//! semáforo; una tarea aparte consulta las que están en marcha cada
//! `poll_period`, libera el slot de las terminadas y reinicia como tareas
//! nuevas las que fallaron por causas pasajeras. El id local de cada par
//! se conserva entre reinicios; el id remoto cambia.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tm_common::{codes, Result, TaskAttributes, TaskId, TaskState, TmError};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::task_client::TaskClient;

/// Con al menos estos pares, demasiados fallos cortan el envío.
pub const FAILED_RATIO_MIN_PAIRS: usize = 100;
pub const FAILED_RATIO_LIMIT: f64 = 0.6;

#[derive(Debug, Clone)]
pub struct PollerOptions {
    /// Sin `sync` solo se crean las tareas.
    pub sync: bool,
    pub poll_period: Duration,
    pub running_tasks_limit: usize,
    pub enable_failed_tasks_restarting: bool,
    pub max_failed_tasks_restart_count: u32,
    pub failed_tasks_restart_sleep: Duration,
    pub enable_early_skip_if_destination_exists: bool,
}

impl Default for PollerOptions {
    fn default() -> Self {
        Self {
            sync: true,
            poll_period: Duration::from_secs(5),
            running_tasks_limit: 10,
            enable_failed_tasks_restarting: false,
            max_failed_tasks_restart_count: 3,
            failed_tasks_restart_sleep: Duration::from_secs(10),
            enable_early_skip_if_destination_exists: false,
        }
    }
}

const RESTARTABLE_CODES: [i32; 3] = [
    codes::TASK_DIED_SILENTLY,
    codes::TOO_MANY_FAILED_JOBS,
    codes::MASTER_NOT_RESPONDING,
];

const RESTARTABLE_MESSAGES: [&str; 3] = [
    "Task died silently",
    "Failed jobs limit exceeded",
    "Master is not responding",
];

/// Un fallo es pasajero si algún error de la cadena tiene uno de los
/// códigos reiniciables, o es genérico con uno de los mensajes exactos.
pub fn is_restartable(error: &TmError) -> bool {
    error
        .find(&|e| {
            RESTARTABLE_CODES.contains(&e.code)
                || (e.code == codes::GENERIC && RESTARTABLE_MESSAGES.contains(&e.message.as_str()))
        })
        .is_some()
}

struct LocalTask {
    local_id: usize,
    task_id: TaskId,
    attributes: TaskAttributes,
    restarts: u32,
    // el slot se libera al soltar la tarea
    _permit: OwnedSemaphorePermit,
}

enum PollerEvent {
    Started(LocalTask),
    AllStarted,
}

#[derive(Debug, Default)]
struct PollSummary {
    task_ids: BTreeMap<usize, TaskId>,
    aborted: usize,
    failed: usize,
}

/// Crea y sigue una tarea por juego de atributos. Devuelve los ids remotos
/// finales en orden de envío; los pares saltados no aparecen.
pub async fn run(
    client: &TaskClient,
    tasks: Vec<TaskAttributes>,
    options: &PollerOptions,
) -> Result<Vec<TaskId>> {
    // 1) salto anticipado: destinos yt que ya existen
    let mut pending = Vec::with_capacity(tasks.len());
    for (local_id, attributes) in tasks.into_iter().enumerate() {
        if options.enable_early_skip_if_destination_exists {
            let destination = attributes
                .destination_table
                .as_deref()
                .unwrap_or(&attributes.source_table);
            if client
                .destination_exists(&attributes.destination_cluster, destination)
                .await?
            {
                info!(
                    "{}:{} ya existe, se omite",
                    attributes.destination_cluster, destination
                );
                continue;
            }
        }
        pending.push((local_id, attributes));
    }

    if !options.sync {
        let mut ids = Vec::with_capacity(pending.len());
        for (_, attributes) in &pending {
            ids.push(client.add_task_with_attributes(attributes).await?);
        }
        return Ok(ids);
    }
    if pending.is_empty() {
        return Ok(Vec::new());
    }

    // 2) poller en segundo plano y envío acotado por el semáforo
    let total = pending.len();
    let slots = Arc::new(Semaphore::new(options.running_tasks_limit.max(1)));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut poller = tokio::spawn(poll_loop(client.clone(), events_rx, options.clone(), total));

    if let Err(e) = submit_all(client, pending, &slots, &events_tx, &mut poller).await {
        poller.abort();
        return Err(e);
    }
    let _ = events_tx.send(PollerEvent::AllStarted);

    // 3) resumen final
    let summary = poller.await.map_err(join_error)??;
    if summary.failed + summary.aborted > 0 {
        let ids: Vec<String> = summary.task_ids.into_values().collect();
        return Err(TmError::generic(format!(
            "{} tasks failed, {} tasks aborted",
            summary.failed, summary.aborted
        ))
        .with_attribute("failed", summary.failed)
        .with_attribute("aborted", summary.aborted)
        .with_attribute("task_ids", ids));
    }
    Ok(summary.task_ids.into_values().collect())
}

async fn submit_all(
    client: &TaskClient,
    pending: Vec<(usize, TaskAttributes)>,
    slots: &Arc<Semaphore>,
    events: &mpsc::UnboundedSender<PollerEvent>,
    poller: &mut JoinHandle<Result<PollSummary>>,
) -> Result<()> {
    for (local_id, attributes) in pending {
        // un error del poller corta el envío en cuanto se espera slot
        let permit = tokio::select! {
            permit = slots.clone().acquire_owned() => {
                permit.map_err(|_| TmError::generic("Task slots are closed"))?
            }
            joined = &mut *poller => return Err(poller_stopped(joined)),
        };
        let task_id = client.add_task_with_attributes(&attributes).await?;
        debug!("tarea local {} enviada como {}", local_id, task_id);
        let task = LocalTask {
            local_id,
            task_id,
            attributes,
            restarts: 0,
            _permit: permit,
        };
        if events.send(PollerEvent::Started(task)).is_err() {
            return Err(poller_stopped((&mut *poller).await));
        }
    }
    Ok(())
}

fn join_error(e: JoinError) -> TmError {
    TmError::generic(format!("Poller task failed: {e}"))
}

fn poller_stopped(joined: std::result::Result<Result<PollSummary>, JoinError>) -> TmError {
    match joined {
        Ok(Err(e)) => e,
        Ok(Ok(_)) => TmError::generic("Poller stopped before all tasks were started"),
        Err(e) => join_error(e),
    }
}

async fn poll_loop(
    client: TaskClient,
    mut events: mpsc::UnboundedReceiver<PollerEvent>,
    options: PollerOptions,
    total: usize,
) -> Result<PollSummary> {
    let cancel = client.cancel_token().clone();
    let mut running: Vec<LocalTask> = Vec::new();
    let mut restart_queue: Vec<(Instant, LocalTask)> = Vec::new();
    let mut summary = PollSummary::default();
    let mut failures = 0usize;
    let mut all_started = false;

    loop {
        // 1) tareas nuevas
        loop {
            match events.try_recv() {
                Ok(PollerEvent::Started(task)) => running.push(task),
                Ok(PollerEvent::AllStarted) | Err(TryRecvError::Disconnected) => {
                    all_started = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        // 2) estado de las que están en marcha
        let mut still_running = Vec::with_capacity(running.len());
        for task in running.drain(..) {
            let info = client.ping_task_and_get(&task.task_id).await?;
            match info.state {
                TaskState::Pending | TaskState::Running => still_running.push(task),
                TaskState::Completed | TaskState::Skipped => {
                    debug!("tarea {} terminada: {}", task.task_id, info.state);
                    summary.task_ids.insert(task.local_id, task.task_id);
                }
                TaskState::Aborted => {
                    warn!("tarea {} abortada", task.task_id);
                    summary.aborted += 1;
                    summary.task_ids.insert(task.local_id, task.task_id);
                }
                TaskState::Failed => {
                    failures += 1;
                    if total >= FAILED_RATIO_MIN_PAIRS
                        && failures as f64 >= FAILED_RATIO_LIMIT * total as f64
                    {
                        return Err(TmError::generic(format!(
                            "More than {:.1}% of tasks failed",
                            FAILED_RATIO_LIMIT * 100.0
                        ))
                        .with_attribute("failed", failures)
                        .with_attribute("total", total));
                    }
                    let error = info
                        .error
                        .unwrap_or_else(|| TmError::generic("Task failed without error"));
                    if options.enable_failed_tasks_restarting
                        && task.restarts < options.max_failed_tasks_restart_count
                        && is_restartable(&error)
                    {
                        info!(
                            "tarea {} fallida ({}), se reinicia en {:?}",
                            task.task_id, error, options.failed_tasks_restart_sleep
                        );
                        restart_queue.push((Instant::now() + options.failed_tasks_restart_sleep, task));
                    } else {
                        warn!("tarea {} fallida: {}", task.task_id, error);
                        summary.failed += 1;
                        summary.task_ids.insert(task.local_id, task.task_id);
                    }
                }
            }
        }
        running = still_running;

        // 3) reinicios vencidos: misma tarea local, id remoto nuevo
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) =
            restart_queue.drain(..).partition(|(at, _)| *at <= now);
        restart_queue = waiting;
        for (_, mut task) in due {
            let new_id = client.add_task_with_attributes(&task.attributes).await?;
            task.restarts += 1;
            info!(
                "tarea local {} reiniciada ({}/{}): {} -> {}",
                task.local_id, task.restarts, options.max_failed_tasks_restart_count, task.task_id, new_id
            );
            task.task_id = new_id;
            running.push(task);
        }

        if all_started && running.is_empty() && restart_queue.is_empty() {
            return Ok(summary);
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(TmError::cancelled()),
            _ = sleep(options.poll_period) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tm_common::ErrorKind;

    #[rstest]
    #[case(TmError::with_code(codes::TASK_DIED_SILENTLY, "Task died silently"), true)]
    #[case(TmError::with_code(codes::MASTER_NOT_RESPONDING, "whatever"), true)]
    #[case(TmError::generic("Failed jobs limit exceeded"), true)]
    #[case(TmError::generic("Master is not responding"), true)]
    #[case(TmError::generic("Master is not responding, maybe"), false)]
    #[case(TmError::new(ErrorKind::Resolve, "Task died silently"), false)]
    #[case(TmError::new(ErrorKind::IncorrectRowCount, "rows differ"), false)]
    fn reinicio_por_codigo_o_mensaje_exacto(#[case] error: TmError, #[case] expected: bool) {
        assert_eq!(is_restartable(&error), expected);
    }

    #[test]
    fn causa_interna_reiniciable_cuenta() {
        let error = TmError::generic("Operation 42 failed").with_inner(TmError::new(
            ErrorKind::TooManyFailedJobs,
            "Failed jobs limit exceeded",
        ));
        assert!(is_restartable(&error));
    }

    #[test]
    fn opciones_por_defecto_son_sincronas_y_sin_reinicios() {
        let options = PollerOptions::default();
        assert!(options.sync);
        assert!(!options.enable_failed_tasks_restarting);
        assert_eq!(options.max_failed_tasks_restart_count, 3);
    }
}
