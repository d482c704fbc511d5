use std::{collections::HashSet, time::SystemTime};

use tm_common::{ErrorKind, TaskState, TmError};
use tracing::{info, warn};

use crate::handlers::{died_silently, ApiError};
use crate::state::{lock, AppState};

/// Lo que cambió en una pasada del monitor.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub dead_workers: Vec<String>,
    pub failed_tasks: Vec<String>,
    pub expired_tasks: Vec<String>,
    pub evicted_mutations: usize,
}

pub async fn monitor_loop(state: AppState) {
    loop {
        tokio::time::sleep(state.settings.sweep_interval).await;
        match sweep_once(&state, SystemTime::now()) {
            Ok(report) if report != SweepReport::default() => {
                info!(
                    "monitor: {} workers muertos, {} tareas fallidas, {} leases vencidos, {} mutaciones olvidadas",
                    report.dead_workers.len(),
                    report.failed_tasks.len(),
                    report.expired_tasks.len(),
                    report.evicted_mutations
                );
            }
            Ok(_) => {}
            Err(e) => warn!("error en la pasada del monitor: {:?}", e),
        }
    }
}

/// Una pasada de chequeo:
/// 1. marca workers muertos
/// 2. falla las tareas que tenían en vuelo
/// 3. aborta las tareas cuyo lease venció
/// 4. olvida las respuestas de mutaciones más viejas que el TTL
pub fn sweep_once(state: &AppState, now: SystemTime) -> Result<SweepReport, ApiError> {
    let mut report = SweepReport::default();
    let mut tasks = lock(&state.tasks)?;
    let mut in_flight = lock(&state.in_flight)?;
    let mut workers = lock(&state.workers)?;

    // 1) Detectar qué workers están muertos
    for (worker_id, meta) in workers.iter_mut() {
        if meta.dead {
            continue;
        }
        let Ok(elapsed) = now.duration_since(meta.last_heartbeat) else {
            continue;
        };
        if elapsed > state.settings.worker_dead_timeout {
            meta.dead = true;
            warn!(
                "marcando worker {} como DEAD (sin heartbeat hace {:?})",
                worker_id, elapsed
            );
            report.dead_workers.push(worker_id.clone());
        }
    }

    // 2) Sus tareas en vuelo mueren con ellos
    let dead: HashSet<&String> = workers
        .iter()
        .filter(|(_, meta)| meta.dead)
        .map(|(id, _)| id)
        .collect();
    let orphaned: Vec<(String, String)> = in_flight
        .iter()
        .filter(|(_, f)| dead.contains(&f.worker_id))
        .map(|(task_id, f)| (task_id.clone(), f.worker_id.clone()))
        .collect();
    for (task_id, worker_id) in orphaned {
        in_flight.remove(&task_id);
        if let Some(meta) = workers.get_mut(&worker_id) {
            meta.tasks_failed += 1;
        }
        let Ok(record) = tasks.get_mut(&task_id) else {
            continue;
        };
        if record.state == TaskState::Running {
            warn!("tarea {} perdida con el worker {}", task_id, worker_id);
            record.transition(TaskState::Failed, Some(died_silently(&worker_id)))?;
            report.failed_tasks.push(task_id);
        }
    }

    // 3) Leases vencidos: nadie consulta ya la tarea
    let ids: Vec<String> = tasks.ids().cloned().collect();
    for id in ids {
        let record = tasks.get_mut(&id)?;
        if record.state.is_terminal() || !record.lease_expired(now) {
            continue;
        }
        info!("abortando tarea {}: lease vencido", id);
        record.transition(
            TaskState::Aborted,
            Some(TmError::new(ErrorKind::Cancelled, "Task lease expired").with_attribute("task_id", id.as_str())),
        )?;
        report.expired_tasks.push(id);
    }

    // 4) Respuestas de mutaciones caducadas
    let mut mutations = lock(&state.mutations)?;
    let before = mutations.len();
    mutations.retain(|_, record| !record.expired(now, state.settings.mutation_ttl));
    report.evicted_mutations = before - mutations.len();

    Ok(report)
}
