use serde_json::{Map, Value};
use std::{sync::Arc, time::Duration};
use tm_common::{
    copy::table_path, BackendConfig, ClusterDirectory, ClusterKind, Config, Context,
    MatchPair, MatchRequest, Result, TaskAttributes, TaskId, TaskInfo, TaskState, TmError,
    WorkerMetrics,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::http::HttpTransport;
use crate::poller::{self, PollerOptions};

const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(5);

/// Cliente de la API de tareas del master.
#[derive(Clone)]
pub struct TaskClient {
    http: HttpTransport,
    // clústeres visibles desde el cliente (para el salto anticipado)
    directory: Option<Arc<ClusterDirectory>>,
    poll_period: Duration,
}

impl TaskClient {
    pub fn new(config: &Config, cancel: CancellationToken) -> Result<Self> {
        let http = HttpTransport::new(&config.master_url, config.token.clone(), &config.http, cancel)?;
        Ok(Self {
            http,
            directory: None,
            poll_period: DEFAULT_POLL_PERIOD,
        })
    }

    pub fn with_directory(mut self, directory: Arc<ClusterDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    /// Cadencia de consulta de `add_task` con espera.
    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        self.http.cancel_token()
    }

    /* ---------------- creación ---------------- */

    /// Crea una tarea. Con `sync` espera a su estado final y falla si no
    /// terminó bien.
    pub async fn add_task(
        &self,
        source_cluster: &str,
        source_table: &str,
        destination_cluster: &str,
        destination_table: Option<&str>,
        params: &Map<String, Value>,
        sync: bool,
    ) -> Result<TaskId> {
        let attributes = TaskAttributes::new(source_cluster, source_table, destination_cluster, destination_table)
            .merged_with(params)?;
        let task_id = self.add_task_with_attributes(&attributes).await?;
        if sync {
            let info = self.wait_task(&task_id, self.poll_period).await?;
            if !matches!(info.state, TaskState::Completed | TaskState::Skipped) {
                let mut err = TmError::generic(format!("Task {task_id} finished with state {}", info.state))
                    .with_attribute("task_id", task_id.as_str());
                if let Some(inner) = info.error {
                    err = err.with_inner(inner);
                }
                return Err(err);
            }
        }
        Ok(task_id)
    }

    pub async fn add_task_with_attributes(&self, attributes: &TaskAttributes) -> Result<TaskId> {
        attributes.validate()?;
        let task_id: TaskId = self.http.mutate("/tasks/", Some(attributes)).await?;
        info!(
            "tarea {} creada: {}:{} -> {}",
            task_id, attributes.source_cluster, attributes.source_table, attributes.destination_cluster
        );
        Ok(task_id)
    }

    /// Expande los patrones en el master y crea una tarea por par.
    pub async fn add_tasks(
        &self,
        source_cluster: &str,
        source_pattern: &str,
        destination_cluster: &str,
        destination_pattern: &str,
        params: &Map<String, Value>,
        options: &PollerOptions,
    ) -> Result<Vec<TaskId>> {
        let pairs = self
            .match_patterns(&MatchRequest {
                source_cluster: source_cluster.to_string(),
                source_pattern: source_pattern.to_string(),
                destination_cluster: destination_cluster.to_string(),
                destination_pattern: destination_pattern.to_string(),
            })
            .await?;
        self.add_tasks_from_src_dst_pairs(&pairs, source_cluster, destination_cluster, params, options)
            .await
    }

    /// Entrada principal para muchas copias: con `options.sync` limita las
    /// tareas en marcha, las sigue hasta el final y reinicia las que
    /// fallaron por causas pasajeras.
    pub async fn add_tasks_from_src_dst_pairs(
        &self,
        pairs: &[MatchPair],
        source_cluster: &str,
        destination_cluster: &str,
        params: &Map<String, Value>,
        options: &PollerOptions,
    ) -> Result<Vec<TaskId>> {
        let attributes = pairs
            .iter()
            .map(|pair| {
                TaskAttributes::new(
                    source_cluster,
                    &pair.source,
                    destination_cluster,
                    Some(pair.destination.as_str()),
                )
                .merged_with(params)
            })
            .collect::<Result<Vec<_>>>()?;
        poller::run(self, attributes, options).await
    }

    pub async fn match_patterns(&self, req: &MatchRequest) -> Result<Vec<MatchPair>> {
        self.http.post("/match/", Some(req)).await
    }

    /* ---------------- control ---------------- */

    pub async fn abort_task(&self, task_id: &str) -> Result<()> {
        let _: Value = self
            .http
            .mutate::<(), _>(&format!("/tasks/{task_id}/abort/"), None)
            .await?;
        info!("tarea {} abortada", task_id);
        Ok(())
    }

    /// Reinicia una tarea terminal; devuelve el id de la tarea nueva.
    pub async fn restart_task(&self, task_id: &str) -> Result<TaskId> {
        let new_id: TaskId = self
            .http
            .mutate::<(), _>(&format!("/tasks/{task_id}/restart/"), None)
            .await?;
        info!("tarea {} reiniciada como {}", task_id, new_id);
        Ok(new_id)
    }

    pub async fn get_task_info(&self, task_id: &str) -> Result<TaskInfo> {
        self.http.get(&format!("/tasks/{task_id}/"), &[]).await
    }

    /// Renueva el lease de la tarea y devuelve su estado.
    pub async fn ping_task_and_get(&self, task_id: &str) -> Result<TaskInfo> {
        self.http
            .post::<(), _>(&format!("/tasks/{task_id}/ping_and_get/"), None)
            .await
    }

    pub async fn get_tasks(&self, user: Option<&str>, fields: &[&str]) -> Result<Vec<Value>> {
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(user) = user {
            query.push(("user", user.to_string()));
        }
        query.extend(fields.iter().map(|f| ("fields[]", f.to_string())));
        self.http.get("/tasks/", &query).await
    }

    pub async fn get_backend_config(&self) -> Result<BackendConfig> {
        self.http.get("/config/", &[]).await
    }

    pub async fn get_workers(&self) -> Result<Vec<WorkerMetrics>> {
        self.http.get("/workers", &[]).await
    }

    /// Espera al estado final de una tarea renovando su lease.
    pub async fn wait_task(&self, task_id: &str, poll_period: Duration) -> Result<TaskInfo> {
        let cancel = self.cancel_token().clone();
        loop {
            let info = self.ping_task_and_get(task_id).await?;
            if info.state.is_terminal() {
                return Ok(info);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TmError::cancelled()),
                _ = tokio::time::sleep(poll_period) => {}
            }
        }
    }

    /// `true` si el destino es una tabla yt que ya existe. Sin directorio
    /// de clústeres no se puede comprobar y se devuelve `false`.
    pub async fn destination_exists(&self, cluster: &str, table: &str) -> Result<bool> {
        let Some(directory) = &self.directory else {
            return Ok(false);
        };
        let Ok(entry) = directory.get(cluster) else {
            return Ok(false);
        };
        if entry.kind() != ClusterKind::Yt {
            return Ok(false);
        }
        let path = table_path(entry.kind(), table);
        entry.client.exists(&Context::new(), &path).await
    }
}
