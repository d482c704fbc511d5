//! Cliente HTTP del worker contra la API interna del master.

use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tm_common::{
    BackendConfig, ErrorKind, TaskAssignment, TaskAssignmentRequest, TaskAssignmentResponse,
    TaskFinishRequest, TaskFinishResponse, TaskId, TaskProgressRequest, TaskProgressResponse,
    TmError, WorkerHeartbeatRequest, WorkerHeartbeatResponse, WorkerRegisterRequest,
    WorkerRegisterResponse,
};

/// Convierte un fallo de reqwest en un error del transfer manager.
pub fn transport_error(e: reqwest::Error) -> TmError {
    let kind = if e.is_timeout() {
        ErrorKind::Timeout
    } else if e.is_decode() {
        return TmError::format(format!("Malformed response from master: {e}"));
    } else {
        ErrorKind::TransportUnavailable
    };
    TmError::new(kind, format!("Master request failed: {e}"))
}

async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T, TmError> {
    let status = resp.status();
    if status.is_success() {
        return resp.json().await.map_err(transport_error);
    }
    let body = resp.text().await.map_err(transport_error)?;
    Err(serde_json::from_str::<TmError>(&body).unwrap_or_else(|_| {
        TmError::generic(format!("Master returned status {status}")).with_attribute("body", body)
    }))
}

#[derive(Clone)]
pub struct MasterApi {
    client: Client,
    base_url: String,
}

impl MasterApi {
    pub fn new(base_url: &str, request_timeout: Duration) -> Result<Self, TmError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(transport_error)?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T, TmError> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;
        parse(resp).await
    }

    pub async fn register(&self, req: &WorkerRegisterRequest) -> Result<WorkerRegisterResponse, TmError> {
        self.post("/api/v1/workers/register", req).await
    }

    pub async fn heartbeat(&self, req: &WorkerHeartbeatRequest) -> Result<WorkerHeartbeatResponse, TmError> {
        self.post("/api/v1/workers/heartbeat", req).await
    }

    pub async fn next_task(&self, worker_id: &str) -> Result<Option<TaskAssignment>, TmError> {
        let resp: TaskAssignmentResponse = self
            .post(
                "/api/v1/workers/next",
                &TaskAssignmentRequest {
                    worker_id: worker_id.to_string(),
                },
            )
            .await?;
        Ok(resp.task)
    }

    pub async fn progress(&self, task_id: &TaskId, req: &TaskProgressRequest) -> Result<TaskProgressResponse, TmError> {
        self.post(&format!("/api/v1/tasks/{task_id}/progress"), req).await
    }

    pub async fn finish(&self, task_id: &TaskId, req: &TaskFinishRequest) -> Result<TaskFinishResponse, TmError> {
        self.post(&format!("/api/v1/tasks/{task_id}/finish"), req).await
    }

    pub async fn backend_config(&self) -> Result<BackendConfig, TmError> {
        let url = format!("{}/api/v1/config/", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(transport_error)?;
        parse(resp).await
    }
}
