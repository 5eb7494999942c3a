//! Uniform-outcome execution client.
//!
//! [`ComfyUIClient`] sits on top of [`ComfyUIApi`] and never returns an
//! error: every call resolves to a [`RemoteOutcome`] carrying a success
//! flag, an optional payload, human-readable error text and the HTTP
//! status when there was one. The orchestrators are generic over
//! [`ExecutionBackend`], which the client implements.

use std::future::Future;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::history::{parse_history, PollStatus};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Result shape shared by every remote interaction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
}

impl RemoteOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            ..Self::default()
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn from_error(err: &ComfyUIApiError) -> Self {
        Self {
            status_code: err.status(),
            ..Self::failure(err.to_string())
        }
    }

    /// Attach a payload; used to keep the prompt id on failed outcomes.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// String field from the payload.
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.as_ref()?.get(key)?.as_str()
    }

    pub fn prompt_id(&self) -> Option<&str> {
        self.data_str("prompt_id")
    }
}

/// How long and how often to poll for completion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaitPolicy {
    pub poll_interval: Duration,
    /// `None` waits indefinitely.
    pub max_wait: Option<Duration>,
}

impl WaitPolicy {
    pub fn new(poll_interval: Duration, max_wait: Option<Duration>) -> Self {
        Self {
            poll_interval,
            max_wait,
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), None)
    }
}

// ---------------------------------------------------------------------------
// Backend trait
// ---------------------------------------------------------------------------

/// Remote execution as seen by the orchestrators.
pub trait ExecutionBackend: Send + Sync {
    /// Whether the server answers at all.
    fn health_check(&self) -> impl Future<Output = bool> + Send;

    /// Submit `workflow` and wait for it to finish.
    ///
    /// The payload carries `prompt_id` whenever submission succeeded, and
    /// `outputs` on success.
    fn execute(
        &self,
        workflow: &Value,
        policy: WaitPolicy,
    ) -> impl Future<Output = RemoteOutcome> + Send;

    /// Upload a local input file. The payload carries the stored `name`.
    fn upload_input(
        &self,
        path: &Path,
        subfolder: &str,
        overwrite: bool,
    ) -> impl Future<Output = RemoteOutcome> + Send;
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Execution client bound to one ComfyUI instance.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    api: ComfyUIApi,
    client_id: String,
}

impl ComfyUIClient {
    /// Build a client for `api_url` with a per-request timeout.
    pub fn new(api_url: &str, request_timeout: Duration) -> Result<Self, ComfyUIApiError> {
        Ok(Self::with_api(ComfyUIApi::with_timeout(
            api_url,
            request_timeout,
        )?))
    }

    pub fn with_api(api: ComfyUIApi) -> Self {
        Self {
            api,
            client_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Queue a workflow. Payload: `{prompt_id, number}`.
    pub async fn submit(&self, workflow: &Value) -> RemoteOutcome {
        match self.api.submit_workflow(workflow, &self.client_id).await {
            Ok(resp) => {
                tracing::debug!(prompt_id = %resp.prompt_id, number = resp.number, "Workflow queued");
                RemoteOutcome::ok(json!({
                    "prompt_id": resp.prompt_id,
                    "number": resp.number,
                }))
            }
            Err(e) => {
                tracing::error!(error = %e, "Workflow submission failed");
                RemoteOutcome::from_error(&e)
            }
        }
    }

    /// Typed status of a submitted prompt.
    pub async fn poll_status(&self, prompt_id: &str) -> Result<PollStatus, ComfyUIApiError> {
        let body = self.api.get_history(prompt_id).await?;
        parse_history(prompt_id, &body).map_err(|e| ComfyUIApiError::Decode(e.to_string()))
    }

    /// One status check. Payload: `{prompt_id, status}` plus `outputs`
    /// once completed; an execution error is a failed outcome.
    pub async fn poll(&self, prompt_id: &str) -> RemoteOutcome {
        match self.poll_status(prompt_id).await {
            Ok(PollStatus::Pending) => RemoteOutcome::ok(json!({
                "prompt_id": prompt_id,
                "status": "pending",
            })),
            Ok(PollStatus::Completed(outputs)) => RemoteOutcome::ok(json!({
                "prompt_id": prompt_id,
                "status": "completed",
                "outputs": outputs,
            })),
            Ok(PollStatus::Failed(message)) => {
                RemoteOutcome::failure(message).with_data(json!({ "prompt_id": prompt_id }))
            }
            Err(e) => RemoteOutcome::from_error(&e).with_data(json!({ "prompt_id": prompt_id })),
        }
    }

    /// Poll until the prompt completes, fails, or `policy.max_wait`
    /// elapses. Timing out does not cancel the remote job.
    pub async fn await_completion(&self, prompt_id: &str, policy: WaitPolicy) -> RemoteOutcome {
        let started = Instant::now();

        loop {
            let outcome = self.poll(prompt_id).await;
            let pending = outcome.success && outcome.data_str("status") == Some("pending");
            if !pending {
                if !outcome.success {
                    tracing::warn!(
                        prompt_id = %prompt_id,
                        error = outcome.error_message.as_deref().unwrap_or_default(),
                        "Execution failed"
                    );
                }
                return outcome;
            }

            if let Some(max_wait) = policy.max_wait {
                if started.elapsed() >= max_wait {
                    tracing::warn!(prompt_id = %prompt_id, "Gave up waiting for completion");
                    return RemoteOutcome::failure(format!(
                        "Timeout after {}s",
                        max_wait.as_secs_f64()
                    ))
                    .with_data(json!({ "prompt_id": prompt_id }));
                }
            }

            tokio::time::sleep(policy.poll_interval).await;
        }
    }

    /// Submit then wait.
    pub async fn execute_and_wait(&self, workflow: &Value, policy: WaitPolicy) -> RemoteOutcome {
        let submitted = self.submit(workflow).await;
        let Some(prompt_id) = submitted.prompt_id().map(str::to_string) else {
            return submitted;
        };
        self.await_completion(&prompt_id, policy).await
    }

    /// Upload `path`. Payload: `{name, subfolder, type}`.
    pub async fn upload_input(&self, path: &Path, subfolder: &str, overwrite: bool) -> RemoteOutcome {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(source) => {
                let err = ComfyUIApiError::File {
                    path: path.display().to_string(),
                    source,
                };
                return RemoteOutcome::from_error(&err);
            }
        };
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("input.png");

        match self
            .api
            .upload_image(bytes, file_name, subfolder, overwrite)
            .await
        {
            Ok(resp) => {
                tracing::debug!(path = %path.display(), stored = %resp.name, "Uploaded input image");
                RemoteOutcome::ok(json!({
                    "name": resp.name,
                    "subfolder": resp.subfolder,
                    "type": resp.folder_type,
                }))
            }
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "Upload failed");
                RemoteOutcome::from_error(&e)
            }
        }
    }

    /// `/system_stats` answers 2xx within the health-check timeout.
    pub async fn health_check(&self) -> bool {
        match self.api.system_stats().await {
            Ok(_) => {
                tracing::debug!(url = %self.api.api_url(), "Server is reachable");
                true
            }
            Err(e) => {
                tracing::warn!(url = %self.api.api_url(), error = %e, "Health check failed");
                false
            }
        }
    }

    /// Current queue. Payload: the raw `/queue` body.
    pub async fn queue(&self) -> RemoteOutcome {
        match self.api.get_queue().await {
            Ok(body) => RemoteOutcome::ok(body),
            Err(e) => RemoteOutcome::from_error(&e),
        }
    }

    /// Interrupt whatever is executing now.
    pub async fn interrupt(&self) -> RemoteOutcome {
        match self.api.interrupt().await {
            Ok(()) => RemoteOutcome::ok(json!({ "interrupted": true })),
            Err(e) => RemoteOutcome::from_error(&e),
        }
    }
}

impl ExecutionBackend for ComfyUIClient {
    async fn health_check(&self) -> bool {
        ComfyUIClient::health_check(self).await
    }

    async fn execute(&self, workflow: &Value, policy: WaitPolicy) -> RemoteOutcome {
        self.execute_and_wait(workflow, policy).await
    }

    async fn upload_input(&self, path: &Path, subfolder: &str, overwrite: bool) -> RemoteOutcome {
        ComfyUIClient::upload_input(self, path, subfolder, overwrite).await
    }
}

#[cfg(test)]
mod tests {
    use axum::extract::Path as UrlPath;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    use super::*;

    fn unreachable_client() -> ComfyUIClient {
        ComfyUIClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap()
    }

    /// History of a local test server: `done` has outputs, anything else
    /// stays queued.
    async fn history(UrlPath(prompt_id): UrlPath<String>) -> Json<Value> {
        if prompt_id == "done" {
            Json(json!({ "done": { "outputs": { "9": { "images": [] } } } }))
        } else {
            Json(json!({}))
        }
    }

    /// Start a minimal ComfyUI stand-in on an ephemeral port.
    async fn local_server() -> ComfyUIClient {
        let app = Router::new()
            .route(
                "/prompt",
                post(|| async { Json(json!({ "prompt_id": "done", "number": 4 })) }),
            )
            .route("/history/{prompt_id}", get(history))
            .route(
                "/queue",
                get(|| async {
                    Json(json!({ "queue_running": [[4, "done"]], "queue_pending": [] }))
                }),
            )
            .route("/interrupt", post(|| async {}));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        ComfyUIClient::new(&format!("http://{addr}"), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn failure_outcome_keeps_status_and_message() {
        let err = ComfyUIApiError::ApiError {
            status: 500,
            body: "boom".into(),
        };
        let outcome = RemoteOutcome::from_error(&err).with_data(json!({"prompt_id": "p1"}));
        assert!(!outcome.success);
        assert_eq!(outcome.status_code, Some(500));
        assert_eq!(outcome.prompt_id(), Some("p1"));
        assert!(outcome.error_message.unwrap().contains("boom"));
    }

    #[test]
    fn outcome_serializes_without_empty_fields() {
        let value = serde_json::to_value(RemoteOutcome::ok(json!({"prompt_id": "x"}))).unwrap();
        assert_eq!(value, json!({"success": true, "data": {"prompt_id": "x"}}));
    }

    #[tokio::test]
    async fn unreachable_server_fails_health_check() {
        assert!(!unreachable_client().health_check().await);
    }

    #[tokio::test]
    async fn transport_failures_become_outcomes() {
        let client = unreachable_client();
        let outcome = client
            .execute_and_wait(&json!({"1": {}}), WaitPolicy::default())
            .await;
        assert!(!outcome.success);
        assert!(outcome.prompt_id().is_none());
        assert!(outcome.error_message.is_some());
    }

    #[tokio::test]
    async fn missing_upload_file_is_a_failed_outcome() {
        let outcome = unreachable_client()
            .upload_input(Path::new("/definitely/not/here.png"), "", true)
            .await;
        assert!(!outcome.success);
        assert!(outcome.error_message.unwrap().contains("not/here.png"));
    }

    #[tokio::test]
    async fn pending_prompt_times_out_and_keeps_its_id() {
        let client = local_server().await;
        let policy = WaitPolicy::new(Duration::from_millis(10), Some(Duration::from_millis(50)));

        let outcome = client.await_completion("queued-forever", policy).await;

        assert!(!outcome.success);
        assert!(outcome
            .error_message
            .as_deref()
            .unwrap()
            .starts_with("Timeout after"));
        assert_eq!(outcome.prompt_id(), Some("queued-forever"));
        assert_eq!(outcome.status_code, None);
    }

    #[tokio::test]
    async fn completed_prompt_carries_outputs() {
        let client = local_server().await;
        let policy = WaitPolicy::new(Duration::from_millis(10), Some(Duration::from_secs(2)));

        let outcome = client.execute_and_wait(&json!({ "1": {} }), policy).await;

        assert!(outcome.success);
        assert_eq!(outcome.prompt_id(), Some("done"));
        assert_eq!(outcome.data_str("status"), Some("completed"));
        assert!(outcome.data.unwrap()["outputs"]["9"]["images"].is_array());
    }

    #[tokio::test]
    async fn queue_and_interrupt_reach_the_server() {
        let client = local_server().await;

        let queue = client.queue().await;
        assert!(queue.success);
        assert_eq!(queue.data.unwrap()["queue_running"][0][1], "done");

        let interrupted = client.interrupt().await;
        assert!(interrupted.success);
        assert!(unreachable_client().interrupt().await.error_message.is_some());
    }
}
