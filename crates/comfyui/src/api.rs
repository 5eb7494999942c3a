//! Typed wrapper over the ComfyUI HTTP endpoints this tool talks to.
//!
//! | Method | Path                 | Wrapper                         |
//! |--------|----------------------|---------------------------------|
//! | POST   | `/prompt`            | [`ComfyUIApi::submit_workflow`] |
//! | GET    | `/history/{id}`      | [`ComfyUIApi::get_history`]     |
//! | GET    | `/queue`             | [`ComfyUIApi::get_queue`]       |
//! | POST   | `/interrupt`         | [`ComfyUIApi::interrupt`]       |
//! | POST   | `/upload/image`      | [`ComfyUIApi::upload_image`]    |
//! | GET    | `/system_stats`      | [`ComfyUIApi::system_stats`]    |

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

/// Timeout for the `/system_stats` health probe.
pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Body of a successful `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Queue number assigned by the server.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation errors; an empty object when the graph was
    /// accepted as is.
    #[serde(default)]
    pub node_errors: Value,
}

/// Body of a successful `POST /upload/image`.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadResponse {
    /// File name as stored on the server; may differ from the local one.
    pub name: String,
    /// Subfolder inside the target folder; empty for the folder root.
    #[serde(default)]
    pub subfolder: String,
    /// Target folder on the server, normally `input`.
    #[serde(default, rename = "type")]
    pub folder_type: String,
}

/// Errors from the ComfyUI REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Transport failure: connection refused, DNS, timeout.
    #[error("Request to ComfyUI failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered outside 2xx.
    #[error("ComfyUI returned HTTP {status}: {body}")]
    ApiError {
        /// HTTP status code.
        status: u16,
        /// Response body, or a placeholder when it could not be read.
        body: String,
    },

    /// A 2xx response whose body did not have the expected shape.
    #[error("Malformed response: {0}")]
    Decode(String),

    /// A local file needed for the request could not be read.
    #[error("Failed to read {path}: {source}")]
    File {
        /// Local path that was being read.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl ComfyUIApiError {
    /// HTTP status code, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            Self::Request(e) => e.status().map(|s| s.as_u16()),
            Self::Decode(_) | Self::File { .. } => None,
        }
    }
}

/// Endpoint wrapper bound to one server's base URL.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    http: reqwest::Client,
    base_url: String,
}

impl ComfyUIApi {
    /// Wrapper with reqwest's default client (no overall timeout).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Wrapper whose requests give up after `timeout`.
    pub fn with_timeout(
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ComfyUIApiError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, base_url))
    }

    /// Wrapper around an existing reqwest client.
    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    /// Base URL without a trailing slash.
    pub fn api_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Queue `workflow` under `client_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let payload = json!({ "prompt": workflow, "client_id": client_id });
        let request = self.http.post(self.url("/prompt")).json(&payload);
        decode(send(request).await?).await
    }

    /// Stop whatever is executing now. ComfyUI has no per-prompt interrupt.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        send(self.http.post(self.url("/interrupt"))).await?;
        Ok(())
    }

    /// Raw history entry map for `prompt_id`; see [`crate::history`].
    pub async fn get_history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        let request = self.http.get(self.url(&format!("/history/{prompt_id}")));
        decode(send(request).await?).await
    }

    /// Raw `/queue` body: `queue_running` and `queue_pending` lists.
    pub async fn get_queue(&self) -> Result<Value, ComfyUIApiError> {
        decode(send(self.http.get(self.url("/queue"))).await?).await
    }

    /// Server statistics, bounded by [`HEALTH_CHECK_TIMEOUT`].
    pub async fn system_stats(&self) -> Result<Value, ComfyUIApiError> {
        let request = self
            .http
            .get(self.url("/system_stats"))
            .timeout(HEALTH_CHECK_TIMEOUT);
        decode(send(request).await?).await
    }

    /// Multipart upload into the server's `input` folder.
    pub async fn upload_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        subfolder: &str,
        overwrite: bool,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let image = reqwest::multipart::Part::bytes(bytes).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .part("image", image)
            .text("type", "input")
            .text("subfolder", subfolder.to_string())
            .text("overwrite", overwrite.to_string());

        let request = self.http.post(self.url("/upload/image")).multipart(form);
        decode(send(request).await?).await
    }
}

/// Send `request`; a non-2xx answer becomes [`ComfyUIApiError::ApiError`]
/// carrying the body text.
async fn send(request: reqwest::RequestBuilder) -> Result<reqwest::Response, ComfyUIApiError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = match response.text().await {
        Ok(text) => text,
        Err(_) => String::from("<body not readable>"),
    };
    Err(ComfyUIApiError::ApiError {
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ComfyUIApiError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| ComfyUIApiError::Decode(e.to_string()))
}
