//! HTTP side of the ComfyUI protocol.
//!
//! Covers the four REST calls a generation needs: queueing a prompt,
//! removing it from the queue, reading its history record and
//! downloading an output file. Every request carries its own timeout;
//! nothing here retries.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::artifact::ArtifactRef;
use crate::job::{JobHandle, JobRequest};

/// Per-request timeout used unless overridden.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client for one ComfyUI server.
///
/// Cheap to clone; clones share the underlying connection pool.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    /// HTTP base, without a trailing path.
    api_url: String,
    /// Applied to every request individually.
    request_timeout: Duration,
}

/// Body of a successful `POST /prompt`.
#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Queue number assigned by the server.
    #[serde(default)]
    pub number: i64,
    /// Per-node validation errors, empty when the workflow was accepted.
    #[serde(default)]
    pub node_errors: Value,
}

impl SubmitResponse {
    /// True when the server flagged any node as invalid.
    pub fn has_node_errors(&self) -> bool {
        match &self.node_errors {
            Value::Null => false,
            Value::Object(nodes) => !nodes.is_empty(),
            Value::Array(nodes) => !nodes.is_empty(),
            _ => true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Transport failure or timeout; no usable response arrived.
    #[error("request to ComfyUI failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server answered with a non-2xx status.
    #[error("ComfyUI answered {status}: {body}")]
    ApiError { status: u16, body: String },

    /// A 2xx response whose body was not what the endpoint promises.
    #[error("unexpected ComfyUI response: {0}")]
    Malformed(String),
}

impl ComfyUIApiError {
    /// HTTP status for [`ApiError`](Self::ApiError), `None` otherwise.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl ComfyUIApi {
    /// `api_url` is the server's HTTP base, e.g. `http://localhost:8188`.
    pub fn new(api_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Replace the per-request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// HTTP base this client talks to.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Queue `job` under its client id.
    ///
    /// A response without a usable `prompt_id` is
    /// [`ComfyUIApiError::Malformed`]. Node errors are left for the
    /// caller to inspect.
    pub async fn submit_workflow(&self, job: &JobRequest) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = json!({
            "prompt": job.payload(),
            "client_id": job.client_id(),
        });
        let request = self.client.post(self.endpoint("prompt")).json(&body);
        let submitted: SubmitResponse = self.fetch_json(request).await?;

        if submitted.prompt_id.is_empty() {
            return Err(ComfyUIApiError::Malformed("empty prompt_id".into()));
        }
        Ok(submitted)
    }

    /// Ask the server to drop `job` from its queue. A job that has
    /// already started keeps running.
    pub async fn cancel_execution(&self, job: &JobHandle) -> Result<(), ComfyUIApiError> {
        let request = self
            .client
            .post(self.endpoint("queue"))
            .json(&json!({ "delete": [job.as_str()] }));
        self.send(request).await.map(drop)
    }

    /// `GET /history/{prompt_id}`. The body is an object keyed by prompt
    /// id, empty when the server holds no record.
    pub async fn get_history(&self, job: &JobHandle) -> Result<Value, ComfyUIApiError> {
        let request = self
            .client
            .get(self.endpoint(&format!("history/{}", job.as_str())));
        self.fetch_json(request).await
    }

    /// `GET /view` for one output file, returning its raw bytes.
    ///
    /// The file is addressed by name, subfolder and storage class exactly
    /// as the history record lists it. An empty body is returned as is;
    /// callers decide whether that is an error.
    pub async fn view(&self, artifact: &ArtifactRef) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = self.client.get(self.endpoint("view")).query(&[
            ("filename", artifact.filename.as_str()),
            ("subfolder", artifact.subfolder.as_str()),
            ("type", artifact.storage_type.as_str()),
        ]);
        let response = self.send(request).await?;
        Ok(response.bytes().await?.to_vec())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.api_url.trim_end_matches('/'))
    }

    /// Send with the request timeout; non-2xx becomes `ApiError`.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ComfyUIApiError> {
        let response = request.timeout(self.request_timeout).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ComfyUIApiError::ApiError {
            status: status.as_u16(),
            body,
        })
    }

    async fn fetch_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ComfyUIApiError> {
        let text = self.send(request).await?.text().await?;
        serde_json::from_str(&text).map_err(|e| ComfyUIApiError::Malformed(format!("{e}: {text}")))
    }
}
