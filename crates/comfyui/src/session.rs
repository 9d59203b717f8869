//! One generation job, end to end.
//!
//! A [`GenerationSession`] owns a fresh client id and, while it runs, the
//! WebSocket opened under that id. [`GenerationSession::run`] opens the
//! socket, builds and submits the payload, waits for the completion
//! event, then downloads and stores the output image. The socket is
//! closed on every path out of `run`.
//!
//! The socket is opened before submission so that a job finishing
//! faster than the handshake still has its completion event delivered.

use std::time::Duration;

use lumen_core::error::CoreError;
use lumen_core::settings::GenerationSettings;
use lumen_core::workflow::{build_payload, FieldBindings, GenerationParams, WorkflowTemplate};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;
use crate::artifact::{ArtifactRetriever, ArtifactStore, GeneratedArtifact};
use crate::client::{ComfyUIClient, ComfyUIConnection};
use crate::correlator::EventCorrelator;
use crate::error::GenerationError;
use crate::events::GenerationEvent;
use crate::job::{JobHandle, JobRequest};

/// A single generation job against one server.
///
/// Built once and consumed by [`run`](Self::run); a retry is a new
/// session with a new client id.
pub struct GenerationSession {
    /// Socket side, also the source of both base URLs.
    client: ComfyUIClient,
    api: ComfyUIApi,
    /// Where the downloaded image is written.
    store: ArtifactStore,
    template: WorkflowTemplate,
    bindings: FieldBindings,
    /// Deadline for the completion event.
    timeout: Duration,
    /// Fresh UUID per session; scopes both the socket and the submission.
    client_id: String,
    events: Option<broadcast::Sender<GenerationEvent>>,
}

impl GenerationSession {
    /// Create a session against `server` with a fresh client id.
    pub fn new(
        server: &str,
        template: WorkflowTemplate,
        bindings: FieldBindings,
        store: ArtifactStore,
    ) -> Self {
        let client = ComfyUIClient::new(server);
        let api = ComfyUIApi::new(client.api_url().to_string());
        Self {
            client,
            api,
            store,
            template,
            bindings,
            timeout: Duration::from_secs(lumen_core::settings::DEFAULT_TIMEOUT_SECS),
            client_id: uuid::Uuid::new_v4().to_string(),
            events: None,
        }
    }

    /// Create a session from a settings record.
    ///
    /// Fails when the settings do not pass
    /// [`GenerationSettings::validate`].
    pub fn from_settings(settings: &GenerationSettings) -> Result<Self, CoreError> {
        settings.validate()?;
        let template = settings.template();
        let bindings = settings.resolve_bindings(&template);
        let store = ArtifactStore::new(settings.output_dir.clone());

        Ok(Self::new(&settings.server, template, bindings, store)
            .with_timeout(settings.timeout())
            .with_request_timeout(settings.request_timeout()))
    }

    /// Deadline for the completion event after submission.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Bound on each HTTP request and on opening the event socket.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.client = self.client.with_connect_timeout(timeout);
        self.api = self.api.with_request_timeout(timeout);
        self
    }

    /// Report submission and outcome on `events`.
    pub fn with_events(mut self, events: broadcast::Sender<GenerationEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// The correlation id this session connects and submits under.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Run the job to completion.
    ///
    /// Returns the stored artifact or the first error encountered. When
    /// `cancel` fires, the wait is interrupted, a queued job is removed
    /// from the server queue, and [`GenerationError::Cancelled`] is
    /// returned. In all cases the socket is closed before returning.
    pub async fn run(
        self,
        mut params: GenerationParams,
        cancel: &CancellationToken,
    ) -> Result<GeneratedArtifact, GenerationError> {
        if params.seed.is_none() {
            params.seed = Some(u64::from(rand::random::<u32>()));
        }
        let payload = build_payload(&self.template, &self.bindings, &params);
        let request = JobRequest::new(payload, self.client_id.clone());

        tracing::info!(
            client_id = %self.client_id,
            server = %self.client.api_url(),
            nodes = request.payload().len(),
            seed = params.seed,
            "Starting generation",
        );

        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GenerationError::Cancelled),
            conn = self.client.connect(&self.client_id) => {
                conn.map_err(|e| GenerationError::Connection(e.to_string()))
            }
        };
        let mut conn = match conn {
            Ok(conn) => conn,
            Err(e) => {
                self.emit_failed(None, &e);
                return Err(e);
            }
        };

        let mut submitted = None;
        let result = self.drive(&mut conn, &request, cancel, &mut submitted).await;
        conn.close().await;

        match &result {
            Ok(artifact) => self.emit(GenerationEvent::Finished {
                client_id: self.client_id.clone(),
                prompt_id: artifact.prompt_id.clone(),
                artifact_path: artifact.path.clone(),
            }),
            Err(e) => {
                tracing::error!(client_id = %self.client_id, error = %e, "Generation failed");
                self.emit_failed(submitted.as_ref(), e);
            }
        }
        result
    }

    /// Submit, correlate, retrieve. The caller owns closing `conn`.
    async fn drive(
        &self,
        conn: &mut ComfyUIConnection,
        request: &JobRequest,
        cancel: &CancellationToken,
        submitted: &mut Option<JobHandle>,
    ) -> Result<GeneratedArtifact, GenerationError> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            response = self.api.submit_workflow(request) => {
                response.map_err(|e| GenerationError::Submission(e.to_string()))?
            }
        };
        if response.has_node_errors() {
            return Err(GenerationError::Submission(format!(
                "server rejected workflow: {}",
                response.node_errors
            )));
        }

        let queue_position = response.number;
        let job = JobHandle::from(response);
        *submitted = Some(job.clone());

        tracing::info!(
            client_id = %self.client_id,
            prompt_id = %job,
            queue_position,
            "Workflow submitted to ComfyUI",
        );
        self.emit(GenerationEvent::Submitted {
            client_id: self.client_id.clone(),
            prompt_id: job.to_string(),
            queue_position,
        });

        let mut correlator = EventCorrelator::new(job.clone());
        let completion = match correlator
            .wait_for_completion(&mut conn.ws_stream, self.timeout, cancel)
            .await
        {
            Ok(completion) => completion,
            Err(e) => {
                if matches!(e, GenerationError::Cancelled | GenerationError::Timeout { .. }) {
                    self.dequeue(&job).await;
                }
                return Err(e);
            }
        };

        ArtifactRetriever::new(self.api.clone(), self.store.clone())
            .fetch(&job, completion.server_error, cancel)
            .await
    }

    /// Best-effort removal of an abandoned job from the server queue.
    async fn dequeue(&self, job: &JobHandle) {
        if let Err(e) = self.api.cancel_execution(job).await {
            tracing::warn!(prompt_id = %job, error = %e, "Failed to remove job from queue");
        }
    }

    fn emit(&self, event: GenerationEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn emit_failed(&self, job: Option<&JobHandle>, error: &GenerationError) {
        self.emit(GenerationEvent::Failed {
            client_id: self.client_id.clone(),
            prompt_id: job.map(JobHandle::to_string),
            error: error.to_string(),
        });
    }
}
