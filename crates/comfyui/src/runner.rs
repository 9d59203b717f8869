//! Background execution of generation sessions.
//!
//! [`GenerationRunner`] is the handle an interactive layer keeps. Each
//! [`start`](GenerationRunner::start) builds a fresh session from the
//! runner's settings and runs it on a tokio task, so the caller's loop
//! never blocks on the server. The outcome comes back through the
//! returned [`GenerationHandle`]; coarse progress is broadcast to
//! [`subscribe`](GenerationRunner::subscribe)rs.
//!
//! At most one session runs per runner. Dropping a handle cancels its
//! session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use lumen_core::settings::GenerationSettings;
use lumen_core::workflow::GenerationParams;
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::artifact::GeneratedArtifact;
use crate::error::GenerationError;
use crate::events::GenerationEvent;
use crate::session::GenerationSession;

/// Broadcast channel capacity for generation events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

type SessionResult = Result<GeneratedArtifact, GenerationError>;

/// Runs one generation session at a time in the background.
///
/// Holds the settings each new session is built from, the busy flag
/// that enforces the single-session rule, and the broadcast sender
/// every session reports on.
pub struct GenerationRunner {
    settings: GenerationSettings,
    /// Set while a session task is alive.
    busy: Arc<AtomicBool>,
    event_tx: broadcast::Sender<GenerationEvent>,
    /// Master cancellation token -- cancelled during shutdown.
    cancel: CancellationToken,
}

/// Caller's side of one running session.
pub struct GenerationHandle {
    client_id: String,
    cancel: CancellationToken,
    result: Option<oneshot::Receiver<SessionResult>>,
    /// The session task, consulted when it ends without sending.
    task: Option<JoinHandle<()>>,
}

/// Clears the runner's busy flag when the session task ends, however it
/// ends.
struct BusyGuard(Arc<AtomicBool>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl GenerationRunner {
    /// Create an idle runner. Settings are validated per `start`.
    pub fn new(settings: GenerationSettings) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings,
            busy: Arc::new(AtomicBool::new(false)),
            event_tx,
            cancel: CancellationToken::new(),
        }
    }

    /// Subscribe to submission/outcome events.
    pub fn subscribe(&self) -> broadcast::Receiver<GenerationEvent> {
        self.event_tx.subscribe()
    }

    /// Settings the next session will be built from.
    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Replace the settings used by subsequent sessions.
    pub fn set_settings(&mut self, settings: GenerationSettings) {
        self.settings = settings;
    }

    /// True while a session task from this runner is alive.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Start a session in the background.
    ///
    /// Fails with [`GenerationError::Busy`] while another session from
    /// this runner is in flight. Settings that fail validation are
    /// reported here as a [`GenerationError::Submission`], before
    /// anything is sent. Must be called within a tokio runtime.
    pub fn start(&self, params: GenerationParams) -> Result<GenerationHandle, GenerationError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(GenerationError::Busy);
        }
        let guard = BusyGuard(Arc::clone(&self.busy));

        let session = GenerationSession::from_settings(&self.settings)
            .map_err(|e| GenerationError::Submission(format!("invalid settings: {e}")))?
            .with_events(self.event_tx.clone());
        let client_id = session.client_id().to_string();

        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();
        let (tx, rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let _guard = guard;
            let result = session.run(params, &task_cancel).await;
            // The receiver may be gone if the handle was dropped.
            let _ = tx.send(result);
        });

        tracing::debug!(client_id = %client_id, "Generation task spawned");

        Ok(GenerationHandle {
            client_id,
            cancel,
            result: Some(rx),
            task: Some(task),
        })
    }

    /// Cancel any in-flight session. Later `start` calls are cancelled
    /// immediately.
    pub fn shutdown(&self) {
        tracing::info!("Shutting down generation runner");
        self.cancel.cancel();
    }
}

impl GenerationHandle {
    /// Client id of the session, as carried in its events.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Ask the session to stop. It still closes its socket before
    /// reporting [`GenerationError::Cancelled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the outcome.
    ///
    /// A task that dies before reporting (a panic inside the session)
    /// yields [`GenerationError::Internal`], never `Cancelled`.
    pub async fn wait(mut self) -> SessionResult {
        let Some(rx) = self.result.take() else {
            return Err(GenerationError::Internal("outcome already taken".into()));
        };
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                let joined = match self.task.take() {
                    Some(task) => task.await,
                    None => Ok(()),
                };
                Err(self.lost_outcome(joined))
            }
        }
    }

    /// Non-blocking poll for an interactive loop: `None` while running.
    /// Yields the outcome once.
    pub fn try_result(&mut self) -> Option<SessionResult> {
        let rx = self.result.as_mut()?;
        match rx.try_recv() {
            Ok(result) => {
                self.result = None;
                Some(result)
            }
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.result = None;
                // The sender is gone, so the task has finished or is
                // unwinding; a finished task answers without blocking.
                let joined = self
                    .task
                    .take()
                    .and_then(|task| task.now_or_never())
                    .unwrap_or(Ok(()));
                Some(Err(self.lost_outcome(joined)))
            }
        }
    }

    /// Explain a session task that ended without sending its outcome.
    fn lost_outcome(&self, joined: Result<(), JoinError>) -> GenerationError {
        let reason = match joined {
            Err(e) if e.is_panic() => "generation task panicked",
            Err(_) => "generation task was aborted",
            Ok(()) => "generation task ended without a result",
        };
        tracing::error!(client_id = %self.client_id, reason, "Generation outcome lost");
        GenerationError::Internal(reason.to_string())
    }
}

impl Drop for GenerationHandle {
    fn drop(&mut self) {
        if self.result.is_some() {
            self.cancel.cancel();
        }
    }
}
