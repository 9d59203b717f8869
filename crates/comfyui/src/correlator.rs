//! Completion detection on a shared ComfyUI event stream.
//!
//! A socket opened with a client id receives events for every prompt the
//! server runs on behalf of that id, plus broadcast status frames. The
//! [`EventCorrelator`] watches that stream for the one event that means
//! "the prompt this session submitted has nothing left to execute" and
//! discards everything else.
//!
//! States: `Connecting -> Open -> Completed`, or `Open -> Failed` when
//! the stream drops, the deadline passes, or the caller cancels.

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::error::GenerationError;
use crate::job::JobHandle;
use crate::messages::{parse_event, ExecutionEvent};

/// Deadline used when `now + timeout` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelatorState {
    /// No stream attached yet.
    Connecting,
    /// Reading events.
    Open,
    /// The completion sentinel for the tracked job was seen.
    Completed,
    /// The stream ended, timed out, or was cancelled first.
    Failed,
}

/// What a single frame meant for the tracked job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Not relevant, malformed, or about another job.
    Ignored,
    /// Relevant but not terminal (node started, progress, error).
    Pending,
    /// The tracked job has finished executing.
    Completed,
}

/// Result of a successful wait.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Last `execution_error` message reported for the job, if any.
    pub server_error: Option<String>,
    /// Frames discarded while waiting.
    pub ignored: u64,
}

/// Tracks one job on one event stream.
#[derive(Debug)]
pub struct EventCorrelator {
    job: JobHandle,
    state: CorrelatorState,
    server_error: Option<String>,
    ignored: u64,
}

impl EventCorrelator {
    /// Track `job`, which must be the handle returned by submission.
    pub fn new(job: JobHandle) -> Self {
        Self {
            job,
            state: CorrelatorState::Connecting,
            server_error: None,
            ignored: 0,
        }
    }

    pub fn state(&self) -> CorrelatorState {
        self.state
    }

    pub fn job(&self) -> &JobHandle {
        &self.job
    }

    /// Feed one text frame.
    ///
    /// Only an `executing` event with a null node *and* this job's
    /// prompt id completes. Everything else leaves the state unchanged.
    pub fn observe_text(&mut self, text: &str) -> Observation {
        let event = match parse_event(text) {
            Ok(event) => event,
            Err(e) => {
                tracing::trace!(error = %e, "Skipping unrecognised frame");
                self.ignored += 1;
                return Observation::Ignored;
            }
        };
        self.observe(&event)
    }

    /// Feed one parsed event.
    pub fn observe(&mut self, event: &ExecutionEvent) -> Observation {
        if self.state != CorrelatorState::Open {
            self.ignored += 1;
            return Observation::Ignored;
        }

        if event.prompt_id() != Some(self.job.as_str()) {
            self.ignored += 1;
            return Observation::Ignored;
        }

        if event.is_completion_sentinel() {
            tracing::info!(prompt_id = %self.job, "Execution completed (all nodes done)");
            self.state = CorrelatorState::Completed;
            return Observation::Completed;
        }

        match event {
            ExecutionEvent::Executing(data) => {
                tracing::debug!(prompt_id = %self.job, node = ?data.node, "Executing node");
            }
            ExecutionEvent::Progress(data) => {
                tracing::debug!(
                    prompt_id = %self.job,
                    value = data.value,
                    max = data.max,
                    percent = data.percent(),
                    "Generation progress",
                );
            }
            ExecutionEvent::ExecutionError(data) => {
                tracing::warn!(
                    prompt_id = %self.job,
                    node_id = %data.node_id,
                    error_type = %data.exception_type,
                    error_message = %data.exception_message,
                    "Execution error reported by server",
                );
                self.server_error = Some(data.exception_message.clone());
            }
            other => {
                tracing::debug!(prompt_id = %self.job, event = ?other, "Execution event");
            }
        }
        Observation::Pending
    }

    /// Read `stream` until the tracked job completes.
    ///
    /// Fails with [`GenerationError::Timeout`] once `timeout` has elapsed,
    /// [`GenerationError::Stream`] when the stream closes or errors, and
    /// [`GenerationError::Cancelled`] when `cancel` fires. Binary frames
    /// (preview images) and control frames are skipped.
    pub async fn wait_for_completion<S>(
        &mut self,
        stream: &mut S,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Completion, GenerationError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        self.state = CorrelatorState::Open;
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.fail(GenerationError::Cancelled));
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.fail(GenerationError::Timeout {
                        prompt_id: self.job.to_string(),
                        waited: timeout,
                    }));
                }
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(Message::Text(text))) => {
                    if self.observe_text(&text) == Observation::Completed {
                        return Ok(Completion {
                            server_error: self.server_error.clone(),
                            ignored: self.ignored,
                        });
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::trace!(prompt_id = %self.job, "Ignoring binary frame (preview image)");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(frame))) => {
                    return Err(self.fail(GenerationError::Stream(format!(
                        "server closed the event stream before prompt {} completed ({frame:?})",
                        self.job
                    ))));
                }
                Some(Err(e)) => {
                    return Err(self.fail(GenerationError::Stream(format!(
                        "event stream failed before prompt {} completed: {e}",
                        self.job
                    ))));
                }
                None => {
                    return Err(self.fail(GenerationError::Stream(format!(
                        "event stream ended before prompt {} completed",
                        self.job
                    ))));
                }
            }
        }
    }

    fn fail(&mut self, error: GenerationError) -> GenerationError {
        tracing::warn!(prompt_id = %self.job, ignored = self.ignored, error = %error, "Event stream wait failed");
        self.state = CorrelatorState::Failed;
        error
    }
}
