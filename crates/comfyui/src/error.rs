//! Errors surfaced by a generation session.
//!
//! Every variant is terminal for the session that produced it. The
//! session closes its WebSocket before returning any of them.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// The event stream could not be opened.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server rejected the job or answered with something that is
    /// not a job identifier.
    #[error("Submission error: {0}")]
    Submission(String),

    /// The event stream ended or failed before the job completed.
    #[error("Stream error: {0}")]
    Stream(String),

    /// No completion event arrived within the deadline.
    #[error("Timed out after {waited:?} waiting for prompt {prompt_id} to complete")]
    Timeout { prompt_id: String, waited: Duration },

    /// The server has no history record for a completed prompt.
    #[error("No history found for prompt {0}")]
    HistoryNotFound(String),

    /// The job completed without producing a retrievable image.
    #[error("Prompt {prompt_id} produced no image output{}", server_error_suffix(.server_error))]
    NoArtifact {
        prompt_id: String,
        /// Execution error reported on the stream, if any.
        server_error: Option<String>,
    },

    /// History or download request failed after completion.
    #[error("Artifact retrieval failed: {0}")]
    Retrieval(String),

    /// Writing the artifact to local storage failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The caller abandoned the session.
    #[error("Generation cancelled")]
    Cancelled,

    /// A session is already in flight on this runner.
    #[error("A generation is already in progress")]
    Busy,

    /// The session task died without reporting an outcome.
    #[error("Internal error: {0}")]
    Internal(String),
}

fn server_error_suffix(server_error: &Option<String>) -> String {
    match server_error {
        Some(msg) => format!(" (server reported: {msg})"),
        None => String::new(),
    }
}
