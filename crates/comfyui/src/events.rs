//! Coarse progress events emitted by generation sessions.
//!
//! Only submission and the final outcome are reported; the server's
//! step-level progress stays in the debug log.

use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub enum GenerationEvent {
    /// The server accepted the job.
    Submitted {
        client_id: String,
        prompt_id: String,
        /// Position in the server's execution queue.
        queue_position: i64,
    },

    /// The artifact was downloaded and stored.
    Finished {
        client_id: String,
        prompt_id: String,
        artifact_path: PathBuf,
    },

    /// The session ended with an error.
    Failed {
        client_id: String,
        /// Set when the failure happened after submission.
        prompt_id: Option<String>,
        error: String,
    },
}
