//! Execution events read from the ComfyUI WebSocket.
//!
//! ComfyUI sends JSON text frames shaped `{"type": "<kind>", "data": {...}}`.
//! [`parse_event`] turns one frame into an [`ExecutionEvent`]. Frames of
//! unknown kinds (custom nodes add their own) fail to parse and are the
//! caller's to skip.

use serde::Deserialize;

/// Known ComfyUI execution events.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ExecutionEvent {
    /// Server status broadcast (queue depth).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptRef),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A node is executing, or, when `node` is `None`, nothing is left
    /// to execute for the prompt. The latter is the completion sentinel.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Step-level progress from a long-running node.
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Sent by newer servers after the last node of a prompt.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptRef),

    /// Execution failed on a node.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

impl ExecutionEvent {
    /// Prompt this event is about, when it names one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ExecutionEvent::Status(_) => None,
            ExecutionEvent::ExecutionStart(d) | ExecutionEvent::ExecutionSuccess(d) => {
                Some(&d.prompt_id)
            }
            ExecutionEvent::ExecutionCached(d) => Some(&d.prompt_id),
            ExecutionEvent::Executing(d) => d.prompt_id.as_deref(),
            ExecutionEvent::Progress(d) => d.prompt_id.as_deref(),
            ExecutionEvent::Executed(d) => Some(&d.prompt_id),
            ExecutionEvent::ExecutionError(d) => Some(&d.prompt_id),
        }
    }

    /// `executing` with a null node: nothing left to run for the prompt.
    pub fn is_completion_sentinel(&self) -> bool {
        matches!(self, ExecutionEvent::Executing(d) if d.node.is_none())
    }
}

/// Payload of a `status` broadcast.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    /// Prompts still waiting or running on the server.
    pub queue_remaining: i32,
}

/// Payload naming only a prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

/// Payload of `execution_cached`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node ids whose cached outputs were reused.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload of `executing`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    /// Node about to run; `None` once the prompt is done.
    pub node: Option<String>,
    /// Absent on very old servers; such events cannot be correlated.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload of `progress`, sent by samplers once per step.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    /// Steps done so far.
    pub value: i32,
    /// Total steps for the node.
    pub max: i32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    /// Completion percentage (0-100), 0 when `max` is not positive.
    pub fn percent(&self) -> i16 {
        if self.max > 0 {
            ((self.value as f64 / self.max as f64) * 100.0) as i16
        } else {
            0
        }
    }
}

/// Payload of `executed`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// Node that produced `output`.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload of `execution_error`. The server also sends a traceback and
/// the failing node's inputs; those are not kept.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    /// Node that raised.
    pub node_id: String,
    /// Human-readable message, carried into the session error.
    pub exception_message: String,
    /// Python exception class name.
    pub exception_type: String,
}

/// Parse a ComfyUI WebSocket text frame into a typed event.
///
/// Returns `Err` for malformed JSON or unknown `type` values. Unknown
/// fields inside a known event are ignored.
pub fn parse_event(text: &str) -> Result<ExecutionEvent, serde_json::Error> {
    serde_json::from_str(text)
}
