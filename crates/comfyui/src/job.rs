//! Job request and handle types.

use std::fmt;

use lumen_core::workflow::WorkflowTemplate;

use crate::api::SubmitResponse;

/// A built payload ready for submission, scoped to one correlation id.
///
/// The correlation id is the ComfyUI `client_id`: the server addresses
/// WebSocket events for this job to the socket opened with the same id.
#[derive(Debug, Clone)]
pub struct JobRequest {
    payload: WorkflowTemplate,
    client_id: String,
}

impl JobRequest {
    pub fn new(payload: WorkflowTemplate, client_id: impl Into<String>) -> Self {
        Self {
            payload,
            client_id: client_id.into(),
        }
    }

    pub fn payload(&self) -> &WorkflowTemplate {
        &self.payload
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

/// Server-assigned job identifier (ComfyUI `prompt_id`).
///
/// Only obtainable from a [`SubmitResponse`], so a handle always names a
/// job this client actually enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobHandle(String);

impl JobHandle {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SubmitResponse> for JobHandle {
    fn from(response: SubmitResponse) -> Self {
        Self(response.prompt_id)
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
pub(crate) fn handle_for_tests(prompt_id: &str) -> JobHandle {
    JobHandle(prompt_id.to_string())
}
