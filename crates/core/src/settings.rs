//! Generation settings record (server, defaults, workflow template).
//!
//! Persisted as pretty-printed JSON. A missing file yields defaults and
//! missing keys take their default values, so older files keep loading
//! as fields are added.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::workflow::{FieldBindings, GenerationParams, WorkflowTemplate};

/// Default settings file name, relative to the working directory.
pub const DEFAULT_SETTINGS_FILE: &str = "comfy_settings.json";

/// Default generation server address.
pub const DEFAULT_SERVER: &str = "http://localhost:8188";

/// Default image width and height in pixels.
pub const DEFAULT_DIMENSION: u32 = 512;

/// Default sampler step count.
pub const DEFAULT_STEPS: u32 = 20;

/// Default deadline for the completion event, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Upper bound accepted for `timeout_secs` (one day).
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Default per-request HTTP timeout, in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Upper bound accepted for `request_timeout_secs` (one hour).
pub const MAX_REQUEST_TIMEOUT_SECS: u64 = 3_600;

/// Default directory for generated artifacts.
pub const DEFAULT_OUTPUT_DIR: &str = "generated";

/// Settings for image generation against a remote server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    /// HTTP base address of the generation server.
    pub server: String,
    /// Checkpoint name; empty means "leave the workflow's own value".
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    /// Fixed seed. A fresh random seed is drawn per call when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    /// Workflow template as JSON text (ComfyUI API format).
    pub workflow: String,
    /// Explicit bindings. Discovered from the template when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bindings: Option<FieldBindings>,
    pub timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub output_dir: PathBuf,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            model: String::new(),
            width: DEFAULT_DIMENSION,
            height: DEFAULT_DIMENSION,
            steps: DEFAULT_STEPS,
            seed: None,
            workflow: String::new(),
            bindings: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        }
    }
}

impl GenerationSettings {
    /// Load settings from `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No settings file, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(CoreError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&text).map_err(|e| {
            CoreError::Validation(format!("Malformed settings file {}: {e}", path.display()))
        })
    }

    /// Write settings to `path` as pretty-printed JSON.
    pub fn save(&self, path: &Path) -> Result<(), CoreError> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize settings: {e}")))?;
        std::fs::write(path, text).map_err(|source| CoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), "Generation settings saved");
        Ok(())
    }

    /// Check values a session cannot work without.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.server.trim().is_empty() {
            return Err(CoreError::Validation("Server address must not be empty".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(CoreError::Validation(format!(
                "Dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.steps == 0 {
            return Err(CoreError::Validation("Steps must be at least 1".into()));
        }
        if !(1..=MAX_TIMEOUT_SECS).contains(&self.timeout_secs) {
            return Err(CoreError::Validation(format!(
                "Timeout must be between 1 and {MAX_TIMEOUT_SECS} seconds, got {}",
                self.timeout_secs
            )));
        }
        if !(1..=MAX_REQUEST_TIMEOUT_SECS).contains(&self.request_timeout_secs) {
            return Err(CoreError::Validation(format!(
                "Request timeout must be between 1 and {MAX_REQUEST_TIMEOUT_SECS} seconds, got {}",
                self.request_timeout_secs
            )));
        }
        Ok(())
    }

    /// Parse the stored workflow text; see [`WorkflowTemplate::from_json_str`].
    pub fn template(&self) -> WorkflowTemplate {
        WorkflowTemplate::from_json_str(&self.workflow)
    }

    /// Explicit bindings, or bindings discovered from `template`.
    pub fn resolve_bindings(&self, template: &WorkflowTemplate) -> FieldBindings {
        match &self.bindings {
            Some(explicit) => explicit.clone(),
            None => FieldBindings::discover(template),
        }
    }

    /// Runtime values for `prompt` with this record's defaults filled in.
    pub fn params_for(&self, prompt: impl Into<String>) -> GenerationParams {
        GenerationParams {
            prompt: Some(prompt.into()),
            model: Some(self.model.clone()),
            width: Some(self.width),
            height: Some(self.height),
            steps: Some(self.steps),
            seed: self.seed,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
