//! Output lookup, download, and local storage.
//!
//! After completion the job's outputs are read from `GET /history/{id}`.
//! Node outputs are scanned in node-id order (numeric ids ascending,
//! then others lexically) and the first node listing an image wins. Its
//! first image is downloaded through `GET /view` and written to the
//! artifact directory under a fresh UUID file name.

use std::path::{Path, PathBuf};

use lumen_core::types::Timestamp;
use lumen_core::workflow::compare_node_ids;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::ComfyUIApi;
use crate::error::GenerationError;
use crate::job::JobHandle;

/// Extension used when the server filename has none worth keeping.
const DEFAULT_EXTENSION: &str = "png";

/// One output file on the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage class: `output`, `temp` or `input`.
    #[serde(rename = "type", default = "default_storage_type")]
    pub storage_type: String,
}

fn default_storage_type() -> String {
    "output".to_string()
}

/// A downloaded image persisted to local storage.
#[derive(Debug, Clone)]
pub struct GeneratedArtifact {
    /// Locally assigned identifier; also the file stem.
    pub id: Uuid,
    pub path: PathBuf,
    pub bytes: Vec<u8>,
    /// The server-side file this was downloaded from.
    pub source: ArtifactRef,
    pub prompt_id: String,
    pub created_at: Timestamp,
}

/// Pick the output image for `job` from a `/history/{id}` response.
///
/// Fails with [`GenerationError::HistoryNotFound`] when the response has
/// no record for the job, and [`GenerationError::NoArtifact`] when no
/// node output lists an image.
pub fn select_artifact(
    history: &serde_json::Value,
    job: &JobHandle,
    server_error: Option<String>,
) -> Result<ArtifactRef, GenerationError> {
    let record = history
        .get(job.as_str())
        .filter(|r| r.is_object())
        .ok_or_else(|| GenerationError::HistoryNotFound(job.to_string()))?;

    let no_artifact = || GenerationError::NoArtifact {
        prompt_id: job.to_string(),
        server_error: server_error.clone(),
    };

    let Some(outputs) = record.get("outputs").and_then(|o| o.as_object()) else {
        return Err(no_artifact());
    };

    let mut node_ids: Vec<&String> = outputs.keys().collect();
    node_ids.sort_by(|a, b| compare_node_ids(a, b));

    for node_id in node_ids {
        let Some(images) = outputs[node_id.as_str()].get("images").and_then(|i| i.as_array()) else {
            continue;
        };
        let first = images
            .iter()
            .find_map(|image| serde_json::from_value::<ArtifactRef>(image.clone()).ok());
        if let Some(artifact) = first {
            tracing::debug!(
                prompt_id = %job,
                node_id = %node_id,
                filename = %artifact.filename,
                "Selected output image",
            );
            return Ok(artifact);
        }
    }

    Err(no_artifact())
}

/// Local artifact directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `bytes` under a new unique name and return the artifact.
    ///
    /// Bytes go to a `.part` file first and are renamed into place, so a
    /// failed write never leaves a file with the final name. The partial
    /// file is removed on failure.
    pub async fn persist(
        &self,
        bytes: Vec<u8>,
        source: ArtifactRef,
        job: &JobHandle,
    ) -> Result<GeneratedArtifact, GenerationError> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            GenerationError::Storage(format!("cannot create {}: {e}", self.dir.display()))
        })?;

        let id = Uuid::new_v4();
        let path = self
            .dir
            .join(format!("{}.{}", id.simple(), extension_of(&source.filename)));
        let part = path.with_extension(format!("{}.part", extension_of(&source.filename)));

        if let Err(e) = write_new(&part, &bytes).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(GenerationError::Storage(format!(
                "cannot write {}: {e}",
                part.display()
            )));
        }
        if let Err(e) = tokio::fs::rename(&part, &path).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(GenerationError::Storage(format!(
                "cannot move artifact into {}: {e}",
                path.display()
            )));
        }

        tracing::info!(
            prompt_id = %job,
            artifact_id = %id,
            path = %path.display(),
            size = bytes.len(),
            "Artifact saved",
        );

        Ok(GeneratedArtifact {
            id,
            path,
            bytes,
            source,
            prompt_id: job.to_string(),
            created_at: chrono::Utc::now(),
        })
    }
}

async fn write_new(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

/// Lowercase extension of `filename` if it is short and alphanumeric.
fn extension_of(filename: &str) -> String {
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 8 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| DEFAULT_EXTENSION.to_string())
}

/// History lookup plus download plus storage for one server.
#[derive(Clone)]
pub struct ArtifactRetriever {
    api: ComfyUIApi,
    store: ArtifactStore,
}

impl ArtifactRetriever {
    pub fn new(api: ComfyUIApi, store: ArtifactStore) -> Self {
        Self { api, store }
    }

    /// Fetch and persist the output image of a completed job.
    ///
    /// `cancel` is honoured until the bytes are downloaded. The local
    /// write is never interrupted, so a cancelled fetch leaves no file
    /// behind and a successful write is always returned.
    pub async fn fetch(
        &self,
        job: &JobHandle,
        server_error: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<GeneratedArtifact, GenerationError> {
        let (source, bytes) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GenerationError::Cancelled),
            downloaded = self.download(job, server_error) => downloaded?,
        };
        self.store.persist(bytes, source, job).await
    }

    /// Look up and download the output image of a completed job.
    ///
    /// `server_error` is the execution error seen on the stream, carried
    /// into [`GenerationError::NoArtifact`] when there is no image.
    /// Nothing is written locally, so the future may be dropped at any
    /// await point.
    pub async fn download(
        &self,
        job: &JobHandle,
        server_error: Option<String>,
    ) -> Result<(ArtifactRef, Vec<u8>), GenerationError> {
        let history = self.api.get_history(job).await.map_err(|e| match e.status() {
            Some(404) => GenerationError::HistoryNotFound(job.to_string()),
            _ => GenerationError::Retrieval(format!("history lookup for {job} failed: {e}")),
        })?;

        let artifact = select_artifact(&history, job, server_error)?;

        let bytes = self.api.view(&artifact).await.map_err(|e| {
            GenerationError::Retrieval(format!("download of {} failed: {e}", artifact.filename))
        })?;
        if bytes.is_empty() {
            return Err(GenerationError::Retrieval(format!(
                "server returned an empty file for {}",
                artifact.filename
            )));
        }
        Ok((artifact, bytes))
    }
}
