//! Annotation records and the collaborators that produce and keep them.
//!
//! The record store maps an image key to its annotation text and
//! approval state. The vision client turns an image plus an instruction
//! prompt into annotation text.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{ImageKey, Timestamp};

/// Default vision model used for automatic annotation.
pub const DEFAULT_VISION_MODEL: &str = "gpt-4-turbo-2024-04-09";

/// Default instruction sent with each image.
pub const DEFAULT_ANNOTATION_PROMPT: &str = "1. Begin with the special word: gsai, illustration. \
2. The description should be short and concise but contain all key requirements. \
3. Requirements: Highlight and describe the main objects in the image that are in the foreground. \
Then, describe the secondary objects, if any. Describe the background. Describe the atmosphere or \
mood of the image. Pay special attention to the light and shadows, and the nature of the lighting. \
Describe the lighting in detail. Describe the composition and the dynamic arrangement of the objects \
in the image. Describe the interactions between the objects in the image. Pay attention to the time \
of day, season, natural environment, weather, etc. If there is a character in the image, describe \
them in detail (appearance, physique, emotions, clothing details). Briefly describe the narrative of \
the image, if there is a story being told. 4. Write the whole thing in one paragraph";

/// One stored annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationRecord {
    pub text: String,
    pub approved: bool,
    /// Set on every upsert, cleared once the operator reviews it.
    pub is_new: bool,
    pub updated_at: Timestamp,
}

/// Key-value store for annotations.
pub trait AnnotationStore {
    fn lookup(&self, key: &str) -> Option<AnnotationRecord>;

    /// Insert or replace the text for `key`. Marks the record new and
    /// unapproved.
    fn upsert(&mut self, key: &str, text: &str) -> Result<(), CoreError>;

    /// Set approval for `key`. Returns `false` when no record exists.
    fn set_approved(&mut self, key: &str, approved: bool) -> Result<bool, CoreError>;

    fn approve_all(&mut self) -> Result<usize, CoreError>;

    /// Approved `(key, text)` pairs in key order.
    fn approved(&self) -> Vec<(ImageKey, String)>;

    fn remove(&mut self, key: &str) -> Result<bool, CoreError>;

    /// Every record in key order.
    fn entries(&self) -> Vec<(ImageKey, AnnotationRecord)>;

    /// Drop every record, returning how many there were.
    fn clear(&mut self) -> Result<usize, CoreError>;

    /// Insert or replace each entry, keeping its flags as given.
    fn import(&mut self, entries: Vec<ExportedAnnotation>) -> Result<usize, CoreError>;
}

/// Produces annotation text for an image.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn request(&self, image_path: &Path, prompt: &str, model: &str) -> Result<String, CoreError>;
}

/// One row of an exported store.
///
/// Written as a JSON array `[image, text, is_new, approved]`. Flags are
/// read back from either booleans or `0`/`1` integers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ExportRow", into = "ExportRow")]
pub struct ExportedAnnotation {
    pub image: ImageKey,
    pub text: String,
    pub is_new: bool,
    pub approved: bool,
}

#[derive(Serialize, Deserialize)]
struct ExportRow(ImageKey, String, Flag, Flag);

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

impl From<Flag> for bool {
    fn from(flag: Flag) -> Self {
        match flag {
            Flag::Bool(b) => b,
            Flag::Int(n) => n != 0,
        }
    }
}

impl From<ExportRow> for ExportedAnnotation {
    fn from(ExportRow(image, text, is_new, approved): ExportRow) -> Self {
        Self {
            image,
            text,
            is_new: is_new.into(),
            approved: approved.into(),
        }
    }
}

impl From<ExportedAnnotation> for ExportRow {
    fn from(entry: ExportedAnnotation) -> Self {
        ExportRow(
            entry.image,
            entry.text,
            Flag::Bool(entry.is_new),
            Flag::Bool(entry.approved),
        )
    }
}

/// JSON-file backed [`AnnotationStore`].
///
/// The whole file is loaded on open and rewritten after each mutation.
/// A mutation whose write fails leaves the in-memory records untouched.
pub struct FileAnnotationStore {
    path: PathBuf,
    records: BTreeMap<ImageKey, AnnotationRecord>,
}

impl FileAnnotationStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let records = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                CoreError::Validation(format!("Malformed annotation store {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => return Err(CoreError::Io { path, source }),
        };
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Apply `change` to a copy of the records, write the copy, and only
    /// then make it current.
    fn commit<T>(
        &mut self,
        change: impl FnOnce(&mut BTreeMap<ImageKey, AnnotationRecord>) -> T,
    ) -> Result<T, CoreError> {
        let mut next = self.records.clone();
        let out = change(&mut next);
        self.write(&next)?;
        self.records = next;
        Ok(out)
    }

    fn write(&self, records: &BTreeMap<ImageKey, AnnotationRecord>) -> Result<(), CoreError> {
        let text = serde_json::to_string_pretty(records)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize annotations: {e}")))?;
        std::fs::write(&self.path, text).map_err(|source| CoreError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl AnnotationStore for FileAnnotationStore {
    fn lookup(&self, key: &str) -> Option<AnnotationRecord> {
        self.records.get(key).cloned()
    }

    fn upsert(&mut self, key: &str, text: &str) -> Result<(), CoreError> {
        let record = AnnotationRecord {
            text: text.to_string(),
            approved: false,
            is_new: true,
            updated_at: chrono::Utc::now(),
        };
        self.commit(|records| {
            records.insert(key.to_string(), record);
        })
    }

    fn set_approved(&mut self, key: &str, approved: bool) -> Result<bool, CoreError> {
        if !self.records.contains_key(key) {
            return Ok(false);
        }
        let now = chrono::Utc::now();
        self.commit(|records| {
            if let Some(record) = records.get_mut(key) {
                record.approved = approved;
                record.is_new = false;
                record.updated_at = now;
            }
            true
        })
    }

    fn approve_all(&mut self) -> Result<usize, CoreError> {
        let now = chrono::Utc::now();
        self.commit(|records| {
            for record in records.values_mut() {
                record.approved = true;
                record.is_new = false;
                record.updated_at = now;
            }
            records.len()
        })
    }

    fn approved(&self) -> Vec<(ImageKey, String)> {
        self.records
            .iter()
            .filter(|(_, r)| r.approved)
            .map(|(k, r)| (k.clone(), r.text.clone()))
            .collect()
    }

    fn remove(&mut self, key: &str) -> Result<bool, CoreError> {
        if !self.records.contains_key(key) {
            return Ok(false);
        }
        self.commit(|records| records.remove(key).is_some())
    }

    fn entries(&self) -> Vec<(ImageKey, AnnotationRecord)> {
        self.records.iter().map(|(k, r)| (k.clone(), r.clone())).collect()
    }

    fn clear(&mut self) -> Result<usize, CoreError> {
        self.commit(|records| {
            let count = records.len();
            records.clear();
            count
        })
    }

    fn import(&mut self, entries: Vec<ExportedAnnotation>) -> Result<usize, CoreError> {
        let now = chrono::Utc::now();
        self.commit(|records| {
            let count = entries.len();
            for entry in entries {
                records.insert(
                    entry.image,
                    AnnotationRecord {
                        text: entry.text,
                        approved: entry.approved,
                        is_new: entry.is_new,
                        updated_at: now,
                    },
                );
            }
            count
        })
    }
}
