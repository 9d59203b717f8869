//! Moving annotations in and out of a training dataset on disk.
//!
//! Covers folder scanning for batch annotation, `.txt` sidecars next to
//! approved images, and whole-store JSON export and import.

use std::path::{Path, PathBuf};

use crate::annotation::{AnnotationStore, ExportedAnnotation};
use crate::error::CoreError;

/// File extensions picked up when annotating a folder.
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Image files directly inside `dir`, sorted by path.
///
/// Subdirectories are not descended into. Extensions match
/// case-insensitively against [`IMAGE_EXTENSIONS`].
pub fn image_files_in(dir: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let io_err = |source| CoreError::Io {
        path: dir.to_path_buf(),
        source,
    };

    let mut images = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let path = entry.map_err(io_err)?.path();
        if path.is_file() && is_image(&path) {
            images.push(path);
        }
    }
    images.sort();
    Ok(images)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.iter().any(|known| e.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// Where the caption for `image` is written: same stem, `.txt`.
pub fn sidecar_path(image: &Path) -> PathBuf {
    image.with_extension("txt")
}

/// Outcome of [`write_sidecar_texts`].
#[derive(Debug, Default)]
pub struct SidecarReport {
    pub written: Vec<PathBuf>,
    /// Images whose caption could not be written, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Write each approved annotation to a `.txt` file beside its image.
///
/// A failure on one image is recorded and the rest are still written.
pub fn write_sidecar_texts(store: &impl AnnotationStore) -> SidecarReport {
    let mut report = SidecarReport::default();
    for (image, text) in store.approved() {
        let target = sidecar_path(Path::new(&image));
        match std::fs::write(&target, text.as_bytes()) {
            Ok(()) => {
                tracing::debug!(path = %target.display(), "Caption written");
                report.written.push(target);
            }
            Err(e) => {
                tracing::warn!(image = %image, error = %e, "Failed to write caption");
                report.failed.push((image, e.to_string()));
            }
        }
    }
    tracing::info!(
        written = report.written.len(),
        failed = report.failed.len(),
        "Caption files generated",
    );
    report
}

/// Dump every record in `store` to `path` as a JSON list of
/// `[image, text, is_new, approved]` rows.
pub fn export_annotations(store: &impl AnnotationStore, path: &Path) -> Result<usize, CoreError> {
    let rows: Vec<ExportedAnnotation> = store
        .entries()
        .into_iter()
        .map(|(image, record)| ExportedAnnotation {
            image,
            text: record.text,
            is_new: record.is_new,
            approved: record.approved,
        })
        .collect();

    let text = serde_json::to_string_pretty(&rows)
        .map_err(|e| CoreError::Internal(format!("Failed to serialize export: {e}")))?;
    std::fs::write(path, text).map_err(|source| CoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(path = %path.display(), count = rows.len(), "Annotations exported");
    Ok(rows.len())
}

/// Load rows written by [`export_annotations`] into `store`, replacing
/// records with the same image key.
pub fn import_annotations(store: &mut impl AnnotationStore, path: &Path) -> Result<usize, CoreError> {
    let text = std::fs::read_to_string(path).map_err(|source| CoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let rows: Vec<ExportedAnnotation> = serde_json::from_str(&text).map_err(|e| {
        CoreError::Validation(format!("Malformed annotation export {}: {e}", path.display()))
    })?;
    let count = store.import(rows)?;
    tracing::info!(path = %path.display(), count, "Annotations imported");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::FileAnnotationStore;

    fn key(path: &Path) -> String {
        path.display().to_string()
    }

    #[test]
    fn folder_scan_is_flat_sorted_and_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.PNG", "a.jpg", "c.jpeg", "d.bmp", "notes.txt", "e.webp"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.png")).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("deep.png"), b"x").unwrap();

        let names: Vec<_> = image_files_in(dir.path())
            .unwrap()
            .into_iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();

        assert_eq!(names, vec!["a.jpg", "b.PNG", "c.jpeg", "d.bmp"]);
    }

    #[test]
    fn missing_folder_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            image_files_in(&dir.path().join("absent")),
            Err(CoreError::Io { .. })
        ));
    }

    #[test]
    fn sidecars_only_for_approved_and_failures_do_not_stop_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileAnnotationStore::open(dir.path().join("db.json")).unwrap();
        let fox = dir.path().join("fox.png");
        let owl = dir.path().join("owl.final.jpg");
        let draft = dir.path().join("draft.png");
        let orphan = dir.path().join("gone").join("lost.png");

        store.upsert(&key(&fox), "gsai, illustration. A fox.").unwrap();
        store.upsert(&key(&owl), "an owl").unwrap();
        store.upsert(&key(&draft), "not yet").unwrap();
        store.upsert(&key(&orphan), "nowhere").unwrap();
        for image in [&fox, &owl, &orphan] {
            store.set_approved(&key(image), true).unwrap();
        }

        let report = write_sidecar_texts(&store);

        assert_eq!(report.written.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, key(&orphan));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("fox.txt")).unwrap(),
            "gsai, illustration. A fox."
        );
        assert_eq!(std::fs::read_to_string(dir.path().join("owl.final.txt")).unwrap(), "an owl");
        assert!(!dir.path().join("draft.txt").exists());
    }

    #[test]
    fn export_then_import_into_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let export = dir.path().join("export.json");
        let mut source = FileAnnotationStore::open(dir.path().join("a.json")).unwrap();
        source.upsert("x.png", "ex").unwrap();
        source.upsert("y.png", "why").unwrap();
        source.set_approved("y.png", true).unwrap();

        assert_eq!(export_annotations(&source, &export).unwrap(), 2);

        let mut target = FileAnnotationStore::open(dir.path().join("b.json")).unwrap();
        target.upsert("x.png", "stale").unwrap();
        assert_eq!(import_annotations(&mut target, &export).unwrap(), 2);

        assert_eq!(target.len(), 2);
        assert_eq!(target.lookup("x.png").unwrap().text, "ex");
        assert!(target.lookup("x.png").unwrap().is_new);
        let y = target.lookup("y.png").unwrap();
        assert!(y.approved);
        assert!(!y.is_new);
    }

    #[test]
    fn malformed_import_changes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let export = dir.path().join("export.json");
        std::fs::write(&export, r#"{"not": "a list"}"#).unwrap();
        let mut store = FileAnnotationStore::open(dir.path().join("db.json")).unwrap();
        store.upsert("keep.png", "kept").unwrap();

        assert!(matches!(
            import_annotations(&mut store, &export),
            Err(CoreError::Validation(_))
        ));
        assert_eq!(store.len(), 1);
    }
}
