//! Per-document JSON manifests.
//!
//! Every document owns one manifest at `{manifest_root}/{sha256}.json`,
//! created at ingest and grown by later stages. Stage updates deep-merge into
//! the existing JSON and land via a temp-file rename, so readers never see a
//! half-written manifest and a crashed stage leaves the previous version
//! intact.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

/// Manifest schema. Stage sections are absent until their stage has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub sha256: String,
    pub doc_id: i64,
    pub source_system: String,
    pub original: OriginalArtifact,
    #[serde(default)]
    pub extraction: Option<ExtractionStage>,
    #[serde(default)]
    pub indexing: Option<IndexingStage>,
    /// Derived artifacts keyed by a short label ("pages", "ocr").
    #[serde(default)]
    pub processed: BTreeMap<String, ProcessedArtifact>,
    /// ISO-8601 stage timestamps keyed by stage name.
    #[serde(default)]
    pub timestamps: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginalArtifact {
    /// Path relative to the storage root, e.g. `originals/{sha256}.pdf`.
    pub path: String,
    pub bytes: u64,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedArtifact {
    pub path: String,
    pub files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionStage {
    pub method: String,
    pub pages: usize,
    pub pages_with_errors: usize,
    pub ocr_triggered: bool,
    pub sampled_pages: usize,
    pub avg_chars_per_page: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingStage {
    pub keyword_pages: usize,
    pub vector_pages: usize,
}

/// Filesystem store for manifests. Cheap to clone; every service that
/// records stage results holds one.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn path_for(&self, sha256: &str) -> PathBuf {
        self.root.join(format!("{}.json", sha256))
    }

    /// Writes a fresh manifest. Ingest calls this exactly once per hash.
    pub fn create(&self, manifest: &Manifest) -> Result<()> {
        let value = serde_json::to_value(manifest).map_err(json_err)?;
        self.write_atomic(&self.path_for(&manifest.sha256), &value)
    }

    pub fn get(&self, sha256: &str) -> Result<Option<Manifest>> {
        match self.get_value(sha256)? {
            Some(value) => {
                let manifest = serde_json::from_value(value).map_err(json_err)?;
                Ok(Some(manifest))
            }
            None => Ok(None),
        }
    }

    /// Raw JSON form, for deep merges and status output.
    pub fn get_value(&self, sha256: &str) -> Result<Option<serde_json::Value>> {
        let path = self.path_for(sha256);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value = serde_json::from_str(&content).map_err(json_err)?;
        Ok(Some(value))
    }

    /// Deep-merges `patch` into the stored manifest and rewrites it
    /// atomically. Objects merge field-by-field; arrays and scalars replace.
    pub fn update(&self, sha256: &str, patch: serde_json::Value) -> Result<Manifest> {
        let mut base = self
            .get_value(sha256)?
            .ok_or_else(|| PipelineError::NotFound(format!("manifest for {}", sha256)))?;
        deep_merge(&mut base, patch);
        self.write_atomic(&self.path_for(sha256), &base)?;
        serde_json::from_value(base).map_err(json_err)
    }

    fn write_atomic(&self, path: &Path, value: &serde_json::Value) -> Result<()> {
        let body = serde_json::to_vec_pretty(value).map_err(json_err)?;
        let tmp = self
            .root
            .join(format!(".tmp-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&tmp, &body)?;
        match std::fs::rename(&tmp, path) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                Err(e.into())
            }
        }
    }
}

/// Recursive JSON merge: object fields merge, everything else replaces.
pub fn deep_merge(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(&key) {
                    Some(base_value) => deep_merge(base_value, patch_value),
                    None => {
                        base_map.insert(key, patch_value);
                    }
                }
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value,
    }
}

/// Stage timestamps use a second-resolution UTC format.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn json_err(e: serde_json::Error) -> PipelineError {
    PipelineError::Storage(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_manifest(sha: &str) -> Manifest {
        Manifest {
            sha256: sha.to_string(),
            doc_id: 7,
            source_system: "app-upload".to_string(),
            original: OriginalArtifact {
                path: format!("originals/{}.pdf", sha),
                bytes: 1234,
                filename: "motion.pdf".to_string(),
            },
            extraction: None,
            indexing: None,
            processed: BTreeMap::new(),
            timestamps: BTreeMap::new(),
        }
    }

    #[test]
    fn deep_merge_merges_objects_and_replaces_scalars() {
        let mut base = json!({
            "a": {"x": 1, "y": 2},
            "b": "old",
            "c": [1, 2, 3],
        });
        deep_merge(
            &mut base,
            json!({
                "a": {"y": 20, "z": 30},
                "b": "new",
                "c": [9],
                "d": true,
            }),
        );
        assert_eq!(
            base,
            json!({
                "a": {"x": 1, "y": 20, "z": 30},
                "b": "new",
                "c": [9],
                "d": true,
            })
        );
    }

    #[test]
    fn create_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path()).unwrap();
        let manifest = sample_manifest("aa11");
        store.create(&manifest).unwrap();

        let loaded = store.get("aa11").unwrap().unwrap();
        assert_eq!(loaded.doc_id, 7);
        assert_eq!(loaded.original.filename, "motion.pdf");
        assert!(loaded.extraction.is_none());
    }

    #[test]
    fn get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path()).unwrap();
        assert!(store.get("feed").unwrap().is_none());
    }

    #[test]
    fn update_adds_stage_and_keeps_original() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path()).unwrap();
        store.create(&sample_manifest("bb22")).unwrap();

        let updated = store
            .update(
                "bb22",
                json!({
                    "extraction": {
                        "method": "native",
                        "pages": 4,
                        "pages_with_errors": 0,
                        "ocr_triggered": false,
                        "sampled_pages": 4,
                        "avg_chars_per_page": 812.5,
                    },
                    "timestamps": {"extracted_at": "2026-01-01T00:00:00Z"},
                }),
            )
            .unwrap();

        assert_eq!(updated.original.bytes, 1234);
        assert_eq!(updated.extraction.as_ref().unwrap().pages, 4);
        assert_eq!(
            updated.timestamps.get("extracted_at").unwrap(),
            "2026-01-01T00:00:00Z"
        );

        // Second stage merges without clobbering the first.
        let updated = store
            .update(
                "bb22",
                json!({
                    "indexing": {"keyword_pages": 4, "vector_pages": 0},
                    "timestamps": {"indexed_at": "2026-01-01T00:05:00Z"},
                }),
            )
            .unwrap();
        assert!(updated.extraction.is_some());
        assert_eq!(updated.timestamps.len(), 2);
    }

    #[test]
    fn update_missing_manifest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path()).unwrap();
        let err = store.update("cc33", json!({"x": 1})).unwrap_err();
        assert!(matches!(err, PipelineError::NotFound(_)));
    }

    #[test]
    fn writes_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path()).unwrap();
        store.create(&sample_manifest("dd44")).unwrap();
        store
            .update("dd44", json!({"timestamps": {"x": "y"}}))
            .unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["dd44.json".to_string()]);
    }
}
