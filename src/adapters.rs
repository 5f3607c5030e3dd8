//! External source adapters.
//!
//! Each adapter turns one external system into the narrow [`DocumentSource`]
//! port the pipeline syncs from: resolve an external id to raw bytes, a
//! filename, and source metadata. External ids are always relative paths
//! under the adapter's root; absolute paths and `..` components are rejected
//! before touching the filesystem.

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::config::{EvidenceAdapterConfig, LibraryAdapterConfig};
use crate::error::{PipelineError, Result};
use crate::manifest::deep_merge;
use crate::models::SourceSystem;

/// One document as an external system hands it over.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    fn system(&self) -> SourceSystem;
    /// Resolve an external id to the document it names.
    async fn fetch(&self, external_id: &str) -> Result<SourceRecord>;
    /// External ids currently available from this source, sorted.
    async fn list(&self) -> Result<Vec<String>>;
}

// ============ Document library ============

/// A shared document library on disk. External ids are paths relative to the
/// library root, filtered through an include-glob allowlist.
pub struct LibraryAdapter {
    root: PathBuf,
    include: GlobSet,
}

impl LibraryAdapter {
    pub fn new(config: &LibraryAdapterConfig) -> Result<Self> {
        Ok(Self {
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
        })
    }
}

#[async_trait]
impl DocumentSource for LibraryAdapter {
    fn system(&self) -> SourceSystem {
        SourceSystem::ExternalLibrary
    }

    async fn fetch(&self, external_id: &str) -> Result<SourceRecord> {
        let relative = safe_relative(external_id)?;
        if !self.include.is_match(external_id) {
            return Err(PipelineError::InvalidInput(format!(
                "'{}' is not allowed by the library include globs",
                external_id
            )));
        }

        let path = self.root.join(relative);
        let bytes = read_bytes(&path)?;
        let filename = file_name(&path, external_id);

        Ok(SourceRecord {
            bytes,
            filename,
            metadata: serde_json::json!({
                "adapter": "library",
                "external_id": external_id,
            }),
        })
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in WalkDir::new(&self.root) {
            let entry = entry.map_err(|e| {
                PipelineError::Storage(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("library walk failed: {}", e),
                ))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(&self.root).unwrap_or(entry.path());
            let rel_str = relative.to_string_lossy().to_string();
            if self.include.is_match(&rel_str) {
                ids.push(rel_str);
            }
        }
        // Sort for deterministic ordering
        ids.sort();
        Ok(ids)
    }
}

// ============ Evidence indexer ============

/// An evidence drop directory: `{root}/{id}/` holds exactly one artifact
/// file plus an optional `meta.json` sidecar whose fields become document
/// metadata.
pub struct EvidenceAdapter {
    root: PathBuf,
}

impl EvidenceAdapter {
    pub fn new(config: &EvidenceAdapterConfig) -> Self {
        Self {
            root: config.root.clone(),
        }
    }
}

#[async_trait]
impl DocumentSource for EvidenceAdapter {
    fn system(&self) -> SourceSystem {
        SourceSystem::EvidenceIndexer
    }

    async fn fetch(&self, external_id: &str) -> Result<SourceRecord> {
        let relative = safe_relative(external_id)?;
        let dir = self.root.join(relative);
        if !dir.is_dir() {
            return Err(PipelineError::NotFound(format!(
                "evidence item '{}'",
                external_id
            )));
        }

        let mut sidecar = serde_json::json!({});
        let mut artifact: Option<PathBuf> = None;

        let mut entries: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .collect();
        entries.sort();

        for path in entries {
            if !path.is_file() {
                continue;
            }
            if path.file_name().and_then(|n| n.to_str()) == Some("meta.json") {
                let raw = std::fs::read_to_string(&path)?;
                sidecar = serde_json::from_str(&raw).map_err(|e| {
                    PipelineError::InvalidInput(format!(
                        "evidence item '{}' has malformed meta.json: {}",
                        external_id, e
                    ))
                })?;
            } else if artifact.is_none() {
                artifact = Some(path);
            }
        }

        let Some(path) = artifact else {
            return Err(PipelineError::NotFound(format!(
                "evidence item '{}' has no artifact file",
                external_id
            )));
        };

        let bytes = read_bytes(&path)?;
        let filename = file_name(&path, external_id);

        let mut metadata = sidecar;
        deep_merge(
            &mut metadata,
            serde_json::json!({
                "adapter": "evidence",
                "external_id": external_id,
            }),
        );

        Ok(SourceRecord {
            bytes,
            filename,
            metadata,
        })
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().is_dir() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ============ Shared helpers ============

/// External ids must stay inside the adapter root: relative, no `..`, no
/// leading slash.
fn safe_relative(external_id: &str) -> Result<&Path> {
    let path = Path::new(external_id);
    let traversal = external_id.is_empty()
        || path.is_absolute()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if traversal {
        return Err(PipelineError::InvalidInput(format!(
            "invalid external id '{}': must be a relative path without '..'",
            external_id
        )));
    }
    Ok(path)
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            PipelineError::NotFound(format!("source file {}", path.display()))
        } else {
            PipelineError::Storage(e)
        }
    })
}

fn file_name(path: &Path, fallback: &str) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| fallback.to_string())
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).map_err(|e| {
            PipelineError::InvalidInput(format!("bad include glob '{}': {}", pattern, e))
        })?);
    }
    builder.build().map_err(|e| {
        PipelineError::InvalidInput(format!("include globs did not compile: {}", e))
    })
}
