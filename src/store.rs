//! Content-addressed storage and ingest.
//!
//! Originals live at `{root}/originals/{sha256}.{ext}` and are never
//! rewritten. Two writers racing on equal bytes are decided twice, and both
//! decisions are idempotent: the file lands via temp + hard-link (where
//! `AlreadyExists` means the other writer won), and the `documents` row lands
//! via `INSERT .. ON CONFLICT(sha256) DO NOTHING` (zero rows affected means
//! the same). The loser reports a duplicate; no error, no torn state.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::StorageConfig;
use crate::error::{PipelineError, Result};
use crate::manifest::{now_iso, Manifest, ManifestStore, OriginalArtifact};
use crate::models::{
    Document, DocumentState, ExtractionMethod, IngestResult, Page, SourceSystem,
};

pub struct Store {
    pool: SqlitePool,
    root: PathBuf,
    manifests: ManifestStore,
}

enum IngestSource<'a> {
    File(&'a Path),
    Bytes(&'a [u8]),
}

impl Store {
    pub fn new(pool: SqlitePool, config: &StorageConfig, manifests: ManifestStore) -> Result<Self> {
        std::fs::create_dir_all(config.root.join("originals"))?;
        std::fs::create_dir_all(config.root.join("processed"))?;
        Ok(Self {
            pool,
            root: config.root.clone(),
            manifests,
        })
    }

    pub fn storage_root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a document's original, given its manifest.
    pub fn original_path(&self, manifest: &Manifest) -> PathBuf {
        self.root.join(&manifest.original.path)
    }

    // ============ Ingest ============

    pub async fn ingest_path(
        &self,
        path: &Path,
        source: SourceSystem,
        metadata: serde_json::Value,
    ) -> Result<IngestResult> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("upload.bin")
            .to_string();
        let file = std::fs::File::open(path).map_err(|e| {
            PipelineError::EmptyOrMissingFile(format!("{}: {}", path.display(), e))
        })?;
        let (sha256, size) = hash_reader(file)?;
        self.ingest_inner(
            IngestSource::File(path),
            &filename,
            sha256,
            size,
            source,
            metadata,
        )
        .await
    }

    pub async fn ingest_bytes(
        &self,
        bytes: &[u8],
        filename: &str,
        source: SourceSystem,
        metadata: serde_json::Value,
    ) -> Result<IngestResult> {
        let (sha256, size) = hash_reader(bytes)?;
        self.ingest_inner(
            IngestSource::Bytes(bytes),
            filename,
            sha256,
            size,
            source,
            metadata,
        )
        .await
    }

    async fn ingest_inner(
        &self,
        src: IngestSource<'_>,
        filename: &str,
        sha256: String,
        size: u64,
        source: SourceSystem,
        metadata: serde_json::Value,
    ) -> Result<IngestResult> {
        if size == 0 {
            return Err(PipelineError::EmptyOrMissingFile(format!(
                "{} is empty",
                filename
            )));
        }

        // Known hash: point at the existing document, write nothing.
        if let Some(doc) = self.get_document_by_hash(&sha256).await? {
            tracing::debug!(sha256 = %sha256, doc_id = doc.id, "ingest deduplicated");
            return Ok(IngestResult {
                doc_id: doc.id,
                sha256,
                size_bytes: size,
                is_duplicate: true,
            });
        }

        let rel_path = format!("originals/{}.{}", sha256, canonical_ext(filename));
        self.write_original(&src, &rel_path)?;

        let now = chrono::Utc::now().timestamp();
        let insert = sqlx::query(
            r#"
            INSERT INTO documents
                (sha256, filename, size_bytes, source_system, metadata_json, state, ingested_at)
            VALUES (?, ?, ?, ?, ?, 'ingested', ?)
            ON CONFLICT(sha256) DO NOTHING
            "#,
        )
        .bind(&sha256)
        .bind(filename)
        .bind(size as i64)
        .bind(source.as_str())
        .bind(metadata.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if insert.rows_affected() == 0 {
            // Raced another ingest of the same bytes; that writer owns the row.
            let doc = self
                .get_document_by_hash(&sha256)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("document {}", sha256)))?;
            return Ok(IngestResult {
                doc_id: doc.id,
                sha256,
                size_bytes: size,
                is_duplicate: true,
            });
        }
        let doc_id = insert.last_insert_rowid();

        let mut timestamps = BTreeMap::new();
        timestamps.insert("ingested_at".to_string(), now_iso());
        self.manifests.create(&Manifest {
            sha256: sha256.clone(),
            doc_id,
            source_system: source.as_str().to_string(),
            original: OriginalArtifact {
                path: rel_path,
                bytes: size,
                filename: filename.to_string(),
            },
            extraction: None,
            indexing: None,
            processed: BTreeMap::new(),
            timestamps,
        })?;

        Ok(IngestResult {
            doc_id,
            sha256,
            size_bytes: size,
            is_duplicate: false,
        })
    }

    /// Lands the original at its canonical path. Content-addressed, so a
    /// pre-existing file is already the right bytes.
    fn write_original(&self, src: &IngestSource<'_>, rel_path: &str) -> Result<()> {
        let final_path = self.root.join(rel_path);
        if final_path.exists() {
            return Ok(());
        }

        let tmp = self
            .root
            .join("originals")
            .join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        match src {
            IngestSource::File(path) => {
                std::fs::copy(path, &tmp)?;
            }
            IngestSource::Bytes(bytes) => {
                std::fs::write(&tmp, bytes)?;
            }
        }

        match std::fs::hard_link(&tmp, &final_path) {
            Ok(()) => {}
            // A racing writer linked the same content first.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => {
                let _ = std::fs::remove_file(&tmp);
                return Err(e.into());
            }
        }
        let _ = std::fs::remove_file(&tmp);
        Ok(())
    }

    // ============ Lookups ============

    pub async fn get_document(&self, doc_id: i64) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, sha256, filename, size_bytes, source_system, metadata_json,
                    state, ingested_at, extracted_at, indexed_at
             FROM documents WHERE id = ?",
        )
        .bind(doc_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_document).transpose()
    }

    pub async fn get_document_by_hash(&self, sha256: &str) -> Result<Option<Document>> {
        let row = sqlx::query(
            "SELECT id, sha256, filename, size_bytes, source_system, metadata_json,
                    state, ingested_at, extracted_at, indexed_at
             FROM documents WHERE sha256 = ?",
        )
        .bind(sha256)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_document).transpose()
    }

    pub async fn get_pages(&self, doc_id: i64) -> Result<Vec<Page>> {
        let rows = sqlx::query(
            "SELECT document_id, page_number, text, method, extraction_error
             FROM pages WHERE document_id = ? ORDER BY page_number",
        )
        .bind(doc_id)
        .fetch_all(&self.pool)
        .await?;

        let mut pages = Vec::with_capacity(rows.len());
        for row in rows {
            let method_str: String = row.get("method");
            let method = ExtractionMethod::parse(&method_str).ok_or_else(|| {
                sqlx::Error::Decode(format!("unknown extraction method: {}", method_str).into())
            })?;
            pages.push(Page {
                document_id: row.get("document_id"),
                page_number: row.get("page_number"),
                text: row.get("text"),
                method,
                extraction_error: row.get("extraction_error"),
            });
        }
        Ok(pages)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let pages: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pages")
            .fetch_one(&self.pool)
            .await?;
        let vectors: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM page_vectors")
            .fetch_one(&self.pool)
            .await?;
        let authorities: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM authorities")
            .fetch_one(&self.pool)
            .await?;

        let by_state = sqlx::query(
            "SELECT state, COUNT(*) AS n FROM documents GROUP BY state ORDER BY state",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| (row.get::<String, _>("state"), row.get::<i64, _>("n")))
        .collect();

        let by_source = sqlx::query(
            "SELECT source_system, COUNT(*) AS n FROM documents
             GROUP BY source_system ORDER BY source_system",
        )
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| (row.get::<String, _>("source_system"), row.get::<i64, _>("n")))
        .collect();

        Ok(StoreStats {
            documents,
            pages,
            vectors,
            authorities,
            by_state,
            by_source,
        })
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub documents: i64,
    pub pages: i64,
    pub vectors: i64,
    pub authorities: i64,
    pub by_state: Vec<(String, i64)>,
    pub by_source: Vec<(String, i64)>,
}

pub(crate) fn row_to_document(row: sqlx::sqlite::SqliteRow) -> Result<Document> {
    let source_str: String = row.get("source_system");
    let source_system = SourceSystem::parse(&source_str).ok_or_else(|| {
        sqlx::Error::Decode(format!("unknown source system: {}", source_str).into())
    })?;
    let state_str: String = row.get("state");
    let state = DocumentState::parse(&state_str)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown state: {}", state_str).into()))?;
    let metadata_json: String = row.get("metadata_json");
    let metadata = serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null);

    Ok(Document {
        id: row.get("id"),
        sha256: row.get("sha256"),
        filename: row.get("filename"),
        size_bytes: row.get("size_bytes"),
        source_system,
        metadata,
        state,
        ingested_at: row.get("ingested_at"),
        extracted_at: row.get("extracted_at"),
        indexed_at: row.get("indexed_at"),
    })
}

/// Streaming SHA-256 over 64 KiB chunks; equal bytes hash equally no matter
/// how they arrive.
pub fn hash_reader<R: Read>(mut reader: R) -> std::io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), total))
}

/// Lowercased alphanumeric extension, or "bin" when the filename gives none.
fn canonical_ext(filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");
    let cleaned: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect::<String>()
        .to_lowercase();
    if cleaned.is_empty() {
        "bin".to_string()
    } else {
        cleaned
    }
}
