//! Keyword and vector indexing.
//!
//! Indexing is a pure projection of the stored page set: the FTS rows for a
//! document are replaced transactionally, and vector rows are upserted with a
//! text hash so unchanged pages are never re-embedded. Ordering is enforced
//! here: a document that has never been extracted cannot be indexed.

use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::EmbeddingConfig;
use crate::embedding::{vec_to_blob, EmbeddingProvider};
use crate::error::{PipelineError, Result};
use crate::manifest::{now_iso, ManifestStore};
use crate::models::{Document, DocumentState, IndexResult, Page};
use crate::progress::{ProgressReporter, StageEvent};

pub struct Indexer {
    pool: SqlitePool,
    manifests: ManifestStore,
    embedder: Arc<dyn EmbeddingProvider>,
    vector_enabled: bool,
    config: EmbeddingConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl Indexer {
    pub fn new(
        pool: SqlitePool,
        manifests: ManifestStore,
        embedder: Arc<dyn EmbeddingProvider>,
        vector_enabled: bool,
        config: EmbeddingConfig,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            pool,
            manifests,
            embedder,
            vector_enabled,
            config,
            progress,
        }
    }

    pub async fn index(
        &self,
        doc: &Document,
        pages: &[Page],
        enable_vector: bool,
        cancel: &CancellationToken,
    ) -> Result<IndexResult> {
        if doc.state == DocumentState::Ingested {
            return Err(PipelineError::NotExtractedYet(doc.id));
        }
        if enable_vector && !self.vector_enabled {
            return Err(PipelineError::InvalidInput(
                "embedding provider is disabled; cannot build a vector index".to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        self.progress.report(&StageEvent::Started {
            stage: "index",
            doc_id: doc.id,
        });

        let keyword_pages = self.replace_keyword_rows(doc.id, pages).await?;

        let vector_pages = if enable_vector {
            self.embed_pages(doc, pages, cancel).await?
        } else {
            0
        };

        let now = chrono::Utc::now().timestamp();
        sqlx::query("UPDATE documents SET state = 'indexed', indexed_at = ? WHERE id = ?")
            .bind(now)
            .bind(doc.id)
            .execute(&self.pool)
            .await?;

        self.manifests.update(
            &doc.sha256,
            serde_json::json!({
                "indexing": {
                    "keyword_pages": keyword_pages,
                    "vector_pages": vector_pages,
                },
                "timestamps": { "indexed_at": now_iso() },
            }),
        )?;

        tracing::info!(
            doc_id = doc.id,
            keyword_pages,
            vector_pages,
            "indexing complete"
        );

        Ok(IndexResult {
            doc_id: doc.id,
            pages_indexed: keyword_pages,
            vector_pages,
        })
    }

    /// Delete-then-insert inside one transaction, the only safe "upsert" an
    /// FTS5 table offers.
    async fn replace_keyword_rows(&self, doc_id: i64, pages: &[Page]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pages_fts WHERE document_id = ?")
            .bind(doc_id)
            .execute(&mut *tx)
            .await?;

        let mut inserted = 0usize;
        for page in pages {
            if page.extraction_error {
                continue;
            }
            sqlx::query("INSERT INTO pages_fts (document_id, page_number, text) VALUES (?, ?, ?)")
                .bind(doc_id)
                .bind(page.page_number)
                .bind(&page.text)
                .execute(&mut *tx)
                .await?;
            inserted += 1;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Embeds pages in batches, skipping rows whose stored hash matches the
    /// current text under the current model. Returns the total vector rows
    /// held for the document afterwards.
    async fn embed_pages(
        &self,
        doc: &Document,
        pages: &[Page],
        cancel: &CancellationToken,
    ) -> Result<usize> {
        let model = self.embedder.model_name().to_string();

        let existing: Vec<(i64, String, String)> =
            sqlx::query("SELECT page_number, text_hash, model FROM page_vectors WHERE document_id = ?")
                .bind(doc.id)
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(|row| {
                    (
                        row.get::<i64, _>("page_number"),
                        row.get::<String, _>("text_hash"),
                        row.get::<String, _>("model"),
                    )
                })
                .collect();

        let mut todo: Vec<(&Page, String)> = Vec::new();
        for page in pages {
            if page.extraction_error || page.text.trim().is_empty() {
                continue;
            }
            let hash = text_hash(&page.text);
            let current = existing.iter().any(|(n, h, m)| {
                *n == page.page_number && *h == hash && *m == model
            });
            if !current {
                todo.push((page, hash));
            }
        }

        let total = todo.len();
        let mut done = 0usize;

        for batch in todo.chunks(self.config.batch_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let texts: Vec<String> = batch.iter().map(|(p, _)| p.text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(PipelineError::UpstreamUnavailable {
                    service: "embeddings",
                    reason: format!(
                        "expected {} vectors, got {}",
                        batch.len(),
                        vectors.len()
                    ),
                });
            }

            for ((page, hash), vector) in batch.iter().zip(vectors) {
                sqlx::query(
                    r#"
                    INSERT INTO page_vectors
                        (document_id, page_number, model, dims, text_hash, embedding)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(document_id, page_number) DO UPDATE SET
                        model = excluded.model,
                        dims = excluded.dims,
                        text_hash = excluded.text_hash,
                        embedding = excluded.embedding
                    "#,
                )
                .bind(doc.id)
                .bind(page.page_number)
                .bind(&model)
                .bind(vector.len() as i64)
                .bind(hash)
                .bind(vec_to_blob(&vector))
                .execute(&self.pool)
                .await?;
            }

            done += batch.len();
            self.progress.report(&StageEvent::EmbeddingBatch {
                doc_id: doc.id,
                done,
                total,
            });
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM page_vectors WHERE document_id = ?")
            .bind(doc.id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_hash_is_stable_and_content_sensitive() {
        let a = text_hash("the witness testified");
        let b = text_hash("the witness testified");
        let c = text_hash("the witness recanted");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
