//! Pipeline assembly and the stable operation surface.
//!
//! [`Pipeline::open`] builds the whole dependency graph up front, leaves
//! first: pool, then store and manifests, then the stage services that share
//! them. Nothing is constructed lazily and nothing lives in a global;
//! callers hold the `Pipeline` and pass it by reference. Collaborator ports
//! (OCR, embeddings, authority, completion, progress) default to their
//! config-selected providers and can each be overridden on the builder,
//! which is how tests substitute deterministic fakes.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;

use crate::adapters::DocumentSource;
use crate::analyze::{AnalysisMode, AnalyzeResult, Analyzer, CompletionProvider};
use crate::authority::{AuthorityCache, AuthoritySource};
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::{PipelineError, Result};
use crate::extract::Extractor;
use crate::index::Indexer;
use crate::manifest::{Manifest, ManifestStore};
use crate::models::{
    AuthorityRecord, Document, DocumentState, ExtractResult, IndexResult, IngestResult, Page,
    Passage, RetrieveMethod, RetrieveResult, SourceSystem, SyncResult,
};
use crate::ocr::OcrProvider;
use crate::progress::{NoProgress, ProgressReporter};
use crate::search::Retriever;
use crate::store::{Store, StoreStats};
use crate::{analyze, authority, db, embedding, migrate, ocr};

pub struct PipelineBuilder {
    config: Config,
    ocr: Option<Arc<dyn OcrProvider>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    authority_source: Option<Arc<dyn AuthoritySource>>,
    completion: Option<Arc<dyn CompletionProvider>>,
    progress: Option<Arc<dyn ProgressReporter>>,
}

impl PipelineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            ocr: None,
            embedder: None,
            authority_source: None,
            completion: None,
            progress: None,
        }
    }

    pub fn with_ocr(mut self, ocr: Arc<dyn OcrProvider>) -> Self {
        self.ocr = Some(ocr);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_authority_source(mut self, source: Arc<dyn AuthoritySource>) -> Self {
        self.authority_source = Some(source);
        self
    }

    pub fn with_completion(mut self, completion: Arc<dyn CompletionProvider>) -> Self {
        self.completion = Some(completion);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Connect, migrate, and construct every service. Misconfiguration
    /// (unknown provider names, missing API keys) fails here, not at first
    /// use.
    pub async fn open(self) -> Result<Pipeline> {
        let pool = db::connect(&self.config).await?;
        migrate::run(&pool).await?;

        let manifests = ManifestStore::new(&self.config.storage.manifest_root)?;
        let store = Store::new(pool.clone(), &self.config.storage, manifests.clone())?;

        let progress = self.progress.unwrap_or_else(|| Arc::new(NoProgress));

        // An injected collaborator counts as enabled even when the config
        // section says disabled; config gates only the default providers.
        let embedding_enabled = self.embedder.is_some() || self.config.embedding.is_enabled();

        let ocr = match self.ocr {
            Some(provider) => provider,
            None => ocr::create_provider(&self.config.ocr)?,
        };
        let embedder = match self.embedder {
            Some(provider) => provider,
            None => embedding::create_provider(&self.config.embedding)?,
        };
        let authority_source = match self.authority_source {
            Some(source) => source,
            None => authority::create_source(&self.config.authority)?,
        };
        let completion = match self.completion {
            Some(provider) => provider,
            None => analyze::create_provider(&self.config.analysis)?,
        };

        let extractor = Extractor::new(
            pool.clone(),
            self.config.storage.root.clone(),
            manifests.clone(),
            ocr,
            self.config.extraction.clone(),
            progress.clone(),
        );
        let indexer = Indexer::new(
            pool.clone(),
            manifests.clone(),
            embedder.clone(),
            embedding_enabled,
            self.config.embedding.clone(),
            progress.clone(),
        );
        let retriever = Retriever::new(
            pool.clone(),
            embedder,
            embedding_enabled,
            self.config.retrieval.clone(),
        );
        let authorities = AuthorityCache::new(
            pool.clone(),
            authority_source,
            self.config.authority.ttl_secs,
        );
        let analyzer = Analyzer::new(completion);

        Ok(Pipeline {
            config: self.config,
            pool,
            store,
            manifests,
            extractor,
            indexer,
            retriever,
            authorities,
            analyzer,
            embedding_enabled,
        })
    }
}

pub struct Pipeline {
    config: Config,
    pool: SqlitePool,
    store: Store,
    manifests: ManifestStore,
    extractor: Extractor,
    indexer: Indexer,
    retriever: Retriever,
    authorities: AuthorityCache,
    analyzer: Analyzer,
    embedding_enabled: bool,
}

impl Pipeline {
    pub fn builder(config: Config) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Open with the config-selected providers.
    pub async fn open(config: Config) -> Result<Pipeline> {
        Self::builder(config).open().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ============ Ingest ============

    pub async fn ingest_path(
        &self,
        path: &Path,
        source: SourceSystem,
        metadata: serde_json::Value,
    ) -> Result<IngestResult> {
        self.store.ingest_path(path, source, metadata).await
    }

    pub async fn ingest_bytes(
        &self,
        bytes: &[u8],
        filename: &str,
        source: SourceSystem,
        metadata: serde_json::Value,
    ) -> Result<IngestResult> {
        self.store
            .ingest_bytes(bytes, filename, source, metadata)
            .await
    }

    // ============ Extract / Index ============

    pub async fn extract_document(
        &self,
        doc_id: i64,
        cancel: &CancellationToken,
    ) -> Result<ExtractResult> {
        let doc = self.require_document(doc_id).await?;
        let manifest = self.require_manifest(&doc.sha256)?;
        self.extractor.extract(&doc, &manifest, cancel).await
    }

    pub async fn index_document(
        &self,
        doc_id: i64,
        enable_vector: bool,
        cancel: &CancellationToken,
    ) -> Result<IndexResult> {
        let doc = self.require_document(doc_id).await?;
        let pages = self.store.get_pages(doc_id).await?;
        self.indexer.index(&doc, &pages, enable_vector, cancel).await
    }

    // ============ Retrieve / Analyze ============

    pub async fn retrieve(
        &self,
        query: &str,
        filters: &HashMap<String, String>,
        top_k: Option<usize>,
        method: RetrieveMethod,
    ) -> Result<RetrieveResult> {
        self.retriever.retrieve(query, filters, top_k, method).await
    }

    /// Analyze a question against passages. `context: None` retrieves
    /// `analysis.context_top_k` passages first, hybrid when embeddings are
    /// available and keyword-only otherwise.
    pub async fn analyze(
        &self,
        query: &str,
        context: Option<Vec<Passage>>,
        mode: AnalysisMode,
        cancel: &CancellationToken,
    ) -> Result<AnalyzeResult> {
        let passages = match context {
            Some(passages) => passages,
            None => {
                let method = if self.embedding_enabled {
                    RetrieveMethod::Hybrid
                } else {
                    RetrieveMethod::Keyword
                };
                let top_k = self.config.analysis.context_top_k.max(1) as usize;
                self.retriever
                    .retrieve(query, &HashMap::new(), Some(top_k), method)
                    .await?
                    .passages
            }
        };
        self.analyzer.analyze(query, &passages, mode, cancel).await
    }

    // ============ Authorities ============

    pub async fn lookup_authority(&self, citation: &str) -> Result<Option<AuthorityRecord>> {
        self.authorities.lookup(citation).await
    }

    pub async fn bulk_lookup_authorities(
        &self,
        citations: &[String],
    ) -> Result<HashMap<String, Option<AuthorityRecord>>> {
        self.authorities.bulk_lookup(citations).await
    }

    // ============ External sync ============

    /// Pull one document from an external source and run it through the
    /// pipeline, resuming from whatever state its content already reached.
    /// Re-syncing unchanged content is a no-op beyond the duplicate check.
    pub async fn sync_external(
        &self,
        source: &dyn DocumentSource,
        external_id: &str,
        enable_vector: bool,
        cancel: &CancellationToken,
    ) -> Result<SyncResult> {
        let record = source.fetch(external_id).await?;
        let ingest = self
            .store
            .ingest_bytes(
                &record.bytes,
                &record.filename,
                source.system(),
                record.metadata,
            )
            .await?;

        let doc = self.require_document(ingest.doc_id).await?;
        let mut extracted = false;
        let mut indexed = false;

        if doc.state == DocumentState::Ingested {
            let manifest = self.require_manifest(&doc.sha256)?;
            self.extractor.extract(&doc, &manifest, cancel).await?;
            extracted = true;
        }

        if extracted || doc.state == DocumentState::Extracted {
            let doc = self.require_document(ingest.doc_id).await?;
            let pages = self.store.get_pages(doc.id).await?;
            self.indexer.index(&doc, &pages, enable_vector, cancel).await?;
            indexed = true;
        }

        tracing::info!(
            external_id,
            source = source.system().as_str(),
            doc_id = ingest.doc_id,
            duplicate = ingest.is_duplicate,
            extracted,
            indexed,
            "external sync complete"
        );

        Ok(SyncResult {
            external_id: external_id.to_string(),
            ingest,
            extracted,
            indexed,
        })
    }

    // ============ Read side ============

    pub async fn get_document(&self, doc_id: i64) -> Result<Option<Document>> {
        self.store.get_document(doc_id).await
    }

    pub async fn get_document_by_hash(&self, sha256: &str) -> Result<Option<Document>> {
        self.store.get_document_by_hash(sha256).await
    }

    pub async fn get_pages(&self, doc_id: i64) -> Result<Vec<Page>> {
        self.store.get_pages(doc_id).await
    }

    pub fn get_manifest(&self, sha256: &str) -> Result<Option<Manifest>> {
        self.manifests.get(sha256)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn require_document(&self, doc_id: i64) -> Result<Document> {
        self.store
            .get_document(doc_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("document {}", doc_id)))
    }

    fn require_manifest(&self, sha256: &str) -> Result<Manifest> {
        self.manifests
            .get(sha256)?
            .ok_or_else(|| PipelineError::NotFound(format!("manifest for {}", sha256)))
    }
}
