//! Core data model shared across the pipeline: documents, pages, passages,
//! and the result types returned by each stage.

use serde::{Deserialize, Serialize};

// ============ Enumerations ============

/// Where a document came from. Stored as a kebab-case string in the
/// `documents.source_system` column and in manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceSystem {
    AppUpload,
    EvidenceIndexer,
    ExternalLibrary,
}

impl SourceSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSystem::AppUpload => "app-upload",
            SourceSystem::EvidenceIndexer => "evidence-indexer",
            SourceSystem::ExternalLibrary => "external-library",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "app-upload" => Some(SourceSystem::AppUpload),
            "evidence-indexer" => Some(SourceSystem::EvidenceIndexer),
            "external-library" => Some(SourceSystem::ExternalLibrary),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a document. The only backward transition is
/// re-extraction, which moves an indexed document to `Extracted` because its
/// index rows are purged in the same transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentState {
    Ingested,
    Extracted,
    Indexed,
}

impl DocumentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentState::Ingested => "ingested",
            DocumentState::Extracted => "extracted",
            DocumentState::Indexed => "indexed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ingested" => Some(DocumentState::Ingested),
            "extracted" => Some(DocumentState::Extracted),
            "indexed" => Some(DocumentState::Indexed),
            _ => None,
        }
    }
}

impl std::fmt::Display for DocumentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a page's text was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    Native,
    Ocr,
}

impl ExtractionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionMethod::Native => "native",
            ExtractionMethod::Ocr => "ocr",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "native" => Some(ExtractionMethod::Native),
            "ocr" => Some(ExtractionMethod::Ocr),
            _ => None,
        }
    }
}

/// Retrieval strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveMethod {
    Keyword,
    Semantic,
    Hybrid,
}

impl RetrieveMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrieveMethod::Keyword => "keyword",
            RetrieveMethod::Semantic => "semantic",
            RetrieveMethod::Hybrid => "hybrid",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keyword" => Some(RetrieveMethod::Keyword),
            "semantic" => Some(RetrieveMethod::Semantic),
            "hybrid" => Some(RetrieveMethod::Hybrid),
            _ => None,
        }
    }
}

// ============ Rows ============

/// A row in `documents`. One per unique content hash.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: i64,
    pub sha256: String,
    /// Filename recorded at first ingest; later duplicates do not change it.
    pub filename: String,
    pub size_bytes: i64,
    pub source_system: SourceSystem,
    pub metadata: serde_json::Value,
    pub state: DocumentState,
    pub ingested_at: i64,
    pub extracted_at: Option<i64>,
    pub indexed_at: Option<i64>,
}

/// A row in `pages`. Page numbers are 1-based and unique per document.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub document_id: i64,
    pub page_number: i64,
    pub text: String,
    pub method: ExtractionMethod,
    /// True when this page's extraction failed; `text` is empty in that case.
    pub extraction_error: bool,
}

// ============ Stage results ============

/// Outcome of `ingest`. Duplicates are reported, never errored.
#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub doc_id: i64,
    pub sha256: String,
    pub size_bytes: u64,
    /// True when the content hash was already known; nothing was written.
    pub is_duplicate: bool,
}

/// What the text-layer heuristic saw when it sampled a document.
#[derive(Debug, Clone, Serialize)]
pub struct TextLayerReport {
    pub sampled_pages: usize,
    pub avg_chars_per_page: f64,
    pub threshold: usize,
    pub has_text_layer: bool,
}

/// Outcome of `extract`.
#[derive(Debug, Clone, Serialize)]
pub struct ExtractResult {
    pub doc_id: i64,
    pub method: ExtractionMethod,
    pub pages: usize,
    pub pages_with_errors: usize,
    pub ocr_triggered: bool,
}

/// Outcome of `index`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexResult {
    pub doc_id: i64,
    /// Pages inserted into the keyword index (error pages are skipped).
    pub pages_indexed: usize,
    /// Pages with a stored embedding after this run; zero when vectors were
    /// not requested.
    pub vector_pages: usize,
}

/// A citation-grade retrieval hit. `snippet` is byte-for-byte equal to
/// `page_text[start..end]` of the stored page it points into.
#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    pub doc_id: i64,
    pub page_number: i64,
    /// Byte offset of the snippet start within the page text.
    pub start: usize,
    /// Byte offset one past the snippet end.
    pub end: usize,
    pub snippet: String,
    /// Method-relative relevance: negated BM25 for keyword, cosine for
    /// semantic, fused reciprocal-rank score for hybrid.
    pub score: f64,
    pub filename: String,
    pub source_system: SourceSystem,
}

/// Outcome of `retrieve`.
#[derive(Debug, Clone, Serialize)]
pub struct RetrieveResult {
    pub passages: Vec<Passage>,
    /// Candidates that matched the query and filters before the `top_k` cut.
    pub total_matches: usize,
}

/// A cached authority record keyed by normalized citation + source.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorityRecord {
    pub citation_key: String,
    pub source: String,
    /// Every raw citation string that has resolved to this key.
    pub raw_citations: Vec<String>,
    pub payload: serde_json::Value,
    pub fetched_at: i64,
    pub ttl_secs: i64,
}

impl AuthorityRecord {
    /// A record is fresh while `now` is inside its TTL window.
    pub fn is_fresh(&self, now: i64) -> bool {
        now < self.fetched_at + self.ttl_secs
    }
}

/// Outcome of `sync`: pull from an external system plus the stages that ran.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub external_id: String,
    pub ingest: IngestResult,
    pub extracted: bool,
    pub indexed: bool,
}
