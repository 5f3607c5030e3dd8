//! End-to-end pipeline tests.
//!
//! These tests drive the real pipeline (SQLite, content-addressed store,
//! manifests) through the public builder, with every external collaborator
//! replaced by an in-memory fake. Nothing here touches the network.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use docket::adapters::{EvidenceAdapter, LibraryAdapter};
use docket::analyze::{AnalysisMode, CompletionProvider};
use docket::authority::{AuthoritySource, CitationKey};
use docket::config::{Config, EvidenceAdapterConfig, LibraryAdapterConfig};
use docket::embedding::EmbeddingProvider;
use docket::error::{PipelineError, Result};
use docket::models::{DocumentState, ExtractionMethod, RetrieveMethod, SourceSystem};
use docket::ocr::OcrProvider;
use docket::pipeline::Pipeline;

// ─── Fakes ──────────────────────────────────────────────────────────

/// OCR engine that returns a fixed page set and counts invocations.
struct FakeOcr {
    pages: Vec<Option<String>>,
    calls: AtomicUsize,
}

impl FakeOcr {
    fn new(pages: Vec<Option<String>>) -> Self {
        Self {
            pages,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl OcrProvider for FakeOcr {
    fn engine_name(&self) -> &str {
        "fake-ocr"
    }

    async fn recognize(&self, _bytes: &[u8], _filename: &str) -> Result<Vec<Option<String>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.pages.clone())
    }
}

/// Deterministic embedder: letter-frequency vectors, 26 dims. Similar prose
/// lands close together, which is all the fusion tests need.
struct LetterFreqEmbedder;

#[async_trait]
impl EmbeddingProvider for LetterFreqEmbedder {
    fn model_name(&self) -> &str {
        "letter-freq"
    }

    fn dims(&self) -> usize {
        26
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| letter_freq(t)).collect())
    }
}

fn letter_freq(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 26];
    for b in text.bytes() {
        let c = b.to_ascii_lowercase();
        if c.is_ascii_lowercase() {
            v[(c - b'a') as usize] += 1.0;
        }
    }
    v
}

/// Authority source that knows one reporter and counts upstream fetches.
#[derive(Default)]
struct CountingAuthority {
    calls: AtomicUsize,
}

#[async_trait]
impl AuthoritySource for CountingAuthority {
    fn source_name(&self) -> &str {
        "fake-reporter"
    }

    async fn fetch(&self, key: &CitationKey) -> Result<Option<serde_json::Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if key.reporter == "us" {
            Ok(Some(json!({
                "case_name": "Miranda v. Arizona",
                "absolute_url": "/opinion/107252/miranda-v-arizona/",
            })))
        } else {
            Ok(None)
        }
    }
}

/// Completion model that replays a canned response.
struct CannedCompletion {
    response: String,
}

#[async_trait]
impl CompletionProvider for CannedCompletion {
    fn model_name(&self) -> &str {
        "canned"
    }

    async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
        Ok(self.response.clone())
    }
}

// ─── Fixtures ───────────────────────────────────────────────────────

/// Two-page brief; the form feed is the page break.
const BRIEF_TEXT: &str = "The officers initiated a custodial interrogation without providing \
the warnings Miranda requires. The person must be warned prior to any questioning that they \
have the right to remain silent and the right to counsel.\u{000C}\
Page two addresses the admissibility of the seized ledger and whether the exclusionary rule \
reaches statements derived from the unwarned interrogation.";

/// A PDF whose pages carry no text operators at all, as a scanner produces.
/// Page objects are numbered 3..3+n, their empty content streams follow.
fn scanned_pdf(page_count: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut offsets = Vec::new();
    out.extend_from_slice(b"%PDF-1.4\n");

    offsets.push(out.len());
    out.extend_from_slice(b"1 0 obj << /Type /Catalog /Pages 2 0 R >> endobj\n");

    let kids: Vec<String> = (0..page_count).map(|i| format!("{} 0 R", 3 + i)).collect();
    offsets.push(out.len());
    out.extend_from_slice(
        format!(
            "2 0 obj << /Type /Pages /Kids [{}] /Count {} >> endobj\n",
            kids.join(" "),
            page_count
        )
        .as_bytes(),
    );

    for i in 0..page_count {
        offsets.push(out.len());
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Type /Page /Parent 2 0 R /MediaBox [0 0 612 792] /Contents {} 0 R >> endobj\n",
                3 + i,
                3 + page_count + i
            )
            .as_bytes(),
        );
    }
    for i in 0..page_count {
        offsets.push(out.len());
        out.extend_from_slice(
            format!(
                "{} 0 obj << /Length 0 >> stream\nendstream endobj\n",
                3 + page_count + i
            )
            .as_bytes(),
        );
    }

    let xref_start = out.len();
    out.extend_from_slice(format!("xref\n0 {}\n", offsets.len() + 1).as_bytes());
    out.extend_from_slice(format!("{:010} 65535 f \n", 0).as_bytes());
    for offset in &offsets {
        out.extend_from_slice(format!("{:010} 00000 n \n", offset).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "trailer << /Size {} /Root 1 0 R >>\nstartxref\n",
            offsets.len() + 1
        )
        .as_bytes(),
    );
    out.extend_from_slice(format!("{}\n", xref_start).as_bytes());
    out.extend_from_slice(b"%%EOF\n");
    out
}

async fn open_pipeline(tmp: &TempDir) -> Pipeline {
    Pipeline::builder(Config::minimal(tmp.path()))
        .open()
        .await
        .unwrap()
}

fn no_filters() -> HashMap<String, String> {
    HashMap::new()
}

// ─── Ingest ─────────────────────────────────────────────────────────

/// The same bytes ingest once no matter how often or under what name they
/// arrive; the store keeps exactly one original on disk.
#[tokio::test]
async fn ingest_same_content_registers_once() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open_pipeline(&tmp).await;

    let first = pipeline
        .ingest_bytes(
            BRIEF_TEXT.as_bytes(),
            "brief.txt",
            SourceSystem::AppUpload,
            json!({"matter": "smith-v-jones"}),
        )
        .await
        .unwrap();
    assert!(!first.is_duplicate);

    let second = pipeline
        .ingest_bytes(
            BRIEF_TEXT.as_bytes(),
            "copy-of-brief.txt",
            SourceSystem::AppUpload,
            json!({}),
        )
        .await
        .unwrap();
    assert!(second.is_duplicate);
    assert_eq!(second.doc_id, first.doc_id);
    assert_eq!(second.sha256, first.sha256);

    let stats = pipeline.stats().await.unwrap();
    assert_eq!(stats.documents, 1);

    let originals: Vec<_> = std::fs::read_dir(tmp.path().join("store").join("originals"))
        .unwrap()
        .collect();
    assert_eq!(originals.len(), 1);

    // The first ingest owns the name and metadata.
    let doc = pipeline.get_document(first.doc_id).await.unwrap().unwrap();
    assert_eq!(doc.filename, "brief.txt");
    assert_eq!(doc.metadata["matter"], "smith-v-jones");

    pipeline.close().await;
}

/// Zero-byte input is rejected before anything is written.
#[tokio::test]
async fn ingest_rejects_empty_input() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open_pipeline(&tmp).await;

    let err = pipeline
        .ingest_bytes(b"", "empty.txt", SourceSystem::AppUpload, json!({}))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::EmptyOrMissingFile(_)));

    let stats = pipeline.stats().await.unwrap();
    assert_eq!(stats.documents, 0);

    pipeline.close().await;
}

// ─── Stage ordering ─────────────────────────────────────────────────

/// Indexing an un-extracted document is an ordering violation, not a crash.
#[tokio::test]
async fn index_before_extract_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open_pipeline(&tmp).await;
    let cancel = CancellationToken::new();

    let ingest = pipeline
        .ingest_bytes(
            BRIEF_TEXT.as_bytes(),
            "brief.txt",
            SourceSystem::AppUpload,
            json!({}),
        )
        .await
        .unwrap();

    let err = pipeline
        .index_document(ingest.doc_id, false, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::NotExtractedYet(_)));

    pipeline.close().await;
}

/// Retrieval against an empty corpus answers cleanly.
#[tokio::test]
async fn retrieve_on_empty_corpus_returns_nothing() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open_pipeline(&tmp).await;

    let result = pipeline
        .retrieve("custodial interrogation", &no_filters(), None, RetrieveMethod::Keyword)
        .await
        .unwrap();
    assert!(result.passages.is_empty());
    assert_eq!(result.total_matches, 0);

    pipeline.close().await;
}

// ─── Extract / index / retrieve ─────────────────────────────────────

/// The full native path: a form-feed paginated text file becomes passages
/// whose offsets slice the stored page text exactly.
#[tokio::test]
async fn text_document_flows_to_verifiable_passages() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open_pipeline(&tmp).await;
    let cancel = CancellationToken::new();

    let ingest = pipeline
        .ingest_bytes(
            BRIEF_TEXT.as_bytes(),
            "brief.txt",
            SourceSystem::AppUpload,
            json!({"matter": "smith-v-jones"}),
        )
        .await
        .unwrap();

    let extract = pipeline.extract_document(ingest.doc_id, &cancel).await.unwrap();
    assert_eq!(extract.method, ExtractionMethod::Native);
    assert_eq!(extract.pages, 2);
    assert_eq!(extract.pages_with_errors, 0);
    assert!(!extract.ocr_triggered);

    let index = pipeline
        .index_document(ingest.doc_id, false, &cancel)
        .await
        .unwrap();
    assert_eq!(index.pages_indexed, 2);
    assert_eq!(index.vector_pages, 0);

    let doc = pipeline.get_document(ingest.doc_id).await.unwrap().unwrap();
    assert_eq!(doc.state, DocumentState::Indexed);

    // Case-insensitive match; snippet case comes from the page.
    let result = pipeline
        .retrieve("Custodial Interrogation", &no_filters(), None, RetrieveMethod::Keyword)
        .await
        .unwrap();
    assert_eq!(result.total_matches, 1);
    assert_eq!(result.passages.len(), 1);

    let pages = pipeline.get_pages(ingest.doc_id).await.unwrap();
    let hit = &result.passages[0];
    assert_eq!(hit.page_number, 1);
    let page = pages.iter().find(|p| p.page_number == hit.page_number).unwrap();
    assert_eq!(&page.text[hit.start..hit.end], hit.snippet);
    assert!(hit.snippet.contains("custodial interrogation"));

    // Metadata filters narrow without breaking the offset guarantee.
    let scoped = pipeline
        .retrieve(
            "interrogation",
            &HashMap::from([("matter".to_string(), "smith-v-jones".to_string())]),
            None,
            RetrieveMethod::Keyword,
        )
        .await
        .unwrap();
    assert!(!scoped.passages.is_empty());

    let other_matter = pipeline
        .retrieve(
            "interrogation",
            &HashMap::from([("matter".to_string(), "doe-v-roe".to_string())]),
            None,
            RetrieveMethod::Keyword,
        )
        .await
        .unwrap();
    assert!(other_matter.passages.is_empty());

    let stats = pipeline.stats().await.unwrap();
    assert!(stats.by_state.contains(&("indexed".to_string(), 1)));

    pipeline.close().await;
}

/// Re-extraction replaces the page set and demotes the document out of the
/// searchable state until it is indexed again.
#[tokio::test]
async fn reextraction_supersedes_pages_and_demotes_state() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open_pipeline(&tmp).await;
    let cancel = CancellationToken::new();

    let ingest = pipeline
        .ingest_bytes(
            BRIEF_TEXT.as_bytes(),
            "brief.txt",
            SourceSystem::AppUpload,
            json!({}),
        )
        .await
        .unwrap();
    pipeline.extract_document(ingest.doc_id, &cancel).await.unwrap();
    pipeline
        .index_document(ingest.doc_id, false, &cancel)
        .await
        .unwrap();

    pipeline.extract_document(ingest.doc_id, &cancel).await.unwrap();

    let pages = pipeline.get_pages(ingest.doc_id).await.unwrap();
    assert_eq!(pages.len(), 2);

    let doc = pipeline.get_document(ingest.doc_id).await.unwrap().unwrap();
    assert_eq!(doc.state, DocumentState::Extracted);

    // Not searchable until re-indexed.
    let result = pipeline
        .retrieve("interrogation", &no_filters(), None, RetrieveMethod::Keyword)
        .await
        .unwrap();
    assert!(result.passages.is_empty());

    pipeline.close().await;
}

/// A PDF with no text layer routes to OCR; a page the engine cannot read is
/// stored empty with its error flag instead of failing the document.
#[tokio::test]
async fn scanned_pdf_falls_back_to_ocr_with_page_flags() {
    let tmp = TempDir::new().unwrap();
    let ocr = Arc::new(FakeOcr::new(vec![
        Some("Affidavit of service, recognized from page one.".to_string()),
        None,
    ]));
    let pipeline = Pipeline::builder(Config::minimal(tmp.path()))
        .with_ocr(ocr.clone())
        .open()
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let ingest = pipeline
        .ingest_bytes(
            &scanned_pdf(2),
            "scan.pdf",
            SourceSystem::AppUpload,
            json!({}),
        )
        .await
        .unwrap();

    let extract = pipeline.extract_document(ingest.doc_id, &cancel).await.unwrap();
    assert_eq!(extract.method, ExtractionMethod::Ocr);
    assert!(extract.ocr_triggered);
    assert_eq!(extract.pages, 2);
    assert_eq!(extract.pages_with_errors, 1);
    assert_eq!(ocr.calls.load(Ordering::SeqCst), 1);

    let pages = pipeline.get_pages(ingest.doc_id).await.unwrap();
    assert!(pages[0].text.contains("Affidavit"));
    assert!(!pages[0].extraction_error);
    assert!(pages[1].text.is_empty());
    assert!(pages[1].extraction_error);

    pipeline.close().await;
}

// ─── Vector and hybrid retrieval ────────────────────────────────────

/// Semantic search without an embedding provider is a caller error.
#[tokio::test]
async fn semantic_search_requires_an_embedding_provider() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open_pipeline(&tmp).await;

    let err = pipeline
        .retrieve("interrogation", &no_filters(), None, RetrieveMethod::Semantic)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvalidInput(_)));

    pipeline.close().await;
}

/// An embedder injected through the builder enables vector indexing and
/// hybrid retrieval even though the config keeps the provider disabled.
#[tokio::test]
async fn injected_embedder_enables_hybrid_retrieval() {
    let tmp = TempDir::new().unwrap();
    let pipeline = Pipeline::builder(Config::minimal(tmp.path()))
        .with_embedder(Arc::new(LetterFreqEmbedder))
        .open()
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let ingest = pipeline
        .ingest_bytes(
            BRIEF_TEXT.as_bytes(),
            "brief.txt",
            SourceSystem::AppUpload,
            json!({}),
        )
        .await
        .unwrap();
    pipeline.extract_document(ingest.doc_id, &cancel).await.unwrap();
    let index = pipeline
        .index_document(ingest.doc_id, true, &cancel)
        .await
        .unwrap();
    assert_eq!(index.vector_pages, 2);

    let result = pipeline
        .retrieve("custodial interrogation", &no_filters(), None, RetrieveMethod::Hybrid)
        .await
        .unwrap();
    assert!(!result.passages.is_empty());

    // Page one matches both channels, so fusion must rank it first.
    let top = &result.passages[0];
    assert_eq!(top.page_number, 1);

    let pages = pipeline.get_pages(ingest.doc_id).await.unwrap();
    for hit in &result.passages {
        let page = pages.iter().find(|p| p.page_number == hit.page_number).unwrap();
        assert_eq!(&page.text[hit.start..hit.end], hit.snippet);
    }

    pipeline.close().await;
}

// ─── Authority cache ────────────────────────────────────────────────

/// Citation aliases normalize to one key; the second lookup answers from
/// cache and records the new raw variant.
#[tokio::test]
async fn authority_cache_serves_aliases_from_one_fetch() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(CountingAuthority::default());
    let pipeline = Pipeline::builder(Config::minimal(tmp.path()))
        .with_authority_source(source.clone())
        .open()
        .await
        .unwrap();

    let first = pipeline
        .lookup_authority("Miranda v. Arizona, 384 U.S. 436 (1966)")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.citation_key, "384 us 436");
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    let second = pipeline.lookup_authority("384 US 436").await.unwrap().unwrap();
    assert_eq!(second.citation_key, "384 us 436");
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    assert!(second
        .raw_citations
        .iter()
        .any(|c| c == "Miranda v. Arizona, 384 U.S. 436 (1966)"));
    assert!(second.raw_citations.iter().any(|c| c == "384 US 436"));

    pipeline.close().await;
}

/// An expired record is refetched instead of served.
#[tokio::test]
async fn authority_ttl_expiry_triggers_refetch() {
    let tmp = TempDir::new().unwrap();
    let mut config = Config::minimal(tmp.path());
    config.authority.ttl_secs = 0;
    let source = Arc::new(CountingAuthority::default());
    let pipeline = Pipeline::builder(config)
        .with_authority_source(source.clone())
        .open()
        .await
        .unwrap();

    pipeline.lookup_authority("384 U.S. 436").await.unwrap().unwrap();
    pipeline.lookup_authority("384 U.S. 436").await.unwrap().unwrap();
    assert_eq!(source.calls.load(Ordering::SeqCst), 2);

    pipeline.close().await;
}

/// Bulk lookup answers every input; statutes and prose that do not parse as
/// case citations come back as misses without touching the source.
#[tokio::test]
async fn bulk_lookup_skips_unparseable_citations() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(CountingAuthority::default());
    let pipeline = Pipeline::builder(Config::minimal(tmp.path()))
        .with_authority_source(source.clone())
        .open()
        .await
        .unwrap();

    let citations = vec![
        "Miranda v. Arizona, 384 U.S. 436 (1966)".to_string(),
        "384 US 436".to_string(),
        "42 U.S.C. § 1983".to_string(),
    ];
    let results = pipeline.bulk_lookup_authorities(&citations).await.unwrap();

    assert_eq!(results.len(), 3);
    assert!(results["Miranda v. Arizona, 384 U.S. 436 (1966)"].is_some());
    assert!(results["384 US 436"].is_some());
    assert!(results["42 U.S.C. § 1983"].is_none());
    // Both aliases share one cache entry, the statute never parses.
    assert_eq!(source.calls.load(Ordering::SeqCst), 1);

    pipeline.close().await;
}

// ─── External sync ──────────────────────────────────────────────────

/// Library sync runs ingest, extract, and index in one call, and a second
/// sync of the same item resumes into a no-op.
#[tokio::test]
async fn library_sync_runs_full_pipeline_and_resumes() {
    let tmp = TempDir::new().unwrap();
    let lib_root = tmp.path().join("library");
    std::fs::create_dir_all(lib_root.join("briefs")).unwrap();
    std::fs::write(lib_root.join("briefs/motion.txt"), BRIEF_TEXT).unwrap();

    let adapter = LibraryAdapter::new(&LibraryAdapterConfig {
        root: lib_root,
        include_globs: vec!["**/*.txt".to_string()],
    })
    .unwrap();

    let pipeline = open_pipeline(&tmp).await;
    let cancel = CancellationToken::new();

    let sync = pipeline
        .sync_external(&adapter, "briefs/motion.txt", false, &cancel)
        .await
        .unwrap();
    assert!(!sync.ingest.is_duplicate);
    assert!(sync.extracted);
    assert!(sync.indexed);

    let doc = pipeline
        .get_document(sync.ingest.doc_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.state, DocumentState::Indexed);
    assert_eq!(doc.source_system, SourceSystem::ExternalLibrary);
    assert_eq!(doc.filename, "motion.txt");

    let again = pipeline
        .sync_external(&adapter, "briefs/motion.txt", false, &cancel)
        .await
        .unwrap();
    assert!(again.ingest.is_duplicate);
    assert!(!again.extracted);
    assert!(!again.indexed);

    pipeline.close().await;
}

/// Evidence sync merges the item's sidecar metadata into the document, where
/// retrieval filters can reach it.
#[tokio::test]
async fn evidence_sync_merges_sidecar_metadata() {
    let tmp = TempDir::new().unwrap();
    let ev_root = tmp.path().join("evidence");
    let item = ev_root.join("EX-7");
    std::fs::create_dir_all(&item).unwrap();
    std::fs::write(
        item.join("meta.json"),
        r#"{"custodian": "R. Alvarez", "matter": "smith-v-jones"}"#,
    )
    .unwrap();
    std::fs::write(item.join("statement.txt"), BRIEF_TEXT).unwrap();

    let adapter = EvidenceAdapter::new(&EvidenceAdapterConfig { root: ev_root });
    let pipeline = open_pipeline(&tmp).await;
    let cancel = CancellationToken::new();

    let sync = pipeline
        .sync_external(&adapter, "EX-7", false, &cancel)
        .await
        .unwrap();

    let doc = pipeline
        .get_document(sync.ingest.doc_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.source_system, SourceSystem::EvidenceIndexer);
    assert_eq!(doc.filename, "statement.txt");
    assert_eq!(doc.metadata["custodian"], "R. Alvarez");
    assert_eq!(doc.metadata["adapter"], "evidence");
    assert_eq!(doc.metadata["external_id"], "EX-7");

    let scoped = pipeline
        .retrieve(
            "interrogation",
            &HashMap::from([("custodian".to_string(), "R. Alvarez".to_string())]),
            None,
            RetrieveMethod::Keyword,
        )
        .await
        .unwrap();
    assert!(!scoped.passages.is_empty());

    pipeline.close().await;
}

// ─── Cancellation ───────────────────────────────────────────────────

/// A cancelled extraction writes no pages and leaves the document where the
/// previous stage left it.
#[tokio::test]
async fn cancelled_extract_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open_pipeline(&tmp).await;

    let ingest = pipeline
        .ingest_bytes(
            BRIEF_TEXT.as_bytes(),
            "brief.txt",
            SourceSystem::AppUpload,
            json!({}),
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = pipeline
        .extract_document(ingest.doc_id, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled));

    let doc = pipeline.get_document(ingest.doc_id).await.unwrap().unwrap();
    assert_eq!(doc.state, DocumentState::Ingested);
    assert!(pipeline.get_pages(ingest.doc_id).await.unwrap().is_empty());

    pipeline.close().await;
}

// ─── Analysis ───────────────────────────────────────────────────────

/// A grounded answer's quoted citations are verified against the retrieved
/// passages and pinned to byte offsets in the stored page text.
#[tokio::test]
async fn analyze_verifies_quotes_and_locates_them() {
    let tmp = TempDir::new().unwrap();
    let completion = Arc::new(CannedCompletion {
        response: "Before any custodial questioning begins, the suspect must be advised of \
                   the rights the warnings protect.\n\n\
                   CITATIONS:\n\
                   [1] \"the right to remain silent\"\n\
                   [2] \"a phrase that appears nowhere\"\n"
            .to_string(),
    });
    let pipeline = Pipeline::builder(Config::minimal(tmp.path()))
        .with_completion(completion)
        .open()
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let ingest = pipeline
        .ingest_bytes(
            BRIEF_TEXT.as_bytes(),
            "brief.txt",
            SourceSystem::AppUpload,
            json!({}),
        )
        .await
        .unwrap();
    pipeline.extract_document(ingest.doc_id, &cancel).await.unwrap();
    pipeline
        .index_document(ingest.doc_id, false, &cancel)
        .await
        .unwrap();

    let result = pipeline
        .analyze("right to remain silent", None, AnalysisMode::Grounded, &cancel)
        .await
        .unwrap();

    assert!(result.grounded);
    assert!(!result.passages.is_empty());
    assert!(result.answer.contains("custodial questioning"));
    assert!(!result.answer.contains("CITATIONS"));
    assert_eq!(result.citations.len(), 2);

    let verified = &result.citations[0];
    assert_eq!(verified.passage_index, 1);
    assert!(verified.verified);
    let loc = verified.location.as_ref().unwrap();
    let pages = pipeline.get_pages(ingest.doc_id).await.unwrap();
    let page = pages.iter().find(|p| p.page_number == loc.page_number).unwrap();
    assert_eq!(&page.text[loc.start..loc.end], "the right to remain silent");

    // The fabricated quote stays in the output, flagged.
    let flagged = &result.citations[1];
    assert!(!flagged.verified);
    assert!(flagged.location.is_none());

    pipeline.close().await;
}

/// With nothing retrievable, grounded mode degrades to an open answer and
/// says so.
#[tokio::test]
async fn analyze_without_context_degrades_to_open() {
    let tmp = TempDir::new().unwrap();
    let completion = Arc::new(CannedCompletion {
        response: "General background only.".to_string(),
    });
    let pipeline = Pipeline::builder(Config::minimal(tmp.path()))
        .with_completion(completion)
        .open()
        .await
        .unwrap();
    let cancel = CancellationToken::new();

    let result = pipeline
        .analyze("anything at all", None, AnalysisMode::Grounded, &cancel)
        .await
        .unwrap();

    assert!(!result.grounded);
    assert!(result.passages.is_empty());
    assert!(result.citations.is_empty());
    assert_eq!(result.answer, "General background only.");

    pipeline.close().await;
}
