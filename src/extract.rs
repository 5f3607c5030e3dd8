//! Page-level text extraction with a scanned-document fallback.
//!
//! Extraction never trusts a PDF to carry a text layer: the native pass runs
//! first, a sampled character-density probe decides whether the result looks
//! like real text, and scanned PDFs fall through to the OCR engine. The
//! probe samples the first few pages plus evenly-spaced pages further in, so
//! a long scan with a typed cover sheet is still detected.
//!
//! A page whose extraction fails is stored with empty text and an error flag;
//! only a document that is unreadable end-to-end fails the stage. All rows
//! for a document land in one transaction, together with the purge of any
//! stale index rows, so re-extraction atomically supersedes the old page set.

use sqlx::SqlitePool;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::ExtractionConfig;
use crate::error::{PipelineError, Result};
use crate::manifest::{now_iso, Manifest, ManifestStore};
use crate::models::{Document, ExtractResult, ExtractionMethod, TextLayerReport};
use crate::ocr::OcrProvider;
use crate::progress::{ProgressReporter, StageEvent};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileKind {
    Pdf,
    Docx,
    Text,
}

struct PageRecord {
    number: usize,
    text: String,
    error: bool,
}

pub struct Extractor {
    pool: SqlitePool,
    storage_root: PathBuf,
    manifests: ManifestStore,
    ocr: Arc<dyn OcrProvider>,
    config: ExtractionConfig,
    progress: Arc<dyn ProgressReporter>,
}

impl Extractor {
    pub fn new(
        pool: SqlitePool,
        storage_root: PathBuf,
        manifests: ManifestStore,
        ocr: Arc<dyn OcrProvider>,
        config: ExtractionConfig,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            pool,
            storage_root,
            manifests,
            ocr,
            config,
            progress,
        }
    }

    /// Extracts every page of `doc` and replaces its stored page set.
    pub async fn extract(
        &self,
        doc: &Document,
        manifest: &Manifest,
        cancel: &CancellationToken,
    ) -> Result<ExtractResult> {
        self.progress.report(&StageEvent::Started {
            stage: "extract",
            doc_id: doc.id,
        });

        let original = self.storage_root.join(&manifest.original.path);
        let bytes = std::fs::read(&original).map_err(|e| {
            PipelineError::ExtractionFatal(format!("{}: {}", original.display(), e))
        })?;

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let kind = detect_kind(&manifest.original.path, &bytes)?;
        let native = native_pages(kind, &bytes);

        let report = match &native {
            Ok(pages) => detect_text_layer(pages, &self.config),
            // Unreadable native pass counts as "no text layer" so a damaged
            // but scannable PDF still reaches OCR.
            Err(_) => TextLayerReport {
                sampled_pages: 0,
                avg_chars_per_page: 0.0,
                threshold: self.config.text_layer_min_chars_per_page,
                has_text_layer: false,
            },
        };

        let (method, raw_pages): (ExtractionMethod, Vec<Option<String>>) = match native {
            Ok(pages) if report.has_text_layer => {
                (ExtractionMethod::Native, pages.into_iter().map(Some).collect())
            }
            _ if kind == FileKind::Pdf => {
                self.progress.report(&StageEvent::OcrFallback { doc_id: doc.id });
                tracing::info!(
                    doc_id = doc.id,
                    avg_chars = report.avg_chars_per_page,
                    "no text layer, falling back to ocr"
                );
                let recognized = tokio::select! {
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    res = self.ocr.recognize(&bytes, &manifest.original.filename) => res?,
                };
                (ExtractionMethod::Ocr, recognized)
            }
            // Only PDFs can be scanned images; other formats either read
            // natively (even if short) or are unreadable outright.
            Ok(pages) => (ExtractionMethod::Native, pages.into_iter().map(Some).collect()),
            Err(e) => return Err(PipelineError::ExtractionFatal(e)),
        };

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let pages: Vec<PageRecord> = raw_pages
            .into_iter()
            .enumerate()
            .map(|(i, text)| match text {
                Some(text) => PageRecord {
                    number: i + 1,
                    text,
                    error: false,
                },
                None => PageRecord {
                    number: i + 1,
                    text: String::new(),
                    error: true,
                },
            })
            .collect();
        let pages_with_errors = pages.iter().filter(|p| p.error).count();

        let (artifact_dir, artifact_files) = self.write_page_artifacts(&doc.sha256, "pages", &pages)?;
        // OCR output is kept as its own artifact set, separate from the
        // canonical page cache.
        let ocr_artifacts = if method == ExtractionMethod::Ocr {
            Some(self.write_page_artifacts(&doc.sha256, "ocr", &pages)?)
        } else {
            None
        };
        self.progress.report(&StageEvent::PagesWritten {
            doc_id: doc.id,
            pages: pages.len(),
        });

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pages WHERE document_id = ?")
            .bind(doc.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM pages_fts WHERE document_id = ?")
            .bind(doc.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM page_vectors WHERE document_id = ?")
            .bind(doc.id)
            .execute(&mut *tx)
            .await?;
        for page in &pages {
            sqlx::query(
                "INSERT INTO pages (document_id, page_number, text, method, extraction_error, char_count)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(doc.id)
            .bind(page.number as i64)
            .bind(&page.text)
            .bind(method.as_str())
            .bind(page.error)
            .bind(page.text.chars().count() as i64)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "UPDATE documents SET state = 'extracted', extracted_at = ?, indexed_at = NULL
             WHERE id = ?",
        )
        .bind(now)
        .bind(doc.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut processed = serde_json::json!({
            "pages": { "path": artifact_dir, "files": artifact_files },
        });
        if let Some((ocr_dir, ocr_files)) = &ocr_artifacts {
            processed["ocr"] = serde_json::json!({ "path": ocr_dir, "files": ocr_files });
        }
        self.manifests.update(
            &doc.sha256,
            serde_json::json!({
                "extraction": {
                    "method": method.as_str(),
                    "pages": pages.len(),
                    "pages_with_errors": pages_with_errors,
                    "ocr_triggered": method == ExtractionMethod::Ocr,
                    "sampled_pages": report.sampled_pages,
                    "avg_chars_per_page": report.avg_chars_per_page,
                },
                "processed": processed,
                "timestamps": { "extracted_at": now_iso() },
            }),
        )?;

        tracing::info!(
            doc_id = doc.id,
            method = method.as_str(),
            pages = pages.len(),
            errors = pages_with_errors,
            "extraction complete"
        );

        Ok(ExtractResult {
            doc_id: doc.id,
            method,
            pages: pages.len(),
            pages_with_errors,
            ocr_triggered: method == ExtractionMethod::Ocr,
        })
    }

    /// One plain-text file per page under `processed/{sha256}/{subdir}/`.
    /// Any previous run's directory is replaced wholesale.
    fn write_page_artifacts(
        &self,
        sha256: &str,
        subdir: &str,
        pages: &[PageRecord],
    ) -> Result<(String, usize)> {
        let rel_dir = format!("processed/{}/{}", sha256, subdir);
        let dir = self.storage_root.join(&rel_dir);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        std::fs::create_dir_all(&dir)?;
        for page in pages {
            std::fs::write(dir.join(format!("{:04}.txt", page.number)), page.text.as_bytes())?;
        }
        Ok((rel_dir, pages.len()))
    }
}

// ============ Format Detection ============

/// Extension first, magic bytes as fallback for opaque names.
fn detect_kind(stored_path: &str, bytes: &[u8]) -> Result<FileKind> {
    let ext = std::path::Path::new(stored_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => return Ok(FileKind::Pdf),
        "docx" => return Ok(FileKind::Docx),
        "txt" | "text" | "md" => return Ok(FileKind::Text),
        _ => {}
    }
    if bytes.starts_with(b"%PDF-") {
        return Ok(FileKind::Pdf);
    }
    if bytes.starts_with(b"PK\x03\x04") {
        return Ok(FileKind::Docx);
    }
    if std::str::from_utf8(bytes).is_ok() {
        return Ok(FileKind::Text);
    }
    Err(PipelineError::ExtractionFatal(format!(
        "unsupported file type: {}",
        stored_path
    )))
}

/// Native extraction, one string per page. Errors are strings because the
/// caller may still route the document to OCR.
fn native_pages(kind: FileKind, bytes: &[u8]) -> std::result::Result<Vec<String>, String> {
    match kind {
        FileKind::Pdf => {
            pdf_extract::extract_text_from_mem_by_pages(bytes).map_err(|e| e.to_string())
        }
        // DOCX has no page geometry until rendered; the whole body is one page.
        FileKind::Docx => docx_text(bytes).map(|t| vec![t]),
        FileKind::Text => Ok(split_text_pages(&String::from_utf8_lossy(bytes))),
    }
}

/// Plain text paginates on form feeds.
pub(crate) fn split_text_pages(text: &str) -> Vec<String> {
    text.split('\u{000C}').map(|s| s.to_string()).collect()
}

fn docx_text(bytes: &[u8]) -> std::result::Result<String, String> {
    let mut archive =
        zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| e.to_string())?;
    let mut doc_xml = Vec::new();
    {
        let entry = archive
            .by_name("word/document.xml")
            .map_err(|e| e.to_string())?;
        entry
            .take(MAX_XML_ENTRY_BYTES)
            .read_to_end(&mut doc_xml)
            .map_err(|e| e.to_string())?;
        if doc_xml.len() as u64 >= MAX_XML_ENTRY_BYTES {
            return Err("word/document.xml exceeds size limit".to_string());
        }
    }
    docx_paragraph_text(&doc_xml)
}

/// Pulls `<w:t>` runs and breaks lines at paragraph ends.
fn docx_paragraph_text(xml: &[u8]) -> std::result::Result<String, String> {
    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    if let Ok(quick_xml::events::Event::Text(te)) = reader.read_event_into(&mut buf)
                    {
                        out.push_str(te.unescape().unwrap_or_default().as_ref());
                    }
                }
            }
            Ok(quick_xml::events::Event::End(e)) => {
                if e.local_name().as_ref() == b"p" && !out.is_empty() && !out.ends_with('\n') {
                    out.push('\n');
                }
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ Text-Layer Probe ============

/// Indices sampled by the probe: the first `head` pages plus `spread` pages
/// spaced evenly through the remainder.
pub(crate) fn sample_indices(page_count: usize, head: usize, spread: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..page_count.min(head)).collect();
    if page_count > head && spread > 0 {
        let span = page_count - head;
        for i in 0..spread {
            let offset = (span * (i + 1)) / (spread + 1);
            indices.push(head + offset.min(span - 1));
        }
    }
    indices.sort_unstable();
    indices.dedup();
    indices
}

/// Average trimmed character count over the sampled pages, compared against
/// the configured per-page threshold.
pub(crate) fn detect_text_layer(pages: &[String], config: &ExtractionConfig) -> TextLayerReport {
    let threshold = config.text_layer_min_chars_per_page;
    let indices = sample_indices(
        pages.len(),
        config.sample_head_pages,
        config.sample_spread_pages,
    );
    if indices.is_empty() {
        return TextLayerReport {
            sampled_pages: 0,
            avg_chars_per_page: 0.0,
            threshold,
            has_text_layer: false,
        };
    }
    let total: usize = indices
        .iter()
        .map(|&i| pages[i].trim().chars().count())
        .sum();
    let avg = total as f64 / indices.len() as f64;
    TextLayerReport {
        sampled_pages: indices.len(),
        avg_chars_per_page: avg,
        threshold,
        has_text_layer: avg >= threshold as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_config() -> ExtractionConfig {
        ExtractionConfig {
            text_layer_min_chars_per_page: 50,
            sample_head_pages: 3,
            sample_spread_pages: 3,
        }
    }

    #[test]
    fn sample_indices_covers_short_documents_entirely() {
        assert_eq!(sample_indices(1, 3, 3), vec![0]);
        assert_eq!(sample_indices(3, 3, 3), vec![0, 1, 2]);
    }

    #[test]
    fn sample_indices_spreads_through_long_documents() {
        let indices = sample_indices(100, 3, 3);
        assert_eq!(indices.len(), 6);
        assert_eq!(&indices[..3], &[0, 1, 2]);
        // Spread picks land in the tail, not bunched at the front.
        assert!(indices[3] > 10);
        assert!(indices[5] > indices[4]);
        assert!(*indices.last().unwrap() < 100);
    }

    #[test]
    fn detect_text_layer_accepts_typed_pages() {
        let page = "This memorandum addresses the admissibility of the exhibit. ".repeat(3);
        let pages = vec![page; 5];
        let report = detect_text_layer(&pages, &probe_config());
        assert!(report.has_text_layer);
        assert!(report.avg_chars_per_page > 50.0);
    }

    #[test]
    fn detect_text_layer_flags_scanned_pages() {
        // Scanner noise: a few stray characters per page.
        let pages = vec!["  7 ".to_string(); 40];
        let report = detect_text_layer(&pages, &probe_config());
        assert!(!report.has_text_layer);
        assert_eq!(report.sampled_pages, 6);
    }

    #[test]
    fn detect_text_layer_catches_typed_cover_on_scanned_body() {
        // First page typed, the remaining 39 blank. The spread samples must
        // drag the average below the threshold.
        let mut pages = vec!["A full page of real extracted text. ".repeat(10)];
        pages.extend(std::iter::repeat(String::new()).take(39));
        let report = detect_text_layer(&pages, &probe_config());
        assert!(!report.has_text_layer);
    }

    #[test]
    fn split_text_pages_on_form_feed() {
        let pages = split_text_pages("page one\u{000C}page two\u{000C}page three");
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[1], "page two");
        assert_eq!(split_text_pages("no breaks").len(), 1);
    }

    #[test]
    fn detect_kind_prefers_extension_then_magic() {
        assert_eq!(
            detect_kind("originals/ab.pdf", b"junk").unwrap(),
            FileKind::Pdf
        );
        assert_eq!(
            detect_kind("originals/ab.bin", b"%PDF-1.4 rest").unwrap(),
            FileKind::Pdf
        );
        assert_eq!(
            detect_kind("originals/ab.bin", b"PK\x03\x04zip").unwrap(),
            FileKind::Docx
        );
        assert_eq!(
            detect_kind("originals/ab.bin", b"plain words").unwrap(),
            FileKind::Text
        );
        assert!(detect_kind("originals/ab.bin", &[0xFF, 0xFE, 0x00]).is_err());
    }

    #[test]
    fn docx_text_reads_paragraphs() {
        use std::io::Write;
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            let xml = "<?xml version=\"1.0\"?>\
                <w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\">\
                <w:body>\
                <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>\
                <w:p><w:r><w:t>Second paragraph.</w:t></w:r></w:p>\
                </w:body></w:document>";
            zip.write_all(xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        let text = docx_text(&buf).unwrap();
        assert_eq!(text, "First paragraph.\nSecond paragraph.\n");
    }

    #[test]
    fn docx_text_rejects_non_zip_bytes() {
        assert!(docx_text(b"not a zip").is_err());
    }
}
