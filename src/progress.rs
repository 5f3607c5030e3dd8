//! Stage progress reporting.
//!
//! Long stages (OCR of a large scan, embedding a long document) emit
//! observable progress so operators can tell a slow engine from a hung one.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::sync::Arc;

/// A single progress event from an extraction or indexing stage.
#[derive(Clone, Debug)]
pub enum StageEvent {
    Started { stage: &'static str, doc_id: i64 },
    /// The text-layer probe found a scanned document; OCR is running.
    OcrFallback { doc_id: i64 },
    PagesWritten { doc_id: i64, pages: usize },
    EmbeddingBatch { doc_id: i64, done: usize, total: usize },
}

/// Reports stage progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &StageEvent);
}

/// Human-friendly progress: "index doc 12  embedding  64 / 1,024 pages".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: &StageEvent) {
        let line = match event {
            StageEvent::Started { stage, doc_id } => {
                format!("{} doc {}  started\n", stage, doc_id)
            }
            StageEvent::OcrFallback { doc_id } => {
                format!("extract doc {}  no text layer, running ocr...\n", doc_id)
            }
            StageEvent::PagesWritten { doc_id, pages } => {
                format!(
                    "extract doc {}  {} pages written\n",
                    doc_id,
                    format_number(*pages as u64)
                )
            }
            StageEvent::EmbeddingBatch {
                doc_id,
                done,
                total,
            } => {
                format!(
                    "index doc {}  embedding  {} / {} pages\n",
                    doc_id,
                    format_number(*done as u64),
                    format_number(*total as u64)
                )
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: &StageEvent) {
        let obj = match event {
            StageEvent::Started { stage, doc_id } => serde_json::json!({
                "event": "progress",
                "stage": stage,
                "doc_id": doc_id,
                "phase": "started"
            }),
            StageEvent::OcrFallback { doc_id } => serde_json::json!({
                "event": "progress",
                "stage": "extract",
                "doc_id": doc_id,
                "phase": "ocr"
            }),
            StageEvent::PagesWritten { doc_id, pages } => serde_json::json!({
                "event": "progress",
                "stage": "extract",
                "doc_id": doc_id,
                "phase": "pages",
                "pages": pages
            }),
            StageEvent::EmbeddingBatch {
                doc_id,
                done,
                total,
            } => serde_json::json!({
                "event": "progress",
                "stage": "index",
                "doc_id": doc_id,
                "phase": "embedding",
                "n": done,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &StageEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "off" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Build a reporter for this mode; the pipeline builder takes it.
    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}
