//! Pipeline error taxonomy.
//!
//! Validation and ordering errors surface immediately to the caller; transient
//! upstream failures (OCR, embeddings, authority API, LLM) are typed as
//! [`PipelineError::UpstreamUnavailable`] so the orchestration layer decides
//! retry policy. Page-level extraction failures are data (an
//! `extraction_error` flag on the page), not errors. Duplicate ingest is a
//! success variant (`IngestResult::is_duplicate`), not an error.

use std::fmt;

/// Errors raised by the document pipeline.
#[derive(Debug)]
pub enum PipelineError {
    /// Document, manifest, or page set does not exist.
    NotFound(String),
    /// Ingest-time validation: source unreadable or zero bytes.
    EmptyOrMissingFile(String),
    /// The original is unreadable entirely; extraction cannot proceed.
    ExtractionFatal(String),
    /// Ordering violation: `index` called before `extract` produced pages.
    NotExtractedYet(i64),
    /// Ordering violation: operation requires an indexed document.
    NotIndexedYet(i64),
    /// Caller-supplied input was rejected before any work was attempted.
    InvalidInput(String),
    /// An external collaborator (OCR, embeddings, authority, LLM) failed.
    UpstreamUnavailable {
        service: &'static str,
        reason: String,
    },
    /// The caller's cancellation signal fired; no partial stage was written.
    Cancelled,
    /// Filesystem error against the storage or manifest roots.
    Storage(std::io::Error),
    /// Database error.
    Database(sqlx::Error),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::NotFound(what) => write!(f, "not found: {}", what),
            PipelineError::EmptyOrMissingFile(reason) => {
                write!(f, "empty or missing file: {}", reason)
            }
            PipelineError::ExtractionFatal(reason) => {
                write!(f, "document unreadable: {}", reason)
            }
            PipelineError::NotExtractedYet(doc_id) => {
                write!(f, "document {} has not been extracted yet", doc_id)
            }
            PipelineError::NotIndexedYet(doc_id) => {
                write!(f, "document {} has not been indexed yet", doc_id)
            }
            PipelineError::InvalidInput(reason) => write!(f, "invalid input: {}", reason),
            PipelineError::UpstreamUnavailable { service, reason } => {
                write!(f, "{} unavailable: {}", service, reason)
            }
            PipelineError::Cancelled => write!(f, "operation cancelled"),
            PipelineError::Storage(e) => write!(f, "storage error: {}", e),
            PipelineError::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PipelineError::Storage(e) => Some(e),
            PipelineError::Database(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(e: std::io::Error) -> Self {
        PipelineError::Storage(e)
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Database(e)
    }
}

/// Shorthand used by every service in the pipeline.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_failing_service() {
        let err = PipelineError::UpstreamUnavailable {
            service: "ocr",
            reason: "connection refused".to_string(),
        };
        assert_eq!(err.to_string(), "ocr unavailable: connection refused");
    }

    #[test]
    fn io_errors_convert_to_storage() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: PipelineError = io.into();
        assert!(matches!(err, PipelineError::Storage(_)));
    }
}
