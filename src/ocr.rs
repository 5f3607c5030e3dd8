//! OCR provider abstraction.
//!
//! Scanned documents are sent whole to a remote OCR engine which returns one
//! text entry per page. A `null` entry means the engine gave up on that page;
//! the extractor records such pages with an error flag instead of failing the
//! document. Engine-level failures (network, HTTP errors after retries)
//! surface as [`PipelineError::UpstreamUnavailable`].

use async_trait::async_trait;
use base64::Engine as _;
use std::sync::Arc;
use std::time::Duration;

use crate::config::OcrConfig;
use crate::error::{PipelineError, Result};

#[async_trait]
pub trait OcrProvider: Send + Sync {
    fn engine_name(&self) -> &str;
    /// Recognize every page of `bytes`. `None` entries are pages the engine
    /// could not read.
    async fn recognize(&self, bytes: &[u8], filename: &str) -> Result<Vec<Option<String>>>;
}

/// Used when `ocr.provider = "disabled"`. Recognition attempts fail, which
/// the extractor reports as the engine being unavailable for scanned input.
pub struct DisabledOcr;

#[async_trait]
impl OcrProvider for DisabledOcr {
    fn engine_name(&self) -> &str {
        "disabled"
    }
    async fn recognize(&self, _bytes: &[u8], _filename: &str) -> Result<Vec<Option<String>>> {
        Err(PipelineError::UpstreamUnavailable {
            service: "ocr",
            reason: "ocr provider is disabled".to_string(),
        })
    }
}

/// Remote OCR engine speaking a small JSON protocol:
///
/// ```text
/// POST {endpoint}
/// {"filename": "...", "document": "<base64 bytes>"}
/// → {"pages": ["page one text", null, "page three text"]}
/// ```
///
/// Retries follow the same policy as the embedding provider: 429/5xx and
/// network errors back off and retry, other 4xx fail immediately.
pub struct RemoteOcr {
    endpoint: String,
    timeout_secs: u64,
    max_retries: u32,
}

impl RemoteOcr {
    pub fn new(config: &OcrConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone().ok_or_else(|| {
            PipelineError::InvalidInput("ocr.endpoint required for remote provider".to_string())
        })?;
        Ok(Self {
            endpoint,
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl OcrProvider for RemoteOcr {
    fn engine_name(&self) -> &str {
        "remote"
    }

    async fn recognize(&self, bytes: &[u8], filename: &str) -> Result<Vec<Option<String>>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| ocr_err(format!("client init: {}", e)))?;

        let body = serde_json::json!({
            "filename": filename,
            "document": base64::engine::general_purpose::STANDARD.encode(bytes),
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client.post(&self.endpoint).json(&body).send().await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().await.map_err(|e| ocr_err(e.to_string()))?;
                        return parse_ocr_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(ocr_err(format!("engine error {}: {}", status, body_text)));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(ocr_err(format!("engine error {}: {}", status, body_text)));
                }
                Err(e) => {
                    last_err = Some(ocr_err(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| ocr_err("recognition failed after retries".to_string())))
    }
}

fn ocr_err(reason: String) -> PipelineError {
    PipelineError::UpstreamUnavailable {
        service: "ocr",
        reason,
    }
}

fn parse_ocr_response(json: &serde_json::Value) -> Result<Vec<Option<String>>> {
    let pages = json
        .get("pages")
        .and_then(|p| p.as_array())
        .ok_or_else(|| ocr_err("invalid response: missing pages array".to_string()))?;

    Ok(pages
        .iter()
        .map(|p| p.as_str().map(|s| s.to_string()))
        .collect())
}

pub fn create_provider(config: &OcrConfig) -> Result<Arc<dyn OcrProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledOcr)),
        "remote" => Ok(Arc::new(RemoteOcr::new(config)?)),
        other => Err(PipelineError::InvalidInput(format!(
            "Unknown ocr provider: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_response_keeps_failed_pages_as_none() {
        let json = serde_json::json!({
            "pages": ["first page", null, "third page"]
        });
        let pages = parse_ocr_response(&json).unwrap();
        assert_eq!(pages.len(), 3);
        assert_eq!(pages[0].as_deref(), Some("first page"));
        assert!(pages[1].is_none());
        assert_eq!(pages[2].as_deref(), Some("third page"));
    }

    #[test]
    fn parse_response_without_pages_is_an_engine_error() {
        let json = serde_json::json!({"error": "boom"});
        let err = parse_ocr_response(&json).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UpstreamUnavailable { service: "ocr", .. }
        ));
    }

    #[tokio::test]
    async fn disabled_ocr_refuses_recognition() {
        let err = DisabledOcr.recognize(b"%PDF-", "scan.pdf").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UpstreamUnavailable { service: "ocr", .. }
        ));
    }
}
