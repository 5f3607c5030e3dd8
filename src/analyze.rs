//! Grounded analysis over retrieved passages.
//!
//! The analyzer hands a numbered set of passages to a completion model and
//! demands a trailing `CITATIONS:` block of `[n] "exact quote"` lines. Every
//! claimed citation is checked against the passage it names: the quote must
//! occur verbatim inside that passage's snippet, which yields absolute page
//! offsets. Claims that fail the check are returned flagged, never silently
//! trusted. Grounded mode with no passages to ground on degrades to an open
//! answer and says so in the result.

use async_trait::async_trait;
use regex::Regex;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::AnalysisConfig;
use crate::error::{PipelineError, Result};
use crate::models::Passage;

// ============ Result types ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisMode {
    Grounded,
    Open,
}

/// One citation claim from the model's `CITATIONS:` block.
#[derive(Debug, Clone)]
pub struct CitationClaim {
    /// 1-based passage number as claimed by the model.
    pub passage_index: usize,
    pub quote: String,
    pub verified: bool,
    /// Absolute page location of the quote; present only when verified.
    pub location: Option<CitationLocation>,
}

#[derive(Debug, Clone)]
pub struct CitationLocation {
    pub doc_id: i64,
    pub page_number: i64,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone)]
pub struct AnalyzeResult {
    pub answer: String,
    pub citations: Vec<CitationClaim>,
    /// Whether the answer was actually grounded in passages.
    pub grounded: bool,
    /// The passages the model was shown, in prompt order.
    pub passages: Vec<Passage>,
}

// ============ Completion provider ============

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    fn model_name(&self) -> &str;
    async fn complete(&self, system: &str, user: &str) -> Result<String>;
}

/// Used when `analysis.provider = "disabled"`.
pub struct DisabledCompletion;

#[async_trait]
impl CompletionProvider for DisabledCompletion {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
        Err(PipelineError::UpstreamUnavailable {
            service: "analysis",
            reason: "analysis provider is disabled".to_string(),
        })
    }
}

pub struct OpenAICompletion {
    model: String,
    max_retries: u32,
    timeout_secs: u64,
}

impl OpenAICompletion {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let model = config.model.clone().ok_or_else(|| {
            PipelineError::InvalidInput("analysis.model required for OpenAI provider".to_string())
        })?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(PipelineError::InvalidInput(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }

        Ok(Self {
            model,
            max_retries: config.max_retries,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl CompletionProvider for OpenAICompletion {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            analysis_err("OPENAI_API_KEY not set".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| analysis_err(format!("client init: {}", e)))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = client
                .post("https://api.openai.com/v1/chat/completions")
                .header("Authorization", format!("Bearer {}", api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| analysis_err(e.to_string()))?;
                        return parse_completion_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(analysis_err(format!(
                            "OpenAI API error {}: {}",
                            status, body_text
                        )));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(analysis_err(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(analysis_err(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| analysis_err("completion failed after retries".into())))
    }
}

fn analysis_err(reason: String) -> PipelineError {
    PipelineError::UpstreamUnavailable {
        service: "analysis",
        reason,
    }
}

fn parse_completion_response(json: &serde_json::Value) -> Result<String> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| analysis_err("invalid response: missing message content".to_string()))
}

pub fn create_provider(config: &AnalysisConfig) -> Result<Arc<dyn CompletionProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledCompletion)),
        "openai" => Ok(Arc::new(OpenAICompletion::new(config)?)),
        other => Err(PipelineError::InvalidInput(format!(
            "Unknown analysis provider: {}",
            other
        ))),
    }
}

// ============ Analyzer ============

pub struct Analyzer {
    completion: Arc<dyn CompletionProvider>,
}

impl Analyzer {
    pub fn new(completion: Arc<dyn CompletionProvider>) -> Self {
        Self { completion }
    }

    pub async fn analyze(
        &self,
        query: &str,
        passages: &[Passage],
        mode: AnalysisMode,
        cancel: &CancellationToken,
    ) -> Result<AnalyzeResult> {
        if query.trim().is_empty() {
            return Err(PipelineError::InvalidInput(
                "analysis query must not be empty".to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let grounded = mode == AnalysisMode::Grounded && !passages.is_empty();
        let (system, user) = if grounded {
            build_grounded_prompt(query, passages)
        } else {
            build_open_prompt(query)
        };

        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            res = self.completion.complete(&system, &user) => res?,
        };

        let (answer, claims) = parse_citation_claims(&raw);
        let citations = validate_citations(&claims, passages);

        tracing::info!(
            model = self.completion.model_name(),
            passages = passages.len(),
            citations = citations.len(),
            unverified = citations.iter().filter(|c| !c.verified).count(),
            grounded,
            "analysis complete"
        );

        Ok(AnalyzeResult {
            answer,
            citations,
            grounded,
            passages: passages.to_vec(),
        })
    }
}

// ============ Prompts ============

fn build_grounded_prompt(query: &str, passages: &[Passage]) -> (String, String) {
    let system = "You are a legal research assistant. Answer strictly from the \
                  numbered source passages; do not rely on outside knowledge. If the \
                  passages do not answer the question, say so. End your reply with a \
                  line reading CITATIONS: followed by one line per passage you relied \
                  on, in the form [n] \"exact quote\", where the quote is copied \
                  verbatim from that passage."
        .to_string();

    let mut user = String::new();
    for (i, p) in passages.iter().enumerate() {
        let _ = writeln!(
            user,
            "[{}] {} (doc {}, page {}, chars {}..{})",
            i + 1,
            p.filename,
            p.doc_id,
            p.page_number,
            p.start,
            p.end
        );
        user.push_str(&p.snippet);
        user.push_str("\n\n");
    }
    let _ = write!(user, "Question: {}", query);

    (system, user)
}

fn build_open_prompt(query: &str) -> (String, String) {
    let system = "You are a legal research assistant. No source documents are \
                  available for this question; answer from general knowledge and say \
                  clearly that the answer is not grounded in the document set."
        .to_string();
    (system, query.to_string())
}

// ============ Citation parsing & validation ============

struct RawClaim {
    index: usize,
    quote: String,
}

/// Splits a completion into the answer text and the claims of its trailing
/// `CITATIONS:` block. A reply without the block is all answer, no claims.
fn parse_citation_claims(raw: &str) -> (String, Vec<RawClaim>) {
    static CLAIM_RE: OnceLock<Regex> = OnceLock::new();
    let re = CLAIM_RE
        .get_or_init(|| Regex::new(r#"^\s*\[(\d+)\]\s*"(.*)"\s*$"#).expect("claim line regex"));

    let marker = raw
        .lines()
        .collect::<Vec<_>>()
        .into_iter()
        .enumerate()
        .rev()
        .find(|(_, line)| line.trim().eq_ignore_ascii_case("citations:"));

    let Some((marker_idx, _)) = marker else {
        return (raw.trim().to_string(), Vec::new());
    };

    let mut answer_lines: Vec<&str> = Vec::new();
    let mut claims = Vec::new();
    for (i, line) in raw.lines().enumerate() {
        if i < marker_idx {
            answer_lines.push(line);
        } else if i > marker_idx {
            if let Some(caps) = re.captures(line) {
                if let Ok(index) = caps[1].parse::<usize>() {
                    claims.push(RawClaim {
                        index,
                        quote: caps[2].to_string(),
                    });
                }
            }
        }
    }

    (answer_lines.join("\n").trim().to_string(), claims)
}

/// A claim verifies only when it names a supplied passage and its quote is a
/// verbatim substring of that passage's snippet. Offsets are absolute within
/// the page: passage start plus the quote's position in the snippet.
fn validate_citations(claims: &[RawClaim], passages: &[Passage]) -> Vec<CitationClaim> {
    claims
        .iter()
        .map(|claim| {
            let passage = claim.index.checked_sub(1).and_then(|i| passages.get(i));
            let location = passage.and_then(|p| {
                if claim.quote.is_empty() {
                    return None;
                }
                p.snippet.find(&claim.quote).map(|pos| CitationLocation {
                    doc_id: p.doc_id,
                    page_number: p.page_number,
                    start: p.start + pos,
                    end: p.start + pos + claim.quote.len(),
                })
            });
            CitationClaim {
                passage_index: claim.index,
                quote: claim.quote.clone(),
                verified: location.is_some(),
                location,
            }
        })
        .collect()
}
