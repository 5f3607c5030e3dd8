//! Citation-authority cache.
//!
//! Citations arrive in whatever shape a lawyer typed: "Miranda v. Arizona,
//! 384 U.S. 436 (1966)" and "384 US 436" name the same authority. Raw
//! strings normalize to a volume/reporter/page key; cached payloads are
//! served within their TTL and refetched past it. An upstream failure
//! degrades the current call to "not found" and is never written to the
//! cache.

use async_trait::async_trait;
use regex::Regex;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use crate::config::AuthorityConfig;
use crate::error::{PipelineError, Result};
use crate::models::AuthorityRecord;

// ============ Citation normalization ============

/// Normalized form of a case-reporter citation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CitationKey {
    pub volume: u32,
    pub reporter: String,
    pub page: u32,
}

impl CitationKey {
    /// Stable cache key, e.g. `384 us 436`.
    pub fn as_key(&self) -> String {
        format!("{} {} {}", self.volume, self.reporter, self.page)
    }
}

/// Extracts the volume/reporter/page triple from a raw citation string.
///
/// Case names preceding the volume and trailing parentheticals drop out;
/// only `NNN <reporter> NNN` is significant. The reporter keeps just its
/// lowercased alphanumerics, so `U.S.`, `US`, and `U. S.` produce the same
/// key. Strings without a reporter triple (statutes with a section sign,
/// docket numbers, prose) return `None`.
pub fn normalize_citation(raw: &str) -> Option<CitationKey> {
    static TRIPLE_RE: OnceLock<Regex> = OnceLock::new();
    let re = TRIPLE_RE.get_or_init(|| {
        // The reporter capture is greedy so digit-bearing reporters keep
        // their tail: "F. Supp. 2d 1130" must yield page 1130, not page 2.
        // Pincites stay safe because ',' is outside the reporter class.
        Regex::new(r"(?:^|\D)(\d{1,4})\s+([A-Za-z][A-Za-z0-9.' ]*)\s+(\d{1,5})(?:\D|$)")
            .expect("citation regex compiles")
    });

    // Parentheticals (court, year) never carry the triple; strip them so
    // "(2d Cir. 1999)" cannot masquerade as a reporter.
    let stripped = strip_parentheticals(raw);
    let caps = re.captures(&stripped)?;

    let volume: u32 = caps[1].parse().ok()?;
    let page: u32 = caps[3].parse().ok()?;
    let reporter: String = caps[2]
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    if reporter.is_empty() {
        return None;
    }

    Some(CitationKey {
        volume,
        reporter,
        page,
    })
}

fn strip_parentheticals(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut depth = 0usize;
    for ch in raw.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(ch),
            _ => {}
        }
    }
    out
}

// ============ Upstream source ============

/// Upstream citation API. `Ok(None)` means the source answered and the
/// citation does not exist there, which is an answer, not a failure.
#[async_trait]
pub trait AuthoritySource: Send + Sync {
    fn source_name(&self) -> &str;
    async fn fetch(&self, key: &CitationKey) -> Result<Option<serde_json::Value>>;
}

/// Used when `authority.provider = "disabled"`. Fetch attempts fail, which
/// the cache degrades to a miss; previously cached records still serve.
pub struct DisabledAuthority;

#[async_trait]
impl AuthoritySource for DisabledAuthority {
    fn source_name(&self) -> &str {
        "disabled"
    }
    async fn fetch(&self, _key: &CitationKey) -> Result<Option<serde_json::Value>> {
        Err(PipelineError::UpstreamUnavailable {
            service: "authority",
            reason: "authority provider is disabled".to_string(),
        })
    }
}

/// CourtListener-style citation API:
///
/// ```text
/// GET {base_url}/citations/?volume=384&reporter=us&page=436
/// Authorization: Token {token}      (when the token env var is set)
/// → 200 {...}                        opinion metadata, cached as-is
/// → 404                              no such authority
/// ```
///
/// Retries follow the same policy as the other HTTP providers: 429/5xx and
/// network errors back off and retry, any other 4xx fails immediately.
pub struct HttpAuthority {
    base_url: String,
    api_token: Option<String>,
    timeout_secs: u64,
    max_retries: u32,
}

impl HttpAuthority {
    /// The API token is read from the configured env var once, at
    /// construction. A missing token is allowed: public endpoints answer
    /// anonymous requests at a lower rate limit.
    pub fn new(config: &AuthorityConfig) -> Result<Self> {
        let base_url = config.base_url.clone().ok_or_else(|| {
            PipelineError::InvalidInput(
                "authority.base_url required for courtlistener provider".to_string(),
            )
        })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_token: std::env::var(&config.api_token_env).ok(),
            timeout_secs: config.timeout_secs,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl AuthoritySource for HttpAuthority {
    fn source_name(&self) -> &str {
        "courtlistener"
    }

    async fn fetch(&self, key: &CitationKey) -> Result<Option<serde_json::Value>> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| auth_err(format!("client init: {}", e)))?;

        let url = format!("{}/citations/", self.base_url);
        let params = [
            ("volume", key.volume.to_string()),
            ("reporter", key.reporter.clone()),
            ("page", key.page.to_string()),
        ];

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = client.get(&url).query(&params);
            if let Some(token) = &self.api_token {
                request = request.header("Authorization", format!("Token {}", token));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().await.map_err(|e| auth_err(e.to_string()))?;
                        return Ok(Some(json));
                    }

                    if status.as_u16() == 404 {
                        return Ok(None);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(auth_err(format!("API error {}: {}", status, body_text)));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    return Err(auth_err(format!("API error {}: {}", status, body_text)));
                }
                Err(e) => {
                    last_err = Some(auth_err(e.to_string()));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| auth_err("lookup failed after retries".to_string())))
    }
}

fn auth_err(reason: String) -> PipelineError {
    PipelineError::UpstreamUnavailable {
        service: "authority",
        reason,
    }
}

pub fn create_source(config: &AuthorityConfig) -> Result<Arc<dyn AuthoritySource>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledAuthority)),
        "courtlistener" => Ok(Arc::new(HttpAuthority::new(config)?)),
        other => Err(PipelineError::InvalidInput(format!(
            "Unknown authority provider: {}",
            other
        ))),
    }
}

// ============ Cache ============

pub struct AuthorityCache {
    pool: SqlitePool,
    source: Arc<dyn AuthoritySource>,
    ttl_secs: i64,
}

impl AuthorityCache {
    pub fn new(pool: SqlitePool, source: Arc<dyn AuthoritySource>, ttl_secs: i64) -> Self {
        Self {
            pool,
            source,
            ttl_secs,
        }
    }

    /// Resolve one raw citation string.
    ///
    /// Fresh cache hits never touch the network; a previously unseen raw
    /// variant of a cached key is appended to the record's variant list.
    /// Expired or missing records are refetched; when the source is
    /// unreachable the call answers `None` without caching the failure.
    pub async fn lookup(&self, citation: &str) -> Result<Option<AuthorityRecord>> {
        let Some(key) = normalize_citation(citation) else {
            tracing::debug!(citation, "citation did not normalize to a reporter key");
            return Ok(None);
        };
        let key_str = key.as_key();
        let now = unix_now();

        if let Some(mut record) = self.load(&key_str).await? {
            if record.is_fresh(now) {
                if !record.raw_citations.iter().any(|c| c == citation) {
                    record.raw_citations.push(citation.to_string());
                    self.save(&record).await?;
                }
                return Ok(Some(record));
            }

            // Expired: refetch, replacing the payload but keeping the
            // accumulated raw variants.
            return match self.source.fetch(&key).await {
                Ok(Some(payload)) => {
                    record.payload = payload;
                    record.fetched_at = now;
                    record.ttl_secs = self.ttl_secs;
                    if !record.raw_citations.iter().any(|c| c == citation) {
                        record.raw_citations.push(citation.to_string());
                    }
                    self.save(&record).await?;
                    Ok(Some(record))
                }
                Ok(None) => {
                    // The source says the authority no longer exists; the
                    // stale record has nothing left to back it.
                    self.remove(&key_str).await?;
                    Ok(None)
                }
                Err(e) => {
                    tracing::warn!(citation, error = %e, "authority refetch failed");
                    Ok(None)
                }
            };
        }

        match self.source.fetch(&key).await {
            Ok(Some(payload)) => {
                let record = AuthorityRecord {
                    citation_key: key_str,
                    source: self.source.source_name().to_string(),
                    raw_citations: vec![citation.to_string()],
                    payload,
                    fetched_at: now,
                    ttl_secs: self.ttl_secs,
                };
                self.save(&record).await?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::warn!(citation, error = %e, "authority fetch failed");
                Ok(None)
            }
        }
    }

    /// Resolve a batch, one entry per distinct input string. A failed or
    /// unparseable citation yields `None` for that entry without aborting
    /// the rest; raw variants of one authority share a single fetch.
    pub async fn bulk_lookup(
        &self,
        citations: &[String],
    ) -> Result<HashMap<String, Option<AuthorityRecord>>> {
        let mut out = HashMap::with_capacity(citations.len());
        for citation in citations {
            if out.contains_key(citation) {
                continue;
            }
            let record = self.lookup(citation).await?;
            out.insert(citation.clone(), record);
        }
        Ok(out)
    }

    async fn load(&self, key: &str) -> Result<Option<AuthorityRecord>> {
        let row = sqlx::query(
            "SELECT citation_key, source, raw_citations, payload, fetched_at, ttl_secs
             FROM authorities WHERE citation_key = ? AND source = ?",
        )
        .bind(key)
        .bind(self.source.source_name())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let raw_citations_json: String = row.get("raw_citations");
        let payload_json: String = row.get("payload");

        Ok(Some(AuthorityRecord {
            citation_key: row.get("citation_key"),
            source: row.get("source"),
            raw_citations: serde_json::from_str(&raw_citations_json).unwrap_or_default(),
            payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
            fetched_at: row.get("fetched_at"),
            ttl_secs: row.get("ttl_secs"),
        }))
    }

    async fn save(&self, record: &AuthorityRecord) -> Result<()> {
        let raw_citations = encode_json(&record.raw_citations)?;
        let payload = encode_json(&record.payload)?;

        sqlx::query(
            "INSERT INTO authorities (citation_key, source, raw_citations, payload, fetched_at, ttl_secs)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(citation_key, source) DO UPDATE SET
                 raw_citations = excluded.raw_citations,
                 payload = excluded.payload,
                 fetched_at = excluded.fetched_at,
                 ttl_secs = excluded.ttl_secs",
        )
        .bind(&record.citation_key)
        .bind(&record.source)
        .bind(raw_citations)
        .bind(payload)
        .bind(record.fetched_at)
        .bind(record.ttl_secs)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM authorities WHERE citation_key = ? AND source = ?")
            .bind(key)
            .bind(self.source.source_name())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        PipelineError::Storage(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_and_short_citations_share_a_key() {
        let full = normalize_citation("Miranda v. Arizona, 384 U.S. 436 (1966)").unwrap();
        let short = normalize_citation("384 US 436").unwrap();
        let spaced = normalize_citation("384 U. S. 436").unwrap();
        assert_eq!(full, short);
        assert_eq!(full, spaced);
        assert_eq!(full.as_key(), "384 us 436");
    }

    #[test]
    fn pincites_and_trailing_periods_drop_out() {
        let pincite = normalize_citation("Miranda v. Arizona, 384 U.S. 436, 444 (1966)").unwrap();
        assert_eq!(pincite.as_key(), "384 us 436");
        let prose = normalize_citation("See 384 U.S. 436.").unwrap();
        assert_eq!(prose.as_key(), "384 us 436");
    }

    #[test]
    fn multiword_reporters_normalize_consistently() {
        let spaced = normalize_citation("Smith v. Jones, 526 F. Supp. 2d 1130 (D.N.M. 2007)");
        let packed = normalize_citation("526 F.Supp.2d 1130");
        assert_eq!(spaced.unwrap().as_key(), "526 fsupp2d 1130");
        assert_eq!(packed.unwrap().as_key(), "526 fsupp2d 1130");
    }

    #[test]
    fn statutes_and_prose_do_not_normalize() {
        assert!(normalize_citation("42 U.S.C. § 1983").is_none());
        assert!(normalize_citation("the fifth amendment").is_none());
        assert!(normalize_citation("").is_none());
    }

    #[test]
    fn parenthetical_years_cannot_become_reporters() {
        // Without stripping, "(1966)" would offer "436 (1966" no triple, but
        // a court parenthetical like "100 (9th Cir. 2001)" must not parse as
        // volume 100 reporter "th Cir" page 2001.
        assert!(normalize_citation("slip op. at 100 (9th Cir. 2001)").is_none());
    }

    #[tokio::test]
    async fn disabled_source_refuses_fetch() {
        let key = normalize_citation("384 U.S. 436").unwrap();
        let err = DisabledAuthority.fetch(&key).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::UpstreamUnavailable {
                service: "authority",
                ..
            }
        ));
    }
}
