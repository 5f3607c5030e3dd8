//! Hybrid retrieval over indexed pages.
//!
//! Keyword and semantic channels produce rank-ordered page candidates; hybrid
//! mode fuses them with reciprocal-rank scoring so neither channel's raw
//! score scale dominates. Every hit is returned as a passage whose snippet is
//! byte-for-byte a slice of the stored page text, with the offsets to prove
//! it. Results are deterministically ordered: score desc, then document id,
//! then page number.

use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::RetrievalConfig;
use crate::embedding::{self, EmbeddingProvider};
use crate::error::{PipelineError, Result};
use crate::models::{Passage, RetrieveMethod, RetrieveResult, SourceSystem};

pub struct Retriever {
    pool: SqlitePool,
    embedder: Arc<dyn EmbeddingProvider>,
    embedding_enabled: bool,
    config: RetrievalConfig,
}

impl Retriever {
    pub fn new(
        pool: SqlitePool,
        embedder: Arc<dyn EmbeddingProvider>,
        embedding_enabled: bool,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            embedding_enabled,
            config,
        }
    }

    pub async fn retrieve(
        &self,
        query: &str,
        filters: &HashMap<String, String>,
        top_k: Option<usize>,
        method: RetrieveMethod,
    ) -> Result<RetrieveResult> {
        let top_k = top_k.unwrap_or(self.config.top_k as usize).max(1);

        if query.trim().is_empty() {
            return Ok(RetrieveResult {
                passages: Vec::new(),
                total_matches: 0,
            });
        }

        let wants_vectors = matches!(method, RetrieveMethod::Semantic | RetrieveMethod::Hybrid);
        if wants_vectors && !self.embedding_enabled {
            return Err(PipelineError::InvalidInput(format!(
                "method '{}' requires embeddings; set [embedding] provider in config",
                method.as_str()
            )));
        }

        let keyword_candidates =
            if matches!(method, RetrieveMethod::Keyword | RetrieveMethod::Hybrid) {
                self.fetch_keyword_candidates(query).await?
            } else {
                Vec::new()
            };
        let vector_candidates = if wants_vectors {
            self.fetch_vector_candidates(query).await?
        } else {
            Vec::new()
        };

        let fused = fuse_candidates(
            method,
            &keyword_candidates,
            &vector_candidates,
            self.config.rrf_k,
        );

        // Load page text and document fields, applying filters as we go.
        let mut hits: Vec<(FusedHit, String, String, SourceSystem)> = Vec::new();
        for hit in fused {
            let row = sqlx::query(
                "SELECT p.text, d.filename, d.source_system, d.metadata_json
                 FROM pages p JOIN documents d ON d.id = p.document_id
                 WHERE p.document_id = ? AND p.page_number = ?",
            )
            .bind(hit.doc_id)
            .bind(hit.page_number)
            .fetch_optional(&self.pool)
            .await?;
            let Some(row) = row else {
                continue;
            };
            let source_str: String = row.get("source_system");
            let Some(source) = SourceSystem::parse(&source_str) else {
                continue;
            };
            let filename: String = row.get("filename");
            let metadata_json: String = row.get("metadata_json");
            let metadata: serde_json::Value =
                serde_json::from_str(&metadata_json).unwrap_or(serde_json::Value::Null);
            if !metadata_matches(filters, source, &filename, &metadata) {
                continue;
            }
            hits.push((hit, row.get("text"), filename, source));
        }

        let total_matches = hits.len();
        hits.truncate(top_k);

        let mut passages = Vec::with_capacity(hits.len());
        for (hit, text, filename, source) in hits {
            let (start, end) = passage_window(&text, query, self.config.window_chars);
            passages.push(Passage {
                doc_id: hit.doc_id,
                page_number: hit.page_number,
                start,
                end,
                snippet: text[start..end].to_string(),
                score: hit.score,
                filename,
                source_system: source,
            });
        }

        Ok(RetrieveResult {
            passages,
            total_matches,
        })
    }

    // ============ Keyword channel ============

    async fn fetch_keyword_candidates(&self, query: &str) -> Result<Vec<PageCandidate>> {
        let match_expr = fts_match_expr(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT pages_fts.document_id AS document_id,
                   pages_fts.page_number AS page_number,
                   pages_fts.rank AS rank
            FROM pages_fts
            JOIN documents ON documents.id = pages_fts.document_id
            WHERE pages_fts MATCH ? AND documents.state = 'indexed'
            ORDER BY rank
            LIMIT ?
            "#,
        )
        .bind(match_expr)
        .bind(self.config.candidate_k)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let rank: f64 = row.get("rank");
                PageCandidate {
                    doc_id: row.get("document_id"),
                    page_number: row.get("page_number"),
                    raw_score: -rank, // negate so higher = better
                }
            })
            .collect())
    }

    // ============ Semantic channel ============

    async fn fetch_vector_candidates(&self, query: &str) -> Result<Vec<PageCandidate>> {
        let query_vec = self.embedder.embed_one(query).await?;

        // Fetch all vectors and compute cosine similarity in Rust.
        let rows = sqlx::query(
            r#"
            SELECT pv.document_id, pv.page_number, pv.embedding
            FROM page_vectors pv
            JOIN documents d ON d.id = pv.document_id
            WHERE d.state = 'indexed'
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut candidates: Vec<PageCandidate> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vec = embedding::blob_to_vec(&blob);
                let similarity = embedding::cosine_similarity(&query_vec, &vec) as f64;
                PageCandidate {
                    doc_id: row.get("document_id"),
                    page_number: row.get("page_number"),
                    raw_score: similarity,
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.raw_score
                .partial_cmp(&a.raw_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.doc_id.cmp(&b.doc_id))
                .then(a.page_number.cmp(&b.page_number))
        });
        candidates.truncate(self.config.candidate_k as usize);

        Ok(candidates)
    }
}

// ============ Candidate types ============

#[derive(Debug, Clone)]
struct PageCandidate {
    doc_id: i64,
    page_number: i64,
    raw_score: f64,
}

#[derive(Debug, Clone)]
struct FusedHit {
    doc_id: i64,
    page_number: i64,
    score: f64,
}

// ============ Fusion ============

/// Contribution of holding `rank` (0-based) in one channel's list.
fn reciprocal_rank_score(rank: usize, k: usize) -> f64 {
    1.0 / (k as f64 + 1.0 + rank as f64)
}

/// Single-method results pass through on their raw scores; hybrid sums the
/// reciprocal-rank contribution of each channel. Ties fall back to the best
/// min-max-normalized single-channel score, then to (doc, page).
fn fuse_candidates(
    method: RetrieveMethod,
    keyword: &[PageCandidate],
    vector: &[PageCandidate],
    rrf_k: usize,
) -> Vec<FusedHit> {
    match method {
        RetrieveMethod::Keyword => passthrough(keyword),
        RetrieveMethod::Semantic => passthrough(vector),
        RetrieveMethod::Hybrid => {
            #[derive(Default)]
            struct Entry {
                rrf: f64,
                best_norm: f64,
            }

            let norm_keyword = normalize_scores(keyword);
            let norm_vector = normalize_scores(vector);

            let mut entries: HashMap<(i64, i64), Entry> = HashMap::new();
            // Both channel lists arrive rank-ordered, so enumerate() is rank.
            for (rank, (cand, norm)) in norm_keyword.iter().enumerate() {
                let entry = entries.entry((cand.doc_id, cand.page_number)).or_default();
                entry.rrf += reciprocal_rank_score(rank, rrf_k);
                entry.best_norm = entry.best_norm.max(*norm);
            }
            for (rank, (cand, norm)) in norm_vector.iter().enumerate() {
                let entry = entries.entry((cand.doc_id, cand.page_number)).or_default();
                entry.rrf += reciprocal_rank_score(rank, rrf_k);
                entry.best_norm = entry.best_norm.max(*norm);
            }

            let mut hits: Vec<((i64, i64), Entry)> = entries.into_iter().collect();
            hits.sort_by(|a, b| {
                b.1.rrf
                    .partial_cmp(&a.1.rrf)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(
                        b.1.best_norm
                            .partial_cmp(&a.1.best_norm)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    .then(a.0 .0.cmp(&b.0 .0))
                    .then(a.0 .1.cmp(&b.0 .1))
            });
            hits.into_iter()
                .map(|((doc_id, page_number), entry)| FusedHit {
                    doc_id,
                    page_number,
                    score: entry.rrf,
                })
                .collect()
        }
    }
}

fn passthrough(candidates: &[PageCandidate]) -> Vec<FusedHit> {
    let mut hits: Vec<FusedHit> = candidates
        .iter()
        .map(|c| FusedHit {
            doc_id: c.doc_id,
            page_number: c.page_number,
            score: c.raw_score,
        })
        .collect();
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.doc_id.cmp(&b.doc_id))
            .then(a.page_number.cmp(&b.page_number))
    });
    hits
}

/// Min-max normalize raw scores to [0, 1], preserving input order.
fn normalize_scores(candidates: &[PageCandidate]) -> Vec<(&PageCandidate, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|c| c.raw_score)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|c| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (c.raw_score - s_min) / (s_max - s_min)
            };
            (c, norm)
        })
        .collect()
}

// ============ Query handling ============

/// Builds an FTS5 MATCH expression that survives arbitrary user punctuation:
/// every whitespace token becomes a quoted phrase, implicitly ANDed.
pub(crate) fn fts_match_expr(query: &str) -> String {
    query
        .split_whitespace()
        .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Query terms used for locating a match inside page text, with edge
/// punctuation stripped so "arizona," still finds "Arizona".
pub(crate) fn query_terms(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// ASCII-case-insensitive substring search that reports byte offsets valid in
/// the original text. Lowercasing is byte-wise, so offsets never shift.
pub(crate) fn find_case_insensitive(text: &str, needle: &str) -> Option<usize> {
    if needle.is_empty() || needle.len() > text.len() {
        return None;
    }
    let hay: Vec<u8> = text.bytes().map(|b| b.to_ascii_lowercase()).collect();
    let nee: Vec<u8> = needle.bytes().map(|b| b.to_ascii_lowercase()).collect();

    let mut from = 0usize;
    while from + nee.len() <= hay.len() {
        match hay[from..].windows(nee.len()).position(|w| w == nee) {
            Some(pos) => {
                let abs = from + pos;
                if text.is_char_boundary(abs) {
                    return Some(abs);
                }
                from = abs + 1;
            }
            None => return None,
        }
    }
    None
}

/// Earliest match of any query term; on equal start, the longest term wins.
pub(crate) fn locate_match(text: &str, terms: &[String]) -> Option<(usize, usize)> {
    let mut best: Option<(usize, usize)> = None;
    for term in terms {
        if let Some(pos) = find_case_insensitive(text, term) {
            let better = match best {
                None => true,
                Some((bpos, blen)) => pos < bpos || (pos == bpos && term.len() > blen),
            };
            if better {
                best = Some((pos, term.len()));
            }
        }
    }
    best
}

/// A window of roughly `window` bytes centered on the first query-term match
/// (or the page head when nothing matches), snapped outward to char
/// boundaries and clamped to the page. Never crosses page bounds by
/// construction, so `text[start..end]` is always the exact snippet.
pub(crate) fn passage_window(text: &str, query: &str, window: usize) -> (usize, usize) {
    let terms = query_terms(query);
    let (m_start, m_len) = locate_match(text, &terms).unwrap_or((0, 0));

    let half = window.saturating_sub(m_len) / 2;
    let mut start = m_start.saturating_sub(half);
    let mut end = (m_start + m_len + half).min(text.len());

    // Reuse the budget a clamped edge left over.
    if end - start < window {
        if start == 0 {
            end = window.min(text.len());
        } else if end == text.len() {
            start = end.saturating_sub(window);
        }
    }

    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }
    (start, end)
}

// ============ Filters ============

/// Filters match on source system, filename, or any flat metadata key.
pub(crate) fn metadata_matches(
    filters: &HashMap<String, String>,
    source: SourceSystem,
    filename: &str,
    metadata: &serde_json::Value,
) -> bool {
    for (key, want) in filters {
        let ok = match key.as_str() {
            "source_system" | "source" => source.as_str() == want,
            "filename" => filename == want,
            _ => match metadata.get(key) {
                Some(serde_json::Value::String(s)) => s == want,
                Some(other) => other.to_string() == *want,
                None => false,
            },
        };
        if !ok {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cand(doc_id: i64, page: i64, score: f64) -> PageCandidate {
        PageCandidate {
            doc_id,
            page_number: page,
            raw_score: score,
        }
    }

    #[test]
    fn match_expr_quotes_every_term() {
        assert_eq!(
            fts_match_expr("miranda v. arizona (1966)"),
            r#""miranda" "v." "arizona" "(1966)""#
        );
        assert_eq!(fts_match_expr(r#"say "hello""#), r#""say" ""hello"""#);
        assert_eq!(fts_match_expr("   "), "");
    }

    #[test]
    fn query_terms_strip_edge_punctuation() {
        assert_eq!(
            query_terms("Miranda, arizona. (custody)"),
            vec!["Miranda", "arizona", "custody"]
        );
    }

    #[test]
    fn find_is_case_insensitive_with_exact_offsets() {
        let text = "The Court held in MIRANDA that statements...";
        let pos = find_case_insensitive(text, "miranda").unwrap();
        assert_eq!(&text[pos..pos + 7], "MIRANDA");
    }

    #[test]
    fn find_survives_multibyte_prefix() {
        // The match offset must be a byte offset into the original text even
        // when multibyte characters precede it.
        let text = "«Préambule» — the Miranda warnings follow.";
        let pos = find_case_insensitive(text, "miranda").unwrap();
        assert_eq!(&text[pos..pos + 7], "Miranda");
    }

    #[test]
    fn locate_prefers_earliest_then_longest() {
        let text = "seizure before search and seizure doctrine";
        let terms = vec!["search".to_string(), "seizure".to_string()];
        let (pos, len) = locate_match(text, &terms).unwrap();
        assert_eq!(pos, 0);
        assert_eq!(len, "seizure".len());
    }

    #[test]
    fn window_slices_are_always_valid() {
        let text = "π ≈ 3.14159. The Fourth Amendment protects against unreasonable searches. δικαιοσύνη means justice.";
        let (start, end) = passage_window(text, "fourth amendment", 40);
        let snippet = &text[start..end]; // must not panic on char boundaries
        assert!(snippet.to_lowercase().contains("fourth"));
        assert!(end - start >= 40);
    }

    #[test]
    fn window_without_match_anchors_at_page_head() {
        let text = "short page of text";
        let (start, end) = passage_window(text, "nonexistent", 240);
        assert_eq!(start, 0);
        assert_eq!(end, text.len());
    }

    #[test]
    fn reciprocal_rank_values() {
        assert!((reciprocal_rank_score(0, 60) - 1.0 / 61.0).abs() < 1e-12);
        assert!((reciprocal_rank_score(9, 60) - 1.0 / 70.0).abs() < 1e-12);
        assert!(reciprocal_rank_score(0, 60) > reciprocal_rank_score(1, 60));
    }

    #[test]
    fn hybrid_ranks_dual_channel_hits_first() {
        // Page (1,1) appears in both channels at modest rank; (2,1) tops the
        // keyword list only. Two reciprocal contributions beat one.
        let keyword = vec![cand(2, 1, 9.0), cand(1, 1, 8.0)];
        let vector = vec![cand(1, 1, 0.9), cand(3, 1, 0.8)];
        let hits = fuse_candidates(RetrieveMethod::Hybrid, &keyword, &vector, 60);
        assert_eq!((hits[0].doc_id, hits[0].page_number), (1, 1));
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn hybrid_ties_break_on_identity() {
        // (9,9) and (2,1) each hold rank 0 in exactly one channel, so both
        // their fused scores and their normalized channel scores (1.0) tie.
        // The (doc, page) tie-break puts doc 2 first.
        let keyword = vec![cand(9, 9, 10.0), cand(1, 1, 5.0)];
        let vector = vec![cand(2, 1, 0.9), cand(8, 8, 0.4)];
        let hits = fuse_candidates(RetrieveMethod::Hybrid, &keyword, &vector, 60);
        let pos_2 = hits
            .iter()
            .position(|h| (h.doc_id, h.page_number) == (2, 1))
            .unwrap();
        let pos_9 = hits
            .iter()
            .position(|h| (h.doc_id, h.page_number) == (9, 9))
            .unwrap();
        assert!(pos_2 < pos_9);
    }

    #[test]
    fn keyword_passthrough_orders_deterministically() {
        let keyword = vec![cand(2, 3, 1.5), cand(1, 7, 1.5), cand(1, 2, 1.5)];
        let hits = fuse_candidates(RetrieveMethod::Keyword, &keyword, &[], 60);
        let order: Vec<(i64, i64)> = hits.iter().map(|h| (h.doc_id, h.page_number)).collect();
        assert_eq!(order, vec![(1, 2), (1, 7), (2, 3)]);
    }

    #[test]
    fn normalize_single_candidate_is_one() {
        let candidates = vec![cand(1, 1, 5.0)];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn normalize_range_maps_to_unit_interval() {
        let candidates = vec![cand(1, 1, 10.0), cand(2, 1, 5.0), cand(3, 1, 0.0)];
        let result = normalize_scores(&candidates);
        assert!((result[0].1 - 1.0).abs() < 1e-9);
        assert!((result[1].1 - 0.5).abs() < 1e-9);
        assert!((result[2].1 - 0.0).abs() < 1e-9);
    }

    #[test]
    fn filters_match_source_filename_and_metadata() {
        let metadata = serde_json::json!({"matter": "smith-v-jones", "year": 2024});
        let mut filters = HashMap::new();
        filters.insert("source".to_string(), "app-upload".to_string());
        filters.insert("matter".to_string(), "smith-v-jones".to_string());
        assert!(metadata_matches(
            &filters,
            SourceSystem::AppUpload,
            "motion.pdf",
            &metadata
        ));

        filters.insert("matter".to_string(), "other-matter".to_string());
        assert!(!metadata_matches(
            &filters,
            SourceSystem::AppUpload,
            "motion.pdf",
            &metadata
        ));

        let mut by_name = HashMap::new();
        by_name.insert("filename".to_string(), "motion.pdf".to_string());
        assert!(metadata_matches(
            &by_name,
            SourceSystem::EvidenceIndexer,
            "motion.pdf",
            &metadata
        ));
    }
}
