use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub storage: StorageConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub ocr: OcrConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub authority: AuthorityConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub adapters: AdaptersConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root of the content-addressed store; originals land under
    /// `{root}/originals/` and per-stage artifacts under `{root}/processed/`.
    pub root: PathBuf,
    /// Directory holding one `{sha256}.json` manifest per document.
    pub manifest_root: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    /// Pages averaging fewer characters than this are considered scanned.
    #[serde(default = "default_min_chars_per_page")]
    pub text_layer_min_chars_per_page: usize,
    /// How many leading pages the text-layer probe always samples.
    #[serde(default = "default_sample_head_pages")]
    pub sample_head_pages: usize,
    /// How many additional evenly-spaced pages the probe samples.
    #[serde(default = "default_sample_spread_pages")]
    pub sample_spread_pages: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            text_layer_min_chars_per_page: default_min_chars_per_page(),
            sample_head_pages: default_sample_head_pages(),
            sample_spread_pages: default_sample_spread_pages(),
        }
    }
}

fn default_min_chars_per_page() -> usize {
    50
}
fn default_sample_head_pages() -> usize {
    3
}
fn default_sample_spread_pages() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct OcrConfig {
    /// "disabled" or "remote".
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Endpoint of the OCR engine; required when provider is "remote".
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_ocr_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_ocr_max_retries")]
    pub max_retries: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            endpoint: None,
            timeout_secs: default_ocr_timeout_secs(),
            max_retries: default_ocr_max_retries(),
        }
    }
}

impl OcrConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_ocr_timeout_secs() -> u64 {
    120
}
fn default_ocr_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// "disabled" or "openai".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Target snippet width in bytes before char-boundary snapping.
    #[serde(default = "default_window_chars")]
    pub window_chars: usize,
    /// Candidates fetched per method before fusion and the top_k cut.
    #[serde(default = "default_candidate_k")]
    pub candidate_k: i64,
    #[serde(default = "default_top_k")]
    pub top_k: i64,
    /// Constant in the reciprocal-rank denominator; larger values flatten
    /// the contribution of rank differences.
    #[serde(default = "default_rrf_k")]
    pub rrf_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            window_chars: default_window_chars(),
            candidate_k: default_candidate_k(),
            top_k: default_top_k(),
            rrf_k: default_rrf_k(),
        }
    }
}

fn default_window_chars() -> usize {
    240
}
fn default_candidate_k() -> i64 {
    80
}
fn default_top_k() -> i64 {
    12
}
fn default_rrf_k() -> usize {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthorityConfig {
    /// "disabled" or "courtlistener".
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Base URL of the citation API; required when provider is enabled.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Environment variable holding the API token, if the API wants one.
    #[serde(default = "default_token_env")]
    pub api_token_env: String,
    /// How long a cached authority record stays fresh. Default one week.
    #[serde(default = "default_authority_ttl_secs")]
    pub ttl_secs: i64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_max_retries")]
    pub max_retries: u32,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            base_url: None,
            api_token_env: default_token_env(),
            ttl_secs: default_authority_ttl_secs(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_api_max_retries(),
        }
    }
}

impl AuthorityConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_token_env() -> String {
    "COURTLISTENER_API_TOKEN".to_string()
}
fn default_authority_ttl_secs() -> i64 {
    604_800
}
/// Shared by the authority and analysis clients.
fn default_api_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    /// "disabled" or "openai".
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Passages retrieved as grounding context when the caller supplies none.
    #[serde(default = "default_context_top_k")]
    pub context_top_k: i64,
    #[serde(default = "default_analysis_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_max_retries")]
    pub max_retries: u32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            context_top_k: default_context_top_k(),
            timeout_secs: default_analysis_timeout_secs(),
            max_retries: default_api_max_retries(),
        }
    }
}

impl AnalysisConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_context_top_k() -> i64 {
    6
}
fn default_analysis_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AdaptersConfig {
    pub library: Option<LibraryAdapterConfig>,
    pub evidence: Option<EvidenceAdapterConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LibraryAdapterConfig {
    pub root: PathBuf,
    #[serde(default = "default_library_globs")]
    pub include_globs: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvidenceAdapterConfig {
    pub root: PathBuf,
}

fn default_library_globs() -> Vec<String> {
    vec![
        "**/*.pdf".to_string(),
        "**/*.docx".to_string(),
        "**/*.txt".to_string(),
    ]
}

impl Config {
    /// Smallest working configuration, rooted under `dir`. Every external
    /// provider is disabled; tests inject fakes through the pipeline builder.
    pub fn minimal(dir: &Path) -> Self {
        Self {
            storage: StorageConfig {
                root: dir.join("store"),
                manifest_root: dir.join("manifests"),
            },
            db: DbConfig {
                path: dir.join("docket.db"),
            },
            extraction: ExtractionConfig::default(),
            ocr: OcrConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            authority: AuthorityConfig::default(),
            analysis: AnalysisConfig::default(),
            adapters: AdaptersConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate extraction
    if config.extraction.text_layer_min_chars_per_page == 0 {
        anyhow::bail!("extraction.text_layer_min_chars_per_page must be > 0");
    }
    if config.extraction.sample_head_pages + config.extraction.sample_spread_pages == 0 {
        anyhow::bail!("extraction sampling must probe at least one page");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if config.retrieval.candidate_k < config.retrieval.top_k {
        anyhow::bail!("retrieval.candidate_k must be >= retrieval.top_k");
    }
    if config.retrieval.window_chars < 16 {
        anyhow::bail!("retrieval.window_chars must be >= 16");
    }

    // Validate OCR
    match config.ocr.provider.as_str() {
        "disabled" => {}
        "remote" => {
            if config.ocr.endpoint.is_none() {
                anyhow::bail!("ocr.endpoint must be set when provider is 'remote'");
            }
        }
        other => anyhow::bail!("Unknown ocr provider: '{}'. Must be disabled or remote.", other),
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    // Validate authority
    match config.authority.provider.as_str() {
        "disabled" => {}
        "courtlistener" => {
            if config.authority.base_url.is_none() {
                anyhow::bail!("authority.base_url must be set when provider is 'courtlistener'");
            }
            if config.authority.ttl_secs < 0 {
                anyhow::bail!("authority.ttl_secs must be >= 0");
            }
        }
        other => anyhow::bail!(
            "Unknown authority provider: '{}'. Must be disabled or courtlistener.",
            other
        ),
    }

    // Validate analysis
    if config.analysis.is_enabled() && config.analysis.model.is_none() {
        anyhow::bail!(
            "analysis.model must be specified when provider is '{}'",
            config.analysis.provider
        );
    }
    match config.analysis.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown analysis provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("dkt.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_minimal_file_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[storage]
root = "./data/store"
manifest_root = "./data/manifests"

[db]
path = "./data/docket.db"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.extraction.text_layer_min_chars_per_page, 50);
        assert_eq!(config.retrieval.top_k, 12);
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.authority.ttl_secs, 604_800);
        assert!(!config.ocr.is_enabled());
        assert!(!config.embedding.is_enabled());
    }

    #[test]
    fn rejects_remote_ocr_without_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[storage]
root = "./data/store"
manifest_root = "./data/manifests"

[db]
path = "./data/docket.db"

[ocr]
provider = "remote"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("ocr.endpoint"));
    }

    #[test]
    fn rejects_enabled_embedding_without_dims() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[storage]
root = "./data/store"
manifest_root = "./data/manifests"

[db]
path = "./data/docket.db"

[embedding]
provider = "openai"
model = "text-embedding-3-small"
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
    }

    #[test]
    fn rejects_candidate_k_below_top_k() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(
            &dir,
            r#"
[storage]
root = "./data/store"
manifest_root = "./data/manifests"

[db]
path = "./data/docket.db"

[retrieval]
candidate_k = 5
top_k = 10
"#,
        );
        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("candidate_k"));
    }
}
