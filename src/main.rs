//! # Docket CLI (`dkt`)
//!
//! The `dkt` binary drives the document pipeline: database initialization,
//! ingest, extraction, indexing, retrieval, authority lookup, grounded
//! analysis, and external-source sync.
//!
//! ## Usage
//!
//! ```bash
//! dkt --config ./config/dkt.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dkt init` | Create the SQLite database and run schema migrations |
//! | `dkt ingest <path>` | Ingest a file into content-addressed storage |
//! | `dkt extract <doc-id>` | Extract page text (OCR fallback for scans) |
//! | `dkt index <doc-id>` | Build the keyword (and optionally vector) index |
//! | `dkt search "<query>"` | Retrieve citation-grade passages |
//! | `dkt analyze "<question>"` | LLM analysis grounded in retrieved passages |
//! | `dkt authority <citation>...` | Cached citation-authority lookup |
//! | `dkt sync <system> <id>` | Pull one document from an external source |
//! | `dkt status <id-or-sha256>` | Show a document and its manifest |
//! | `dkt stats` | Corpus counts by state and source |
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! dkt init --config ./config/dkt.toml
//!
//! # Ingest a brief with matter metadata
//! dkt ingest briefs/motion.pdf --meta matter=smith-v-jones
//!
//! # Extract and index with vectors
//! dkt extract 1
//! dkt index 1 --vectors
//!
//! # Hybrid retrieval scoped to one matter
//! dkt search "custodial interrogation" --method hybrid --filter matter=smith-v-jones
//!
//! # Look up authorities cited in a brief
//! dkt authority "Miranda v. Arizona, 384 U.S. 436 (1966)" "384 US 436"
//!
//! # Sync one item from the evidence indexer
//! dkt sync evidence EX-042 --vectors
//! ```

use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use docket::adapters::{DocumentSource, EvidenceAdapter, LibraryAdapter};
use docket::analyze::AnalysisMode;
use docket::config::{self, Config};
use docket::migrate;
use docket::models::{Document, RetrieveMethod, SourceSystem};
use docket::pipeline::Pipeline;
use docket::progress::ProgressMode;

/// Docket CLI — a content-addressed legal document pipeline.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/dkt.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "dkt",
    about = "Docket — content-addressed ingest, extraction, indexing, and citation-grade retrieval for legal documents",
    version,
    long_about = "Docket ingests legal documents into content-addressed storage, extracts page \
    text with OCR fallback for scanned files, indexes pages for keyword and vector search, and \
    answers queries with passages whose offsets are verifiable against the stored page text."
)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// Defaults to `./config/dkt.toml`. Storage roots, database path,
    /// extraction thresholds, and all provider settings are read from it.
    #[arg(long, global = true, default_value = "./config/dkt.toml")]
    config: PathBuf,

    /// Stage progress on stderr: `off`, `human`, or `json`.
    ///
    /// Defaults to `human` when stderr is a terminal, `off` otherwise.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables (documents,
    /// pages, pages_fts, page_vectors, authorities). This command is
    /// idempotent — running it multiple times is safe.
    Init,

    /// Ingest a file into content-addressed storage.
    ///
    /// Hashes the file, stores it under `originals/{sha256}.{ext}`, registers
    /// a document row, and writes the initial manifest. Re-ingesting the
    /// same content reports the existing document instead of duplicating it.
    Ingest {
        /// Path of the file to ingest.
        path: PathBuf,

        /// Source system: `app-upload`, `evidence-indexer`, or
        /// `external-library`.
        #[arg(long, default_value = "app-upload")]
        source: String,

        /// Document metadata as `key=value` pairs (stored as JSON).
        #[arg(long = "meta", value_parser = parse_key_val)]
        meta: Vec<(String, String)>,
    },

    /// Extract page text from an ingested document.
    ///
    /// Parses PDF, DOCX, or plain text natively; documents without a usable
    /// text layer fall back to the configured OCR engine. Pages the engine
    /// cannot read are recorded with an error flag rather than failing the
    /// document. Re-running replaces the previous extraction.
    Extract {
        /// Document id (from `dkt ingest` or `dkt stats`).
        doc_id: i64,
    },

    /// Index an extracted document for retrieval.
    ///
    /// Rebuilds the document's rows in the FTS5 keyword index; with
    /// `--vectors`, also embeds pages through the configured provider,
    /// skipping pages whose text has not changed since the last run.
    Index {
        /// Document id.
        doc_id: i64,

        /// Also build the vector index (requires an embedding provider).
        #[arg(long)]
        vectors: bool,
    },

    /// Retrieve citation-grade passages.
    ///
    /// Every result is a byte-exact slice of a stored page with its offsets,
    /// so citations can be verified against the page text.
    Search {
        /// The search query string.
        query: String,

        /// Retrieval method: `keyword` (FTS5), `semantic` (vector), or
        /// `hybrid` (reciprocal-rank fusion of both).
        #[arg(long, default_value = "keyword")]
        method: String,

        /// Filter passages as `key=value` pairs; `source`/`filename` match
        /// document fields, anything else matches metadata keys.
        #[arg(long = "filter", value_parser = parse_key_val)]
        filters: Vec<(String, String)>,

        /// Maximum number of passages to return.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Analyze a question against the corpus with a completion model.
    ///
    /// Retrieves grounding passages first (hybrid when embeddings are
    /// configured), then demands the model cite them; each claimed citation
    /// is verified against the supplied passage text and flagged when it
    /// does not match.
    Analyze {
        /// The question to analyze.
        query: String,

        /// `grounded` (answer from retrieved passages) or `open` (general
        /// knowledge, clearly labeled as ungrounded).
        #[arg(long, default_value = "grounded")]
        mode: String,
    },

    /// Look up citation authorities through the TTL cache.
    ///
    /// Citations normalize to a volume/reporter/page key before lookup, so
    /// "Miranda v. Arizona, 384 U.S. 436 (1966)" and "384 US 436" share one
    /// cache entry. Fresh entries answer without touching the network.
    Authority {
        /// One or more citation strings.
        #[arg(required = true)]
        citations: Vec<String>,
    },

    /// Sync a document from an external source.
    ///
    /// Fetches the document by external id, then runs ingest, extract, and
    /// index, resuming from whatever state its content already reached.
    Sync {
        /// Source system: `library` or `evidence`.
        system: String,

        /// External id (relative path for `library`, item id for
        /// `evidence`). Required unless `--list` is given.
        external_id: Option<String>,

        /// List available external ids instead of syncing.
        #[arg(long)]
        list: bool,

        /// Also build the vector index after extraction.
        #[arg(long)]
        vectors: bool,
    },

    /// Show a document's registry row and manifest.
    Status {
        /// Document id, or the full sha256 of its content.
        id: String,
    },

    /// Corpus counts by state and source.
    Stats,
}

/// Parse a `key=value` pair for `--meta` and `--filter` arguments.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=VALUE: no '=' found in '{}'", s))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    let cli = Cli::parse();

    let progress_mode = match &cli.progress {
        Some(s) => ProgressMode::parse(s)
            .ok_or_else(|| anyhow::anyhow!("invalid --progress '{}': use off, human, or json", s))?,
        None => ProgressMode::default_for_tty(),
    };

    let cfg = config::load_config(&cli.config)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { path, source, meta } => {
            let source = SourceSystem::parse(&source).ok_or_else(|| {
                anyhow::anyhow!(
                    "invalid --source '{}': use app-upload, evidence-indexer, or external-library",
                    source
                )
            })?;
            let pipeline = open_pipeline(cfg, progress_mode).await?;
            let result = pipeline
                .ingest_path(&path, source, pairs_to_json(meta))
                .await?;
            if result.is_duplicate {
                println!(
                    "Already ingested as document {} (sha256 {})",
                    result.doc_id, result.sha256
                );
            } else {
                println!(
                    "Ingested document {} ({} bytes, sha256 {})",
                    result.doc_id, result.size_bytes, result.sha256
                );
            }
            pipeline.close().await;
        }
        Commands::Extract { doc_id } => {
            let pipeline = open_pipeline(cfg, progress_mode).await?;
            let result = pipeline.extract_document(doc_id, &cancel).await?;
            let mut line = format!(
                "Extracted {} pages from document {} ({})",
                result.pages,
                doc_id,
                result.method.as_str()
            );
            if result.pages_with_errors > 0 {
                line.push_str(&format!(
                    ", {} pages unreadable (flagged)",
                    result.pages_with_errors
                ));
            }
            println!("{}", line);
            pipeline.close().await;
        }
        Commands::Index { doc_id, vectors } => {
            let pipeline = open_pipeline(cfg, progress_mode).await?;
            let result = pipeline.index_document(doc_id, vectors, &cancel).await?;
            if vectors {
                println!(
                    "Indexed document {}: {} keyword pages, {} vector pages",
                    doc_id, result.pages_indexed, result.vector_pages
                );
            } else {
                println!(
                    "Indexed document {}: {} keyword pages",
                    doc_id, result.pages_indexed
                );
            }
            pipeline.close().await;
        }
        Commands::Search {
            query,
            method,
            filters,
            top_k,
        } => {
            let method = RetrieveMethod::parse(&method).ok_or_else(|| {
                anyhow::anyhow!(
                    "invalid --method '{}': use keyword, semantic, or hybrid",
                    method
                )
            })?;
            let filters: HashMap<String, String> = filters.into_iter().collect();
            let pipeline = open_pipeline(cfg, progress_mode).await?;
            let result = pipeline.retrieve(&query, &filters, top_k, method).await?;

            if result.passages.is_empty() {
                println!("No results.");
            } else {
                println!(
                    "Found {} passages (of {} matches):",
                    result.passages.len(),
                    result.total_matches
                );
                println!();
                for (i, p) in result.passages.iter().enumerate() {
                    println!(
                        "{}. [{:.4}] {}  doc {}, page {}, chars {}..{}  ({})",
                        i + 1,
                        p.score,
                        p.filename,
                        p.doc_id,
                        p.page_number,
                        p.start,
                        p.end,
                        p.source_system.as_str()
                    );
                    println!("   {}", p.snippet.replace('\n', " "));
                    println!();
                }
            }
            pipeline.close().await;
        }
        Commands::Analyze { query, mode } => {
            let mode = match mode.as_str() {
                "grounded" => AnalysisMode::Grounded,
                "open" => AnalysisMode::Open,
                other => anyhow::bail!("invalid --mode '{}': use grounded or open", other),
            };
            let pipeline = open_pipeline(cfg, progress_mode).await?;
            let result = pipeline.analyze(&query, None, mode, &cancel).await?;

            println!("{}", result.answer);
            if !result.citations.is_empty() {
                println!();
                println!("Citations:");
                for c in &result.citations {
                    match (&c.location, c.verified) {
                        (Some(loc), true) => {
                            println!(
                                "  [{}] verified  doc {}, page {}, chars {}..{}",
                                c.passage_index, loc.doc_id, loc.page_number, loc.start, loc.end
                            );
                        }
                        _ => {
                            println!("  [{}] UNVERIFIED", c.passage_index);
                        }
                    }
                    println!("      \"{}\"", c.quote);
                }
            }
            println!();
            if result.grounded {
                println!("(grounded in {} passages)", result.passages.len());
            } else {
                println!("(not grounded: no passages were available)");
            }
            pipeline.close().await;
        }
        Commands::Authority { citations } => {
            let pipeline = open_pipeline(cfg, progress_mode).await?;
            let results = pipeline.bulk_lookup_authorities(&citations).await?;
            // Preserve input order; bulk_lookup keys by citation string.
            for citation in &citations {
                println!("{}", citation);
                match results.get(citation).and_then(|r| r.as_ref()) {
                    Some(record) => {
                        println!("  key:     {}", record.citation_key);
                        println!("  source:  {}", record.source);
                        println!("  fetched: {}", format_ts_iso(record.fetched_at));
                        println!("  payload: {}", record.payload);
                    }
                    None => println!("  no authority found"),
                }
                println!();
            }
            pipeline.close().await;
        }
        Commands::Sync {
            system,
            external_id,
            list,
            vectors,
        } => {
            let adapter: Box<dyn DocumentSource> = match system.as_str() {
                "library" => {
                    let lib_cfg = cfg.adapters.library.clone().ok_or_else(|| {
                        anyhow::anyhow!("[adapters.library] is not configured")
                    })?;
                    Box::new(LibraryAdapter::new(&lib_cfg)?)
                }
                "evidence" => {
                    let ev_cfg = cfg.adapters.evidence.clone().ok_or_else(|| {
                        anyhow::anyhow!("[adapters.evidence] is not configured")
                    })?;
                    Box::new(EvidenceAdapter::new(&ev_cfg))
                }
                other => anyhow::bail!("unknown source system '{}': use library or evidence", other),
            };

            if list {
                for id in adapter.list().await? {
                    println!("{}", id);
                }
                return Ok(());
            }

            let external_id = external_id
                .ok_or_else(|| anyhow::anyhow!("external id required unless --list is given"))?;
            let pipeline = open_pipeline(cfg, progress_mode).await?;
            let result = pipeline
                .sync_external(adapter.as_ref(), &external_id, vectors, &cancel)
                .await?;

            let stage = if result.extracted && result.indexed {
                "extracted, indexed"
            } else if result.indexed {
                "indexed"
            } else {
                "already up to date"
            };
            println!(
                "Synced {} → document {} ({})",
                result.external_id, result.ingest.doc_id, stage
            );
            pipeline.close().await;
        }
        Commands::Status { id } => {
            let pipeline = open_pipeline(cfg, progress_mode).await?;
            let doc = match id.parse::<i64>() {
                Ok(doc_id) => pipeline.get_document(doc_id).await?,
                Err(_) => pipeline.get_document_by_hash(&id).await?,
            };
            let Some(doc) = doc else {
                anyhow::bail!("no document with id or sha256 '{}'", id);
            };
            print_document(&doc);
            if let Some(manifest) = pipeline.get_manifest(&doc.sha256)? {
                println!();
                println!("Manifest:");
                println!("{}", serde_json::to_string_pretty(&manifest)?);
            }
            pipeline.close().await;
        }
        Commands::Stats => {
            let pipeline = open_pipeline(cfg, progress_mode).await?;
            let stats = pipeline.stats().await?;
            let db_path = &pipeline.config().db.path;
            let db_size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
            println!("{:<12} {}", "DATABASE", db_path.display());
            println!("{:<12} {}", "SIZE", format_bytes(db_size));
            println!();
            println!("{:<12} {}", "DOCUMENTS", stats.documents);
            println!("{:<12} {}", "PAGES", stats.pages);
            println!("{:<12} {}", "VECTORS", stats.vectors);
            println!("{:<12} {}", "AUTHORITIES", stats.authorities);
            if !stats.by_state.is_empty() {
                println!();
                println!("BY STATE");
                for (state, count) in &stats.by_state {
                    println!("  {:<18} {}", state, count);
                }
            }
            if !stats.by_source.is_empty() {
                println!();
                println!("BY SOURCE");
                for (source, count) in &stats.by_source {
                    println!("  {:<18} {}", source, count);
                }
            }
            pipeline.close().await;
        }
    }

    Ok(())
}

async fn open_pipeline(cfg: Config, progress: ProgressMode) -> anyhow::Result<Pipeline> {
    Ok(Pipeline::builder(cfg)
        .with_progress(progress.reporter())
        .open()
        .await?)
}

fn pairs_to_json(pairs: Vec<(String, String)>) -> serde_json::Value {
    let map: serde_json::Map<String, serde_json::Value> = pairs
        .into_iter()
        .map(|(k, v)| (k, serde_json::Value::String(v)))
        .collect();
    serde_json::Value::Object(map)
}

fn print_document(doc: &Document) {
    println!("Document {}", doc.id);
    println!("  sha256:    {}", doc.sha256);
    println!("  filename:  {}", doc.filename);
    println!("  size:      {} bytes", doc.size_bytes);
    println!("  source:    {}", doc.source_system.as_str());
    println!("  state:     {}", doc.state.as_str());
    println!("  ingested:  {}", format_ts_iso(doc.ingested_at));
    if let Some(ts) = doc.extracted_at {
        println!("  extracted: {}", format_ts_iso(ts));
    }
    if let Some(ts) = doc.indexed_at {
        println!("  indexed:   {}", format_ts_iso(ts));
    }
    if !doc.metadata.is_null() && doc.metadata != serde_json::json!({}) {
        println!("  metadata:  {}", doc.metadata);
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| ts.to_string())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
