//! # Docket
//!
//! A content-addressed pipeline for legal document collections.
//!
//! Docket ingests uploads and external-source documents into immutable
//! content-addressed storage, extracts page text (native parsing with OCR
//! fallback for scanned files), indexes pages for keyword and vector search,
//! and answers retrieval queries with citation-grade passages: every snippet
//! carries the exact byte offsets of its page of origin. On top of retrieval
//! sit a TTL'd citation-authority cache and grounded LLM analysis whose
//! citations are verified against the supplied passages.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────────┐   ┌───────────┐
//! │   Sources     │──▶│         Pipeline           │──▶│  SQLite    │
//! │ upload/lib/   │   │ ingest → extract → index  │   │ FTS5+Vec  │
//! │ evidence      │   │        (OCR fallback)     │   │ +authority │
//! └──────────────┘   └───────────────────────────┘   └─────┬─────┘
//!                                                          │
//!                                       ┌──────────────────┤
//!                                       ▼                  ▼
//!                                 ┌──────────┐       ┌──────────┐
//!                                 │ retrieve │       │ analyze  │
//!                                 │ passages │──────▶│ grounded │
//!                                 └──────────┘       └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dkt init                            # create database
//! dkt ingest brief.pdf                # content-addressed ingest
//! dkt extract 1                       # page text (OCR fallback if scanned)
//! dkt index 1 --vectors               # FTS5 + embeddings
//! dkt search "custodial interrogation" --method hybrid
//! dkt authority "384 U.S. 436"        # cached citation lookup
//! dkt analyze "when are warnings required?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Pipeline error taxonomy |
//! | [`store`] | Content-addressed originals + document registry |
//! | [`manifest`] | Deep-merged per-document JSON manifests |
//! | [`extract`] | Page text extraction with OCR fallback |
//! | [`ocr`] | OCR provider abstraction |
//! | [`index`] | Keyword (FTS5) and vector indexing |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`search`] | Keyword, semantic, and hybrid retrieval |
//! | [`authority`] | Citation normalization + TTL'd authority cache |
//! | [`analyze`] | Grounded analysis with verified citations |
//! | [`adapters`] | External source adapters (library, evidence) |
//! | [`pipeline`] | Eager assembly + the stable operation surface |
//! | [`progress`] | Stage progress reporting |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod adapters;
pub mod analyze;
pub mod authority;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod manifest;
pub mod migrate;
pub mod models;
pub mod ocr;
pub mod pipeline;
pub mod progress;
pub mod search;
pub mod store;
