//! # corpus-mill
//!
//! An incremental pipeline that turns a directory of heterogeneous
//! documents (office formats, images, PDFs) into a corpus of normalized
//! markdown chunks suitable for embedding and retrieval, while avoiding
//! redundant work across repeated runs.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────────────────────────┐   ┌─────────────┐
//! │ Catalog  │──▶│ convert → extract → caption │──▶│  Chunking   │
//! │ discover │   │   (sequential, per source)  │   │  (fan-out)  │
//! └──────────┘   └─────────────────────────────┘   └──────┬──────┘
//!                                                         ▼
//!                                                  ┌─────────────┐
//!                                                  │  Manifest   │
//!                                                  │ CHUNKS.jsonl│
//!                                                  └─────────────┘
//! ```
//!
//! Every source is keyed by an identity hash of its root-relative path,
//! and that hash names all of its derived artifacts (original copy,
//! converted PDF, rendered markdown, chunk files). A staleness chain over
//! modification times decides per stage whether work can be reused; the
//! engines that do the actual conversion, extraction, captioning, and
//! chunk splitting are external collaborators behind traits.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`catalog`] | Source discovery and deduplication |
//! | [`artifacts`] | Derived-artifact addressing and staleness decisions |
//! | [`convert`] | Document-to-PDF conversion with bounded retries |
//! | [`extract`] | PDF-to-markdown extraction staging |
//! | [`scanner`] | Escape-aware markdown image-tag lexer |
//! | [`caption`] | Vision collaborator and content-hash caption cache |
//! | [`rewrite`] | Image-tag to caption substitution |
//! | [`chunking`] | Chunk splitting and chunk-file writing |
//! | [`pipeline`] | Orchestration and bounded chunking fan-out |
//! | [`manifest`] | Manifest persistence and assembly |
//! | [`progress`] | Structured progress events |

pub mod artifacts;
pub mod catalog;
pub mod caption;
pub mod chunking;
pub mod config;
pub mod convert;
pub mod extract;
pub mod manifest;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod rewrite;
pub mod scanner;
