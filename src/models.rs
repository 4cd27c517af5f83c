//! Core data models used throughout corpus-mill.
//!
//! These types represent the sources, media assets, and chunks that flow
//! through the conversion pipeline, plus the corpus manifest that ties a
//! run's output together.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A discovered source file, produced by the catalog before any processing.
///
/// The identity hash is derived from the root-relative path only, never from
/// file bytes: two files at the same relative location always collide on
/// identity across reruns of the same tree. A file whose content changes in
/// place keeps its hash and relies on mtime ordering for staleness — see the
/// module note on [`crate::artifacts`].
#[derive(Debug, Clone)]
pub struct SourceRecord {
    /// Absolute path of the file as discovered.
    pub path: PathBuf,
    /// Path relative to the input root.
    pub rel_path: PathBuf,
    /// Hex identity hash of `rel_path`. Names every derived artifact.
    pub hash: String,
}

/// A deduplicated embedded image target within one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAsset {
    /// Asset identity: `<source-hash>_img_NNN`.
    pub id: String,
    /// Resolved image file, or the best-effort raw destination when the
    /// reference could not be resolved.
    pub source_file: PathBuf,
    /// Final caption substituted into the markdown.
    pub caption: String,
}

/// A chunk of captioned markdown, either freshly produced or recovered from
/// a prior manifest.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    /// Chunk identity: `chnk_<source-hash>_<suffix>`.
    pub chunk_id: String,
    /// The original (copied) source document this chunk came from.
    pub source_path: PathBuf,
    /// On-disk markdown file holding the chunk text.
    pub markdown_path: PathBuf,
    /// Free-form metadata. Always carries `source_rel` and `source_hash`;
    /// chunker-provided keys are never overwritten.
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// The complete, deduplicated output of one pipeline run.
#[derive(Debug)]
pub struct CorpusManifest {
    /// Chunk records, unique by chunk id (first occurrence wins).
    pub chunks: Vec<ChunkRecord>,
    /// Corpus output root.
    pub output_dir: PathBuf,
    /// Input root the sources were discovered under.
    pub input_dir: PathBuf,
    /// Whether a downstream embedding index must be refreshed.
    pub needs_embedding_refresh: bool,
}

impl CorpusManifest {
    pub fn chunk_ids(&self) -> impl Iterator<Item = &str> {
        self.chunks.iter().map(|c| c.chunk_id.as_str())
    }
}

/// A fully prepared document: converted, extracted, and caption-rewritten.
/// One of these is an independent fan-out unit for the chunking stage.
#[derive(Debug, Clone)]
pub struct PreparedDoc {
    /// The copied original under `originals/`.
    pub source_path: PathBuf,
    /// Caption-rewritten markdown under `markdown/`.
    pub markdown_path: PathBuf,
    /// Media assets collected during caption rewriting.
    pub media_assets: Vec<MediaAsset>,
    /// Root-relative path of the original source.
    pub source_rel: PathBuf,
    /// Identity hash naming every derived artifact of this document.
    pub source_hash: String,
}
