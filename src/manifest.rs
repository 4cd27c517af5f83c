//! Corpus manifest persistence and assembly.
//!
//! The manifest lives at `<output_dir>/CHUNKS.jsonl`, one JSON object per
//! chunk record. A prior run's manifest is consulted to recover chunk
//! records for sources that need no reprocessing; after a successful run
//! the merged manifest is written back. Records whose chunk file has gone
//! missing are dropped on load, and malformed lines are skipped rather
//! than failing the run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::artifacts::relpath_hash;
use crate::config::Config;
use crate::models::{ChunkRecord, CorpusManifest, MediaAsset};

/// On-disk shape of one manifest line.
#[derive(Debug, Serialize, Deserialize)]
struct ManifestLine {
    id: String,
    source_path: PathBuf,
    #[serde(default)]
    source_rel: Option<PathBuf>,
    #[serde(default)]
    source_hash: Option<String>,
    #[serde(default)]
    media_assets: Vec<MediaAsset>,
}

/// Load the prior manifest into a map of identity hash → recovered chunk
/// records. Tolerates a missing file and skips records that are malformed
/// or whose chunk file no longer exists.
pub fn load_existing_chunk_map(config: &Config) -> HashMap<String, Vec<ChunkRecord>> {
    let path = config.manifest_path();
    let file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(_) => return HashMap::new(),
    };

    let mut chunk_map: HashMap<String, Vec<ChunkRecord>> = HashMap::new();
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let record: ManifestLine = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping malformed manifest line");
                continue;
            }
        };

        let source_hash = match record.source_hash {
            Some(h) if !h.is_empty() => h,
            _ => match &record.source_rel {
                Some(rel) => relpath_hash(rel),
                None => continue,
            },
        };
        if record.id.is_empty() || record.source_path.as_os_str().is_empty() {
            continue;
        }

        let chunk_path = config.chunks_dir().join(format!("{}.md", record.id));
        if !chunk_path.exists() {
            continue;
        }

        let source_rel = record
            .source_rel
            .clone()
            .unwrap_or_else(|| PathBuf::from(record.source_path.file_name().unwrap_or_default()));
        let mut metadata = BTreeMap::new();
        metadata.insert(
            "media_assets".to_string(),
            serde_json::to_value(&record.media_assets).unwrap_or_default(),
        );
        metadata.insert(
            "source_rel".to_string(),
            serde_json::Value::String(
                source_rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
            ),
        );
        metadata.insert(
            "source_hash".to_string(),
            serde_json::Value::String(source_hash.clone()),
        );

        chunk_map
            .entry(source_hash)
            .or_default()
            .push(ChunkRecord {
                chunk_id: record.id,
                source_path: record.source_path,
                markdown_path: chunk_path,
                metadata,
            });
    }
    chunk_map
}

/// Write the manifest back to `CHUNKS.jsonl`, one record per line.
pub fn write_manifest(config: &Config, manifest: &CorpusManifest) -> Result<()> {
    let path = config.manifest_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(&path)
        .with_context(|| format!("Failed to write manifest {}", path.display()))?;

    for chunk in &manifest.chunks {
        let media_assets: Vec<MediaAsset> = chunk
            .metadata
            .get("media_assets")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        let line = ManifestLine {
            id: chunk.chunk_id.clone(),
            source_path: chunk.source_path.clone(),
            source_rel: chunk
                .metadata
                .get("source_rel")
                .and_then(|v| v.as_str())
                .map(PathBuf::from),
            source_hash: chunk
                .metadata
                .get("source_hash")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            media_assets,
        };
        writeln!(file, "{}", serde_json::to_string(&line)?)?;
    }
    Ok(())
}

/// Accumulates chunk records for one run's manifest, deduplicating by chunk
/// identity with first-occurrence-wins semantics.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    chunks: Vec<ChunkRecord>,
    seen: HashSet<String>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a record unless its identity was already seen. Returns whether
    /// the record was kept.
    pub fn push(&mut self, record: ChunkRecord) -> bool {
        if self.seen.contains(&record.chunk_id) {
            return false;
        }
        self.seen.insert(record.chunk_id.clone());
        self.chunks.push(record);
        true
    }

    /// Add a recovered record only when its chunk file still exists.
    pub fn push_if_on_disk(&mut self, record: ChunkRecord) -> bool {
        if !record.markdown_path.exists() {
            return false;
        }
        self.push(record)
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.seen.contains(chunk_id)
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn build(
        self,
        input_dir: &Path,
        output_dir: &Path,
        needs_embedding_refresh: bool,
    ) -> CorpusManifest {
        CorpusManifest {
            chunks: self.chunks,
            output_dir: output_dir.to_path_buf(),
            input_dir: input_dir.to_path_buf(),
            needs_embedding_refresh,
        }
    }
}
