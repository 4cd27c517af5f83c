//! Derived-artifact addressing and staleness decisions.
//!
//! Every source is keyed by an identity hash of its root-relative path, and
//! that hash names the four derived locations: the original copy, the
//! converted PDF, the rendered markdown, and the chunk files. Freshness is
//! evaluated as a chain (copy ≥ source, PDF ≥ copy, markdown ≥ PDF, every
//! chunk ≥ markdown); the first broken link invalidates only what lies
//! downstream of it.
//!
//! Because the identity hash ignores file bytes, a file that changes content
//! at the same location is only caught by mtime ordering. On trees with
//! unreliable timestamps (restored backups) the pipeline can silently skip
//! changed content. Known limitation, inherited deliberately.
//!
//! Every decision here fails open toward reprocessing: a missing file or an
//! unreadable timestamp is treated as stale, never as fresh.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

use crate::config::Config;
use crate::models::ChunkRecord;

/// Identity hash for a root-relative path. Deterministic across runs and
/// hosts; independent of file contents.
pub fn relpath_hash(rel_path: &Path) -> String {
    let posix = rel_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    let mut hasher = Sha256::new();
    hasher.update(posix.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The derived paths owned by one identity hash.
#[derive(Debug, Clone)]
pub struct ArtifactChain {
    pub copy_path: PathBuf,
    pub pdf_path: PathBuf,
    pub markdown_path: PathBuf,
}

impl ArtifactChain {
    pub fn for_source(config: &Config, source: &Path, hash: &str) -> Self {
        let ext = source
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let copy_name = if ext.is_empty() {
            hash.to_string()
        } else {
            format!("{hash}.{ext}")
        };
        Self {
            copy_path: config.originals_dir().join(copy_name),
            pdf_path: config.converted_dir().join(format!("{hash}.pdf")),
            markdown_path: config.markdown_dir().join(format!("{hash}.md")),
        }
    }
}

/// Chunk identity for a prefix and chunker-assigned suffix.
pub fn chunk_id(source_hash: &str, suffix: &str) -> String {
    format!("chnk_{source_hash}_{suffix}")
}

fn mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// True when the whole chain through the recorded chunks is fresh and the
/// document can be skipped entirely. Empty `existing_chunks` always means
/// reprocess.
pub fn should_skip_reprocessing(chain: &ArtifactChain, existing_chunks: &[ChunkRecord]) -> bool {
    if existing_chunks.is_empty() {
        return false;
    }

    let Some(source_mtime) = mtime(&chain.copy_path) else {
        return false;
    };
    let Some(pdf_mtime) = mtime(&chain.pdf_path) else {
        return false;
    };
    if pdf_mtime < source_mtime {
        return false;
    }
    let Some(md_mtime) = mtime(&chain.markdown_path) else {
        return false;
    };
    if md_mtime < pdf_mtime {
        return false;
    }

    existing_chunks.iter().all(|chunk| {
        mtime(&chunk.markdown_path)
            .map(|t| t >= md_mtime)
            .unwrap_or(false)
    })
}

/// Chunking-disabled variant: copy → PDF → markdown only.
pub fn artifacts_up_to_date(chain: &ArtifactChain) -> bool {
    let Some(source_mtime) = mtime(&chain.copy_path) else {
        return false;
    };
    let Some(pdf_mtime) = mtime(&chain.pdf_path) else {
        return false;
    };
    if pdf_mtime < source_mtime {
        return false;
    }
    mtime(&chain.markdown_path)
        .map(|t| t >= pdf_mtime)
        .unwrap_or(false)
}

/// Recovered chunk records are only trusted when every chunk id carries the
/// current identity hash prefix; a mismatch means the recorded identity
/// diverged from this tree.
pub fn chunks_match_hash(existing_chunks: &[ChunkRecord], source_hash: &str) -> bool {
    let prefix = format!("chnk_{source_hash}_");
    existing_chunks
        .iter()
        .all(|chunk| chunk.chunk_id.starts_with(&prefix))
}

/// Delete stale chunk files. Removal failures are logged and ignored; the
/// records are being dropped either way.
pub fn remove_chunk_artifacts(chunks: &[ChunkRecord]) {
    for chunk in chunks {
        if let Err(e) = std::fs::remove_file(&chunk.markdown_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(
                    path = %chunk.markdown_path.display(),
                    error = %e,
                    "failed to remove stale chunk markdown"
                );
            }
        }
    }
}

/// Copy the source into `originals/` when the copy is missing or older than
/// the source. Returns the copy path.
pub fn copy_original(source: &Path, chain: &ArtifactChain) -> Result<PathBuf> {
    let target = &chain.copy_path;
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stale = match (mtime(source), mtime(target)) {
        (Some(src), Some(dst)) => src > dst,
        _ => true,
    };
    if stale {
        debug!(source = %source.display(), target = %target.display(), "copying original");
        std::fs::copy(source, target)?;
    }
    Ok(target.clone())
}
