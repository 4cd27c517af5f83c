//! Vision captioning collaborator and the content-addressed caption cache.
//!
//! Captions are cached on disk keyed by `"{model}::{sha256(image bytes)}"`,
//! so identical image bytes captioned with the same model never trigger a
//! second request, regardless of which document referenced them. The cache
//! is read once per rewrite pass, mutated in memory, and written back at
//! most once if anything changed. Concurrent runs are not coordinated;
//! last writer wins.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::warn;

pub const CAPTION_START_MARKER: &str = "<!---MEDIA CAPTION STARTS --->";
pub const CAPTION_END_MARKER: &str = "<!---MEDIA CAPTION ENDS --->";

/// Placeholder caption when no alt text, file name, or model caption is
/// available.
pub const PLACEHOLDER_CAPTION: &str = "[이미지]";

/// External vision/captioning collaborator.
///
/// `caption` is best-effort: the returned map may omit entries for images
/// the model declined or failed on, and callers fall back per asset.
#[async_trait]
pub trait VisionService: Send + Sync {
    /// Whether a usable credential is present. When false the rewriter
    /// skips captioning entirely (with a warning) rather than failing.
    fn is_available(&self) -> bool;

    async fn caption(&self, images: &[PathBuf]) -> Result<HashMap<PathBuf, String>>;
}

/// Hex content hash of an image file's bytes, for cache keying.
pub fn content_hash(path: &Path) -> Result<String> {
    let blob = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&blob);
    Ok(format!("{:x}", hasher.finalize()))
}

pub fn cache_key(model: &str, digest: &str) -> String {
    format!("{model}::{digest}")
}

/// File-backed caption cache: a JSON object of cache key → caption.
#[derive(Debug)]
pub struct CaptionCache {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    changed: bool,
}

impl CaptionCache {
    /// Load the cache, tolerating a missing or unreadable file (unreadable
    /// caches are ignored with a warning, never an error).
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<BTreeMap<String, String>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable caption cache");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: path.to_path_buf(),
            entries,
            changed: false,
        }
    }

    /// Delete the on-disk cache and forget all entries.
    pub fn clear(path: &Path) -> Self {
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(path = %path.display(), error = %e, "failed to clear caption cache");
            }
        }
        Self {
            path: path.to_path_buf(),
            entries: BTreeMap::new(),
            changed: false,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.trim().is_empty())
    }

    pub fn insert(&mut self, key: String, caption: String) {
        if self.entries.get(&key).map(|v| v.as_str()) != Some(caption.as_str()) {
            self.entries.insert(key, caption);
            self.changed = true;
        }
    }

    /// Write the cache back if any entry changed this pass. Write failures
    /// are soft: logged and swallowed.
    pub fn save_if_changed(&mut self) {
        if !self.changed {
            return;
        }
        let write = || -> Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let body = serde_json::to_string_pretty(&self.entries)?;
            std::fs::write(&self.path, body)?;
            Ok(())
        };
        match write() {
            Ok(()) => self.changed = false,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to write caption cache")
            }
        }
    }
}
