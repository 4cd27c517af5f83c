//! Source discovery: walks the input root and produces a deterministic,
//! deduplicated list of eligible files.
//!
//! Filtering rules: any path with a hidden (`.`-prefixed) segment is
//! skipped, as is any extension outside the supported set (plus `.pdf`).
//! Deduplication is by fully-resolved filesystem identity, so two nominal
//! paths pointing at the same file collapse to one entry with a warning.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::artifacts::relpath_hash;
use crate::config::Config;
use crate::models::SourceRecord;

/// Extensions the conversion stage accepts (besides `.pdf`). These are also
/// the extensions whose converters are known to fail transiently, so they
/// double as the retry-eligible set in [`crate::convert`].
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "hwp", "hwpx", "doc", "docx", "ppt", "pptx", "xls", "xlsx", "jpg", "jpeg", "png",
];

pub fn is_supported_extension(ext: &str) -> bool {
    SUPPORTED_EXTENSIONS.contains(&ext)
}

/// Scan the input root for eligible source files.
///
/// Returns records sorted by path, one per unique resolved file, each
/// carrying its root-relative path and identity hash.
pub fn discover_sources(config: &Config) -> Result<Vec<SourceRecord>> {
    let root = &config.io.input_dir;
    if !root.exists() {
        bail!("Input directory does not exist: {}", root.display());
    }

    let exclude_set = build_globset(&config.catalog.exclude_globs)?;

    let mut paths = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);

        if relative
            .components()
            .any(|c| c.as_os_str().to_string_lossy().starts_with('.'))
        {
            debug!(path = %path.display(), "skipping hidden file");
            continue;
        }

        if !config.catalog.exclude_globs.is_empty() && exclude_set.is_match(relative) {
            debug!(path = %path.display(), "skipping excluded file");
            continue;
        }

        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !is_supported_extension(&ext) && ext != "pdf" {
            debug!(path = %path.display(), "skipping unsupported file");
            continue;
        }

        paths.push(path.to_path_buf());
    }
    paths.sort();

    Ok(deduplicate_paths(paths)
        .into_iter()
        .map(|path| {
            let rel_path = compute_source_rel(&path, root);
            let hash = relpath_hash(&rel_path);
            SourceRecord {
                path,
                rel_path,
                hash,
            }
        })
        .collect())
}

/// Collapse paths that resolve to the same file. Keeps the first occurrence
/// in sorted order; duplicates are logged, never an error.
fn deduplicate_paths(paths: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut unique = Vec::new();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    for path in paths {
        let key = path.canonicalize().unwrap_or_else(|_| path.clone());
        if !seen.insert(key) {
            warn!(path = %path.display(), "skipping duplicate file");
            continue;
        }
        unique.push(path);
    }
    unique
}

/// Relative path of `source` under `input_root`, falling back to the bare
/// file name for paths outside the root.
pub fn compute_source_rel(source: &Path, input_root: &Path) -> PathBuf {
    source
        .strip_prefix(input_root)
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|_| PathBuf::from(source.file_name().unwrap_or_default()))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
