//! Caption rewriting: replace markdown image tags with inline captions.
//!
//! Scans the raw extracted markdown for image references, resolves each to
//! a file, deduplicates identical targets into media assets, obtains
//! captions (cached by image content hash), and splices the caption markup
//! into each tag's exact span. Text outside those spans is preserved
//! byte-for-byte; trailing whitespace is stripped per line and the output
//! ends with exactly one newline.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::caption::{
    cache_key, content_hash, CaptionCache, VisionService, CAPTION_END_MARKER,
    CAPTION_START_MARKER, PLACEHOLDER_CAPTION,
};
use crate::models::MediaAsset;
use crate::scanner::{find_image_tags, percent_decode};

/// Captioning knobs for one rewrite pass.
pub struct CaptionOptions<'a> {
    pub model: &'a str,
    pub disable_cache: bool,
    pub clear_cache: bool,
    pub cache_path: &'a Path,
}

/// One deduplicated image target and its accumulated alt candidates.
struct AssetTarget {
    id: String,
    resolved: Option<PathBuf>,
    raw_path: String,
    alts: Vec<String>,
    caption: String,
}

/// Rewrite `source_markdown` into `target_path`, substituting captions for
/// image tags. Returns the media assets for downstream chunk metadata.
pub async fn rewrite_markdown_with_captions(
    source_markdown: &Path,
    target_path: &Path,
    source_hash: &str,
    vision: Option<&dyn VisionService>,
    opts: &CaptionOptions<'_>,
) -> Result<Vec<MediaAsset>> {
    let raw_text = std::fs::read_to_string(source_markdown)
        .with_context(|| format!("Failed to read markdown {}", source_markdown.display()))?;
    let tags = find_image_tags(&raw_text);

    if let Some(parent) = target_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if tags.is_empty() {
        std::fs::write(target_path, normalize_markdown(&raw_text))?;
        return Ok(Vec::new());
    }

    let markdown_root = source_markdown.parent().unwrap_or(Path::new("."));

    // Resolve every tag, then fold identical targets into one asset.
    struct Entry {
        span: (usize, usize),
        asset_idx: usize,
    }
    let mut entries: Vec<Entry> = Vec::new();
    let mut targets: Vec<AssetTarget> = Vec::new();
    let mut lookup: HashMap<String, usize> = HashMap::new();

    for tag in &tags {
        let alt = tag.alt_text.trim().to_string();
        let resolved = resolve_image_path(&tag.destination, markdown_root);
        if resolved.is_none() && !tag.destination.is_empty() {
            warn!(destination = %tag.destination, "image referenced in markdown not found");
        }

        let key = match &resolved {
            Some(path) => path
                .canonicalize()
                .unwrap_or_else(|_| path.clone())
                .to_string_lossy()
                .into_owned(),
            None => tag.destination.clone(),
        };
        let asset_idx = *lookup.entry(key).or_insert_with(|| {
            targets.push(AssetTarget {
                id: format!("{source_hash}_img_{:03}", targets.len()),
                resolved: resolved.clone(),
                raw_path: tag.destination.clone(),
                alts: Vec::new(),
                caption: String::new(),
            });
            targets.len() - 1
        });
        targets[asset_idx].alts.push(alt);
        entries.push(Entry {
            span: (tag.start, tag.end),
            asset_idx,
        });
    }

    let caption_lookup = generate_caption_lookup(&targets, vision, opts).await;
    for target in &mut targets {
        let caption = caption_lookup
            .get(&target.id)
            .cloned()
            .unwrap_or_else(|| fallback_caption(target));
        target.caption = if caption.trim().is_empty() {
            PLACEHOLDER_CAPTION.to_string()
        } else {
            caption.trim().to_string()
        };
    }

    // Splice: everything outside the tag spans is preserved verbatim.
    let mut parts = String::with_capacity(raw_text.len());
    let mut cursor = 0usize;
    for entry in &entries {
        let (start, end) = entry.span;
        parts.push_str(&raw_text[cursor..start]);
        parts.push_str(CAPTION_START_MARKER);
        parts.push(' ');
        parts.push_str(&targets[entry.asset_idx].caption);
        parts.push(' ');
        parts.push_str(CAPTION_END_MARKER);
        cursor = end;
    }
    parts.push_str(&raw_text[cursor..]);

    std::fs::write(target_path, normalize_markdown(&parts))?;

    Ok(targets
        .into_iter()
        .map(|t| MediaAsset {
            id: t.id,
            source_file: t
                .resolved
                .unwrap_or_else(|| PathBuf::from(percent_decode(&t.raw_path))),
            caption: t.caption,
        })
        .collect())
}

/// Strip trailing whitespace per line; end with exactly one newline when
/// there is any content.
fn normalize_markdown(text: &str) -> String {
    let mut normalized = text
        .lines()
        .map(|line| line.trim_end())
        .collect::<Vec<_>>()
        .join("\n");
    if !text.is_empty() {
        normalized.push('\n');
    }
    normalized
}

/// Resolve a raw image destination against the markdown's directory.
///
/// Order: percent-decoded path joined under the markdown dir (accepted only
/// when it stays inside that dir and exists), then an existing absolute
/// path, then a filename search of the markdown dir tree. `None` means
/// unresolved; callers log and fall back, never fail.
fn resolve_image_path(raw_path: &str, root_dir: &Path) -> Option<PathBuf> {
    let mut cleaned = percent_decode(raw_path.trim());
    if cleaned.is_empty() {
        return None;
    }
    if cleaned.starts_with('<') && cleaned.ends_with('>') {
        cleaned = cleaned[1..cleaned.len() - 1].to_string();
    }

    let candidate = root_dir.join(&cleaned);
    if candidate.exists() {
        if let (Ok(canon), Ok(root_canon)) = (candidate.canonicalize(), root_dir.canonicalize()) {
            if canon.starts_with(&root_canon) {
                return Some(canon);
            }
        }
    }

    let direct = PathBuf::from(&cleaned);
    if direct.is_absolute() && direct.exists() {
        return Some(direct);
    }

    let fallback_name = Path::new(&cleaned).file_name()?;
    WalkDir::new(root_dir)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name() == fallback_name)
        .map(|e| e.into_path())
}

/// First non-empty accumulated alt text, else the resolved file's stem,
/// else the raw destination's stem, else the placeholder.
fn fallback_caption(target: &AssetTarget) -> String {
    for alt in &target.alts {
        if !alt.trim().is_empty() {
            return alt.trim().to_string();
        }
    }
    if let Some(resolved) = &target.resolved {
        if let Some(stem) = resolved.file_stem() {
            return stem.to_string_lossy().into_owned();
        }
    }
    if !target.raw_path.is_empty() {
        let decoded = percent_decode(&target.raw_path);
        if let Some(stem) = Path::new(&decoded).file_stem() {
            return stem.to_string_lossy().into_owned();
        }
        return target.raw_path.clone();
    }
    PLACEHOLDER_CAPTION.to_string()
}

/// Produce captions per asset id, consulting the content-hash cache unless
/// disabled. Captioning is skipped entirely (soft) when no vision service
/// with a usable credential is present.
async fn generate_caption_lookup(
    targets: &[AssetTarget],
    vision: Option<&dyn VisionService>,
    opts: &CaptionOptions<'_>,
) -> HashMap<String, String> {
    let existing: Vec<usize> = targets
        .iter()
        .enumerate()
        .filter(|(_, t)| t.resolved.as_ref().map(|p| p.exists()).unwrap_or(false))
        .map(|(i, _)| i)
        .collect();
    if existing.is_empty() {
        return HashMap::new();
    }

    if opts.disable_cache {
        let Some(service) = vision.filter(|v| v.is_available()) else {
            warn!("no captioning credential available; skipping image caption generation");
            return HashMap::new();
        };
        let paths: Vec<PathBuf> = existing
            .iter()
            .filter_map(|&i| targets[i].resolved.clone())
            .collect();
        info!(count = paths.len(), "captioning images (cache disabled)");
        let raw = match service.caption(&paths).await {
            Ok(map) => map,
            Err(e) => {
                warn!(error = %e, "captioning request failed; falling back");
                return HashMap::new();
            }
        };
        return existing
            .iter()
            .filter_map(|&i| {
                let path = targets[i].resolved.as_ref()?;
                raw.get(path)
                    .map(|c| c.trim())
                    .filter(|c| !c.is_empty())
                    .map(|c| (targets[i].id.clone(), c.to_string()))
            })
            .collect();
    }

    let mut cache = if opts.clear_cache {
        CaptionCache::clear(opts.cache_path)
    } else {
        CaptionCache::load(opts.cache_path)
    };

    let mut captions: HashMap<String, String> = HashMap::new();
    let mut to_request: Vec<PathBuf> = Vec::new();
    let mut request_lookup: HashMap<PathBuf, (String, String)> = HashMap::new();

    for &i in &existing {
        let Some(path) = targets[i].resolved.clone() else {
            continue;
        };
        let digest = match content_hash(&path) {
            Ok(d) => d,
            Err(_) => continue,
        };
        let key = cache_key(opts.model, &digest);
        if let Some(cached) = cache.get(&key) {
            captions.insert(targets[i].id.clone(), cached.trim().to_string());
            continue;
        }
        request_lookup.insert(path.clone(), (targets[i].id.clone(), key));
        to_request.push(path);
    }

    if !to_request.is_empty() {
        let Some(service) = vision.filter(|v| v.is_available()) else {
            warn!("no captioning credential available; skipping image caption generation");
            return captions;
        };
        info!(count = to_request.len(), "captioning uncached images");
        match service.caption(&to_request).await {
            Ok(raw) => {
                for (path, text) in raw {
                    let Some((asset_id, key)) = request_lookup.get(&path) else {
                        continue;
                    };
                    let cleaned = text.trim();
                    if cleaned.is_empty() {
                        continue;
                    }
                    captions.insert(asset_id.clone(), cleaned.to_string());
                    cache.insert(key.clone(), cleaned.to_string());
                }
                cache.save_if_changed();
            }
            Err(e) => warn!(error = %e, "captioning request failed; falling back"),
        }
    }

    captions
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct RecordingVision {
        calls: AtomicUsize,
        requested: Mutex<Vec<usize>>,
        available: bool,
    }

    impl RecordingVision {
        fn new(available: bool) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                requested: Mutex::new(Vec::new()),
                available,
            }
        }
    }

    #[async_trait]
    impl VisionService for RecordingVision {
        fn is_available(&self) -> bool {
            self.available
        }

        async fn caption(&self, images: &[PathBuf]) -> Result<HashMap<PathBuf, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requested.lock().unwrap().push(images.len());
            Ok(images
                .iter()
                .map(|p| {
                    (
                        p.clone(),
                        format!("caption of {}", p.file_name().unwrap().to_string_lossy()),
                    )
                })
                .collect())
        }
    }

    fn opts<'a>(cache_path: &'a Path, model: &'a str) -> CaptionOptions<'a> {
        CaptionOptions {
            model,
            disable_cache: false,
            clear_cache: false,
            cache_path,
        }
    }

    async fn run_rewrite(
        dir: &Path,
        markdown: &str,
        vision: Option<&dyn VisionService>,
        options: &CaptionOptions<'_>,
    ) -> (String, Vec<MediaAsset>) {
        let src = dir.join("raw.md");
        let dst = dir.join("out.md");
        std::fs::write(&src, markdown).unwrap();
        let assets = rewrite_markdown_with_captions(&src, &dst, "hash", vision, options)
            .await
            .unwrap();
        (std::fs::read_to_string(&dst).unwrap(), assets)
    }

    #[tokio::test]
    async fn duplicate_references_share_one_caption_request() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("fig.png"), b"png bytes").unwrap();
        let cache = tmp.path().join("cache.json");
        let vision = RecordingVision::new(true);

        let md = "one ![first](fig.png) two ![second](fig.png)";
        let (out, assets) = run_rewrite(tmp.path(), md, Some(&vision), &opts(&cache, "m")).await;

        assert_eq!(vision.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*vision.requested.lock().unwrap(), vec![1]);
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].id, "hash_img_000");
        assert_eq!(out.matches("caption of fig.png").count(), 2);
    }

    #[tokio::test]
    async fn cached_caption_prevents_second_request() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("fig.png"), b"png bytes").unwrap();
        let cache = tmp.path().join("cache.json");
        let md = "![a](fig.png)";

        let vision = RecordingVision::new(true);
        run_rewrite(tmp.path(), md, Some(&vision), &opts(&cache, "m")).await;
        assert_eq!(vision.calls.load(Ordering::SeqCst), 1);

        // Same bytes, same model: served from cache.
        run_rewrite(tmp.path(), md, Some(&vision), &opts(&cache, "m")).await;
        assert_eq!(vision.calls.load(Ordering::SeqCst), 1);

        // Clearing the cache forces exactly one re-request.
        let cleared = CaptionOptions {
            clear_cache: true,
            ..opts(&cache, "m")
        };
        run_rewrite(tmp.path(), md, Some(&vision), &cleared).await;
        assert_eq!(vision.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_disabled_batches_once_and_tolerates_missing_entries() {
        struct PartialVision {
            calls: AtomicUsize,
            requested: Mutex<Vec<usize>>,
        }

        #[async_trait]
        impl VisionService for PartialVision {
            fn is_available(&self) -> bool {
                true
            }

            async fn caption(&self, images: &[PathBuf]) -> Result<HashMap<PathBuf, String>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.requested.lock().unwrap().push(images.len());
                // Declines every image but fig.png.
                Ok(images
                    .iter()
                    .filter(|p| p.file_name().map(|n| n == "fig.png").unwrap_or(false))
                    .map(|p| (p.clone(), "a painted chart".to_string()))
                    .collect())
            }
        }

        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("fig.png"), b"png").unwrap();
        std::fs::write(tmp.path().join("fig2.png"), b"png2").unwrap();
        let cache = tmp.path().join("cache.json");
        let vision = PartialVision {
            calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
        };

        let options = CaptionOptions {
            disable_cache: true,
            ..opts(&cache, "m")
        };
        let md = "![](fig.png) ![second figure](fig2.png)";
        let (out, _) = run_rewrite(tmp.path(), md, Some(&vision), &options).await;

        // Every candidate goes out in one batched request.
        assert_eq!(vision.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*vision.requested.lock().unwrap(), vec![2]);
        assert!(out.contains(&format!(
            "{CAPTION_START_MARKER} a painted chart {CAPTION_END_MARKER}"
        )));
        // The declined image falls back to its alt text.
        assert!(out.contains(&format!(
            "{CAPTION_START_MARKER} second figure {CAPTION_END_MARKER}"
        )));
        assert!(!cache.exists(), "disabled cache must never be written");
    }

    #[tokio::test]
    async fn missing_credential_falls_back_softly() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("fig.png"), b"png").unwrap();
        let cache = tmp.path().join("cache.json");
        let vision = RecordingVision::new(false);

        let md = "![diagram of flow](fig.png) and ![](fig2.png)";
        std::fs::write(tmp.path().join("fig2.png"), b"png2").unwrap();
        let (out, _) = run_rewrite(tmp.path(), md, Some(&vision), &opts(&cache, "m")).await;

        assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
        // Alt text first, file stem when alt is empty.
        assert!(out.contains(&format!("{CAPTION_START_MARKER} diagram of flow {CAPTION_END_MARKER}")));
        assert!(out.contains(&format!("{CAPTION_START_MARKER} fig2 {CAPTION_END_MARKER}")));
    }

    #[tokio::test]
    async fn unresolved_image_gets_placeholder_or_stem() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = tmp.path().join("cache.json");

        let md = "![](missing%20file.png)";
        let (out, assets) = run_rewrite(tmp.path(), md, None, &opts(&cache, "m")).await;
        assert!(out.contains("missing file"));
        assert_eq!(assets[0].source_file, PathBuf::from("missing file.png"));
    }

    #[tokio::test]
    async fn malformed_tags_left_untouched() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = tmp.path().join("cache.json");

        let md = "before ![unterminated (paren.png) after\n";
        let (out, assets) = run_rewrite(tmp.path(), md, None, &opts(&cache, "m")).await;
        assert_eq!(out, md);
        assert!(assets.is_empty());
    }

    #[tokio::test]
    async fn output_is_normalized() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cache = tmp.path().join("cache.json");

        let md = "line one   \nline two\t\n\nno trailing newline";
        let (out, _) = run_rewrite(tmp.path(), md, None, &opts(&cache, "m")).await;
        assert_eq!(out, "line one\nline two\n\nno trailing newline\n");
    }

    #[tokio::test]
    async fn destination_outside_markdown_dir_falls_back_to_name_search() {
        let tmp = tempfile::TempDir::new().unwrap();
        let nested = tmp.path().join("media");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("fig.png"), b"png").unwrap();
        let cache = tmp.path().join("cache.json");
        let vision = RecordingVision::new(true);

        // Bogus directory prefix, but the file name exists under the tree.
        let md = "![x](../../elsewhere/fig.png)";
        let (out, assets) = run_rewrite(tmp.path(), md, Some(&vision), &opts(&cache, "m")).await;
        assert_eq!(assets.len(), 1);
        assert!(assets[0].source_file.ends_with("media/fig.png"));
        assert!(out.contains("caption of fig.png"));
    }
}
