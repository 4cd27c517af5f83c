//! Extraction stage: turn a converted PDF into raw markdown.
//!
//! The actual PDF understanding lives in an external [`Extractor`]. This
//! stage only stages a scratch output directory next to the target
//! markdown, selects the first (sorted) markdown file the extractor
//! produced, and fails loudly when none appeared. Embedded media lands in
//! the same scratch directory, where the caption rewriter resolves image
//! references against it.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

/// External PDF-to-markdown extractor. Writes one or more `.md` files (and
/// any embedded media) into `output_dir`.
#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(&self, pdf: &Path, output_dir: &Path) -> Result<()>;
}

/// Scratch directory for one document's extraction output:
/// `markdown/<hash>_extract/`. Recreated from empty on each extraction.
pub fn scratch_dir(markdown_dir: &Path, source_hash: &str) -> PathBuf {
    markdown_dir.join(format!("{source_hash}_extract"))
}

/// Run the extractor for `pdf` and return the raw markdown file it
/// produced. With several candidates the first in sorted order wins.
pub async fn extract_raw_markdown(
    extractor: &dyn Extractor,
    pdf: &Path,
    markdown_dir: &Path,
    source_hash: &str,
) -> Result<PathBuf> {
    let scratch = scratch_dir(markdown_dir, source_hash);
    if scratch.exists() {
        std::fs::remove_dir_all(&scratch)
            .with_context(|| format!("Failed to clear scratch dir {}", scratch.display()))?;
    }
    std::fs::create_dir_all(&scratch)?;

    info!(pdf = %pdf.display(), "extracting markdown");
    extractor.extract(pdf, &scratch).await?;

    let mut candidates: Vec<PathBuf> = std::fs::read_dir(&scratch)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|e| e == "md").unwrap_or(false))
        .collect();
    candidates.sort();

    match candidates.into_iter().next() {
        Some(path) => Ok(path),
        None => bail!("Markdown extraction produced no files for {}", pdf.display()),
    }
}

/// Extractor that shells out to a configured command line, substituting
/// `{input}` and `{output}` placeholders per argument.
pub struct CommandExtractor {
    command: String,
}

impl CommandExtractor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Extractor for CommandExtractor {
    async fn extract(&self, pdf: &Path, output_dir: &Path) -> Result<()> {
        let args: Vec<String> = self
            .command
            .split_whitespace()
            .map(|tok| {
                tok.replace("{input}", &pdf.to_string_lossy())
                    .replace("{output}", &output_dir.to_string_lossy())
            })
            .collect();
        let Some((program, rest)) = args.split_first() else {
            bail!("extractor command is empty");
        };

        let output = tokio::process::Command::new(program)
            .args(rest)
            .output()
            .await?;
        if !output.status.success() {
            bail!(
                "extractor exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
