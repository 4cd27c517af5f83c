//! Conversion stage: produce a normalized PDF for each source.
//!
//! PDF sources get a freshness-gated copy. Everything else is delegated to
//! an external [`Converter`] with a bounded retry loop: retries are granted
//! only for extensions known to fail transiently (office documents and
//! images), each failed attempt deletes partial output, and exhaustion
//! turns into a terminal error carrying the attempt count and the last
//! underlying failure.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::artifacts::ArtifactChain;
use crate::catalog::is_supported_extension;
use crate::config::ConversionConfig;

pub const DEFAULT_CONVERSION_ATTEMPTS: i64 = 3;

/// External document-to-PDF converter.
///
/// Implementations run the actual engine (LibreOffice, a remote service, a
/// test fake). On success they return the path of the produced PDF, which
/// need not equal `target`; the stage copies it into place when it differs.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, source: &Path, target: &Path) -> Result<PathBuf>;
}

/// Produce the converted PDF for `source`, reusing a fresh artifact when
/// possible.
pub async fn convert_to_pdf(
    source: &Path,
    chain: &ArtifactChain,
    converter: &dyn Converter,
    conversion: &ConversionConfig,
) -> Result<PathBuf> {
    let ext = source
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let pdf_path = &chain.pdf_path;
    if let Some(parent) = pdf_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if ext == "pdf" {
        let newer = match (mtime(source), mtime(pdf_path)) {
            (Some(src), Some(dst)) => src > dst,
            _ => true,
        };
        if newer {
            std::fs::copy(source, pdf_path)?;
        }
        return Ok(pdf_path.clone());
    }

    // Reuse the converted PDF only while it is at least as new as the copy;
    // a stale link regenerates everything downstream of it.
    if let (Some(src), Some(dst)) = (mtime(source), mtime(pdf_path)) {
        if dst >= src {
            return Ok(pdf_path.clone());
        }
        let _ = std::fs::remove_file(pdf_path);
    }

    let attempts = effective_attempts(conversion.max_attempts, &ext);

    let mut last_error: Option<String> = None;
    for attempt in 1..=attempts {
        if attempt == 1 {
            info!(source = %source.display(), "converting to PDF");
        } else {
            info!(
                source = %source.display(),
                attempt,
                attempts,
                "retrying conversion"
            );
        }
        match converter.convert(source, pdf_path).await {
            Ok(produced) => {
                if produced != *pdf_path {
                    std::fs::copy(&produced, pdf_path)?;
                }
                return Ok(pdf_path.clone());
            }
            Err(e) => {
                let message = e.to_string();
                warn!(
                    source = %source.display(),
                    attempt,
                    attempts,
                    error = %message,
                    "conversion attempt failed"
                );
                last_error = Some(message);
                if pdf_path.exists() {
                    let _ = std::fs::remove_file(pdf_path);
                }
            }
        }
    }

    let attempt_word = if attempts == 1 { "attempt" } else { "attempts" };
    bail!(
        "Failed to convert {} to PDF after {} {}: {}",
        source.display(),
        attempts,
        attempt_word,
        last_error.unwrap_or_else(|| "unknown error".to_string())
    );
}

/// Clamp the configured attempt count: invalid values fall back to the
/// default with a warning, and extensions outside the retry-eligible set
/// always get exactly one attempt.
fn effective_attempts(configured: i64, ext: &str) -> i64 {
    let mut attempts = configured;
    if attempts < 1 {
        warn!(
            configured,
            default = DEFAULT_CONVERSION_ATTEMPTS,
            "ignoring invalid max_attempts; falling back to default"
        );
        attempts = DEFAULT_CONVERSION_ATTEMPTS;
    }
    if !is_supported_extension(ext) && attempts > 1 {
        debug!(ext, "extension not retry-eligible; single attempt");
        attempts = 1;
    }
    attempts
}

/// Converter that shells out to a configured command line, substituting
/// `{input}` and `{output}` placeholders per argument.
pub struct CommandConverter {
    command: String,
}

impl CommandConverter {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl Converter for CommandConverter {
    async fn convert(&self, source: &Path, target: &Path) -> Result<PathBuf> {
        let args: Vec<String> = self
            .command
            .split_whitespace()
            .map(|tok| {
                tok.replace("{input}", &source.to_string_lossy())
                    .replace("{output}", &target.to_string_lossy())
            })
            .collect();
        let Some((program, rest)) = args.split_first() else {
            bail!("converter command is empty");
        };

        let output = tokio::process::Command::new(program)
            .args(rest)
            .output()
            .await?;
        if !output.status.success() {
            bail!(
                "converter exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        if !target.exists() {
            bail!("converter succeeded but produced no file at {}", target.display());
        }
        Ok(target.to_path_buf())
    }
}

fn mtime(path: &Path) -> Option<std::time::SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyConverter {
        calls: AtomicUsize,
        succeed_on: usize,
    }

    #[async_trait]
    impl Converter for FlakyConverter {
        async fn convert(&self, _source: &Path, target: &Path) -> Result<PathBuf> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                std::fs::write(target, b"%PDF-fake")?;
                Ok(target.to_path_buf())
            } else {
                // Leave a partial file behind to exercise cleanup.
                std::fs::write(target, b"partial")?;
                bail!("engine crashed (call {n})")
            }
        }
    }

    fn chain_in(dir: &Path) -> ArtifactChain {
        ArtifactChain {
            copy_path: dir.join("h.docx"),
            pdf_path: dir.join("h.pdf"),
            markdown_path: dir.join("h.md"),
        }
    }

    fn config(max_attempts: i64) -> ConversionConfig {
        ConversionConfig {
            max_attempts,
            command: None,
        }
    }

    #[tokio::test]
    async fn retries_until_success_for_eligible_extension() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("a.docx");
        std::fs::write(&source, b"doc").unwrap();
        let chain = chain_in(tmp.path());

        let converter = FlakyConverter {
            calls: AtomicUsize::new(0),
            succeed_on: 3,
        };
        let pdf = convert_to_pdf(&source, &chain, &converter, &config(3))
            .await
            .unwrap();
        assert_eq!(converter.calls.load(Ordering::SeqCst), 3);
        assert_eq!(std::fs::read(&pdf).unwrap(), b"%PDF-fake");
    }

    #[tokio::test]
    async fn single_attempt_when_configured_one() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("a.docx");
        std::fs::write(&source, b"doc").unwrap();
        let chain = chain_in(tmp.path());

        let converter = FlakyConverter {
            calls: AtomicUsize::new(0),
            succeed_on: 2,
        };
        let err = convert_to_pdf(&source, &chain, &converter, &config(1))
            .await
            .unwrap_err();
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("after 1 attempt"));
        assert!(err.to_string().contains("engine crashed"));
        assert!(!chain.pdf_path.exists(), "partial output must be deleted");
    }

    #[tokio::test]
    async fn ineligible_extension_never_retries() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("a.odt");
        std::fs::write(&source, b"doc").unwrap();
        let chain = chain_in(tmp.path());

        let converter = FlakyConverter {
            calls: AtomicUsize::new(0),
            succeed_on: 2,
        };
        let err = convert_to_pdf(&source, &chain, &converter, &config(5))
            .await
            .unwrap_err();
        assert_eq!(converter.calls.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("after 1 attempt"));
    }

    #[tokio::test]
    async fn invalid_attempts_fall_back_to_default() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("a.docx");
        std::fs::write(&source, b"doc").unwrap();
        let chain = chain_in(tmp.path());

        let converter = FlakyConverter {
            calls: AtomicUsize::new(0),
            succeed_on: 99,
        };
        let err = convert_to_pdf(&source, &chain, &converter, &config(0))
            .await
            .unwrap_err();
        assert_eq!(
            converter.calls.load(Ordering::SeqCst),
            DEFAULT_CONVERSION_ATTEMPTS as usize
        );
        assert!(err.to_string().contains("after 3 attempts"));
    }

    #[tokio::test]
    async fn pdf_source_is_copied_not_converted() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("a.pdf");
        std::fs::write(&source, b"%PDF-original").unwrap();
        let chain = ArtifactChain {
            copy_path: tmp.path().join("h.pdf"),
            pdf_path: tmp.path().join("converted/h.pdf"),
            markdown_path: tmp.path().join("h.md"),
        };

        let converter = FlakyConverter {
            calls: AtomicUsize::new(0),
            succeed_on: 1,
        };
        let pdf = convert_to_pdf(&source, &chain, &converter, &config(3))
            .await
            .unwrap();
        assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&pdf).unwrap(), b"%PDF-original");
    }

    #[tokio::test]
    async fn existing_target_reused_without_invoking_converter() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("a.docx");
        std::fs::write(&source, b"doc").unwrap();
        let chain = chain_in(tmp.path());
        std::fs::write(&chain.pdf_path, b"%PDF-cached").unwrap();

        let converter = FlakyConverter {
            calls: AtomicUsize::new(0),
            succeed_on: 1,
        };
        let pdf = convert_to_pdf(&source, &chain, &converter, &config(3))
            .await
            .unwrap();
        assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read(&pdf).unwrap(), b"%PDF-cached");
    }
}
