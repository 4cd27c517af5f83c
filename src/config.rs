use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub io: IoConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub captioning: CaptioningConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IoConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversionConfig {
    /// Conversion attempts for retry-eligible extensions. Values < 1 or
    /// otherwise unusable fall back to the default at the use site.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    /// External converter command with `{input}` and `{output}` placeholders.
    #[serde(default)]
    pub command: Option<String>,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            command: None,
        }
    }
}

fn default_max_attempts() -> i64 {
    3
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ExtractionConfig {
    /// External extractor command with `{input}` and `{output}` placeholders.
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptioningConfig {
    #[serde(default = "default_vision_model")]
    pub model: String,
    /// Skip the content-hash cache and batch-caption everything per document.
    #[serde(default)]
    pub disable_cache: bool,
    /// Delete the on-disk caption cache before the run. Usually set from
    /// the CLI rather than the config file.
    #[serde(default)]
    pub clear_cache: bool,
}

impl Default for CaptioningConfig {
    fn default() -> Self {
        Self {
            model: default_vision_model(),
            disable_cache: false,
            clear_cache: false,
        }
    }
}

fn default_vision_model() -> String {
    "gemini-2.5-flash-lite".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunking_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            enabled: default_chunking_enabled(),
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_chunking_enabled() -> bool {
    true
}

fn default_max_tokens() -> usize {
    700
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CatalogConfig {
    /// Glob patterns matched against root-relative paths; matches are skipped.
    #[serde(default)]
    pub exclude_globs: Vec<String>,
}

impl Config {
    pub fn originals_dir(&self) -> PathBuf {
        self.io.output_dir.join("originals")
    }

    pub fn converted_dir(&self) -> PathBuf {
        self.io.output_dir.join("converted")
    }

    pub fn markdown_dir(&self) -> PathBuf {
        self.io.output_dir.join("markdown")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.io.output_dir.join("chunk_markdown")
    }

    pub fn caption_cache_path(&self) -> PathBuf {
        self.io.output_dir.join("media_captions.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.io.output_dir.join("CHUNKS.jsonl")
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }

    if config.io.input_dir.as_os_str().is_empty() {
        anyhow::bail!("io.input_dir must not be empty");
    }

    if config.io.output_dir.as_os_str().is_empty() {
        anyhow::bail!("io.output_dir must not be empty");
    }

    Ok(config)
}
