//! # corpus-mill CLI (`cmill`)
//!
//! The `cmill` binary drives the incremental conversion pipeline: it
//! discovers documents under the configured input directory, converts
//! them to PDF, extracts markdown, substitutes image captions, chunks the
//! result, and records everything in `CHUNKS.jsonl`.
//!
//! ## Usage
//!
//! ```bash
//! cmill --config ./cmill.toml convert
//! cmill --config ./cmill.toml convert --no-chunking
//! cmill --config ./cmill.toml convert --clear-caption-cache --progress json
//! cmill --config ./cmill.toml manifest
//! ```
//!
//! The conversion and extraction engines are external commands configured
//! in the TOML file (`conversion.command`, `extraction.command`), with
//! `{input}`/`{output}` placeholders. No captioning service is wired by
//! default, so captions fall back to alt text; library users can plug a
//! [`corpus_mill::caption::VisionService`] implementation instead.

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use corpus_mill::chunking::ParagraphChunker;
use corpus_mill::config::{load_config, Config};
use corpus_mill::convert::CommandConverter;
use corpus_mill::extract::CommandExtractor;
use corpus_mill::pipeline::{run_pipeline, Collaborators};
use corpus_mill::progress::ProgressMode;

/// corpus-mill — an incremental document-to-markdown corpus pipeline.
#[derive(Parser)]
#[command(
    name = "cmill",
    about = "corpus-mill — convert a directory of documents into captioned markdown chunks",
    version,
    long_about = "corpus-mill ingests a directory of heterogeneous documents (office formats, \
    images, PDFs), converts them to normalized markdown with inline image captions, and splits \
    the result into chunk files for downstream embedding. Repeated runs reuse every artifact \
    that is still fresh."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./cmill.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the conversion pipeline over the configured input directory.
    ///
    /// Sources whose whole artifact chain (copy → PDF → markdown →
    /// chunks) is still fresh are skipped; everything else regenerates
    /// from the first stale stage onward.
    Convert {
        /// Stop after markdown rendering; do not produce chunk files.
        #[arg(long)]
        no_chunking: bool,

        /// Delete the on-disk caption cache before this run.
        #[arg(long)]
        clear_caption_cache: bool,

        /// Bypass the caption cache (one batched request per document).
        #[arg(long)]
        no_caption_cache: bool,

        /// Progress reporting: off, human, or json (stderr).
        /// Defaults to human when stderr is a TTY, otherwise off.
        #[arg(long)]
        progress: Option<String>,
    },

    /// Print the recorded manifest, one `<chunk-id>\t<source>` per line.
    Manifest,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("corpus_mill=info,cmill=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Convert {
            no_chunking,
            clear_caption_cache,
            no_caption_cache,
            progress,
        } => {
            run_convert(
                config,
                no_chunking,
                clear_caption_cache,
                no_caption_cache,
                progress,
            )
            .await
        }
        Commands::Manifest => print_manifest(&config),
    }
}

async fn run_convert(
    mut config: Config,
    no_chunking: bool,
    clear_caption_cache: bool,
    no_caption_cache: bool,
    progress: Option<String>,
) -> Result<()> {
    if no_chunking {
        config.chunking.enabled = false;
    }
    if clear_caption_cache {
        config.captioning.clear_cache = true;
    }
    if no_caption_cache {
        config.captioning.disable_cache = true;
    }

    let mode = match progress.as_deref() {
        None => ProgressMode::default_for_tty(),
        Some("off") => ProgressMode::Off,
        Some("human") => ProgressMode::Human,
        Some("json") => ProgressMode::Json,
        Some(other) => bail!("Unknown progress mode: '{other}'. Must be off, human, or json."),
    };
    let reporter = mode.reporter();

    let Some(convert_command) = config.conversion.command.clone() else {
        bail!("conversion.command must be configured to run the pipeline");
    };
    let Some(extract_command) = config.extraction.command.clone() else {
        bail!("extraction.command must be configured to run the pipeline");
    };

    let collaborators = Collaborators {
        converter: Arc::new(CommandConverter::new(convert_command)),
        extractor: Arc::new(CommandExtractor::new(extract_command)),
        chunker: Arc::new(ParagraphChunker::new(config.chunking.max_tokens)),
        vision: None,
    };

    let manifest = run_pipeline(&config, &collaborators, reporter.as_ref()).await?;

    println!("convert {}", config.io.input_dir.display());
    println!("  chunks: {}", manifest.chunks.len());
    println!(
        "  embedding refresh needed: {}",
        manifest.needs_embedding_refresh
    );
    println!("ok");
    Ok(())
}

fn print_manifest(config: &Config) -> Result<()> {
    let chunk_map = corpus_mill::manifest::load_existing_chunk_map(config);
    let mut ids: Vec<(String, PathBuf)> = chunk_map
        .into_values()
        .flatten()
        .map(|c| (c.chunk_id, c.source_path))
        .collect();
    ids.sort();
    for (id, source) in ids {
        println!("{id}\t{}", source.display());
    }
    Ok(())
}
