//! Pipeline orchestration.
//!
//! Coordinates the full conversion flow: discovery → staleness decision →
//! [skip | convert → extract → caption-rewrite] → chunking fan-out →
//! manifest assembly. Discovery and per-source preparation run strictly
//! sequentially (conversion engines are resource-heavy and the caption
//! cache is shared); only chunking is parallelized, over isolated per-unit
//! inputs and outputs.
//!
//! Per-document failures are collected rather than raised immediately, so
//! one bad document never short-circuits its siblings mid-batch. A run
//! with any collected failure still ends in a single aggregated error and
//! produces no manifest.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::artifacts::{
    artifacts_up_to_date, chunks_match_hash, copy_original, remove_chunk_artifacts,
    should_skip_reprocessing, ArtifactChain,
};
use crate::catalog::discover_sources;
use crate::caption::VisionService;
use crate::chunking::{chunk_prepared_doc, Chunker};
use crate::config::Config;
use crate::convert::{convert_to_pdf, Converter};
use crate::extract::{extract_raw_markdown, Extractor};
use crate::manifest::{load_existing_chunk_map, write_manifest, ManifestBuilder};
use crate::models::{ChunkRecord, CorpusManifest, PreparedDoc, SourceRecord};
use crate::progress::{PipelineEvent, ProgressReporter};
use crate::rewrite::{rewrite_markdown_with_captions, CaptionOptions};

/// The external collaborators for one pipeline run, passed explicitly so a
/// run carries no ambient global state.
pub struct Collaborators {
    pub converter: Arc<dyn Converter>,
    pub extractor: Arc<dyn Extractor>,
    pub chunker: Arc<dyn Chunker>,
    /// Captioning service; `None` (or an unavailable service) means image
    /// captions fall back to alt text without failing the run.
    pub vision: Option<Arc<dyn VisionService>>,
}

/// Run the full incremental pipeline and return the corpus manifest.
pub async fn run_pipeline(
    config: &Config,
    collaborators: &Collaborators,
    progress: &dyn ProgressReporter,
) -> Result<CorpusManifest> {
    let sources = discover_sources(config)?;
    progress.report(PipelineEvent::Discovered {
        total: sources.len() as u64,
        input_dir: config.io.input_dir.clone(),
    });

    if sources.is_empty() {
        info!(input_dir = %config.io.input_dir.display(), "no input files found");
        return Ok(ManifestBuilder::new().build(&config.io.input_dir, &config.io.output_dir, false));
    }

    let chunking_enabled = config.chunking.enabled;
    let mut existing_chunk_map = if chunking_enabled {
        load_existing_chunk_map(config)
    } else {
        HashMap::new()
    };

    let mut builder = ManifestBuilder::new();
    let mut errors: Vec<String> = Vec::new();
    let mut prepared_lookup: Vec<(String, PreparedDoc)> = Vec::new();

    let total = sources.len() as u64;
    for (index, source) in sources.iter().enumerate() {
        let current = index as u64 + 1;
        progress.report(PipelineEvent::ConvertStart {
            current,
            total,
            file: source.path.clone(),
        });

        let chain = ArtifactChain::for_source(config, &source.path, &source.hash);
        copy_original(&source.path, &chain)?;

        let mut existing_chunks = existing_chunk_map.remove(&source.hash).unwrap_or_default();
        if !existing_chunks.is_empty() && !chunks_match_hash(&existing_chunks, &source.hash) {
            remove_chunk_artifacts(&existing_chunks);
            existing_chunks.clear();
        }

        if chunking_enabled {
            if should_skip_reprocessing(&chain, &existing_chunks) {
                for chunk in existing_chunks {
                    builder.push_if_on_disk(chunk);
                }
                continue;
            }
        } else if artifacts_up_to_date(&chain) {
            continue;
        }

        match prepare_source(config, collaborators, source, &chain).await {
            Ok(prepared) => {
                progress.report(PipelineEvent::ExtractDone {
                    current,
                    total,
                    file: source.path.clone(),
                });
                if chunking_enabled {
                    prepared_lookup.push((source.hash.clone(), prepared));
                }
            }
            Err(e) => {
                let message = format!("Failed to process {}: {e:#}", source.path.display());
                error!("{message}");
                errors.push(message);
            }
        }
    }

    if !errors.is_empty() {
        bail!(errors.join("\n"));
    }

    if chunking_enabled && !prepared_lookup.is_empty() {
        let fresh = fan_out_chunking(config, collaborators, &prepared_lookup, progress).await?;
        for records in fresh {
            for record in records {
                builder.push(record);
            }
        }
    }

    if chunking_enabled {
        // Prior-run chunks for identities untouched by this run survive as
        // long as their files still exist. Sorted for a stable manifest.
        let mut untouched: Vec<_> = existing_chunk_map.into_iter().collect();
        untouched.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (_, chunks) in untouched {
            for chunk in chunks {
                builder.push_if_on_disk(chunk);
            }
        }
    }

    let needs_refresh = chunking_enabled && !builder.is_empty();
    let manifest = builder.build(&config.io.input_dir, &config.io.output_dir, needs_refresh);
    if chunking_enabled {
        write_manifest(config, &manifest)?;
    }
    Ok(manifest)
}

/// Convert, extract, and caption-rewrite one source into a prepared
/// fan-out unit.
async fn prepare_source(
    config: &Config,
    collaborators: &Collaborators,
    source: &SourceRecord,
    chain: &ArtifactChain,
) -> Result<PreparedDoc> {
    let pdf_path = convert_to_pdf(
        &chain.copy_path,
        chain,
        collaborators.converter.as_ref(),
        &config.conversion,
    )
    .await?;

    let raw_markdown = extract_raw_markdown(
        collaborators.extractor.as_ref(),
        &pdf_path,
        &config.markdown_dir(),
        &source.hash,
    )
    .await?;

    let cache_path = config.caption_cache_path();
    let options = CaptionOptions {
        model: &config.captioning.model,
        disable_cache: config.captioning.disable_cache,
        clear_cache: config.captioning.clear_cache,
        cache_path: &cache_path,
    };
    let media_assets = rewrite_markdown_with_captions(
        &raw_markdown,
        &chain.markdown_path,
        &source.hash,
        collaborators.vision.as_deref(),
        &options,
    )
    .await?;

    Ok(PreparedDoc {
        source_path: chain.copy_path.clone(),
        markdown_path: chain.markdown_path.clone(),
        media_assets,
        source_rel: source.rel_path.clone(),
        source_hash: source.hash.clone(),
    })
}

/// Execute the chunking units, sequentially for a single unit (or a single
/// unit of concurrency) and otherwise across a bounded pool. Unit failures
/// are accumulated and joined into one error after all units finish;
/// sibling successes are discarded when anything failed.
async fn fan_out_chunking(
    config: &Config,
    collaborators: &Collaborators,
    prepared_lookup: &[(String, PreparedDoc)],
    progress: &dyn ProgressReporter,
) -> Result<Vec<Vec<ChunkRecord>>> {
    let units = prepared_lookup.len();
    let max_workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(units);
    info!(units, max_workers, "chunking prepared documents");
    progress.report(PipelineEvent::ChunkStart {
        total: units as u64,
    });

    let chunks_dir = config.chunks_dir();
    let mut results: Vec<Option<Vec<ChunkRecord>>> = vec![None; units];
    let mut errors: Vec<String> = Vec::new();

    if units == 1 || max_workers == 1 {
        let mut done = 0u64;
        for (index, (_, prepared)) in prepared_lookup.iter().enumerate() {
            match chunk_prepared_doc(&chunks_dir, collaborators.chunker.as_ref(), prepared).await {
                Ok(records) => {
                    results[index] = Some(records);
                    done += 1;
                    progress.report(PipelineEvent::ChunkProgress {
                        current: done,
                        total: units as u64,
                    });
                }
                Err(e) => {
                    let message =
                        format!("Failed to chunk {}: {e:#}", prepared.markdown_path.display());
                    error!("{message}");
                    errors.push(message);
                }
            }
        }
    } else {
        let semaphore = Arc::new(Semaphore::new(max_workers));
        let mut join_set: JoinSet<(usize, Result<Vec<ChunkRecord>>)> = JoinSet::new();
        for (index, (_, prepared)) in prepared_lookup.iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let chunker = Arc::clone(&collaborators.chunker);
            let chunks_dir = chunks_dir.clone();
            let prepared = prepared.clone();
            join_set.spawn(async move {
                let result = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .context("chunking semaphore closed")?;
                    chunk_prepared_doc(&chunks_dir, chunker.as_ref(), &prepared).await
                }
                .await;
                (index, result)
            });
        }

        let mut done = 0u64;
        while let Some(joined) = join_set.join_next().await {
            let (index, result) = joined?;
            match result {
                Ok(records) => {
                    results[index] = Some(records);
                    done += 1;
                    progress.report(PipelineEvent::ChunkProgress {
                        current: done,
                        total: units as u64,
                    });
                }
                Err(e) => {
                    let markdown_path = &prepared_lookup[index].1.markdown_path;
                    let message = format!("Failed to chunk {}: {e:#}", markdown_path.display());
                    error!("{message}");
                    errors.push(message);
                }
            }
        }
        errors.sort();
    }

    if !errors.is_empty() {
        bail!(errors.join("\n"));
    }

    // Completion order is nondeterministic; emit in submission order so
    // the manifest is stable.
    Ok(results.into_iter().flatten().collect())
}
