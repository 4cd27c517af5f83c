//! Chunking stage: split captioned markdown into chunk files.
//!
//! The split itself is delegated to a [`Chunker`] collaborator. This stage
//! writes each returned chunk's text to its own file, derives the stable
//! chunk identity `chnk_<source-hash>_<suffix>`, and attaches metadata
//! defaults without overwriting chunker-provided values. Producing zero
//! chunks is a terminal error for that document.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

use crate::artifacts::chunk_id;
use crate::models::{ChunkRecord, MediaAsset, PreparedDoc};

/// One chunk as returned by a chunker: an identity suffix, the chunk text,
/// and any metadata the chunker wants carried into the manifest.
#[derive(Debug, Clone)]
pub struct ChunkPiece {
    pub suffix: String,
    pub text: String,
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// External markdown chunk-splitting collaborator.
#[async_trait]
pub trait Chunker: Send + Sync {
    async fn split(
        &self,
        markdown_path: &Path,
        source_path: &Path,
        media_assets: &[MediaAsset],
        prefix: &str,
    ) -> Result<Vec<ChunkPiece>>;
}

/// Chunk one prepared document: split, write chunk files, build records.
pub async fn chunk_prepared_doc(
    chunks_dir: &Path,
    chunker: &dyn Chunker,
    prepared: &PreparedDoc,
) -> Result<Vec<ChunkRecord>> {
    std::fs::create_dir_all(chunks_dir)?;
    let source_rel = prepared
        .source_rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    let pieces = chunker
        .split(
            &prepared.markdown_path,
            &prepared.source_path,
            &prepared.media_assets,
            &prepared.source_hash,
        )
        .await?;

    let mut records = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let mut metadata = piece.metadata;
        metadata
            .entry("source_rel".to_string())
            .or_insert_with(|| json!(source_rel));
        metadata
            .entry("source_hash".to_string())
            .or_insert_with(|| json!(prepared.source_hash));
        metadata.entry("media_assets".to_string()).or_insert_with(|| {
            serde_json::to_value(&prepared.media_assets).unwrap_or_default()
        });

        let id = chunk_id(&prepared.source_hash, &piece.suffix);
        let chunk_path = chunks_dir.join(format!("{id}.md"));
        std::fs::write(&chunk_path, &piece.text)
            .with_context(|| format!("Failed to write chunk {}", chunk_path.display()))?;

        records.push(ChunkRecord {
            chunk_id: id,
            source_path: prepared.source_path.clone(),
            markdown_path: chunk_path,
            metadata,
        });
    }

    if records.is_empty() {
        bail!(
            "Chunking produced no output for {}",
            prepared.markdown_path.display()
        );
    }
    Ok(records)
}

/// Approximate chars-per-token ratio used by the built-in chunker.
const CHARS_PER_TOKEN: usize = 4;

/// Built-in paragraph-boundary chunker.
///
/// Splits on blank lines while respecting a `max_tokens` budget, hard
/// splitting oversized paragraphs at line or space boundaries. Suffixes are
/// zero-padded indices, so chunk identities are stable across reruns of the
/// same text.
pub struct ParagraphChunker {
    max_tokens: usize,
}

impl ParagraphChunker {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    fn split_text(&self, text: &str) -> Vec<String> {
        let max_chars = self.max_tokens * CHARS_PER_TOKEN;
        let mut pieces: Vec<String> = Vec::new();
        let mut current = String::new();

        for para in text.split("\n\n") {
            let trimmed = para.trim();
            if trimmed.is_empty() {
                continue;
            }

            let would_be = if current.is_empty() {
                trimmed.len()
            } else {
                current.len() + 2 + trimmed.len()
            };
            if would_be > max_chars && !current.is_empty() {
                pieces.push(std::mem::take(&mut current));
            }

            if trimmed.len() > max_chars {
                if !current.is_empty() {
                    pieces.push(std::mem::take(&mut current));
                }
                let mut remaining = trimmed;
                while !remaining.is_empty() {
                    let split_at = floor_char_boundary(remaining, remaining.len().min(max_chars));
                    let actual = if split_at < remaining.len() {
                        remaining[..split_at]
                            .rfind('\n')
                            .or_else(|| remaining[..split_at].rfind(' '))
                            .map(|pos| pos + 1)
                            .unwrap_or(split_at.max(1))
                    } else {
                        split_at
                    };
                    pieces.push(remaining[..actual].trim().to_string());
                    remaining = &remaining[actual..];
                }
            } else {
                if !current.is_empty() {
                    current.push_str("\n\n");
                }
                current.push_str(trimmed);
            }
        }

        if !current.is_empty() {
            pieces.push(current);
        }
        pieces.retain(|p| !p.is_empty());
        if pieces.is_empty() {
            pieces.push(text.trim().to_string());
        }
        pieces
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

#[async_trait]
impl Chunker for ParagraphChunker {
    async fn split(
        &self,
        markdown_path: &Path,
        _source_path: &Path,
        _media_assets: &[MediaAsset],
        _prefix: &str,
    ) -> Result<Vec<ChunkPiece>> {
        let text = std::fs::read_to_string(markdown_path)
            .with_context(|| format!("Failed to read markdown {}", markdown_path.display()))?;

        Ok(self
            .split_text(&text)
            .into_iter()
            .enumerate()
            .map(|(index, text)| {
                let mut metadata = BTreeMap::new();
                metadata.insert("chunk_index".to_string(), json!(index));
                ChunkPiece {
                    suffix: format!("{index:04}"),
                    text,
                    metadata,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn prepared(dir: &Path, markdown: &str, hash: &str) -> PreparedDoc {
        let md = dir.join(format!("{hash}.md"));
        std::fs::write(&md, markdown).unwrap();
        PreparedDoc {
            source_path: dir.join("orig.docx"),
            markdown_path: md,
            media_assets: vec![],
            source_rel: PathBuf::from("docs/orig.docx"),
            source_hash: hash.to_string(),
        }
    }

    #[tokio::test]
    async fn writes_chunk_files_with_stable_ids() {
        let tmp = tempfile::TempDir::new().unwrap();
        let chunks_dir = tmp.path().join("chunk_markdown");
        let doc = prepared(tmp.path(), "First para.\n\nSecond para.", "abc");

        let chunker = ParagraphChunker::new(700);
        let records = chunk_prepared_doc(&chunks_dir, &chunker, &doc)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].chunk_id, "chnk_abc_0000");
        assert!(records[0].markdown_path.exists());
        assert_eq!(
            records[0].metadata.get("source_rel").unwrap(),
            &json!("docs/orig.docx")
        );
        assert_eq!(
            records[0].metadata.get("source_hash").unwrap(),
            &json!("abc")
        );
    }

    #[tokio::test]
    async fn chunker_metadata_is_not_overwritten() {
        struct OpinionatedChunker;

        #[async_trait]
        impl Chunker for OpinionatedChunker {
            async fn split(
                &self,
                _markdown_path: &Path,
                _source_path: &Path,
                _media_assets: &[MediaAsset],
                _prefix: &str,
            ) -> Result<Vec<ChunkPiece>> {
                let mut metadata = BTreeMap::new();
                metadata.insert("source_hash".to_string(), json!("chunker-says"));
                Ok(vec![ChunkPiece {
                    suffix: "0000".to_string(),
                    text: "body".to_string(),
                    metadata,
                }])
            }
        }

        let tmp = tempfile::TempDir::new().unwrap();
        let doc = prepared(tmp.path(), "anything", "abc");
        let records = chunk_prepared_doc(&tmp.path().join("chunks"), &OpinionatedChunker, &doc)
            .await
            .unwrap();
        assert_eq!(
            records[0].metadata.get("source_hash").unwrap(),
            &json!("chunker-says")
        );
    }

    #[tokio::test]
    async fn zero_chunks_is_terminal() {
        struct EmptyChunker;

        #[async_trait]
        impl Chunker for EmptyChunker {
            async fn split(
                &self,
                _markdown_path: &Path,
                _source_path: &Path,
                _media_assets: &[MediaAsset],
                _prefix: &str,
            ) -> Result<Vec<ChunkPiece>> {
                Ok(vec![])
            }
        }

        let tmp = tempfile::TempDir::new().unwrap();
        let doc = prepared(tmp.path(), "anything", "abc");
        let err = chunk_prepared_doc(&tmp.path().join("chunks"), &EmptyChunker, &doc)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("produced no output"));
    }

    #[test]
    fn paragraph_splitting_respects_budget() {
        let chunker = ParagraphChunker::new(5); // 20 chars
        let pieces =
            chunker.split_text("This is paragraph one.\n\nTwo here.\n\nAnd paragraph three.");
        assert!(pieces.len() > 1);
        for p in &pieces {
            assert!(!p.is_empty());
        }
    }

    #[test]
    fn small_text_single_piece() {
        let chunker = ParagraphChunker::new(700);
        let pieces = chunker.split_text("Hello, world!");
        assert_eq!(pieces, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn split_is_deterministic() {
        let chunker = ParagraphChunker::new(5);
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        assert_eq!(chunker.split_text(text), chunker.split_text(text));
    }
}
