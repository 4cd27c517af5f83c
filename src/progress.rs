//! Pipeline progress reporting.
//!
//! Emits one event per discrete pipeline milestone (discovery total,
//! per-file conversion start, extraction done, chunking start/progress) so
//! an external observer can render progress. Events go to **stderr** so
//! stdout remains parseable for scripts, and the absence of any consumer
//! never affects pipeline correctness.

use std::io::Write;
use std::path::PathBuf;

/// A single progress event for one pipeline run.
#[derive(Clone, Debug)]
pub enum PipelineEvent {
    /// Discovery finished: `total` eligible files under `input_dir`.
    Discovered { total: u64, input_dir: PathBuf },
    /// Conversion/extraction is starting for file `current` of `total`.
    ConvertStart {
        current: u64,
        total: u64,
        file: PathBuf,
    },
    /// Markdown extraction (and caption rewriting) finished for this file.
    ExtractDone {
        current: u64,
        total: u64,
        file: PathBuf,
    },
    /// Chunking fan-out is starting over `total` prepared documents.
    ChunkStart { total: u64 },
    /// `current` of `total` fan-out units have completed.
    ChunkProgress { current: u64, total: u64 },
}

/// Reports pipeline progress. Implementations write to stderr.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: PipelineEvent);
}

/// Human-friendly progress lines on stderr.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: PipelineEvent) {
        let line = match &event {
            PipelineEvent::Discovered { total, input_dir } => {
                format!("convert  discovered {} file(s) in {}\n", total, input_dir.display())
            }
            PipelineEvent::ConvertStart {
                current,
                total,
                file,
            } => format!("convert  [{current}/{total}]  {}\n", file.display()),
            PipelineEvent::ExtractDone {
                current,
                total,
                file,
            } => format!("extract  [{current}/{total}]  {}\n", file.display()),
            PipelineEvent::ChunkStart { total } => {
                format!("chunk    starting over {total} document(s)\n")
            }
            PipelineEvent::ChunkProgress { current, total } => {
                format!("chunk    [{current}/{total}]\n")
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: PipelineEvent) {
        let obj = match &event {
            PipelineEvent::Discovered { total, input_dir } => serde_json::json!({
                "stage": "preprocess",
                "sub": "discover",
                "total": total,
                "input_dir": input_dir,
            }),
            PipelineEvent::ConvertStart {
                current,
                total,
                file,
            } => serde_json::json!({
                "stage": "preprocess",
                "sub": "convert_start",
                "current": current,
                "total": total,
                "file": file,
            }),
            PipelineEvent::ExtractDone {
                current,
                total,
                file,
            } => serde_json::json!({
                "stage": "preprocess",
                "sub": "extract_done",
                "current": current,
                "total": total,
                "file": file,
            }),
            PipelineEvent::ChunkStart { total } => serde_json::json!({
                "stage": "preprocess",
                "sub": "chunk_start",
                "total": total,
            }),
            PipelineEvent::ChunkProgress { current, total } => serde_json::json!({
                "stage": "preprocess",
                "sub": "chunk_progress",
                "current": current,
                "total": total,
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: PipelineEvent) {}
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
