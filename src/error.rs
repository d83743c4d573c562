use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the benchmark pipeline and aggregation passes.
///
/// Variants split into fatal (`InputValidation`, `Execution`, `Publish`)
/// and per-run recoverable (`MissingArtifact`, `MalformedArtifact`,
/// `Augmentation`). Recoverable errors are logged and skipped; they never
/// escalate past the aggregator boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid input detected before any side effect occurred.
    #[error("invalid input: {0}")]
    InputValidation(String),

    /// The evaluation engine itself failed; the run is aborted.
    #[error("evaluation engine failed: {0}")]
    Execution(String),

    /// No result artifact exists at the expected location.
    #[error("no result artifact for run {run_id} at {path}")]
    MissingArtifact { run_id: String, path: PathBuf },

    /// The result artifact exists but cannot be parsed into a run record.
    #[error("malformed artifact for run {run_id}: {reason}")]
    MalformedArtifact { run_id: String, reason: String },

    /// A tracking or summarization call failed; the run proceeds unaugmented.
    #[error("augmentation failed for run {run_id}: {reason}")]
    Augmentation { run_id: String, reason: String },

    /// Writing an index/metadata artifact failed. Previous artifacts are
    /// intact because writes are atomic.
    #[error("failed to publish {path}: {source}")]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PipelineError {
    /// Whether the aggregator may skip this run and continue the pass.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PipelineError::MissingArtifact { .. }
                | PipelineError::MalformedArtifact { .. }
                | PipelineError::Augmentation { .. }
        )
    }
}
