use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Evaluation framework that produced a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum Framework {
    #[serde(rename = "lm-eval")]
    #[value(name = "lm-eval")]
    LmEval,
    #[serde(rename = "llama-cpp")]
    #[value(name = "llama-cpp")]
    LlamaCpp,
    #[serde(rename = "custom")]
    #[value(name = "custom")]
    Custom,
}

/// Model identity as reported by the evaluation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identifier; may contain a path separator (e.g. "models/llama-3-8b-q4_0.gguf")
    pub name: String,
    /// Raw size string from upstream (e.g. "4.1G"); normalization is a derived field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// Metrics for one task within a run.
///
/// Unknown metrics are preserved in `extra` rather than rejected, so newer
/// harness output stays loadable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetrics {
    /// Task accuracy in [0, 1]; None when the harness reported no accuracy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    /// Standard error of the accuracy estimate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<f64>,
    /// Any task-specific metrics beyond accuracy/stderr
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// One completed benchmark execution, written once as an immutable artifact.
///
/// `tracking_ref` and `summary` are augmentation fields: absent until the
/// corresponding best-effort step succeeds, appended without rewriting
/// anything else.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// Globally unique, stable run identifier (timestamp + framework derived)
    pub run_id: String,
    /// Primary ordering key; ties broken by run_id
    pub timestamp: DateTime<Utc>,
    /// Model under evaluation
    pub model: ModelInfo,
    /// Framework that executed the run
    pub framework: Framework,
    /// Task identifiers in execution order; non-empty, no duplicates
    pub tasks: Vec<String>,
    /// Per-task metrics keyed by task identifier
    pub results: BTreeMap<String, TaskMetrics>,
    /// Mean of defined per-task accuracies; recomputed, never trusted upstream
    pub average_accuracy: f64,
    /// Hardware tag the run executed on
    pub hardware_profile: String,
    /// Tracking-service run URL, present once the tracking step succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_ref: Option<String>,
    /// Generated narrative text, present once summarization succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl RunRecord {
    /// Recompute `average_accuracy` from the current results.
    ///
    /// Policy: mean over defined accuracies only; null accuracies are
    /// excluded from the denominator, and zero defined accuracies yields
    /// 0.0 rather than NaN.
    pub fn recompute_average(&mut self) {
        self.average_accuracy = average_of_defined(&self.results);
    }

    /// Ordering used everywhere a run sequence is built: timestamp
    /// descending, ties broken by run_id descending.
    pub fn corpus_order(&self, other: &Self) -> Ordering {
        other
            .timestamp
            .cmp(&self.timestamp)
            .then_with(|| other.run_id.cmp(&self.run_id))
    }
}

/// Mean of the defined per-task accuracies; 0.0 when none are defined.
pub fn average_of_defined(results: &BTreeMap<String, TaskMetrics>) -> f64 {
    let defined: Vec<f64> = results.values().filter_map(|m| m.accuracy).collect();
    if defined.is_empty() {
        return 0.0;
    }
    defined.iter().sum::<f64>() / defined.len() as f64
}

/// Lightweight projection of a run used for list views before the full
/// record is loaded. The boolean flags let the dashboard show placeholders
/// without fetching the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndexEntry {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    /// Model name only; size and derived fields come from the full record
    pub model: String,
    pub average_accuracy: f64,
    pub tasks: Vec<String>,
    pub has_summary: bool,
    pub has_tracking_ref: bool,
}

impl RunIndexEntry {
    /// Project a full record down to its index entry.
    pub fn from_record(record: &RunRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            timestamp: record.timestamp,
            model: record.model.name.clone(),
            average_accuracy: record.average_accuracy,
            tasks: record.tasks.clone(),
            has_summary: record.summary.is_some(),
            has_tracking_ref: record.tracking_ref.is_some(),
        }
    }
}

/// The index artifact: the fully-sorted entry sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIndex {
    pub runs: Vec<RunIndexEntry>,
}

/// Per-model rollup within the metadata artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRollup {
    /// Number of runs for this model
    pub count: usize,
    /// Mean of the runs' average accuracies
    pub mean: f64,
    /// Task with the highest mean accuracy across this model's runs
    pub best_task: Option<String>,
    /// Task with the lowest mean accuracy across this model's runs
    pub worst_task: Option<String>,
}

/// Corpus-wide statistics, rebuilt wholesale on every aggregation pass so
/// it is always a pure function of the current run set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateMetadata {
    pub total_runs: usize,
    pub total_models: usize,
    pub global_average_accuracy: f64,
    pub per_model: BTreeMap<String, ModelRollup>,
}

impl AggregateMetadata {
    /// A well-formed metadata object for an empty corpus.
    pub fn empty() -> Self {
        Self {
            total_runs: 0,
            total_models: 0,
            global_average_accuracy: 0.0,
            per_model: BTreeMap::new(),
        }
    }
}
