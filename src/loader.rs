use crate::error::PipelineError;
use crate::record::{average_of_defined, Framework, ModelInfo, RunRecord, TaskMetrics};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the per-run result artifact.
pub const DATA_FILE: &str = "data.json";
/// Side artifact holding the generated narrative summary.
pub const SUMMARY_FILE: &str = "summary.md";
/// Side artifact holding the tracking-service snapshot.
pub const TRACKING_FILE: &str = "tracking.json";

/// Raw artifact shape as written by the evaluation step.
///
/// Lenient on purpose: unknown fields are ignored, most fields are
/// optional, and metric keys come in several upstream spellings. The
/// loader normalizes all of that into a [`RunRecord`].
#[derive(Debug, Deserialize)]
struct RawArtifact {
    run_id: String,
    timestamp: DateTime<Utc>,
    model: ModelInfo,
    #[serde(default)]
    framework: Option<Framework>,
    #[serde(default)]
    tasks: Vec<String>,
    #[serde(default)]
    results: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    hardware_profile: Option<String>,
    #[serde(default)]
    tracking_ref: Option<String>,
    #[serde(default)]
    summary: Option<String>,
}

/// Tracking-service snapshot side artifact; only the run URL matters here.
#[derive(Debug, Deserialize)]
struct TrackingSnapshot {
    url: String,
}

/// Loads run artifacts from a runs directory, one subdirectory per run.
pub struct RecordLoader {
    runs_dir: PathBuf,
}

impl RecordLoader {
    /// Create a loader rooted at the given runs directory.
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    /// Directory holding the given run's artifacts.
    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir.join(run_id)
    }

    /// Load and normalize one run's record, then fold in any augmentation
    /// side artifacts. Absent side artifacts are not an error.
    pub fn load(&self, run_id: &str) -> Result<RunRecord, PipelineError> {
        let mut record = self.load_data(run_id)?;

        if record.tracking_ref.is_none() {
            record.tracking_ref = self.load_tracking_ref(run_id);
        }
        if record.summary.is_none() {
            record.summary = self.load_summary(run_id);
        }

        Ok(record)
    }

    /// Load the primary result artifact into a normalized record.
    fn load_data(&self, run_id: &str) -> Result<RunRecord, PipelineError> {
        let path = self.run_dir(run_id).join(DATA_FILE);
        if !path.exists() {
            return Err(PipelineError::MissingArtifact {
                run_id: run_id.to_string(),
                path,
            });
        }

        let content =
            std::fs::read_to_string(&path).map_err(|e| PipelineError::MalformedArtifact {
                run_id: run_id.to_string(),
                reason: e.to_string(),
            })?;

        let raw: RawArtifact =
            serde_json::from_str(&content).map_err(|e| PipelineError::MalformedArtifact {
                run_id: run_id.to_string(),
                reason: e.to_string(),
            })?;

        normalize(raw, run_id)
    }

    /// Load the narrative summary side artifact, if present.
    fn load_summary(&self, run_id: &str) -> Option<String> {
        let path = self.run_dir(run_id).join(SUMMARY_FILE);
        std::fs::read_to_string(path).ok().filter(|s| !s.is_empty())
    }

    /// Load the tracking-service run URL from the snapshot, if present.
    fn load_tracking_ref(&self, run_id: &str) -> Option<String> {
        let path = self.run_dir(run_id).join(TRACKING_FILE);
        let content = std::fs::read_to_string(path).ok()?;
        let snapshot: TrackingSnapshot = serde_json::from_str(&content).ok()?;
        Some(snapshot.url)
    }

    /// Append augmentation fields to an existing result artifact.
    ///
    /// Fields already present in the artifact are never rewritten; the
    /// artifact is replaced atomically so readers never see a partial file.
    pub fn append_augmentation(
        &self,
        run_id: &str,
        tracking_ref: Option<&str>,
        summary: Option<&str>,
    ) -> Result<(), PipelineError> {
        let path = self.run_dir(run_id).join(DATA_FILE);
        let content =
            std::fs::read_to_string(&path).map_err(|_| PipelineError::MissingArtifact {
                run_id: run_id.to_string(),
                path: path.clone(),
            })?;

        let mut value: serde_json::Value =
            serde_json::from_str(&content).map_err(|e| PipelineError::MalformedArtifact {
                run_id: run_id.to_string(),
                reason: e.to_string(),
            })?;

        let Some(object) = value.as_object_mut() else {
            return Err(PipelineError::MalformedArtifact {
                run_id: run_id.to_string(),
                reason: "artifact root is not an object".to_string(),
            });
        };

        if let Some(tracking_ref) = tracking_ref {
            object
                .entry("tracking_ref")
                .or_insert_with(|| serde_json::json!(tracking_ref));
        }
        if let Some(summary) = summary {
            object
                .entry("summary")
                .or_insert_with(|| serde_json::json!(summary));
        }

        let rendered = serde_json::to_string_pretty(&value).map_err(|e| {
            PipelineError::MalformedArtifact {
                run_id: run_id.to_string(),
                reason: e.to_string(),
            }
        })?;
        write_atomic(&path, rendered.as_bytes())?;
        debug!(run_id, "appended augmentation fields");
        Ok(())
    }
}

/// Turn a raw artifact into a validated record with normalized metrics and
/// a recomputed average.
fn normalize(raw: RawArtifact, run_id: &str) -> Result<RunRecord, PipelineError> {
    let tasks = if raw.tasks.is_empty() {
        raw.results.keys().cloned().collect()
    } else {
        raw.tasks
    };

    if tasks.is_empty() {
        return Err(PipelineError::MalformedArtifact {
            run_id: run_id.to_string(),
            reason: "run has no tasks".to_string(),
        });
    }

    let mut seen = BTreeSet::new();
    for task in &tasks {
        if !seen.insert(task.as_str()) {
            return Err(PipelineError::MalformedArtifact {
                run_id: run_id.to_string(),
                reason: format!("duplicate task id: {task}"),
            });
        }
    }

    let results: BTreeMap<String, TaskMetrics> = raw
        .results
        .into_iter()
        .map(|(task, metrics)| (task, normalize_metrics(metrics)))
        .collect();

    let average_accuracy = average_of_defined(&results);

    Ok(RunRecord {
        run_id: raw.run_id,
        timestamp: raw.timestamp,
        model: raw.model,
        framework: raw.framework.unwrap_or(Framework::LmEval),
        tasks,
        results,
        average_accuracy,
        hardware_profile: raw.hardware_profile.unwrap_or_else(|| "unknown".to_string()),
        tracking_ref: raw.tracking_ref,
        summary: raw.summary,
    })
}

/// Alternate upstream spellings of the accuracy metric, in priority order.
const ACCURACY_KEYS: [&str; 3] = ["accuracy", "acc", "acc,none"];
/// Alternate upstream spellings of the stderr metric, in priority order.
const STDERR_KEYS: [&str; 3] = ["stderr", "acc_stderr", "acc_stderr,none"];

/// Collapse the harness's metric-key spellings into the canonical shape.
/// Consumed alternate keys are dropped; everything else lands in `extra`.
pub(crate) fn normalize_metrics(mut raw: BTreeMap<String, serde_json::Value>) -> TaskMetrics {
    let accuracy = take_first_numeric(&mut raw, &ACCURACY_KEYS);
    let stderr = take_first_numeric(&mut raw, &STDERR_KEYS);

    TaskMetrics {
        accuracy,
        stderr,
        extra: raw,
    }
}

/// Remove and return the first key in `keys` holding a numeric value,
/// dropping the remaining alternates so they do not duplicate into `extra`.
fn take_first_numeric(
    raw: &mut BTreeMap<String, serde_json::Value>,
    keys: &[&str],
) -> Option<f64> {
    let mut found = None;
    for key in keys {
        if let Some(value) = raw.remove(*key) {
            if found.is_none() {
                found = value.as_f64();
            }
        }
    }
    found
}

/// Write a file atomically: write to a sibling temp path, then rename into
/// place, so a reader never observes a half-written artifact.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PipelineError> {
    let publish_err = |source: std::io::Error| PipelineError::Publish {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(publish_err)?;
    }

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, bytes).map_err(publish_err)?;
    std::fs::rename(&tmp, path).map_err(publish_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_run(dir: &Path, run_id: &str, data: &str) {
        let run_dir = dir.join(run_id);
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join(DATA_FILE), data).unwrap();
    }

    fn sample_artifact() -> &'static str {
        r#"{
            "run_id": "20250601_120000_lm-eval",
            "timestamp": "2025-06-01T12:00:00Z",
            "model": {"name": "models/llama-3-8b-q4_0.gguf", "size": "4.1G"},
            "framework": "lm-eval",
            "tasks": ["hellaswag", "arc_easy"],
            "results": {
                "hellaswag": {"accuracy": 0.8, "stderr": 0.02, "samples": 10042},
                "arc_easy": {"acc,none": 0.6, "acc_stderr,none": 0.03}
            },
            "average_accuracy": 0.99,
            "hardware_profile": "cpu-avx2"
        }"#
    }

    #[test]
    fn test_load_normalizes_and_recomputes_average() {
        let dir = tempdir().unwrap();
        write_run(dir.path(), "run_1", sample_artifact());

        let loader = RecordLoader::new(dir.path());
        let record = loader.load("run_1").unwrap();

        assert_eq!(record.run_id, "20250601_120000_lm-eval");
        assert_eq!(record.tasks, vec!["hellaswag", "arc_easy"]);
        // Alternate keys normalized into the canonical fields
        assert_eq!(record.results["arc_easy"].accuracy, Some(0.6));
        assert_eq!(record.results["arc_easy"].stderr, Some(0.03));
        // Unknown metrics preserved
        assert_eq!(
            record.results["hellaswag"].extra.get("samples"),
            Some(&serde_json::json!(10042))
        );
        // Upstream average (0.99) is ignored and recomputed: (0.8 + 0.6) / 2
        assert!((record.average_accuracy - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_load_missing_artifact() {
        let dir = tempdir().unwrap();
        let loader = RecordLoader::new(dir.path());

        let err = loader.load("absent").unwrap_err();
        assert!(matches!(err, PipelineError::MissingArtifact { .. }));
    }

    #[test]
    fn test_load_malformed_artifact() {
        let dir = tempdir().unwrap();
        write_run(dir.path(), "run_1", "{not json");

        let loader = RecordLoader::new(dir.path());
        let err = loader.load("run_1").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedArtifact { .. }));
    }

    #[test]
    fn test_load_tolerates_unknown_top_level_fields() {
        let dir = tempdir().unwrap();
        let data = r#"{
            "run_id": "run_1",
            "timestamp": "2025-06-01T12:00:00Z",
            "model": {"name": "m"},
            "tasks": ["hellaswag"],
            "results": {"hellaswag": {"accuracy": 0.5}},
            "completed": true,
            "total_tasks": 1,
            "wandb_history": [{"id": "abc"}]
        }"#;
        write_run(dir.path(), "run_1", data);

        let loader = RecordLoader::new(dir.path());
        let record = loader.load("run_1").unwrap();
        assert_eq!(record.framework, Framework::LmEval);
        assert_eq!(record.hardware_profile, "unknown");
    }

    #[test]
    fn test_load_rejects_empty_task_list() {
        let dir = tempdir().unwrap();
        let data = r#"{
            "run_id": "run_1",
            "timestamp": "2025-06-01T12:00:00Z",
            "model": {"name": "m"},
            "tasks": [],
            "results": {}
        }"#;
        write_run(dir.path(), "run_1", data);

        let loader = RecordLoader::new(dir.path());
        let err = loader.load("run_1").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedArtifact { .. }));
        assert!(err.to_string().contains("no tasks"));
    }

    #[test]
    fn test_load_rejects_duplicate_tasks() {
        let dir = tempdir().unwrap();
        let data = r#"{
            "run_id": "run_1",
            "timestamp": "2025-06-01T12:00:00Z",
            "model": {"name": "m"},
            "tasks": ["hellaswag", "hellaswag"],
            "results": {"hellaswag": {"accuracy": 0.5}}
        }"#;
        write_run(dir.path(), "run_1", data);

        let loader = RecordLoader::new(dir.path());
        let err = loader.load("run_1").unwrap_err();
        assert!(err.to_string().contains("duplicate task"));
    }

    #[test]
    fn test_load_derives_tasks_from_results_when_absent() {
        let dir = tempdir().unwrap();
        let data = r#"{
            "run_id": "run_1",
            "timestamp": "2025-06-01T12:00:00Z",
            "model": {"name": "m"},
            "results": {"arc_easy": {"accuracy": 0.6}, "hellaswag": {"accuracy": 0.8}}
        }"#;
        write_run(dir.path(), "run_1", data);

        let loader = RecordLoader::new(dir.path());
        let record = loader.load("run_1").unwrap();
        assert_eq!(record.tasks, vec!["arc_easy", "hellaswag"]);
    }

    #[test]
    fn test_side_artifacts_loaded_independently() {
        let dir = tempdir().unwrap();
        write_run(dir.path(), "run_1", sample_artifact());
        let run_dir = dir.path().join("run_1");
        std::fs::write(run_dir.join(SUMMARY_FILE), "# Summary\nGood run.").unwrap();
        std::fs::write(
            run_dir.join(TRACKING_FILE),
            r#"{"id": "abc123", "name": "llama-run", "url": "https://wandb.ai/r/abc123"}"#,
        )
        .unwrap();

        let loader = RecordLoader::new(dir.path());
        let record = loader.load("run_1").unwrap();
        assert_eq!(record.summary.as_deref(), Some("# Summary\nGood run."));
        assert_eq!(
            record.tracking_ref.as_deref(),
            Some("https://wandb.ai/r/abc123")
        );
    }

    #[test]
    fn test_absent_side_artifacts_are_not_an_error() {
        let dir = tempdir().unwrap();
        write_run(dir.path(), "run_1", sample_artifact());

        let loader = RecordLoader::new(dir.path());
        let record = loader.load("run_1").unwrap();
        assert!(record.summary.is_none());
        assert!(record.tracking_ref.is_none());
    }

    #[test]
    fn test_append_augmentation_never_rewrites_existing_fields() {
        let dir = tempdir().unwrap();
        write_run(dir.path(), "run_1", sample_artifact());
        let loader = RecordLoader::new(dir.path());

        loader
            .append_augmentation("run_1", Some("https://wandb.ai/r/1"), Some("first summary"))
            .unwrap();
        // A second append must not clobber the fields written by the first
        loader
            .append_augmentation("run_1", Some("https://wandb.ai/r/2"), Some("second summary"))
            .unwrap();

        let record = loader.load("run_1").unwrap();
        assert_eq!(record.tracking_ref.as_deref(), Some("https://wandb.ai/r/1"));
        assert_eq!(record.summary.as_deref(), Some("first summary"));
    }

    #[test]
    fn test_append_augmentation_missing_artifact() {
        let dir = tempdir().unwrap();
        let loader = RecordLoader::new(dir.path());

        let err = loader
            .append_augmentation("absent", Some("url"), None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingArtifact { .. }));
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("index.json");

        write_atomic(&path, b"{\"runs\": []}").unwrap();
        write_atomic(&path, b"{\"runs\": [1]}").unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"runs\": [1]}");
        // No temp file left behind
        assert!(!path.with_file_name("index.json.tmp").exists());
    }
}
