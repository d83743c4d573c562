use crate::error::PipelineError;
use crate::loader::{write_atomic, RecordLoader};
use crate::record::{
    AggregateMetadata, ModelRollup, RunIndex, RunIndexEntry, RunRecord,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// File name of the published index artifact.
pub const INDEX_FILE: &str = "index.json";
/// File name of the published metadata artifact.
pub const METADATA_FILE: &str = "metadata.json";
/// File name of the optional CSV export.
pub const CSV_FILE: &str = "runs.csv";

/// Result of one aggregation pass.
pub struct AggregationOutcome {
    pub index: RunIndex,
    pub metadata: AggregateMetadata,
    /// Run ids skipped because their artifacts failed to load
    pub skipped: Vec<String>,
}

/// Folds all loadable run records into the index and metadata artifacts.
///
/// Both artifacts are regenerated wholesale on every pass, never patched
/// incrementally, so they are always a pure function of the current run
/// set. A corrupt run is skipped with a warning; it never aborts the pass.
pub struct Aggregator {
    loader: RecordLoader,
    runs_dir: PathBuf,
    site_dir: PathBuf,
}

impl Aggregator {
    /// Create an aggregator over the given runs and site directories.
    pub fn new(runs_dir: impl Into<PathBuf>, site_dir: impl Into<PathBuf>) -> Self {
        let runs_dir = runs_dir.into();
        Self {
            loader: RecordLoader::new(runs_dir.clone()),
            runs_dir,
            site_dir: site_dir.into(),
        }
    }

    /// Run one full pass: scan, load, fold, publish both artifacts.
    ///
    /// A pass over zero valid runs still succeeds and publishes an empty,
    /// well-formed index/metadata pair.
    pub fn run_pass(&self) -> Result<AggregationOutcome, PipelineError> {
        let outcome = self.fold()?;
        self.publish(&outcome.index, &outcome.metadata)?;
        info!(
            total = outcome.index.runs.len(),
            skipped = outcome.skipped.len(),
            "aggregation pass complete"
        );
        Ok(outcome)
    }

    /// Scan, load and fold the corpus in memory without publishing.
    pub fn fold(&self) -> Result<AggregationOutcome, PipelineError> {
        let run_ids = self.scan_run_ids()?;
        let (records, skipped) = self.load_surviving(&run_ids)?;

        Ok(AggregationOutcome {
            index: build_index(&records),
            metadata: build_metadata(&records),
            skipped,
        })
    }

    /// Load every surviving record in corpus order, for view layers that
    /// need the full records rather than the index projection.
    pub fn load_records(&self) -> Result<Vec<RunRecord>, PipelineError> {
        let run_ids = self.scan_run_ids()?;
        Ok(self.load_surviving(&run_ids)?.0)
    }

    /// Enumerate candidate run ids: every subdirectory of the runs
    /// directory. A missing runs directory is an empty corpus, not an error.
    pub fn scan_run_ids(&self) -> Result<Vec<String>, PipelineError> {
        if !self.runs_dir.exists() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.runs_dir).map_err(|source| {
            PipelineError::Publish {
                path: self.runs_dir.clone(),
                source,
            }
        })?;

        let mut run_ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        run_ids.sort();
        Ok(run_ids)
    }

    /// Load each run, collecting survivors. Recoverable failures (missing
    /// or malformed artifacts) are skipped with a warning; anything else
    /// escalates and aborts the pass.
    fn load_surviving(
        &self,
        run_ids: &[String],
    ) -> Result<(Vec<RunRecord>, Vec<String>), PipelineError> {
        let mut records = Vec::new();
        let mut skipped = Vec::new();

        for run_id in run_ids {
            match self.loader.load(run_id) {
                Ok(record) => records.push(record),
                Err(err) if err.is_recoverable() => {
                    warn!(run_id = %run_id, error = %err, "skipping run");
                    skipped.push(run_id.clone());
                }
                Err(err) => return Err(err),
            }
        }

        records.sort_by(|a, b| a.corpus_order(b));
        Ok((records, skipped))
    }

    /// Atomically publish both artifacts into the site directory.
    pub fn publish(
        &self,
        index: &RunIndex,
        metadata: &AggregateMetadata,
    ) -> Result<(), PipelineError> {
        write_artifact(&self.site_dir.join(INDEX_FILE), index)?;
        write_artifact(&self.site_dir.join(METADATA_FILE), metadata)
    }

    /// Export the index as CSV, one row per run, same atomic discipline.
    pub fn export_csv(&self, index: &RunIndex) -> Result<PathBuf, PipelineError> {
        let path = self.site_dir.join(CSV_FILE);
        let rendered = render_csv(index);
        write_atomic(&path, rendered.as_bytes())?;
        Ok(path)
    }
}

/// Serialize an artifact deterministically and write it atomically.
fn write_artifact<T: serde::Serialize>(path: &Path, artifact: &T) -> Result<(), PipelineError> {
    let rendered =
        serde_json::to_string_pretty(artifact).map_err(|e| PipelineError::Publish {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;
    write_atomic(path, rendered.as_bytes())
}

/// Project the sorted records into the index artifact.
pub fn build_index(records: &[RunRecord]) -> RunIndex {
    RunIndex {
        runs: records.iter().map(RunIndexEntry::from_record).collect(),
    }
}

/// Fold the records into corpus-wide metadata: totals, global mean, and a
/// rollup per model keyed by model name.
pub fn build_metadata(records: &[RunRecord]) -> AggregateMetadata {
    if records.is_empty() {
        return AggregateMetadata::empty();
    }

    let mut per_model: BTreeMap<String, Vec<&RunRecord>> = BTreeMap::new();
    for record in records {
        per_model
            .entry(record.model.name.clone())
            .or_default()
            .push(record);
    }

    let rollups: BTreeMap<String, ModelRollup> = per_model
        .into_iter()
        .map(|(name, runs)| {
            let rollup = roll_up_model(&runs);
            (name, rollup)
        })
        .collect();

    let global_average_accuracy =
        records.iter().map(|r| r.average_accuracy).sum::<f64>() / records.len() as f64;

    AggregateMetadata {
        total_runs: records.len(),
        total_models: rollups.len(),
        global_average_accuracy,
        per_model: rollups,
    }
}

/// Rollup for one model: run count, mean of run averages, and the tasks
/// with the best/worst mean accuracy across the model's runs.
fn roll_up_model(runs: &[&RunRecord]) -> ModelRollup {
    let mean = runs.iter().map(|r| r.average_accuracy).sum::<f64>() / runs.len() as f64;

    let mut task_accuracies: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for run in runs {
        for (task, metrics) in &run.results {
            if let Some(accuracy) = metrics.accuracy {
                task_accuracies.entry(task).or_default().push(accuracy);
            }
        }
    }

    let mut best_task: Option<(&str, f64)> = None;
    let mut worst_task: Option<(&str, f64)> = None;
    for (task, accuracies) in &task_accuracies {
        let task_mean = accuracies.iter().sum::<f64>() / accuracies.len() as f64;
        // Strict comparisons keep the first task name on ties; BTreeMap
        // iteration order makes that the lexicographically smallest.
        if best_task.is_none_or(|(_, best)| task_mean > best) {
            best_task = Some((task, task_mean));
        }
        if worst_task.is_none_or(|(_, worst)| task_mean < worst) {
            worst_task = Some((task, task_mean));
        }
    }

    ModelRollup {
        count: runs.len(),
        mean,
        best_task: best_task.map(|(task, _)| task.to_string()),
        worst_task: worst_task.map(|(task, _)| task.to_string()),
    }
}

/// Render the index as CSV in the shape the dashboard's download consumes.
fn render_csv(index: &RunIndex) -> String {
    let mut out = String::from(
        "run_id,timestamp,model,average_accuracy,tasks,task_count,has_summary,has_tracking_ref\n",
    );
    for entry in &index.runs {
        out.push_str(&format!(
            "{},{},{},{:.4},{},{},{},{}\n",
            csv_field(&entry.run_id),
            entry.timestamp.to_rfc3339(),
            csv_field(&entry.model),
            entry.average_accuracy,
            csv_field(&entry.tasks.join("; ")),
            entry.tasks.len(),
            entry.has_summary,
            entry.has_tracking_ref,
        ));
    }
    out
}

/// Quote a CSV field when it contains a delimiter or quote.
fn csv_field(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
