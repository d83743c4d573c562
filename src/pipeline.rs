use crate::aggregate::Aggregator;
use crate::annotate::Annotator;
use crate::config::Settings;
use crate::error::PipelineError;
use crate::loader::{write_atomic, RecordLoader, DATA_FILE};
use crate::record::{average_of_defined, Framework, ModelInfo, RunRecord, TaskMetrics};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// States of one benchmark execution, entered in order. `Aborted` is
/// terminal and reachable from `Configuring` (validation or user cancel)
/// and `Executing` (hard engine failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Configuring,
    Executing,
    Collecting,
    Aggregating,
    Annotating,
    Publishing,
    Done,
    Aborted,
}

impl RunState {
    /// Whether the machine may move from `self` to `to`.
    pub fn allows(self, to: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, to),
            (Configuring, Executing)
                | (Configuring, Aborted)
                | (Configuring, Done)
                | (Executing, Collecting)
                | (Executing, Aborted)
                | (Collecting, Aggregating)
                | (Aggregating, Annotating)
                | (Annotating, Publishing)
                | (Publishing, Done)
        )
    }
}

/// What one benchmark execution should run.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub model: String,
    pub model_size: Option<String>,
    pub tasks: Vec<String>,
    pub framework: Framework,
    pub hardware_profile: String,
}

impl RunPlan {
    /// Validate before any side effect occurs.
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.model.trim().is_empty() {
            return Err(PipelineError::InputValidation(
                "model identifier is required".to_string(),
            ));
        }
        if self.tasks.is_empty() {
            return Err(PipelineError::InputValidation(
                "at least one task is required".to_string(),
            ));
        }
        let mut seen = BTreeSet::new();
        for task in &self.tasks {
            if task.trim().is_empty() {
                return Err(PipelineError::InputValidation(
                    "empty task identifier".to_string(),
                ));
            }
            if !seen.insert(task.as_str()) {
                return Err(PipelineError::InputValidation(format!(
                    "duplicate task: {task}"
                )));
            }
        }
        Ok(())
    }
}

/// The evaluation engine boundary: executes the benchmark and leaves a
/// raw results artifact on disk.
#[async_trait]
pub trait EvalEngine: Send + Sync {
    async fn execute(&self, plan: &RunPlan, run_dir: &Path) -> Result<PathBuf, PipelineError>;
}

/// Engine adapter that shells out to an external harness program and
/// expects it to write `results.json` into the run directory.
pub struct CommandEngine {
    program: String,
}

impl CommandEngine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl EvalEngine for CommandEngine {
    async fn execute(&self, plan: &RunPlan, run_dir: &Path) -> Result<PathBuf, PipelineError> {
        let results_path = run_dir.join("results.json");
        let output = tokio::process::Command::new(&self.program)
            .arg("--model")
            .arg(&plan.model)
            .arg("--tasks")
            .arg(plan.tasks.join(","))
            .arg("--output_path")
            .arg(&results_path)
            .output()
            .await
            .map_err(|e| PipelineError::Execution(format!("{}: {e}", self.program)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::Execution(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }
        Ok(results_path)
    }
}

/// Raw engine output: either `{"results": {...}}` or a bare task map.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawResults {
    Wrapped {
        results: BTreeMap<String, BTreeMap<String, serde_json::Value>>,
    },
    Bare(BTreeMap<String, BTreeMap<String, serde_json::Value>>),
}

impl RawResults {
    fn into_inner(self) -> BTreeMap<String, BTreeMap<String, serde_json::Value>> {
        match self {
            RawResults::Wrapped { results } => results,
            RawResults::Bare(results) => results,
        }
    }
}

/// Outcome of one pipeline run.
#[derive(Debug)]
pub struct PipelineOutcome {
    pub run_id: String,
    pub state: RunState,
    /// The published record; None on a dry run
    pub record: Option<RunRecord>,
    /// Runs in the published index after this execution
    pub corpus_size: usize,
}

/// Drives one benchmark execution end-to-end through the run states.
///
/// Annotating is best-effort by design: tracking/summary failures log a
/// warning and the machine proceeds to Publishing, so a bad network call
/// never discards a successful benchmark run.
pub struct Pipeline {
    engine: Box<dyn EvalEngine>,
    annotator: Annotator,
    loader: RecordLoader,
    aggregator: Aggregator,
    runs_dir: PathBuf,
    state: RunState,
}

impl Pipeline {
    pub fn new(settings: &Settings, engine: Box<dyn EvalEngine>, annotator: Annotator) -> Self {
        Self {
            engine,
            annotator,
            loader: RecordLoader::new(settings.runs_dir.clone()),
            aggregator: Aggregator::new(settings.runs_dir.clone(), settings.site_dir.clone()),
            runs_dir: settings.runs_dir.clone(),
            state: RunState::Configuring,
        }
    }

    /// Current state of the machine.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Execute the plan. With `dry_run` the plan is validated and echoed
    /// and the machine finishes with no side effects.
    pub async fn run(
        &mut self,
        plan: &RunPlan,
        dry_run: bool,
    ) -> Result<PipelineOutcome, PipelineError> {
        // Configuring: validate before any side effect
        if let Err(err) = plan.validate() {
            self.transition(RunState::Aborted);
            return Err(err);
        }
        let started_at = Utc::now();
        let run_id = new_run_id(plan.framework, started_at);

        if dry_run {
            info!(
                run_id = %run_id,
                model = %plan.model,
                tasks = %plan.tasks.join(","),
                "dry run, stopping before execution"
            );
            self.transition(RunState::Done);
            return Ok(PipelineOutcome {
                run_id,
                state: self.state,
                record: None,
                corpus_size: 0,
            });
        }

        // Executing: hand off to the engine
        self.transition(RunState::Executing);
        let run_dir = self.runs_dir.join(&run_id);
        std::fs::create_dir_all(&run_dir).map_err(|source| PipelineError::Publish {
            path: run_dir.clone(),
            source,
        })?;
        let results_path = match self.engine.execute(plan, &run_dir).await {
            Ok(path) => path,
            Err(err) => {
                self.transition(RunState::Aborted);
                return Err(err);
            }
        };

        // Collecting: normalize the raw results into the run artifact
        self.transition(RunState::Collecting);
        let record = collect_record(&run_id, plan, &results_path, started_at)?;
        let data_path = run_dir.join(DATA_FILE);
        let rendered = serde_json::to_string_pretty(&record).map_err(|e| {
            PipelineError::MalformedArtifact {
                run_id: run_id.clone(),
                reason: e.to_string(),
            }
        })?;
        write_atomic(&data_path, rendered.as_bytes())?;

        // Aggregating: fold the corpus including the new run
        self.transition(RunState::Aggregating);
        let folded = self.aggregator.fold()?;
        info!(
            run_id = %run_id,
            corpus = folded.index.runs.len(),
            "corpus aggregated"
        );

        // Annotating: best-effort tracking + summary
        self.transition(RunState::Annotating);
        let record = self.annotator.annotate(record).await;
        if record.tracking_ref.is_some() || record.summary.is_some() {
            if let Err(err) = self.loader.append_augmentation(
                &run_id,
                record.tracking_ref.as_deref(),
                record.summary.as_deref(),
            ) {
                warn!(error = %err, "could not persist augmentation");
            }
        }

        // Publishing: regenerate and atomically write the site artifacts
        self.transition(RunState::Publishing);
        let outcome = self.aggregator.run_pass()?;

        self.transition(RunState::Done);
        Ok(PipelineOutcome {
            run_id,
            state: self.state,
            record: Some(record),
            corpus_size: outcome.index.runs.len(),
        })
    }

    fn transition(&mut self, to: RunState) {
        debug_assert!(self.state.allows(to), "{:?} -> {:?}", self.state, to);
        info!(from = ?self.state, to = ?to, "pipeline state");
        self.state = to;
    }
}

/// Derive the stable run identifier from the start instant and framework.
pub fn new_run_id(framework: Framework, now: DateTime<Utc>) -> String {
    let tag = match framework {
        Framework::LmEval => "lm-eval",
        Framework::LlamaCpp => "llama-cpp",
        Framework::Custom => "custom",
    };
    format!("{}_{}", now.format("%Y%m%d_%H%M%S"), tag)
}

/// Build the run record from the engine's raw results artifact.
///
/// Tasks the engine reported nothing for still appear in `results` with
/// no accuracy, so coverage stays visible downstream.
fn collect_record(
    run_id: &str,
    plan: &RunPlan,
    results_path: &Path,
    started_at: DateTime<Utc>,
) -> Result<RunRecord, PipelineError> {
    let content =
        std::fs::read_to_string(results_path).map_err(|_| PipelineError::MissingArtifact {
            run_id: run_id.to_string(),
            path: results_path.to_path_buf(),
        })?;

    let raw: RawResults =
        serde_json::from_str(&content).map_err(|e| PipelineError::MalformedArtifact {
            run_id: run_id.to_string(),
            reason: e.to_string(),
        })?;
    let mut raw_results = raw.into_inner();

    let mut results: BTreeMap<String, TaskMetrics> = BTreeMap::new();
    for task in &plan.tasks {
        let metrics = raw_results
            .remove(task)
            .map(crate::loader::normalize_metrics)
            .unwrap_or_default();
        results.insert(task.clone(), metrics);
    }

    let average_accuracy = average_of_defined(&results);

    Ok(RunRecord {
        run_id: run_id.to_string(),
        timestamp: started_at,
        model: ModelInfo {
            name: plan.model.clone(),
            size: plan.model_size.clone(),
        },
        framework: plan.framework,
        tasks: plan.tasks.clone(),
        results,
        average_accuracy,
        hardware_profile: plan.hardware_profile.clone(),
        tracking_ref: None,
        summary: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::INDEX_FILE;
    use crate::record::RunIndex;
    use std::time::Duration;
    use tempfile::tempdir;

    fn create_test_plan() -> RunPlan {
        RunPlan {
            model: "llama-3-8b-q4_0.gguf".to_string(),
            model_size: Some("4.1G".to_string()),
            tasks: vec!["hellaswag".to_string(), "arc_easy".to_string()],
            framework: Framework::LmEval,
            hardware_profile: "cpu".to_string(),
        }
    }

    fn test_settings(root: &Path) -> Settings {
        let mut settings = Settings::default();
        settings.runs_dir = root.join("runs");
        settings.site_dir = root.join("site");
        settings
    }

    fn no_annotator() -> Annotator {
        Annotator::new(None, None, Duration::from_secs(1))
    }

    /// Engine double that writes a fixed results artifact.
    struct StubEngine {
        body: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl EvalEngine for StubEngine {
        async fn execute(&self, _plan: &RunPlan, run_dir: &Path) -> Result<PathBuf, PipelineError> {
            if self.fail {
                return Err(PipelineError::Execution("engine crashed".to_string()));
            }
            let path = run_dir.join("results.json");
            std::fs::write(&path, self.body).unwrap();
            Ok(path)
        }
    }

    fn working_engine() -> Box<dyn EvalEngine> {
        Box::new(StubEngine {
            body: r#"{
                "results": {
                    "hellaswag": {"acc,none": 0.8, "acc_stderr,none": 0.02},
                    "arc_easy": {"accuracy": 0.6}
                }
            }"#,
            fail: false,
        })
    }

    #[test]
    fn test_state_transitions_follow_the_graph() {
        use RunState::*;
        assert!(Configuring.allows(Executing));
        assert!(Configuring.allows(Aborted));
        assert!(Executing.allows(Collecting));
        assert!(Executing.allows(Aborted));
        assert!(Collecting.allows(Aggregating));
        assert!(Aggregating.allows(Annotating));
        assert!(Annotating.allows(Publishing));
        assert!(Publishing.allows(Done));

        // No shortcuts and no leaving terminal states
        assert!(!Configuring.allows(Publishing));
        assert!(!Collecting.allows(Aborted));
        assert!(!Done.allows(Configuring));
        assert!(!Aborted.allows(Executing));
    }

    #[test]
    fn test_plan_validation() {
        assert!(create_test_plan().validate().is_ok());

        let mut no_model = create_test_plan();
        no_model.model = "  ".to_string();
        assert!(matches!(
            no_model.validate().unwrap_err(),
            PipelineError::InputValidation(_)
        ));

        let mut no_tasks = create_test_plan();
        no_tasks.tasks.clear();
        assert!(no_tasks.validate().is_err());

        let mut duplicate = create_test_plan();
        duplicate.tasks.push("hellaswag".to_string());
        assert!(duplicate
            .validate()
            .unwrap_err()
            .to_string()
            .contains("duplicate task"));
    }

    #[test]
    fn test_new_run_id_is_timestamp_and_framework_derived() {
        use chrono::TimeZone;
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 30, 5).unwrap();
        assert_eq!(
            new_run_id(Framework::LmEval, now),
            "20250601_123005_lm-eval"
        );
        assert_eq!(
            new_run_id(Framework::LlamaCpp, now),
            "20250601_123005_llama-cpp"
        );
    }

    #[tokio::test]
    async fn test_full_run_publishes_record_and_index() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut pipeline = Pipeline::new(&settings, working_engine(), no_annotator());

        let outcome = pipeline.run(&create_test_plan(), false).await.unwrap();

        assert_eq!(outcome.state, RunState::Done);
        assert_eq!(outcome.corpus_size, 1);
        let record = outcome.record.unwrap();
        // Average recomputed from the normalized engine output
        assert!((record.average_accuracy - 0.7).abs() < 1e-9);
        assert_eq!(record.results["hellaswag"].accuracy, Some(0.8));

        // The run artifact and the index both exist on disk
        assert!(settings.runs_dir.join(&outcome.run_id).join(DATA_FILE).exists());
        let index: RunIndex = serde_json::from_str(
            &std::fs::read_to_string(settings.site_dir.join(INDEX_FILE)).unwrap(),
        )
        .unwrap();
        assert_eq!(index.runs.len(), 1);
        assert_eq!(index.runs[0].run_id, outcome.run_id);
    }

    #[tokio::test]
    async fn test_invalid_plan_aborts_before_side_effects() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut pipeline = Pipeline::new(&settings, working_engine(), no_annotator());

        let mut plan = create_test_plan();
        plan.model = String::new();
        let err = pipeline.run(&plan, false).await.unwrap_err();

        assert!(matches!(err, PipelineError::InputValidation(_)));
        assert_eq!(pipeline.state(), RunState::Aborted);
        // No side effects: nothing was written anywhere
        assert!(!settings.runs_dir.exists());
        assert!(!settings.site_dir.exists());
    }

    #[tokio::test]
    async fn test_engine_failure_aborts_the_run() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let engine = Box::new(StubEngine {
            body: "",
            fail: true,
        });
        let mut pipeline = Pipeline::new(&settings, engine, no_annotator());

        let err = pipeline.run(&create_test_plan(), false).await.unwrap_err();
        assert!(matches!(err, PipelineError::Execution(_)));
        assert_eq!(pipeline.state(), RunState::Aborted);
    }

    #[tokio::test]
    async fn test_dry_run_has_no_side_effects() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let mut pipeline = Pipeline::new(&settings, working_engine(), no_annotator());

        let outcome = pipeline.run(&create_test_plan(), true).await.unwrap();
        assert_eq!(outcome.state, RunState::Done);
        assert!(outcome.record.is_none());
        assert!(!settings.runs_dir.exists());
        assert!(!settings.site_dir.exists());
    }

    #[tokio::test]
    async fn test_annotation_failure_does_not_discard_the_run() {
        struct FailingTracker;

        #[async_trait]
        impl crate::annotate::Tracker for FailingTracker {
            async fn log_run(&self, _record: &RunRecord) -> anyhow::Result<String> {
                anyhow::bail!("network unreachable")
            }
        }

        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let annotator = Annotator::new(
            Some(Box::new(FailingTracker)),
            None,
            Duration::from_secs(1),
        );
        let mut pipeline = Pipeline::new(&settings, working_engine(), annotator);

        let outcome = pipeline.run(&create_test_plan(), false).await.unwrap();
        // The run still published despite the tracking failure
        assert_eq!(outcome.state, RunState::Done);
        assert_eq!(outcome.corpus_size, 1);
        assert!(outcome.record.unwrap().tracking_ref.is_none());
    }

    #[tokio::test]
    async fn test_tasks_missing_from_engine_output_keep_coverage() {
        let dir = tempdir().unwrap();
        let settings = test_settings(dir.path());
        let engine = Box::new(StubEngine {
            body: r#"{"results": {"hellaswag": {"accuracy": 0.8}}}"#,
            fail: false,
        });
        let mut pipeline = Pipeline::new(&settings, engine, no_annotator());

        let outcome = pipeline.run(&create_test_plan(), false).await.unwrap();
        let record = outcome.record.unwrap();
        // arc_easy produced nothing: present with no accuracy, excluded
        // from the mean
        assert!(record.results.contains_key("arc_easy"));
        assert_eq!(record.results["arc_easy"].accuracy, None);
        assert!((record.average_accuracy - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_command_engine_reports_missing_program() {
        let engine = CommandEngine::new("benchboard-test-no-such-program");
        let dir = tempdir().unwrap();
        let err = engine
            .execute(&create_test_plan(), dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Execution(_)));
    }
}
