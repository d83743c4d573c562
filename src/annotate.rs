use crate::config::Settings;
use crate::error::PipelineError;
use crate::record::RunRecord;
use anyhow::{Context, Result};
use async_openai::{config::OpenAIConfig, types::CreateChatCompletionRequestArgs, Client};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Logs a completed run to the experiment-tracking service.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Returns the tracking reference (run URL) on success.
    async fn log_run(&self, record: &RunRecord) -> Result<String>;
}

/// Generates a short narrative summary for a completed run.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, record: &RunRecord) -> Result<String>;
}

/// Best-effort augmentation step: decorates a record with a tracking ref
/// and a summary when the collaborators succeed, and returns it unchanged
/// otherwise. Failures are logged, never propagated — a bad network call
/// must not discard a successful benchmark run.
pub struct Annotator {
    tracker: Option<Box<dyn Tracker>>,
    summarizer: Option<Box<dyn Summarizer>>,
    call_timeout: Duration,
}

impl Annotator {
    pub fn new(
        tracker: Option<Box<dyn Tracker>>,
        summarizer: Option<Box<dyn Summarizer>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            tracker,
            summarizer,
            call_timeout,
        }
    }

    /// Build an annotator from settings; collaborators whose API key
    /// environment variable is unset are silently disabled.
    pub fn from_settings(settings: &Settings) -> Self {
        let call_timeout = Duration::from_secs(settings.external_timeout_secs);

        let tracker: Option<Box<dyn Tracker>> = match HttpTracker::from_settings(settings) {
            Some(tracker) => Some(Box::new(tracker)),
            None => {
                debug!(
                    env_var = %settings.tracking_env_var_api_key,
                    "tracking API key not set, tracking disabled"
                );
                None
            }
        };

        let summarizer: Option<Box<dyn Summarizer>> = match ChatSummarizer::from_settings(settings)
        {
            Some(summarizer) => Some(Box::new(summarizer)),
            None => {
                debug!(
                    env_var = %settings.summary_env_var_api_key,
                    "summary API key not set, summarization disabled"
                );
                None
            }
        };

        Self::new(tracker, summarizer, call_timeout)
    }

    /// Augment the record with whatever sub-steps succeed.
    pub async fn annotate(&self, mut record: RunRecord) -> RunRecord {
        if record.tracking_ref.is_none() {
            record.tracking_ref = self.try_track(&record).await;
        }
        if record.summary.is_none() {
            record.summary = self.try_summarize(&record).await;
        }
        record
    }

    async fn try_track(&self, record: &RunRecord) -> Option<String> {
        let tracker = self.tracker.as_ref()?;
        match timeout(self.call_timeout, tracker.log_run(record)).await {
            Ok(Ok(url)) => {
                info!(run_id = %record.run_id, url = %url, "run logged to tracking service");
                Some(url)
            }
            Ok(Err(err)) => {
                self.warn_augmentation(record, format!("tracking call failed: {err:#}"));
                None
            }
            Err(_) => {
                self.warn_augmentation(record, "tracking call timed out".to_string());
                None
            }
        }
    }

    async fn try_summarize(&self, record: &RunRecord) -> Option<String> {
        let summarizer = self.summarizer.as_ref()?;
        match timeout(self.call_timeout, summarizer.summarize(record)).await {
            Ok(Ok(summary)) if !summary.is_empty() => {
                info!(run_id = %record.run_id, "summary generated");
                Some(summary)
            }
            Ok(Ok(_)) => {
                self.warn_augmentation(record, "summarizer returned empty text".to_string());
                None
            }
            Ok(Err(err)) => {
                self.warn_augmentation(record, format!("summarization failed: {err:#}"));
                None
            }
            Err(_) => {
                self.warn_augmentation(record, "summarization timed out".to_string());
                None
            }
        }
    }

    fn warn_augmentation(&self, record: &RunRecord, reason: String) {
        let err = PipelineError::Augmentation {
            run_id: record.run_id.clone(),
            reason,
        };
        warn!(error = %err, "proceeding without augmentation");
    }
}

/// HTTP client for the experiment-tracking service.
pub struct HttpTracker {
    client: reqwest::Client,
    endpoint: String,
    project: String,
    api_key: String,
}

impl HttpTracker {
    pub fn new(endpoint: impl Into<String>, project: impl Into<String>, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            project: project.into(),
            api_key,
        }
    }

    /// Build from settings; None when the API key variable is unset.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let api_key = std::env::var(&settings.tracking_env_var_api_key).ok()?;
        Some(Self::new(
            settings.tracking_endpoint.clone(),
            settings.tracking_project.clone(),
            api_key,
        ))
    }

    /// Request body: run config plus metrics flattened as `task/metric`.
    fn build_payload(&self, record: &RunRecord) -> serde_json::Value {
        let mut metrics = serde_json::Map::new();
        metrics.insert(
            "average_accuracy".to_string(),
            json!(record.average_accuracy),
        );
        metrics.insert("total_tasks".to_string(), json!(record.tasks.len()));
        for (task, task_metrics) in &record.results {
            if let Some(accuracy) = task_metrics.accuracy {
                metrics.insert(format!("{task}/accuracy"), json!(accuracy));
            }
            if let Some(stderr) = task_metrics.stderr {
                metrics.insert(format!("{task}/stderr"), json!(stderr));
            }
        }

        json!({
            "project": self.project,
            "run_id": record.run_id,
            "config": {
                "model": record.model.name,
                "tasks": record.tasks,
                "hardware": record.hardware_profile,
                "framework": record.framework,
                "timestamp": record.timestamp,
            },
            "metrics": metrics,
        })
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn log_run(&self, record: &RunRecord) -> Result<String> {
        let url = format!("{}/runs", self.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&self.build_payload(record))
            .send()
            .await
            .context("Failed to reach tracking service")?
            .error_for_status()
            .context("Tracking service rejected the run")?;

        let body: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse tracking response")?;

        body.get("url")
            .and_then(|u| u.as_str())
            .map(str::to_string)
            .context("Tracking response has no run URL")
    }
}

/// Summarizer backed by an OpenAI-compatible chat endpoint.
pub struct ChatSummarizer {
    endpoint: String,
    model: String,
    api_key: String,
}

impl ChatSummarizer {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>, api_key: String) -> Self {
        Self {
            endpoint: endpoint.into(),
            model: model.into(),
            api_key,
        }
    }

    /// Build from settings; None when the API key variable is unset.
    pub fn from_settings(settings: &Settings) -> Option<Self> {
        let api_key = std::env::var(&settings.summary_env_var_api_key).ok()?;
        Some(Self::new(
            settings.summary_endpoint.clone(),
            settings.summary_model.clone(),
            api_key,
        ))
    }

    fn create_client(&self) -> Client<OpenAIConfig> {
        let config = OpenAIConfig::new()
            .with_api_key(self.api_key.clone())
            .with_api_base(&self.endpoint);
        Client::with_config(config)
    }
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    async fn summarize(&self, record: &RunRecord) -> Result<String> {
        let system_message =
            async_openai::types::ChatCompletionRequestSystemMessageArgs::default()
                .content(
                    "You are a benchmark analyst. Write a concise markdown summary \
                     of the benchmark run you are given: overall accuracy, the \
                     strongest and weakest tasks, and anything notable.",
                )
                .build()
                .context("Failed to build system message")?
                .into();

        let user_message = async_openai::types::ChatCompletionRequestUserMessageArgs::default()
            .content(build_summary_prompt(record))
            .build()
            .context("Failed to build user message")?
            .into();

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages([system_message, user_message])
            .temperature(0.2)
            .build()
            .context("Failed to build summary request")?;

        let response = self
            .create_client()
            .chat()
            .create(request)
            .await
            .context("Failed to generate summary")?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }
}

/// Render the run facts the summarizer is asked to narrate.
fn build_summary_prompt(record: &RunRecord) -> String {
    let mut lines = vec![
        format!("Run: {}", record.run_id),
        format!("Model: {}", record.model.name),
        format!("Hardware: {}", record.hardware_profile),
        format!("Tasks evaluated: {}", record.tasks.len()),
        format!("Average accuracy: {:.4}", record.average_accuracy),
        String::new(),
        "Per-task results:".to_string(),
    ];

    for task in &record.tasks {
        let line = match record.results.get(task) {
            Some(metrics) => match (metrics.accuracy, metrics.stderr) {
                (Some(accuracy), Some(stderr)) => {
                    format!("- {task}: {accuracy:.4} (±{stderr:.4})")
                }
                (Some(accuracy), None) => format!("- {task}: {accuracy:.4}"),
                _ => format!("- {task}: no accuracy reported"),
            },
            None => format!("- {task}: no results"),
        };
        lines.push(line);
    }

    lines.join("\n")
}
