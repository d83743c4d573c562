use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Settings for the pipeline and aggregation passes.
///
/// Every field has a default so the settings file is optional; CLI flags
/// override whatever the file provides.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Directory holding one subdirectory per run
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
    /// Directory the index/metadata artifacts are published to
    #[serde(default = "default_site_dir")]
    pub site_dir: PathBuf,
    /// Tracking-service project the annotate step logs runs under
    #[serde(default = "default_tracking_project")]
    pub tracking_project: String,
    /// Tracking-service API endpoint
    #[serde(default = "default_tracking_endpoint")]
    pub tracking_endpoint: String,
    /// Environment variable holding the tracking API key; absence of the
    /// variable disables the tracking sub-step
    #[serde(default = "default_tracking_key_var")]
    pub tracking_env_var_api_key: String,
    /// OpenAI-compatible endpoint the summarizer talks to
    #[serde(default = "default_summary_endpoint")]
    pub summary_endpoint: String,
    /// Model used for summary generation
    #[serde(default = "default_summary_model")]
    pub summary_model: String,
    /// Environment variable holding the summarizer API key
    #[serde(default = "default_summary_key_var")]
    pub summary_env_var_api_key: String,
    /// Upper bound, in seconds, on any single external-service call
    #[serde(default = "default_timeout_secs")]
    pub external_timeout_secs: u64,
    /// Program the executing step invokes to run the benchmark
    #[serde(default = "default_engine_command")]
    pub engine_command: String,
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}

fn default_site_dir() -> PathBuf {
    PathBuf::from("site")
}

fn default_tracking_project() -> String {
    "llm-bench".to_string()
}

fn default_tracking_endpoint() -> String {
    "https://api.wandb.ai".to_string()
}

fn default_tracking_key_var() -> String {
    "TRACKING_API_KEY".to_string()
}

fn default_summary_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_summary_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_summary_key_var() -> String {
    "SUMMARY_API_KEY".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_engine_command() -> String {
    "lm_eval".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        toml::from_str("").expect("all settings fields have defaults")
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML settings: {}", path.display()))
    }

    /// Load from a file when one is given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_settings_parsing() {
        let toml_content = r#"
runs_dir = "/data/runs"
site_dir = "/data/site"
tracking_project = "kr-bench"
tracking_endpoint = "https://tracking.internal"
external_timeout_secs = 10
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", toml_content).unwrap();

        let settings = Settings::from_file(temp_file.path()).unwrap();
        assert_eq!(settings.runs_dir, PathBuf::from("/data/runs"));
        assert_eq!(settings.site_dir, PathBuf::from("/data/site"));
        assert_eq!(settings.tracking_project, "kr-bench");
        assert_eq!(settings.tracking_endpoint, "https://tracking.internal");
        assert_eq!(settings.external_timeout_secs, 10);
        // Unset fields fall back to defaults
        assert_eq!(settings.summary_model, "gpt-4o-mini");
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.runs_dir, PathBuf::from("runs"));
        assert_eq!(settings.site_dir, PathBuf::from("site"));
        assert_eq!(settings.tracking_project, "llm-bench");
        assert_eq!(settings.tracking_env_var_api_key, "TRACKING_API_KEY");
        assert_eq!(settings.summary_env_var_api_key, "SUMMARY_API_KEY");
        assert_eq!(settings.external_timeout_secs, 30);
        assert_eq!(settings.engine_command, "lm_eval");
    }

    #[test]
    fn test_settings_load_without_file() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.runs_dir, PathBuf::from("runs"));
    }

    #[test]
    fn test_settings_rejects_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "runs_dir = [broken").unwrap();

        let result = Settings::from_file(temp_file.path());
        assert!(result.is_err());
    }
}
