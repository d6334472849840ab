//! Worker configuration
//!
//! Loaded from `spendcat.toml`; every tuning constant has a serde default so a
//! missing or partial file still yields a runnable worker. Credentials and
//! folders can be overridden from the environment.

use serde::Deserialize;
use spendcat_common::config::{env_value, load_toml_config, resolve_root_folder, LoggingConfig};
use spendcat_common::{text, Error, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const LLM_API_KEY_ENV: &str = "SPENDCAT_LLM_API_KEY";
pub const LLM_ENDPOINT_ENV: &str = "SPENDCAT_LLM_ENDPOINT";
pub const LLM_DEPLOYMENT_ENV: &str = "SPENDCAT_LLM_DEPLOYMENT";
pub const MODELS_DIR_ENV: &str = "SPENDCAT_MODELS_DIR";

/// Top-level worker configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WorkerConfig {
    /// Job store root folder
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Per-sector dictionary and model artifacts
    #[serde(default)]
    pub models_dir: Option<PathBuf>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub classification: ClassificationConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Scheduler tuning
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Rows per chunk
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Chunks processed concurrently within one batch
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,

    /// Wall-clock budget of one tick
    #[serde(default = "default_time_budget_secs")]
    pub time_budget_secs: u64,

    /// PROCESSING jobs older than this are failed by the staleness sweep
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,

    /// Delay between ticks in `run` mode
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Terminal jobs are deleted this long after their last update
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_chunk_size() -> usize {
    500
}
fn default_max_parallel_chunks() -> usize {
    5
}
fn default_time_budget_secs() -> u64 {
    20 * 60
}
fn default_stale_after_secs() -> u64 {
    60 * 60
}
fn default_tick_interval_secs() -> u64 {
    60
}
fn default_retention_hours() -> u64 {
    72
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_parallel_chunks: default_max_parallel_chunks(),
            time_budget_secs: default_time_budget_secs(),
            stale_after_secs: default_stale_after_secs(),
            tick_interval_secs: default_tick_interval_secs(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl SchedulerConfig {
    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Decision engine thresholds
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassificationConfig {
    pub unique_threshold: f64,
    pub ambiguous_threshold: f64,
    pub top_k: usize,
    pub fuzzy_cutoff: f64,
    /// Sectors without a trained model; classified LLM-first
    pub open_sectors: Vec<String>,
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        Self {
            unique_threshold: 0.45,
            ambiguous_threshold: 0.25,
            top_k: 3,
            fuzzy_cutoff: 0.6,
            open_sectors: vec!["Padrão".to_string()],
        }
    }
}

impl ClassificationConfig {
    pub fn is_open_sector(&self, sector: &str) -> bool {
        let sector = text::key(sector);
        self.open_sectors.iter().any(|s| text::key(s) == sector)
    }
}

/// LLM collaborator settings
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub deployment: String,
    pub api_version: String,
    /// Items per request
    pub batch_size: usize,
    /// Requests in flight per call
    pub max_concurrent_batches: usize,
    pub timeout_secs: u64,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub requests_per_second: u32,
    /// Confidence assumed when a response omits one
    pub default_confidence: f64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key: None,
            deployment: "gpt-4o".to_string(),
            api_version: "2024-02-15-preview".to_string(),
            batch_size: 40,
            max_concurrent_batches: 10,
            timeout_secs: 60,
            max_retries: 3,
            requests_per_second: 5,
            default_confidence: 0.8,
        }
    }
}

impl LlmConfig {
    /// Endpoint and key present (placeholder keys do not count)
    pub fn is_configured(&self) -> bool {
        let endpoint_ok = self.endpoint.as_deref().is_some_and(|e| !e.trim().is_empty());
        let key_ok = self.api_key.as_deref().is_some_and(is_valid_key);
        endpoint_ok && key_ok
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Apply ENV overrides over TOML values
    ///
    /// **Priority:** ENV → TOML
    pub fn apply_env_overrides(&mut self) {
        let toml_key = self.api_key.as_deref().is_some_and(is_valid_key);
        if let Some(key) = env_value(LLM_API_KEY_ENV) {
            if toml_key {
                warn!("LLM API key found in environment and TOML. Using environment.");
            }
            info!("LLM API key loaded from environment variable");
            self.api_key = Some(key);
        }
        if let Some(endpoint) = env_value(LLM_ENDPOINT_ENV) {
            self.endpoint = Some(endpoint);
        }
        if let Some(deployment) = env_value(LLM_DEPLOYMENT_ENV) {
            self.deployment = deployment;
        }
    }
}

/// Keys that are obviously placeholders are treated as absent
pub fn is_valid_key(key: &str) -> bool {
    let key = key.trim();
    !key.is_empty() && key != "SUA-CHAVE-AQUI" && key != "YOUR_API_KEY"
}

impl WorkerConfig {
    /// Load from TOML (explicit path or discovered), apply ENV overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config: WorkerConfig = load_toml_config(path)?;
        config.llm.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<()> {
        let c = &self.classification;
        for (name, value) in [
            ("classification.unique_threshold", c.unique_threshold),
            ("classification.ambiguous_threshold", c.ambiguous_threshold),
            ("classification.fuzzy_cutoff", c.fuzzy_cutoff),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{} must be within [0, 1], got {}", name, value)));
            }
        }
        if c.ambiguous_threshold > c.unique_threshold {
            return Err(Error::Config(format!(
                "classification.ambiguous_threshold ({}) exceeds unique_threshold ({})",
                c.ambiguous_threshold, c.unique_threshold
            )));
        }
        if c.top_k == 0 {
            return Err(Error::Config("classification.top_k must be at least 1".into()));
        }
        if self.scheduler.chunk_size == 0 {
            return Err(Error::Config("scheduler.chunk_size must be at least 1".into()));
        }
        if self.scheduler.max_parallel_chunks == 0 {
            return Err(Error::Config("scheduler.max_parallel_chunks must be at least 1".into()));
        }
        if self.llm.batch_size == 0 || self.llm.max_concurrent_batches == 0 {
            return Err(Error::Config(
                "llm.batch_size and llm.max_concurrent_batches must be at least 1".into(),
            ));
        }
        if self.llm.requests_per_second == 0 {
            return Err(Error::Config("llm.requests_per_second must be at least 1".into()));
        }
        Ok(())
    }

    /// Job store root: CLI → `SPENDCAT_ROOT_FOLDER` → TOML → OS default
    pub fn resolve_root_folder(&self, cli_arg: Option<&Path>) -> PathBuf {
        resolve_root_folder(
            cli_arg,
            spendcat_common::config::ROOT_FOLDER_ENV,
            self.root_folder.as_deref(),
        )
    }

    /// Models folder: CLI → `SPENDCAT_MODELS_DIR` → TOML → `<root>/models`
    pub fn resolve_models_dir(&self, cli_arg: Option<&Path>, root_folder: &Path) -> PathBuf {
        if let Some(path) = cli_arg {
            return path.to_path_buf();
        }
        if let Some(path) = env_value(MODELS_DIR_ENV) {
            return PathBuf::from(path);
        }
        if let Some(path) = &self.models_dir {
            return path.clone();
        }
        root_folder.join("models")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spendcat_common::config::parse_toml_config;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.scheduler.chunk_size, 500);
        assert_eq!(config.scheduler.max_parallel_chunks, 5);
        assert_eq!(config.scheduler.time_budget(), Duration::from_secs(1200));
        assert_eq!(config.scheduler.stale_after_secs, 3600);
        assert_eq!(config.classification.unique_threshold, 0.45);
        assert_eq!(config.classification.ambiguous_threshold, 0.25);
        assert_eq!(config.classification.top_k, 3);
        assert_eq!(config.llm.batch_size, 40);
        assert!(!config.llm.is_configured());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config: WorkerConfig = parse_toml_config(
            r#"
            [scheduler]
            chunk_size = 100

            [classification]
            open_sectors = ["Padrão", "Geral"]
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.chunk_size, 100);
        assert_eq!(config.scheduler.max_parallel_chunks, 5);
        assert_eq!(config.classification.unique_threshold, 0.45);
        assert!(config.classification.is_open_sector("geral"));
        assert!(config.classification.is_open_sector(" Padrão "));
        assert!(!config.classification.is_open_sector("Varejo"));
    }

    #[test]
    fn test_validation_rejects_inverted_thresholds() {
        let mut config = WorkerConfig::default();
        config.classification.ambiguous_threshold = 0.6;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validation_rejects_out_of_range_cutoff() {
        let mut config = WorkerConfig::default();
        config.classification.fuzzy_cutoff = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_chunk_size() {
        let mut config = WorkerConfig::default();
        config.scheduler.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_placeholder_key_is_not_configured() {
        let llm = LlmConfig {
            endpoint: Some("https://example.openai.azure.com".into()),
            api_key: Some("SUA-CHAVE-AQUI".into()),
            ..LlmConfig::default()
        };
        assert!(!llm.is_configured());

        let llm = LlmConfig {
            api_key: Some("abc123".into()),
            ..llm
        };
        assert!(llm.is_configured());
    }

    #[test]
    fn test_models_dir_cli_wins() {
        let config = WorkerConfig {
            models_dir: Some(PathBuf::from("/from/toml")),
            ..WorkerConfig::default()
        };
        let resolved = config.resolve_models_dir(Some(Path::new("/from/cli")), Path::new("/root"));
        assert_eq!(resolved, PathBuf::from("/from/cli"));
    }
}
