use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Engine configuration loaded from a TOML file with defaults for every field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_index_file")]
    pub index_file: String,

    #[serde(default = "default_queue_file")]
    pub queue_file: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Number of concurrent jobs the worker pool processes
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// How often an idle worker polls the queue
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Base delay for exponential retry backoff
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,

    /// Attempts per job when the workflow sets no max_retries
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    /// Active jobs older than this are assumed stalled and requeued
    #[serde(default = "default_stalled_after_secs")]
    pub stalled_after_secs: i64,
}

fn default_index_file() -> String {
    "workflows.redb".to_string()
}

fn default_queue_file() -> String {
    "jobs.redb".to_string()
}

fn default_concurrency() -> usize {
    5
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_backoff_base_secs() -> u64 {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_stalled_after_secs() -> i64 {
    300
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index_file: default_index_file(),
            queue_file: default_queue_file(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
            backoff_base_secs: default_backoff_base_secs(),
            default_max_attempts: default_max_attempts(),
            stalled_after_secs: default_stalled_after_secs(),
        }
    }
}

impl EngineConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        // Create data directory if it doesn't exist
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        // Load config file if it exists, otherwise use defaults
        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self {
                data_dir: data_dir.clone(),
                storage: Default::default(),
                scheduler: Default::default(),
            }
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    /// Get the workflow index path
    pub fn index_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.index_file)
    }

    /// Get the job queue path
    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.queue_file)
    }
}
