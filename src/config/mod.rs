pub mod policy;

use garde::Validate;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::registry::RetentionPolicy;
use policy::PolicyConfig;

/// Where media blobs live.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Local,
    R2,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Jobs driven in parallel.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Jobs waiting for a worker before creation is rejected.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Budget for a single attempt of any stage, in seconds.
    #[serde(default = "default_stage_timeout_secs")]
    pub stage_timeout_secs: u64,

    /// In-place retries per stage after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential retry backoff, in milliseconds.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Overrides `analyzer.sample_count` from the policy.
    pub sample_count: Option<usize>,

    /// Overrides `compositor.window_secs` from the policy.
    pub composite_window_secs: Option<f64>,

    /// JSON file with `PolicyConfig` overrides.
    pub policy_file: Option<PathBuf>,

    #[serde(default)]
    pub storage_backend: StorageBackend,

    /// Root directory for the local content-addressed store.
    #[serde(default = "default_media_root")]
    pub media_root: PathBuf,

    /// R2 bucket name
    pub r2_bucket: Option<String>,

    /// R2 endpoint URL
    pub r2_endpoint: Option<String>,

    /// R2 access key ID (S3-compatible)
    pub r2_access_key: Option<String>,

    /// R2 secret access key (S3-compatible)
    pub r2_secret_key: Option<String>,

    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,

    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,

    /// Remote zone/face detection service. Local heuristics when unset.
    pub vision_service_url: Option<String>,
    pub vision_api_token: Option<String>,

    /// Remote stylization service. Local styling when unset.
    pub style_service_url: Option<String>,
    pub style_api_token: Option<String>,

    /// Declared timeout of every external capability call, in seconds.
    #[serde(default = "default_capability_timeout_secs")]
    pub capability_timeout_secs: u64,

    /// Largest accepted request body, in megabytes.
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,

    /// Seconds a finished job stays queryable.
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    /// Finished jobs kept in memory at most.
    #[serde(default = "default_max_retained_jobs")]
    pub max_retained_jobs: usize,

    #[serde(default = "default_retention_sweep_secs")]
    pub retention_sweep_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_count() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    64
}

fn default_stage_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_media_root() -> PathBuf {
    PathBuf::from("./media")
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_capability_timeout_secs() -> u64 {
    30
}

fn default_max_upload_mb() -> usize {
    512
}

fn default_job_retention_secs() -> u64 {
    3600
}

fn default_max_retained_jobs() -> usize {
    10_000
}

fn default_retention_sweep_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        if config.worker_count == 0 {
            return Err(ConfigError::Invalid("WORKER_COUNT must be at least 1".into()));
        }
        if config.queue_capacity == 0 {
            return Err(ConfigError::Invalid("QUEUE_CAPACITY must be at least 1".into()));
        }
        Ok(config)
    }

    /// Resolve the effective policy: file overrides, then env overrides,
    /// then validation.
    pub fn policy(&self) -> Result<PolicyConfig, ConfigError> {
        let mut policy = match &self.policy_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_json::from_str(&raw)?
            }
            None => PolicyConfig::default(),
        };

        if let Some(n) = self.sample_count {
            policy.analyzer.sample_count = n;
        }
        if let Some(window) = self.composite_window_secs {
            policy.compositor.window_secs = window;
        }

        policy
            .validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))?;
        Ok(policy)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_secs(self.capability_timeout_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            ttl: Duration::from_secs(self.job_retention_secs),
            max_terminal: self.max_retained_jobs,
            sweep_interval: Duration::from_secs(self.retention_sweep_secs.max(1)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Failed to read policy file: {0}")]
    PolicyFile(#[from] std::io::Error),

    #[error("Failed to parse policy file: {0}")]
    PolicyParse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
