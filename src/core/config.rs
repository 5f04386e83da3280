use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::errors::{EngineError, Result};

/// Engine configuration with all tuning parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // Failure pipeline
    /// How often the failed-job listener is re-attempted on an optimistic locking conflict
    pub failed_job_listener_max_retries: u32,
    /// Retries-remaining assigned to newly created jobs
    pub default_job_retries: u32,
    /// Due-date push applied to a job after each business failure
    pub failed_job_retry_delay: Duration,

    // Job acquisition
    /// Number of polling workers
    pub worker_count: usize,
    /// Maximum jobs locked per acquisition
    pub max_jobs_per_acquisition: usize,
    /// Lock expiry stamped on acquired jobs
    pub job_lock_duration: Duration,
    /// Idle wait between acquisitions
    pub poll_interval: Duration,

    // Storage
    /// Sled database path; in-memory storage when unset
    pub storage_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            failed_job_listener_max_retries: 3,
            default_job_retries: 3,
            failed_job_retry_delay: Duration::ZERO,

            worker_count: 2,
            max_jobs_per_acquisition: 3,
            job_lock_duration: Duration::from_secs(300),
            poll_interval: Duration::from_millis(500),

            storage_path: None,
        }
    }
}

impl EngineConfig {
    /// Create a new builder for EngineConfig
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.failed_job_listener_max_retries == 0 {
            return Err(EngineError::configuration(
                "failed_job_listener_max_retries must be greater than 0",
            ));
        }
        if self.worker_count == 0 {
            return Err(EngineError::configuration(
                "worker_count must be greater than 0",
            ));
        }
        if self.max_jobs_per_acquisition == 0 {
            return Err(EngineError::configuration(
                "max_jobs_per_acquisition must be greater than 0",
            ));
        }
        if self.job_lock_duration.is_zero() {
            return Err(EngineError::configuration(
                "job_lock_duration must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Create a configuration for tests and local development
    pub fn development() -> Self {
        Self {
            worker_count: 1,
            poll_interval: Duration::from_millis(20),
            job_lock_duration: Duration::from_secs(30),
            ..Default::default()
        }
    }
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn failed_job_listener_max_retries(mut self, max: u32) -> Self {
        self.config.failed_job_listener_max_retries = max;
        self
    }

    pub fn default_job_retries(mut self, retries: u32) -> Self {
        self.config.default_job_retries = retries;
        self
    }

    pub fn failed_job_retry_delay(mut self, delay: Duration) -> Self {
        self.config.failed_job_retry_delay = delay;
        self
    }

    pub fn worker_count(mut self, workers: usize) -> Self {
        self.config.worker_count = workers;
        self
    }

    pub fn max_jobs_per_acquisition(mut self, max: usize) -> Self {
        self.config.max_jobs_per_acquisition = max;
        self
    }

    pub fn job_lock_duration(mut self, duration: Duration) -> Self {
        self.config.job_lock_duration = duration;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.storage_path = Some(path.into());
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
