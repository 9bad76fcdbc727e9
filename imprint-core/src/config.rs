//! Job options.
//!
//! Every field has a default, so a partial TOML or JSON document deserializes
//! into a complete set of options.
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    pub chunk_size_bytes: u64,
    pub verify: bool,
    pub resume_if_possible: bool,
    /// Degrees Celsius at which writing pauses.
    pub thermal_threshold_warning: f32,
    /// Degrees Celsius at which the job stops for the device.
    pub thermal_threshold_hard: f32,
    /// How far below the warning threshold the reading must fall to resume.
    pub thermal_resume_margin: f32,
    pub thermal_poll_interval_ms: u64,
    pub cancel_all_on_first_failure: bool,
    /// A thermal pause seen by one engine pauses every engine in the job.
    pub pause_all_on_overheat: bool,
    pub max_retries: u32,
    /// Delay before the first retry; doubled for each further attempt.
    pub retry_backoff_ms: u64,
    /// A chunk operation slower than this counts as a transient failure.
    pub chunk_timeout_ms: Option<u64>,
    /// Upper bound on devices written at the same time. `None` means all.
    pub max_concurrent_devices: Option<usize>,
    pub require_removable: bool,
    /// Flush the device and persist progress every this many chunks.
    pub sync_interval_chunks: u32,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            verify: true,
            resume_if_possible: true,
            thermal_threshold_warning: 75.0,
            thermal_threshold_hard: 85.0,
            thermal_resume_margin: 5.0,
            thermal_poll_interval_ms: 3_000,
            cancel_all_on_first_failure: false,
            pause_all_on_overheat: false,
            max_retries: 3,
            retry_backoff_ms: 250,
            chunk_timeout_ms: Some(30_000),
            max_concurrent_devices: None,
            require_removable: true,
            sync_interval_chunks: 16,
        }
    }
}

impl JobOptions {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let invalid = |msg: String| Err(ValidationError::InvalidOptions(msg));

        if self.chunk_size_bytes == 0 {
            return invalid("chunk size must be greater than zero".into());
        }
        if self.thermal_threshold_hard <= self.thermal_threshold_warning {
            return invalid(format!(
                "hard thermal threshold {} must be above the warning threshold {}",
                self.thermal_threshold_hard, self.thermal_threshold_warning
            ));
        }
        if self.thermal_resume_margin < 0.0 {
            return invalid("thermal resume margin cannot be negative".into());
        }
        if self.max_concurrent_devices == Some(0) {
            return invalid("max_concurrent_devices must be at least 1".into());
        }
        if self.sync_interval_chunks == 0 {
            return invalid("sync_interval_chunks must be at least 1".into());
        }
        Ok(())
    }

    pub fn thermal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.thermal_poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn chunk_timeout(&self) -> Option<Duration> {
        self.chunk_timeout_ms.map(Duration::from_millis)
    }
}
