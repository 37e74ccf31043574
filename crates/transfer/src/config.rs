//! Engine configuration.
//!
//! Persisted as camelCase JSON. Requests may override part size, worker
//! count, checkpoint location and rate limit per call.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use partwise_protocol::constants::{DEFAULT_PART_SIZE, MAX_TASK_NUM};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::TransferError;
use crate::planner::PartLimits;
use crate::ratelimit::{RateLimiter, TokenBucket};
use crate::retry::{DEFAULT_BACKOFF_BASE, DEFAULT_JITTER, DEFAULT_MAX_RETRIES, RetryPolicy};

/// Tunables shared by every transfer of a manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransferConfig {
    pub part_size: u64,
    pub task_num: usize,
    pub max_retries: usize,
    pub retry_base_ms: u64,
    pub jitter: f64,
    pub enable_crc: bool,
    pub part_limits: PartLimits,
    /// Directory for checkpoint files; next to the local file when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_dir: Option<PathBuf>,
    /// Bytes per second shared by all workers of one transfer; unlimited
    /// when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<u64>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            task_num: 1,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_ms: DEFAULT_BACKOFF_BASE.as_millis() as u64,
            jitter: DEFAULT_JITTER,
            enable_crc: true,
            part_limits: PartLimits::default(),
            checkpoint_dir: None,
            rate_limit: None,
        }
    }
}

impl TransferConfig {
    /// Reads a config file.
    ///
    /// A missing file yields defaults. So does a malformed one, with a
    /// warning. Out-of-range values are replaced.
    pub fn load(path: &Path) -> Result<Self, TransferError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_str::<Self>(&content) {
            Ok(config) => Ok(config.sanitized()),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse transfer config, using defaults"
                );
                Ok(Self::default())
            }
        }
    }

    /// Writes the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), TransferError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "transfer configuration saved");
        Ok(())
    }

    /// Copy with every field inside its valid range.
    pub fn sanitized(mut self) -> Self {
        let defaults = Self::default();
        let limits = &mut self.part_limits;
        if limits.min_part_size == 0
            || limits.max_part_size < limits.min_part_size
            || limits.max_part_count == 0
        {
            *limits = defaults.part_limits;
        }
        if self.part_limits.check_part_size(self.part_size).is_err() {
            self.part_size = self
                .part_size
                .clamp(self.part_limits.min_part_size, self.part_limits.max_part_size);
        }
        self.task_num = self.task_num.clamp(1, MAX_TASK_NUM);
        if !(0.0..=1.0).contains(&self.jitter) {
            self.jitter = defaults.jitter;
        }
        if self.rate_limit == Some(0) {
            self.rate_limit = None;
        }
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries, Duration::from_millis(self.retry_base_ms))
            .with_jitter(self.jitter)
    }

    /// Token bucket for [`TransferConfig::rate_limit`], allowing one second
    /// of burst.
    pub fn rate_limiter(&self) -> Option<Arc<dyn RateLimiter>> {
        self.rate_limit
            .map(|rate| Arc::new(TokenBucket::new(rate, rate)) as Arc<dyn RateLimiter>)
    }
}
