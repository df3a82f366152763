use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::defaults::*;
use crate::error::{Result, VbkError};
use vbk_types::block::SECTOR_SIZE;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of block workers running concurrently.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Attempts per block before it is marked failed.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Pause between two attempts of the same block.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Backup blocks are split to at most this many MiB (range: 1-64).
    #[serde(default = "default_max_block_size_mib")]
    pub max_block_size_mib: u64,
    #[serde(default = "default_buffer_poll_interval_ms")]
    pub buffer_poll_interval_ms: u64,
    /// How long to wait for detached dedup tasks after all workers finish.
    #[serde(default = "default_subtask_wait_secs")]
    pub subtask_wait_secs: u64,
    /// Backup pool size multiplier over `worker_count` (range: 1.0-4.0).
    #[serde(default = "default_backup_thread_factor")]
    pub backup_thread_factor: f64,
    #[serde(default = "default_failure_policy")]
    pub failure_policy: FailurePolicy,
    /// Order consolidated blocks by generation instead of by offset.
    #[serde(default)]
    pub sort_by_generation: bool,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub query: QueryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_block_size_mib: default_max_block_size_mib(),
            buffer_poll_interval_ms: default_buffer_poll_interval_ms(),
            subtask_wait_secs: default_subtask_wait_secs(),
            backup_thread_factor: default_backup_thread_factor(),
            failure_policy: default_failure_policy(),
            sort_by_generation: false,
            compression: CompressionConfig::default(),
            query: QueryConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(VbkError::Config("worker_count must be at least 1".into()));
        }
        if self.max_retries == 0 {
            return Err(VbkError::Config("max_retries must be at least 1".into()));
        }
        if !(1..=64).contains(&self.max_block_size_mib) {
            return Err(VbkError::Config(format!(
                "max_block_size_mib must be in [1, 64], got {}",
                self.max_block_size_mib
            )));
        }
        if !(1.0..=4.0).contains(&self.backup_thread_factor) {
            return Err(VbkError::Config(format!(
                "backup_thread_factor must be in [1.0, 4.0], got {}",
                self.backup_thread_factor
            )));
        }
        if self.compression.algorithm == CompressionAlgorithm::Zstd
            && !(1..=22).contains(&self.compression.zstd_level)
        {
            return Err(VbkError::Config(format!(
                "compression.zstd_level must be in [1, 22], got {}",
                self.compression.zstd_level
            )));
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn buffer_poll_interval(&self) -> Duration {
        Duration::from_millis(self.buffer_poll_interval_ms)
    }

    pub fn subtask_wait(&self) -> Duration {
        Duration::from_secs(self.subtask_wait_secs)
    }

    /// Maximum block length in sectors.
    pub fn max_block_sectors(&self) -> u64 {
        self.max_block_size_mib * 1024 * 1024 / SECTOR_SIZE
    }

    /// Thread pool size for backups: `worker_count * backup_thread_factor`, rounded up.
    pub fn backup_pool_size(&self) -> usize {
        (self.worker_count as f64 * self.backup_thread_factor).ceil() as usize
    }
}

/// What happens to sibling workers when a block fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Stop the buffer pool so queued blocks abort.
    FailFast,
    /// Let every remaining block run.
    BestEffort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: CompressionAlgorithm,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            zstd_level: default_zstd_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStrategy {
    Allocated,
    ChangedAreas,
    Full,
}

impl QueryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryStrategy::Allocated => "allocated",
            QueryStrategy::ChangedAreas => "changed_areas",
            QueryStrategy::Full => "full",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Preferred strategy; lower-priority strategies are tried when it is unusable.
    #[serde(default = "default_query_strategy")]
    pub strategy: QueryStrategy,
    /// Whether changed-block tracking is enabled on the disk.
    #[serde(default)]
    pub change_tracking: bool,
    /// The disk session cannot serve allocated-block queries.
    #[serde(default)]
    pub legacy_session: bool,
    /// Narrow incremental change lists to allocated sectors.
    #[serde(default = "default_true")]
    pub intersect_changed_with_allocated: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            strategy: default_query_strategy(),
            change_tracking: false,
            legacy_session: false,
            intersect_changed_with_allocated: true,
        }
    }
}
