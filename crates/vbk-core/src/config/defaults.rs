use super::types::{CompressionAlgorithm, FailurePolicy, QueryStrategy};

pub(super) fn default_worker_count() -> usize {
    10
}

pub(super) fn default_max_retries() -> u32 {
    5
}

pub(super) fn default_retry_delay_ms() -> u64 {
    3000
}

pub(super) fn default_max_block_size_mib() -> u64 {
    20
}

pub(super) fn default_buffer_poll_interval_ms() -> u64 {
    1000
}

pub(super) fn default_subtask_wait_secs() -> u64 {
    60
}

pub(super) fn default_backup_thread_factor() -> f64 {
    1.3
}

pub(super) fn default_failure_policy() -> FailurePolicy {
    FailurePolicy::FailFast
}

pub(super) fn default_algorithm() -> CompressionAlgorithm {
    CompressionAlgorithm::Lz4
}

pub(super) fn default_zstd_level() -> i32 {
    3
}

pub(super) fn default_query_strategy() -> QueryStrategy {
    QueryStrategy::Allocated
}

pub(super) fn default_true() -> bool {
    true
}
