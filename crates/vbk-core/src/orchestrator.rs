//! Runs a block list through the pipeline on a bounded thread pool and turns
//! the per-block records into a run result.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use vbk_crypto::CryptoEngine;
use vbk_types::block::{BasicBlockInfo, BlockExtent, DiskId, ExBlockInfo, GenerationId};
use vbk_types::generation::BackupMode;

use crate::backend::{DiskBackend, GenerationSource, TargetBackend};
use crate::chain::resolve_chain;
use crate::compress::Compression;
use crate::config::{FailurePolicy, PipelineConfig, QueryStrategy};
use crate::consolidate::{consolidate, ConsolidationStatistics};
use crate::error::{Result, VbkError};
use crate::normalize::normalize;
use crate::pipeline::report::{build_report, TotalBlocksInfo};
use crate::pipeline::{
    run_block, BlockOutcome, BufferPool, ContentLockTable, Direction, Observer, PipelineContext,
    PipelineEvent, ResultTable,
};
use crate::query::query_blocks;

/// Overall outcome of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    /// Some blocks failed, the others completed.
    PartialFailure,
    /// Cancelled before every block ran; no block failed.
    Aborted,
    Failed(String),
    /// Nothing to do.
    Skipped(String),
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success | RunStatus::Skipped(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    Succeeded,
    Deduplicated,
    Failed(String),
    /// Never ran because the run was aborted.
    NotProcessed,
}

/// Per-block detail, enough to retry just the failed blocks later.
#[derive(Debug, Clone)]
pub struct BlockResult {
    pub index: usize,
    pub extent: BlockExtent,
    pub generation_id: GenerationId,
    pub attempts: u32,
    pub state: BlockState,
    /// The block as recorded in the repository, when it completed.
    pub record: Option<BasicBlockInfo>,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    pub status: RunStatus,
    pub totals: TotalBlocksInfo,
    pub blocks: Vec<BlockResult>,
    pub report: String,
    /// When the workers started; `None` if the run never reached them.
    pub started_at: Option<DateTime<Utc>>,
    pub consolidation: Option<ConsolidationStatistics>,
    pub query_strategy: Option<QueryStrategy>,
    /// Blocks added by splitting oversized extents (backup only).
    pub extension: usize,
}

impl RunResult {
    fn empty(status: RunStatus) -> Self {
        Self {
            status,
            totals: TotalBlocksInfo::default(),
            blocks: Vec::new(),
            report: String::new(),
            started_at: None,
            consolidation: None,
            query_strategy: None,
            extension: 0,
        }
    }

    pub fn failed_blocks(&self) -> impl Iterator<Item = &BlockResult> {
        self.blocks
            .iter()
            .filter(|b| matches!(b.state, BlockState::Failed(_)))
    }
}

#[derive(Debug, Clone)]
pub struct BackupRequest {
    pub disk_id: DiskId,
    pub generation_id: GenerationId,
    pub mode: BackupMode,
    /// Change id of the previous generation, for incremental backups.
    pub change_id: Option<String>,
}

/// Cancels the orchestrator's current and future runs.
#[derive(Clone, Default)]
pub struct AbortHandle {
    requested: Arc<AtomicBool>,
    active: Arc<Mutex<Option<Arc<BufferPool>>>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.requested.store(true, Ordering::Release);
        if let Some(pool) = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            pool.stop();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    fn attach(&self, pool: Option<Arc<BufferPool>>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = pool;
    }
}

pub struct PipelineOrchestrator {
    config: PipelineConfig,
    target: Arc<dyn TargetBackend>,
    crypto: Arc<dyn CryptoEngine>,
    locks: Arc<ContentLockTable>,
    observer: Option<Observer>,
    abort: AbortHandle,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        target: Arc<dyn TargetBackend>,
        crypto: Arc<dyn CryptoEngine>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            target,
            crypto,
            locks: Arc::new(ContentLockTable::new()),
            observer: None,
            abort: AbortHandle::default(),
        })
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Share one lock table between orchestrators writing to the same repository.
    pub fn with_lock_table(mut self, locks: Arc<ContentLockTable>) -> Self {
        self.locks = locks;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Back up the extents selected by the query strategy into a new generation.
    pub fn backup(&self, disk: Arc<dyn DiskBackend>, request: &BackupRequest) -> Result<RunResult> {
        let query = match query_blocks(
            disk.as_ref(),
            &self.config.query,
            request.mode,
            request.change_id.as_deref(),
        ) {
            Ok(query) => query,
            Err(e) => return self.failed_before_start(request.generation_id, e),
        };

        let normalized = normalize(
            &query.extents,
            self.config.max_block_sectors(),
            request.disk_id,
            request.generation_id,
        );
        if normalized.blocks.is_empty() {
            let reason = match request.mode {
                BackupMode::Full => "disk is empty",
                BackupMode::Incremental => "no blocks changed",
            };
            info!(disk_id = request.disk_id, reason, "skipping disk");
            let mut result = RunResult::empty(RunStatus::Skipped(reason.into()));
            result.query_strategy = Some(query.strategy);
            return Ok(result);
        }

        let mut result = self.run(
            Direction::Backup,
            normalized.blocks,
            Some(disk),
            request.disk_id,
            request.generation_id,
        )?;
        result.query_strategy = Some(query.strategy);
        result.extension = normalized.extension;
        Ok(result)
    }

    /// Rebuild `generation_id` of `disk_id` onto `disk`.
    pub fn restore(
        &self,
        disk: Arc<dyn DiskBackend>,
        source: &dyn GenerationSource,
        disk_id: DiskId,
        generation_id: GenerationId,
    ) -> Result<RunResult> {
        let (blocks, stats) = match self.consolidated(source, disk_id, generation_id) {
            Ok(consolidated) => consolidated,
            Err(e) => return self.failed_before_start(generation_id, e),
        };
        let capacity = disk.capacity_in_sectors();
        if let Some(block) = blocks.iter().find(|b| b.end() > capacity) {
            let e = VbkError::InvalidBlock(format!(
                "block {} ends at sector {} beyond disk capacity {capacity}",
                block.extent,
                block.end()
            ));
            return self.failed_before_start(generation_id, e);
        }
        if blocks.is_empty() {
            let mut result = RunResult::empty(RunStatus::Skipped("no blocks to restore".into()));
            result.consolidation = Some(stats);
            return Ok(result);
        }

        let mut result = self.run(Direction::Restore, blocks, Some(disk), disk_id, generation_id)?;
        result.consolidation = Some(stats);
        Ok(result)
    }

    /// Synthesize a full generation `new_generation_id` from the chain ending
    /// at `generation_id`, without reading the disk.
    pub fn virtual_backup(
        &self,
        source: &dyn GenerationSource,
        disk_id: DiskId,
        generation_id: GenerationId,
        new_generation_id: GenerationId,
    ) -> Result<RunResult> {
        let (blocks, stats) = match self.consolidated(source, disk_id, generation_id) {
            Ok(consolidated) => consolidated,
            Err(e) => return self.failed_before_start(new_generation_id, e),
        };
        if blocks.is_empty() {
            let mut result = RunResult::empty(RunStatus::Skipped("no blocks to restore".into()));
            result.consolidation = Some(stats);
            return Ok(result);
        }

        let mut result = self.run(
            Direction::VirtualBackup,
            blocks,
            None,
            disk_id,
            new_generation_id,
        )?;
        result.consolidation = Some(stats);
        Ok(result)
    }

    fn consolidated(
        &self,
        source: &dyn GenerationSource,
        disk_id: DiskId,
        generation_id: GenerationId,
    ) -> Result<(Vec<BasicBlockInfo>, ConsolidationStatistics)> {
        let chain = resolve_chain(source, disk_id, generation_id)?;
        consolidate(&chain, self.config.sort_by_generation)
    }

    fn failed_before_start(&self, generation_id: GenerationId, e: VbkError) -> Result<RunResult> {
        warn!(generation_id, error = %e, "run failed before any block started");
        let result = RunResult::empty(RunStatus::Failed(e.to_string()));
        self.notify(PipelineEvent::RunFinished {
            generation_id,
            status: result.status.clone(),
            totals: result.totals.clone(),
        });
        Ok(result)
    }

    fn notify(&self, event: PipelineEvent) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }

    /// Process `blocks` in `direction`. Records and the report are kept under
    /// `generation_id`.
    pub fn run(
        &self,
        direction: Direction,
        mut blocks: Vec<BasicBlockInfo>,
        disk: Option<Arc<dyn DiskBackend>>,
        disk_id: DiskId,
        generation_id: GenerationId,
    ) -> Result<RunResult> {
        if blocks.is_empty() {
            return Ok(RunResult::empty(RunStatus::Skipped("no blocks".into())));
        }
        if (direction.reads_disk() || direction.writes_disk()) && disk.is_none() {
            return Err(VbkError::Config(format!(
                "{} needs a disk backend",
                direction.as_str()
            )));
        }
        for (index, block) in blocks.iter_mut().enumerate() {
            block.index = index;
        }

        let started = Instant::now();
        let started_at = Utc::now();
        let total = blocks.len();
        let workers = self.config.worker_count;
        let pool_size = match direction {
            Direction::Backup => self.config.backup_pool_size(),
            Direction::Restore | Direction::VirtualBackup => workers,
        };

        let buffers = Arc::new(BufferPool::new(
            workers,
            self.config.buffer_poll_interval(),
            workers,
        )?);
        self.abort.attach(Some(Arc::clone(&buffers)));
        if self.abort.is_aborted() {
            buffers.stop();
        }

        let ctx = Arc::new(PipelineContext {
            pool: Arc::clone(&buffers),
            locks: Arc::clone(&self.locks),
            target: Arc::clone(&self.target),
            disk,
            crypto: Arc::clone(&self.crypto),
            compression: Compression::from_config(&self.config.compression),
            results: ResultTable::new(total),
            observer: self.observer.clone(),
            max_retries: self.config.max_retries,
            retry_delay: self.config.retry_delay(),
            failure_policy: self.config.failure_policy,
            output_generation: generation_id,
        });

        info!(
            direction = direction.as_str(),
            disk_id,
            generation_id,
            blocks = total,
            compression = self.config.compression.algorithm.as_str(),
            workers,
            threads = pool_size,
            "starting block pipeline"
        );

        let thread_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(pool_size)
            .thread_name(|i| format!("vbk-block-{i}"))
            .build()
            .map_err(|e| VbkError::Other(format!("block thread pool: {e}")))?;

        let planned: Vec<(BlockExtent, GenerationId)> =
            blocks.iter().map(|b| (b.extent, b.generation_id)).collect();
        let stop_scheduling = AtomicBool::new(false);
        let policy = self.config.failure_policy;

        thread_pool.in_place_scope(|s| {
            for block in blocks {
                let ctx = &ctx;
                let stop_scheduling = &stop_scheduling;
                s.spawn(move |_| {
                    if stop_scheduling.load(Ordering::Acquire) {
                        return;
                    }
                    match run_block(ctx, direction, block) {
                        BlockOutcome::Success | BlockOutcome::Detached => {}
                        BlockOutcome::Aborted => stop_scheduling.store(true, Ordering::Release),
                        BlockOutcome::Failed(_) if policy == FailurePolicy::FailFast => {
                            stop_scheduling.store(true, Ordering::Release)
                        }
                        BlockOutcome::Failed(_) => {}
                    }
                });
            }
        });

        if !buffers.wait_sub_tasks(self.config.subtask_wait()) {
            warn!(
                timeout_secs = self.config.subtask_wait_secs,
                live_locks = self.locks.len(),
                "detached dedup tasks still running after timeout"
            );
        }
        self.abort.attach(None);

        let records = ctx.results.snapshot();
        let totals = TotalBlocksInfo::from_records(&records, started.elapsed());
        let status = run_status(&records, &totals, policy, self.abort.is_aborted());
        let report = build_report(&records, &totals, started_at);

        info!(
            direction = direction.as_str(),
            disk_id,
            generation_id,
            status = ?status,
            succeeded = totals.succeeded,
            failed = totals.failed,
            deduplicated = totals.deduplicated,
            not_processed = totals.not_processed(),
            bytes = totals.size,
            stream_bytes = totals.stream_size,
            elapsed_secs = totals.elapsed.as_secs_f64(),
            "block pipeline finished"
        );

        if let Err(e) = self.target.post_report(disk_id, generation_id, &report) {
            warn!(disk_id, generation_id, error = %e, "failed to post run report");
        }

        self.notify(PipelineEvent::RunFinished {
            generation_id,
            status: status.clone(),
            totals: totals.clone(),
        });

        Ok(RunResult {
            status,
            blocks: block_results(&records, &planned),
            totals,
            report,
            started_at: Some(started_at),
            consolidation: None,
            query_strategy: None,
            extension: 0,
        })
    }
}

fn run_status(
    records: &[Option<ExBlockInfo>],
    totals: &TotalBlocksInfo,
    policy: FailurePolicy,
    abort_requested: bool,
) -> RunStatus {
    if totals.failed > 0 {
        let reason = records
            .iter()
            .flatten()
            .find(|r| r.failed)
            .and_then(|r| r.reason.clone())
            .unwrap_or_else(|| "unknown".into());
        if policy == FailurePolicy::FailFast || totals.succeeded == 0 {
            return RunStatus::Failed(format!(
                "{} of {} blocks failed, first: {reason}",
                totals.failed, totals.blocks
            ));
        }
        return RunStatus::PartialFailure;
    }
    if abort_requested || totals.not_processed() > 0 {
        return RunStatus::Aborted;
    }
    RunStatus::Success
}

fn block_results(
    records: &[Option<ExBlockInfo>],
    planned: &[(BlockExtent, GenerationId)],
) -> Vec<BlockResult> {
    planned
        .iter()
        .enumerate()
        .map(|(index, &(extent, generation_id))| match records.get(index).and_then(Option::as_ref) {
            Some(info) => BlockResult {
                index,
                extent,
                generation_id,
                attempts: info.attempts,
                state: if info.failed {
                    BlockState::Failed(info.reason.clone().unwrap_or_default())
                } else if info.duplicated {
                    BlockState::Deduplicated
                } else {
                    BlockState::Succeeded
                },
                record: (!info.failed).then(|| info.block.clone()),
            },
            None => BlockResult {
                index,
                extent,
                generation_id,
                attempts: 0,
                state: BlockState::NotProcessed,
                record: None,
            },
        })
        .collect()
}
