//! Concurrent block pipeline: buffer slots, per-key write locks and the
//! per-block worker.

pub mod buffers;
pub mod content_lock;
pub mod report;
mod worker;

use std::sync::Arc;

use vbk_types::block::GenerationId;

use crate::orchestrator::RunStatus;
use crate::pipeline::report::TotalBlocksInfo;

pub use self::buffers::{BufferPool, BufferSlot, SlotGuard};
pub use self::content_lock::{ContentLockGuard, ContentLockTable};
pub use self::report::ResultTable;
pub use self::worker::{run_block, BlockOutcome, PipelineContext};

/// Which way bytes flow for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Disk to repository.
    Backup,
    /// Repository to disk.
    Restore,
    /// Repository to repository: unmodified blocks are re-referenced,
    /// trimmed ones are re-read and stored again.
    VirtualBackup,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Backup => "backup",
            Direction::Restore => "restore",
            Direction::VirtualBackup => "virtual-backup",
        }
    }

    pub fn reads_disk(self) -> bool {
        matches!(self, Direction::Backup)
    }

    pub fn writes_disk(self) -> bool {
        matches!(self, Direction::Restore)
    }
}

/// Progress notifications for an interactive observer.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    BlockSucceeded {
        index: usize,
        offset: u64,
        length: u64,
        duplicated: bool,
    },
    BlockFailed {
        index: usize,
        offset: u64,
        reason: String,
    },
    BlockRetry {
        index: usize,
        attempt: u32,
        reason: String,
    },
    RunFinished {
        generation_id: GenerationId,
        status: RunStatus,
        totals: TotalBlocksInfo,
    },
}

pub type Observer = Arc<dyn Fn(PipelineEvent) + Send + Sync>;
