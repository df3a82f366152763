//! Which sectors a backup reads.

use tracing::{info, warn};

use vbk_types::block::BlockExtent;
use vbk_types::generation::BackupMode;

use crate::backend::{DiskBackend, DiskCapabilities};
use crate::config::{QueryConfig, QueryStrategy};
use crate::error::{Result, VbkError};

/// Granularity of allocated-block queries, in sectors (64 KiB).
pub const MIN_CHUNK_SIZE: u64 = 128;
/// Most chunks a single allocated-block query may cover.
pub const MAX_CHUNK_NUMBER: u64 = 512 * 1024;

/// Change id meaning "every area written since the disk was created".
pub const ALL_CHANGES: &str = "*";

type StrategyPredicate = fn(&QueryConfig, &DiskCapabilities) -> bool;

fn allocated_usable(config: &QueryConfig, caps: &DiskCapabilities) -> bool {
    caps.allocated_query && !config.legacy_session
}

fn changed_areas_usable(config: &QueryConfig, caps: &DiskCapabilities) -> bool {
    config.change_tracking && caps.change_tracking
}

fn always(_: &QueryConfig, _: &DiskCapabilities) -> bool {
    true
}

/// Strategies in priority order. Selection starts at the configured strategy
/// and takes the first usable entry at or below it.
pub const STRATEGY_PRIORITY: [(QueryStrategy, StrategyPredicate); 3] = [
    (QueryStrategy::Allocated, allocated_usable),
    (QueryStrategy::ChangedAreas, changed_areas_usable),
    (QueryStrategy::Full, always),
];

pub fn select_strategy(config: &QueryConfig, caps: &DiskCapabilities) -> Result<QueryStrategy> {
    let start = STRATEGY_PRIORITY
        .iter()
        .position(|(strategy, _)| *strategy == config.strategy)
        .unwrap_or(0);
    STRATEGY_PRIORITY[start..]
        .iter()
        .find(|(_, usable)| usable(config, caps))
        .map(|(strategy, _)| *strategy)
        .ok_or_else(|| {
            VbkError::Config(format!(
                "no usable block query strategy at or below '{}'",
                config.strategy.as_str()
            ))
        })
}

/// Extents a backup must read, and how they were obtained.
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub strategy: QueryStrategy,
    pub extents: Vec<BlockExtent>,
}

/// Query the disk for the extents to back up.
///
/// Incremental backups use the areas changed since `change_id`, optionally
/// narrowed to allocated sectors. Full backups, and incrementals without a
/// change id, follow [`select_strategy`].
pub fn query_blocks(
    disk: &dyn DiskBackend,
    config: &QueryConfig,
    mode: BackupMode,
    change_id: Option<&str>,
) -> Result<QueryOutcome> {
    let caps = disk.capabilities();

    if mode == BackupMode::Incremental {
        match change_id {
            Some(since) if changed_areas_usable(config, &caps) => {
                let changed = disk.query_changed_areas(since)?;
                let extents = if config.intersect_changed_with_allocated
                    && allocated_usable(config, &caps)
                {
                    let allocated = query_allocated_blocks(disk)?;
                    intersect_extents(&changed, &allocated)
                } else {
                    changed
                };
                info!(
                    since,
                    extents = extents.len(),
                    "queried changed areas for incremental backup"
                );
                return Ok(QueryOutcome {
                    strategy: QueryStrategy::ChangedAreas,
                    extents,
                });
            }
            _ => warn!("incremental backup without usable change tracking, querying as full"),
        }
    }

    let strategy = select_strategy(config, &caps)?;
    let extents = match strategy {
        QueryStrategy::Allocated => query_allocated_blocks(disk)?,
        QueryStrategy::ChangedAreas => disk.query_changed_areas(ALL_CHANGES)?,
        QueryStrategy::Full => disk.query_full()?,
    };
    info!(
        strategy = strategy.as_str(),
        extents = extents.len(),
        "queried disk blocks"
    );
    Ok(QueryOutcome { strategy, extents })
}

/// Walk the whole disk in windows of at most [`MAX_CHUNK_NUMBER`] chunks.
/// The unaligned tail is always included, allocated or not.
pub fn query_allocated_blocks(disk: &dyn DiskBackend) -> Result<Vec<BlockExtent>> {
    let capacity = disk.capacity_in_sectors();
    let mut extents = Vec::new();
    let mut offset = 0u64;
    let mut chunks_left = capacity / MIN_CHUNK_SIZE;

    while chunks_left > 0 {
        let chunks = chunks_left.min(MAX_CHUNK_NUMBER);
        extents.extend(disk.query_allocated(offset, chunks * MIN_CHUNK_SIZE, MIN_CHUNK_SIZE)?);
        chunks_left -= chunks;
        offset += chunks * MIN_CHUNK_SIZE;
    }

    let unaligned = capacity % MIN_CHUNK_SIZE;
    if unaligned > 0 {
        extents.push(BlockExtent::new(offset, unaligned));
    }
    Ok(extents)
}

/// Ordered intersection of two extent lists.
pub fn intersect_extents(changed: &[BlockExtent], allocated: &[BlockExtent]) -> Vec<BlockExtent> {
    let mut changed = changed.to_vec();
    let mut allocated = allocated.to_vec();
    changed.sort_by_key(|e| e.offset);
    allocated.sort_by_key(|e| e.offset);

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < changed.len() && j < allocated.len() {
        if let Some(overlap) = changed[i].intersection(&allocated[j]) {
            out.push(overlap);
        }
        if changed[i].end() < allocated[j].end() {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}
