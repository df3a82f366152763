use std::sync::Mutex;

use vbk_types::block::BlockExtent;
use vbk_types::error::{Result, VbkError};
use vbk_types::generation::BackupMode;

use crate::backend::{DiskBackend, DiskCapabilities};
use crate::config::{QueryConfig, QueryStrategy};
use crate::query::{
    intersect_extents, query_allocated_blocks, query_blocks, select_strategy, MAX_CHUNK_NUMBER,
    MIN_CHUNK_SIZE,
};

/// Metadata-only disk: answers queries, holds no data.
struct SparseDisk {
    capacity: u64,
    capabilities: DiskCapabilities,
    allocated: Vec<BlockExtent>,
    changed: Vec<BlockExtent>,
    queries: Mutex<Vec<(u64, u64, u64)>>,
    changed_since: Mutex<Vec<String>>,
}

impl SparseDisk {
    fn new(capacity: u64, capabilities: DiskCapabilities) -> Self {
        Self {
            capacity,
            capabilities,
            allocated: Vec::new(),
            changed: Vec::new(),
            queries: Mutex::new(Vec::new()),
            changed_since: Mutex::new(Vec::new()),
        }
    }
}

impl DiskBackend for SparseDisk {
    fn capacity_in_sectors(&self) -> u64 {
        self.capacity
    }

    fn capabilities(&self) -> DiskCapabilities {
        self.capabilities
    }

    fn read(&self, _extent: BlockExtent, _buf: &mut Vec<u8>) -> Result<()> {
        Err(VbkError::Other("not readable".into()))
    }

    fn write(&self, _extent: BlockExtent, _data: &[u8]) -> Result<()> {
        Err(VbkError::Other("not writable".into()))
    }

    fn query_allocated(&self, offset: u64, length: u64, chunk_size: u64) -> Result<Vec<BlockExtent>> {
        self.queries.lock().unwrap().push((offset, length, chunk_size));
        let window = BlockExtent::new(offset, length);
        Ok(self
            .allocated
            .iter()
            .filter_map(|e| e.intersection(&window))
            .collect())
    }

    fn query_changed_areas(&self, since: &str) -> Result<Vec<BlockExtent>> {
        self.changed_since.lock().unwrap().push(since.to_string());
        Ok(self.changed.clone())
    }
}

const ALL: DiskCapabilities = DiskCapabilities {
    allocated_query: true,
    change_tracking: true,
};

fn query_config(strategy: QueryStrategy, change_tracking: bool) -> QueryConfig {
    QueryConfig {
        strategy,
        change_tracking,
        ..QueryConfig::default()
    }
}

#[test]
fn strategy_follows_priority() {
    let config = query_config(QueryStrategy::Allocated, true);
    assert_eq!(select_strategy(&config, &ALL).unwrap(), QueryStrategy::Allocated);

    let legacy = QueryConfig {
        legacy_session: true,
        ..config.clone()
    };
    assert_eq!(select_strategy(&legacy, &ALL).unwrap(), QueryStrategy::ChangedAreas);

    let none = DiskCapabilities::default();
    assert_eq!(select_strategy(&config, &none).unwrap(), QueryStrategy::Full);
}

#[test]
fn strategy_never_climbs_above_configured() {
    let config = query_config(QueryStrategy::ChangedAreas, false);
    assert_eq!(select_strategy(&config, &ALL).unwrap(), QueryStrategy::Full);

    let config = query_config(QueryStrategy::Full, true);
    assert_eq!(select_strategy(&config, &ALL).unwrap(), QueryStrategy::Full);
}

#[test]
fn allocated_query_includes_unaligned_tail() {
    let mut disk = SparseDisk::new(MIN_CHUNK_SIZE * 4 + 7, ALL);
    disk.allocated = vec![BlockExtent::new(128, 64)];

    let extents = query_allocated_blocks(&disk).unwrap();

    assert_eq!(
        extents,
        vec![BlockExtent::new(128, 64), BlockExtent::new(512, 7)]
    );
    assert_eq!(*disk.queries.lock().unwrap(), vec![(0, 512, MIN_CHUNK_SIZE)]);
}

#[test]
fn allocated_query_is_windowed() {
    let window = MAX_CHUNK_NUMBER * MIN_CHUNK_SIZE;
    let mut disk = SparseDisk::new(window * 2 + MIN_CHUNK_SIZE * 3, ALL);
    disk.allocated = vec![BlockExtent::new(window - 10, 20)];

    let extents = query_allocated_blocks(&disk).unwrap();

    assert_eq!(
        *disk.queries.lock().unwrap(),
        vec![
            (0, window, MIN_CHUNK_SIZE),
            (window, window, MIN_CHUNK_SIZE),
            (window * 2, MIN_CHUNK_SIZE * 3, MIN_CHUNK_SIZE),
        ]
    );
    // The extent straddling the window boundary comes back in two parts.
    assert_eq!(
        extents,
        vec![BlockExtent::new(window - 10, 10), BlockExtent::new(window, 10)]
    );
}

#[test]
fn tiny_disk_is_all_tail() {
    let disk = SparseDisk::new(100, ALL);
    assert_eq!(
        query_allocated_blocks(&disk).unwrap(),
        vec![BlockExtent::new(0, 100)]
    );
    assert!(disk.queries.lock().unwrap().is_empty());
}

#[test]
fn intersection_of_extent_lists() {
    let changed = [
        BlockExtent::new(0, 10),
        BlockExtent::new(20, 30),
        BlockExtent::new(100, 5),
    ];
    let allocated = [BlockExtent::new(5, 20), BlockExtent::new(40, 70)];

    assert_eq!(
        intersect_extents(&changed, &allocated),
        vec![
            BlockExtent::new(5, 5),
            BlockExtent::new(20, 5),
            BlockExtent::new(40, 10),
            BlockExtent::new(100, 5),
        ]
    );
    assert!(intersect_extents(&changed, &[]).is_empty());
}

#[test]
fn incremental_uses_changed_areas_narrowed_to_allocated() {
    let mut disk = SparseDisk::new(1024, ALL);
    disk.changed = vec![BlockExtent::new(0, 100), BlockExtent::new(500, 10)];
    disk.allocated = vec![BlockExtent::new(50, 500)];

    let outcome = query_blocks(
        &disk,
        &query_config(QueryStrategy::Allocated, true),
        BackupMode::Incremental,
        Some("52 3b 11/8"),
    )
    .unwrap();

    assert_eq!(outcome.strategy, QueryStrategy::ChangedAreas);
    assert_eq!(
        outcome.extents,
        vec![BlockExtent::new(50, 50), BlockExtent::new(500, 10)]
    );
    assert_eq!(*disk.changed_since.lock().unwrap(), vec!["52 3b 11/8"]);
}

#[test]
fn incremental_without_change_id_falls_back() {
    let disk = SparseDisk::new(
        256,
        DiskCapabilities {
            allocated_query: false,
            change_tracking: true,
        },
    );

    let outcome = query_blocks(
        &disk,
        &query_config(QueryStrategy::Allocated, true),
        BackupMode::Incremental,
        None,
    )
    .unwrap();

    // Changed areas since creation stand in for the allocated map.
    assert_eq!(outcome.strategy, QueryStrategy::ChangedAreas);
    assert_eq!(*disk.changed_since.lock().unwrap(), vec!["*"]);
}

#[test]
fn full_strategy_covers_whole_disk() {
    let disk = SparseDisk::new(777, DiskCapabilities::default());
    let outcome = query_blocks(
        &disk,
        &query_config(QueryStrategy::Allocated, false),
        BackupMode::Full,
        None,
    )
    .unwrap();

    assert_eq!(outcome.strategy, QueryStrategy::Full);
    assert_eq!(outcome.extents, vec![BlockExtent::new(0, 777)]);
}
