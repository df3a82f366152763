//! In-memory collaborators for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::thread;
use std::time::Duration;

use vbk_crypto::{CryptoEngine, PlaintextEngine};
use vbk_types::block::{
    BasicBlockInfo, BlockExtent, DiskId, GenerationId, StoredEncoding, SECTOR_SIZE,
};
use vbk_types::content_key::ContentKey;
use vbk_types::error::{Result, VbkError};
use vbk_types::generation::{BackupMode, GenerationProfile};

use crate::backend::{DiskBackend, DiskCapabilities, GenerationSource, TargetBackend};
use crate::config::{FailurePolicy, PipelineConfig};

static TRACING_INIT: Once = Once::new();

/// Route `tracing` output to the test harness (`RUST_LOG` selects the level).
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub const CONTENT_SECRET: [u8; 32] = [0x5E; 32];

pub fn plaintext_engine() -> Arc<dyn CryptoEngine> {
    Arc::new(PlaintextEngine::new(&CONTENT_SECRET))
}

/// Config with short delays so retry and polling tests stay fast.
pub fn fast_config(workers: usize) -> PipelineConfig {
    PipelineConfig {
        worker_count: workers,
        max_retries: 3,
        retry_delay_ms: 1,
        buffer_poll_interval_ms: 10,
        subtask_wait_secs: 10,
        failure_policy: FailurePolicy::BestEffort,
        ..PipelineConfig::default()
    }
}

/// Deterministic, non-repeating fill for sector `sector`.
pub fn sector_pattern(sector: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(SECTOR_SIZE as usize);
    for i in 0..SECTOR_SIZE {
        out.push(((sector.wrapping_mul(31) + i * 7) % 251) as u8);
    }
    out
}

/// A sector-addressed disk held in memory.
pub struct MemoryDisk {
    data: Mutex<Vec<u8>>,
    capabilities: DiskCapabilities,
    allocated: Vec<BlockExtent>,
    changed: Vec<BlockExtent>,
    /// Remaining injected failures per block offset.
    read_failures: Mutex<HashMap<u64, u32>>,
    write_failures: Mutex<HashMap<u64, u32>>,
    read_attempts: Mutex<HashMap<u64, usize>>,
    io_delay: Duration,
    pub reads: AtomicUsize,
    pub writes: AtomicUsize,
    in_native: AtomicUsize,
    pub max_concurrent_native: AtomicUsize,
    pub allocated_queries: Mutex<Vec<(u64, u64, u64)>>,
}

impl MemoryDisk {
    /// A zero-filled disk of `capacity` sectors.
    pub fn new(capacity: u64) -> Self {
        Self::with_data(vec![0u8; (capacity * SECTOR_SIZE) as usize])
    }

    /// A disk where every sector holds [`sector_pattern`].
    pub fn patterned(capacity: u64) -> Self {
        let mut data = Vec::with_capacity((capacity * SECTOR_SIZE) as usize);
        for sector in 0..capacity {
            data.extend_from_slice(&sector_pattern(sector));
        }
        Self::with_data(data)
    }

    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            capabilities: DiskCapabilities {
                allocated_query: true,
                change_tracking: true,
            },
            allocated: Vec::new(),
            changed: Vec::new(),
            read_failures: Mutex::new(HashMap::new()),
            write_failures: Mutex::new(HashMap::new()),
            read_attempts: Mutex::new(HashMap::new()),
            io_delay: Duration::ZERO,
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            in_native: AtomicUsize::new(0),
            max_concurrent_native: AtomicUsize::new(0),
            allocated_queries: Mutex::new(Vec::new()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: DiskCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_allocated(mut self, allocated: Vec<BlockExtent>) -> Self {
        self.allocated = allocated;
        self
    }

    pub fn with_changed(mut self, changed: Vec<BlockExtent>) -> Self {
        self.changed = changed;
        self
    }

    pub fn with_io_delay(mut self, delay: Duration) -> Self {
        self.io_delay = delay;
        self
    }

    /// Fail the next `times` reads of the block starting at `offset`.
    pub fn fail_reads(&self, offset: u64, times: u32) {
        self.read_failures.lock().unwrap().insert(offset, times);
    }

    pub fn fail_writes(&self, offset: u64, times: u32) {
        self.write_failures.lock().unwrap().insert(offset, times);
    }

    pub fn read_attempts(&self, offset: u64) -> usize {
        self.read_attempts
            .lock()
            .unwrap()
            .get(&offset)
            .copied()
            .unwrap_or(0)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    pub fn sectors(&self, extent: BlockExtent) -> Vec<u8> {
        let data = self.data.lock().unwrap();
        let start = (extent.offset * SECTOR_SIZE) as usize;
        data[start..start + extent.size_in_bytes() as usize].to_vec()
    }

    fn enter_native(&self) {
        let now = self.in_native.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_native.fetch_max(now, Ordering::SeqCst);
        if !self.io_delay.is_zero() {
            thread::sleep(self.io_delay);
        }
    }

    fn leave_native(&self) {
        self.in_native.fetch_sub(1, Ordering::SeqCst);
    }

    fn take_failure(failures: &Mutex<HashMap<u64, u32>>, offset: u64) -> bool {
        let mut failures = failures.lock().unwrap();
        match failures.get_mut(&offset) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

impl DiskBackend for MemoryDisk {
    fn capacity_in_sectors(&self) -> u64 {
        self.data.lock().unwrap().len() as u64 / SECTOR_SIZE
    }

    fn capabilities(&self) -> DiskCapabilities {
        self.capabilities
    }

    fn read(&self, extent: BlockExtent, buf: &mut Vec<u8>) -> Result<()> {
        self.enter_native();
        self.reads.fetch_add(1, Ordering::SeqCst);
        *self
            .read_attempts
            .lock()
            .unwrap()
            .entry(extent.offset)
            .or_insert(0) += 1;
        let result = if Self::take_failure(&self.read_failures, extent.offset) {
            Err(VbkError::TransientIo(format!(
                "injected read failure at sector {}",
                extent.offset
            )))
        } else {
            let data = self.data.lock().unwrap();
            let start = (extent.offset * SECTOR_SIZE) as usize;
            let end = start + extent.size_in_bytes() as usize;
            match data.get(start..end) {
                Some(bytes) => {
                    buf.clear();
                    buf.extend_from_slice(bytes);
                    Ok(())
                }
                None => Err(VbkError::InvalidBlock(format!("read past end: {extent}"))),
            }
        };
        self.leave_native();
        result
    }

    fn write(&self, extent: BlockExtent, bytes: &[u8]) -> Result<()> {
        self.enter_native();
        self.writes.fetch_add(1, Ordering::SeqCst);
        let result = if Self::take_failure(&self.write_failures, extent.offset) {
            Err(VbkError::TransientIo(format!(
                "injected write failure at sector {}",
                extent.offset
            )))
        } else if bytes.len() as u64 != extent.size_in_bytes() {
            Err(VbkError::InvalidBlock(format!(
                "write of {} bytes to {extent}",
                bytes.len()
            )))
        } else {
            let mut data = self.data.lock().unwrap();
            let start = (extent.offset * SECTOR_SIZE) as usize;
            match data.get_mut(start..start + bytes.len()) {
                Some(target) => {
                    target.copy_from_slice(bytes);
                    Ok(())
                }
                None => Err(VbkError::InvalidBlock(format!("write past end: {extent}"))),
            }
        };
        self.leave_native();
        result
    }

    fn query_allocated(
        &self,
        offset: u64,
        length: u64,
        chunk_size: u64,
    ) -> Result<Vec<BlockExtent>> {
        self.allocated_queries
            .lock()
            .unwrap()
            .push((offset, length, chunk_size));
        let window = BlockExtent::new(offset, length);
        Ok(self
            .allocated
            .iter()
            .filter_map(|e| e.intersection(&window))
            .collect())
    }

    fn query_changed_areas(&self, _since: &str) -> Result<Vec<BlockExtent>> {
        Ok(self.changed.clone())
    }
}

/// A content-addressed repository held in memory.
#[derive(Default)]
pub struct MemoryTarget {
    objects: Mutex<HashMap<ContentKey, Vec<u8>>>,
    encodings: Mutex<HashMap<ContentKey, StoredEncoding>>,
    records: Mutex<Vec<BasicBlockInfo>>,
    reports: Mutex<Vec<(DiskId, GenerationId, String)>>,
    put_failures: Mutex<u32>,
    put_delay: Duration,
    pub puts: AtomicUsize,
    pub dedups: AtomicUsize,
    pub gets: AtomicUsize,
}

impl MemoryTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_put_delay(mut self, delay: Duration) -> Self {
        self.put_delay = delay;
        self
    }

    /// Fail the next `times` puts with a retryable storage error.
    pub fn fail_puts(&self, times: u32) {
        *self.put_failures.lock().unwrap() = times;
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn object(&self, key: &ContentKey) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    /// Overwrite a stored object, e.g. to simulate corruption.
    pub fn replace_object(&self, key: ContentKey, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(key, data);
    }

    /// Records written for `generation_id`, ordered by offset.
    pub fn records(&self, generation_id: GenerationId) -> Vec<BasicBlockInfo> {
        let mut records: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.generation_id == generation_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.offset());
        records
    }

    /// Build a generation profile from the records of `generation_id`.
    pub fn profile(
        &self,
        generation_id: GenerationId,
        previous_generation_id: Option<GenerationId>,
        backup_mode: BackupMode,
    ) -> GenerationProfile {
        let blocks = self.records(generation_id);
        GenerationProfile {
            generation_id,
            previous_generation_id,
            backup_mode,
            compressed: blocks.iter().any(|b| b.compressed),
            ciphered: blocks.iter().any(|b| b.ciphered),
            blocks,
        }
    }

    pub fn reports(&self) -> Vec<(DiskId, GenerationId, String)> {
        self.reports.lock().unwrap().clone()
    }
}

impl TargetBackend for MemoryTarget {
    fn key_exists(&self, key: &ContentKey) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    fn get_block(&self, block: &BasicBlockInfo, out: &mut Vec<u8>) -> Result<()> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let key = block
            .key
            .ok_or_else(|| VbkError::InvalidBlock("block has no content key".into()))?;
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(&key)
            .ok_or_else(|| VbkError::InvalidBlock(format!("object {key} not found")))?;
        out.clear();
        out.extend_from_slice(data);
        Ok(())
    }

    fn put_block(&self, block: &BasicBlockInfo, key: &ContentKey, stream: &[u8]) -> Result<()> {
        {
            let mut failures = self.put_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(VbkError::Storage("injected put failure".into()));
            }
        }
        if !self.put_delay.is_zero() {
            thread::sleep(self.put_delay);
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().unwrap().insert(*key, stream.to_vec());
        self.encodings
            .lock()
            .unwrap()
            .insert(*key, StoredEncoding::of(block));
        self.records.lock().unwrap().push(block.clone());
        Ok(())
    }

    fn stored_encoding(&self, key: &ContentKey) -> Result<Option<StoredEncoding>> {
        if !self.objects.lock().unwrap().contains_key(key) {
            return Ok(None);
        }
        Ok(self.encodings.lock().unwrap().get(key).copied())
    }

    fn dedup_block(&self, block: &BasicBlockInfo, _key: &ContentKey) -> Result<()> {
        self.dedups.fetch_add(1, Ordering::SeqCst);
        self.records.lock().unwrap().push(block.clone());
        Ok(())
    }

    fn post_report(
        &self,
        disk_id: DiskId,
        generation_id: GenerationId,
        report: &str,
    ) -> Result<()> {
        self.reports
            .lock()
            .unwrap()
            .push((disk_id, generation_id, report.to_string()));
        Ok(())
    }
}

/// Generation catalog held in memory.
#[derive(Default)]
pub struct MemoryGenerations {
    profiles: Mutex<HashMap<(DiskId, GenerationId), GenerationProfile>>,
}

impl MemoryGenerations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, disk_id: DiskId, profile: GenerationProfile) {
        self.profiles
            .lock()
            .unwrap()
            .insert((disk_id, profile.generation_id), profile);
    }
}

impl GenerationSource for MemoryGenerations {
    fn load_generation(
        &self,
        disk_id: DiskId,
        generation_id: GenerationId,
    ) -> Result<GenerationProfile> {
        self.profiles
            .lock()
            .unwrap()
            .get(&(disk_id, generation_id))
            .cloned()
            .ok_or(VbkError::MissingGeneration {
                disk_id,
                generation_id,
            })
    }
}

/// A generation profile over plain extents, for consolidation tests.
pub fn generation(
    generation_id: GenerationId,
    previous_generation_id: Option<GenerationId>,
    extents: &[(u64, u64)],
) -> GenerationProfile {
    let backup_mode = if previous_generation_id.is_some() {
        BackupMode::Incremental
    } else {
        BackupMode::Full
    };
    GenerationProfile {
        generation_id,
        previous_generation_id,
        backup_mode,
        compressed: false,
        ciphered: false,
        blocks: extents
            .iter()
            .map(|&(offset, length)| {
                BasicBlockInfo::new(BlockExtent::new(offset, length), 1, generation_id)
            })
            .collect(),
    }
}
