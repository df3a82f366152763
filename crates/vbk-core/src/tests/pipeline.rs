use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use vbk_crypto::aes_gcm::Aes256GcmEngine;
use vbk_crypto::CryptoEngine;
use vbk_types::block::{BasicBlockInfo, BlockExtent};

use crate::backend::{DiskBackend, TargetBackend};
use crate::compress::Compression;
use crate::config::FailurePolicy;
use crate::pipeline::{
    run_block, BlockOutcome, BufferPool, ContentLockTable, Direction, PipelineContext,
    PipelineEvent, ResultTable,
};
use crate::testutil::{init_tracing, plaintext_engine, MemoryDisk, MemoryTarget, CONTENT_SECRET};

struct Harness {
    ctx: Arc<PipelineContext>,
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

fn harness(
    disk: Option<Arc<MemoryDisk>>,
    target: Arc<MemoryTarget>,
    crypto: Arc<dyn CryptoEngine>,
    blocks: usize,
    max_retries: u32,
) -> Harness {
    init_tracing();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let ctx = PipelineContext {
        pool: Arc::new(BufferPool::new(2, Duration::from_millis(10), 2).unwrap()),
        locks: Arc::new(ContentLockTable::new()),
        target,
        disk: disk.map(|d| d as Arc<dyn DiskBackend>),
        crypto,
        compression: Compression::Lz4,
        results: ResultTable::new(blocks),
        observer: Some(Arc::new(move |event: PipelineEvent| sink.lock().unwrap().push(event))),
        max_retries,
        retry_delay: Duration::from_millis(1),
        failure_policy: FailurePolicy::BestEffort,
        output_generation: 9,
    };
    Harness {
        ctx: Arc::new(ctx),
        events,
    }
}

fn block(offset: u64, length: u64, index: usize) -> BasicBlockInfo {
    let mut block = BasicBlockInfo::new(BlockExtent::new(offset, length), 1, 1);
    block.index = index;
    block
}

fn retries(events: &Mutex<Vec<PipelineEvent>>) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, PipelineEvent::BlockRetry { .. }))
        .count()
}

#[test]
fn transient_read_failure_is_retried() {
    let disk = Arc::new(MemoryDisk::patterned(64));
    disk.fail_reads(0, 2);
    let target = Arc::new(MemoryTarget::new());
    let h = harness(Some(Arc::clone(&disk)), Arc::clone(&target), plaintext_engine(), 1, 3);

    let outcome = run_block(&h.ctx, Direction::Backup, block(0, 16, 0));

    assert_eq!(outcome, BlockOutcome::Success);
    assert_eq!(disk.read_attempts(0), 3);
    assert_eq!(retries(&h.events), 2);
    let record = h.ctx.results.snapshot()[0].clone().unwrap();
    assert_eq!(record.attempts, 3);
    assert!(!record.failed);
    assert_eq!(target.object_count(), 1);
}

#[test]
fn block_fails_after_max_retries() {
    let disk = Arc::new(MemoryDisk::patterned(64));
    disk.fail_reads(0, 10);
    let target = Arc::new(MemoryTarget::new());
    let h = harness(Some(Arc::clone(&disk)), Arc::clone(&target), plaintext_engine(), 1, 3);

    let outcome = run_block(&h.ctx, Direction::Backup, block(0, 16, 0));

    assert!(matches!(outcome, BlockOutcome::Failed(ref reason) if reason.contains("injected")));
    assert_eq!(disk.read_attempts(0), 3);
    let record = h.ctx.results.snapshot()[0].clone().unwrap();
    assert!(record.failed);
    assert_eq!(record.attempts, 3);
    assert_eq!(target.object_count(), 0);
    assert_eq!(h.ctx.pool.in_use(), 0);
    assert!(h
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, PipelineEvent::BlockFailed { index: 0, .. })));
}

#[test]
fn stopped_pool_aborts_block() {
    let disk = Arc::new(MemoryDisk::patterned(64));
    let target = Arc::new(MemoryTarget::new());
    let h = harness(Some(Arc::clone(&disk)), target, plaintext_engine(), 1, 3);
    h.ctx.pool.stop();

    let outcome = run_block(&h.ctx, Direction::Backup, block(0, 16, 0));

    assert_eq!(outcome, BlockOutcome::Aborted);
    assert_eq!(disk.reads.load(Ordering::SeqCst), 0);
    assert!(h.ctx.results.snapshot()[0].is_none());
}

#[test]
fn existing_content_is_deduplicated() {
    let disk = Arc::new(MemoryDisk::new(64));
    let target = Arc::new(MemoryTarget::new());
    let h = harness(Some(Arc::clone(&disk)), Arc::clone(&target), plaintext_engine(), 2, 3);

    assert_eq!(
        run_block(&h.ctx, Direction::Backup, block(0, 16, 0)),
        BlockOutcome::Success
    );
    // Same zeroed content: handed to a detached dedup task.
    assert_eq!(
        run_block(&h.ctx, Direction::Backup, block(16, 16, 1)),
        BlockOutcome::Detached
    );
    assert!(h.ctx.pool.wait_sub_tasks(Duration::from_secs(10)));

    let records = h.ctx.results.snapshot();
    let second = records[1].clone().unwrap();
    assert!(second.duplicated);
    assert_eq!(second.stream_size, 0);
    let first = records[0].as_ref().unwrap();
    assert_eq!(second.block.key, first.content_key);
    assert!(second.block.compressed);
    assert!(second.block.digest.is_some());
    assert_eq!(second.block.digest, first.block.digest);
    assert_eq!(second.digest, first.digest);
    assert_eq!(target.puts.load(Ordering::SeqCst), 1);
    assert_eq!(target.dedups.load(Ordering::SeqCst), 1);
}

#[test]
fn concurrent_identical_blocks_have_one_writer() {
    let disk = Arc::new(MemoryDisk::new(1024));
    let target = Arc::new(MemoryTarget::new().with_put_delay(Duration::from_millis(5)));
    let h = harness(Some(disk), Arc::clone(&target), plaintext_engine(), 32, 3);

    thread::scope(|s| {
        for index in 0..32 {
            let ctx = &h.ctx;
            s.spawn(move || run_block(ctx, Direction::Backup, block(index as u64 * 32, 32, index)));
        }
    });
    assert!(h.ctx.pool.wait_sub_tasks(Duration::from_secs(10)));

    assert_eq!(target.puts.load(Ordering::SeqCst), 1);
    assert_eq!(target.object_count(), 1);
    let records = h.ctx.results.snapshot();
    assert!(records.iter().all(|r| r.as_ref().is_some_and(|r| !r.failed)));
    assert_eq!(
        records.iter().flatten().filter(|r| r.duplicated).count(),
        31
    );
    assert!(h.ctx.locks.is_empty());
}

#[test]
fn detached_dedup_fails_when_writer_never_stored() {
    let disk = Arc::new(MemoryDisk::new(64));
    let target = Arc::new(MemoryTarget::new());
    let h = harness(Some(Arc::clone(&disk)), Arc::clone(&target), plaintext_engine(), 1, 3);

    // Another worker holds the key but never stores it.
    let mut zeros = Vec::new();
    disk.read(BlockExtent::new(0, 16), &mut zeros).unwrap();
    let key = vbk_types::content_key::ContentKey::compute(&CONTENT_SECRET, &zeros);
    let guard = h.ctx.locks.lock(key);

    let outcome = run_block(&h.ctx, Direction::Backup, block(0, 16, 0));
    assert_eq!(outcome, BlockOutcome::Detached);
    drop(guard);
    assert!(h.ctx.pool.wait_sub_tasks(Duration::from_secs(10)));

    let record = h.ctx.results.snapshot()[0].clone().unwrap();
    assert!(record.failed);
    assert!(record.reason.unwrap().contains("not stored"));
}

#[test]
fn retryable_put_failure_recovers() {
    let disk = Arc::new(MemoryDisk::patterned(64));
    let target = Arc::new(MemoryTarget::new());
    target.fail_puts(1);
    let h = harness(Some(disk), Arc::clone(&target), plaintext_engine(), 1, 3);

    assert_eq!(
        run_block(&h.ctx, Direction::Backup, block(0, 16, 0)),
        BlockOutcome::Success
    );
    assert_eq!(retries(&h.events), 1);
    assert_eq!(target.object_count(), 1);
}

fn backed_up(
    crypto: Arc<dyn CryptoEngine>,
    source: &Arc<MemoryDisk>,
    extent: BlockExtent,
) -> (Arc<MemoryTarget>, BasicBlockInfo) {
    let target = Arc::new(MemoryTarget::new());
    let h = harness(Some(Arc::clone(source)), Arc::clone(&target), crypto, 1, 3);
    assert_eq!(
        run_block(&h.ctx, Direction::Backup, block(extent.offset, extent.length, 0)),
        BlockOutcome::Success
    );
    let record = target.records(1).remove(0);
    (target, record)
}

#[test]
fn restore_writes_back_encrypted_block() {
    let crypto: Arc<dyn CryptoEngine> = Arc::new(Aes256GcmEngine::new(&[9; 32], &CONTENT_SECRET));
    let source = Arc::new(MemoryDisk::patterned(64));
    let (target, record) = backed_up(Arc::clone(&crypto), &source, BlockExtent::new(8, 32));
    assert!(record.ciphered);
    assert!(record.compressed);
    assert_eq!(record.cipher_offset, 12);

    let restored = Arc::new(MemoryDisk::new(64));
    let h = harness(Some(Arc::clone(&restored)), target, crypto, 1, 3);
    assert_eq!(
        run_block(&h.ctx, Direction::Restore, record),
        BlockOutcome::Success
    );
    assert_eq!(
        restored.sectors(BlockExtent::new(8, 32)),
        source.sectors(BlockExtent::new(8, 32))
    );
    assert_eq!(restored.sectors(BlockExtent::new(0, 8)), vec![0u8; 8 * 512]);
}

#[test]
fn restore_of_trimmed_block_writes_only_its_extent() {
    let source = Arc::new(MemoryDisk::patterned(64));
    let (target, record) = backed_up(plaintext_engine(), &source, BlockExtent::new(0, 32));
    let trimmed = record.trimmed(BlockExtent::new(20, 12));

    let restored = Arc::new(MemoryDisk::new(64));
    let h = harness(Some(Arc::clone(&restored)), target, plaintext_engine(), 1, 3);
    assert_eq!(
        run_block(&h.ctx, Direction::Restore, trimmed),
        BlockOutcome::Success
    );
    assert_eq!(
        restored.sectors(BlockExtent::new(20, 12)),
        source.sectors(BlockExtent::new(20, 12))
    );
    assert_eq!(restored.sectors(BlockExtent::new(0, 20)), vec![0u8; 20 * 512]);
}

#[test]
fn corrupted_object_is_not_retried() {
    let source = Arc::new(MemoryDisk::patterned(64));
    let (target, record) = backed_up(plaintext_engine(), &source, BlockExtent::new(0, 16));
    let key = record.key.unwrap();
    let mut stored = target.object(&key).unwrap();
    stored[5] ^= 0xFF;
    target.replace_object(key, stored);

    let restored = Arc::new(MemoryDisk::new(64));
    let h = harness(Some(Arc::clone(&restored)), Arc::clone(&target), plaintext_engine(), 1, 3);
    let outcome = run_block(&h.ctx, Direction::Restore, record);

    assert!(matches!(outcome, BlockOutcome::Failed(ref r) if r.contains("digest mismatch")));
    assert_eq!(target.gets.load(Ordering::SeqCst), 1);
    assert_eq!(restored.writes.load(Ordering::SeqCst), 0);
}

#[test]
fn virtual_backup_rereferences_unmodified_block() {
    let source = Arc::new(MemoryDisk::patterned(64));
    let (target, record) = backed_up(plaintext_engine(), &source, BlockExtent::new(0, 16));

    let h = harness(None, Arc::clone(&target), plaintext_engine(), 1, 3);
    assert_eq!(
        run_block(&h.ctx, Direction::VirtualBackup, record.clone()),
        BlockOutcome::Success
    );

    let out = target.records(9);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].key, record.key);
    assert_eq!(out[0].extent, record.extent);
    assert_eq!(target.object_count(), 1);
    assert_eq!(target.gets.load(Ordering::SeqCst), 0);
    assert!(h.ctx.results.snapshot()[0].as_ref().unwrap().duplicated);
}

#[test]
fn virtual_backup_stores_trimmed_block_as_new_object() {
    let source = Arc::new(MemoryDisk::patterned(64));
    let (target, record) = backed_up(plaintext_engine(), &source, BlockExtent::new(0, 32));
    let trimmed = record.trimmed(BlockExtent::new(4, 8));

    let h = harness(None, Arc::clone(&target), plaintext_engine(), 1, 3);
    assert_eq!(
        run_block(&h.ctx, Direction::VirtualBackup, trimmed),
        BlockOutcome::Success
    );

    let out = target.records(9);
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].extent, BlockExtent::new(4, 8));
    assert!(!out[0].is_modified());
    assert_ne!(out[0].key, record.key);
    assert_eq!(target.object_count(), 2);

    // The new object restores on its own.
    let restored = Arc::new(MemoryDisk::new(64));
    let h = harness(Some(Arc::clone(&restored)), target, plaintext_engine(), 1, 3);
    assert_eq!(
        run_block(&h.ctx, Direction::Restore, out[0].clone()),
        BlockOutcome::Success
    );
    assert_eq!(
        restored.sectors(BlockExtent::new(4, 8)),
        source.sectors(BlockExtent::new(4, 8))
    );
}

#[test]
fn restore_without_disk_fails() {
    let target = Arc::new(MemoryTarget::new());
    let h = harness(None, target, plaintext_engine(), 1, 3);
    let mut b = block(0, 16, 0);
    b.key = Some(vbk_types::content_key::ContentKey([1; 32]));

    let outcome = run_block(&h.ctx, Direction::Restore, b);
    assert!(matches!(outcome, BlockOutcome::Failed(ref r) if r.contains("no disk backend")));
}
