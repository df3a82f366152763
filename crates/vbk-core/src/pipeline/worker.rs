use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use vbk_crypto::CryptoEngine;
use vbk_types::block::{BasicBlockInfo, ExBlockInfo, GenerationId, StoredEncoding};
use vbk_types::content_key::ContentKey;

use super::buffers::{BufferPool, BufferSlot};
use super::content_lock::ContentLockTable;
use super::report::ResultTable;
use super::{Direction, Observer, PipelineEvent};
use crate::backend::{DiskBackend, TargetBackend};
use crate::compress::{compress_into, decompress_with_hint, Compression};
use crate::config::FailurePolicy;
use crate::error::{Result, VbkError};

/// Everything a block worker shares with its siblings.
pub struct PipelineContext {
    pub pool: Arc<BufferPool>,
    pub locks: Arc<ContentLockTable>,
    pub target: Arc<dyn TargetBackend>,
    /// Required for backup and restore.
    pub disk: Option<Arc<dyn DiskBackend>>,
    pub crypto: Arc<dyn CryptoEngine>,
    pub compression: Compression,
    pub results: ResultTable,
    pub observer: Option<Observer>,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub failure_policy: FailurePolicy,
    /// Generation that virtual-backup records are written under.
    pub output_generation: GenerationId,
}

/// What the worker reports back to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    Success,
    /// Handed to a detached dedup task, which records the result itself.
    Detached,
    Failed(String),
    /// The pool was stopped before the block could get a buffer.
    Aborted,
}

enum Step {
    Done,
    Detached,
}

impl PipelineContext {
    fn disk(&self) -> Result<&Arc<dyn DiskBackend>> {
        self.disk
            .as_ref()
            .ok_or_else(|| VbkError::Config("no disk backend for this run".into()))
    }

    fn notify(&self, event: PipelineEvent) {
        if let Some(observer) = &self.observer {
            observer(event);
        }
    }

    /// Record the final state of a block and tell the observer.
    fn finish(&self, info: ExBlockInfo) {
        if info.failed {
            let reason = info.reason.clone().unwrap_or_default();
            warn!(
                index = info.index(),
                offset = info.block.offset(),
                attempts = info.attempts,
                reason = %reason,
                "block failed"
            );
            self.notify(PipelineEvent::BlockFailed {
                index: info.index(),
                offset: info.block.offset(),
                reason,
            });
            if self.failure_policy == FailurePolicy::FailFast {
                self.pool.stop();
            }
        } else {
            debug!(
                index = info.index(),
                offset = info.block.offset(),
                length = info.block.length(),
                duplicated = info.duplicated,
                stream_size = info.stream_size,
                "block done"
            );
            self.notify(PipelineEvent::BlockSucceeded {
                index: info.index(),
                offset: info.block.offset(),
                length: info.block.length(),
                duplicated: info.duplicated,
            });
        }
        self.results.record(info);
    }
}

/// Drive one block through the pipeline, retrying transient failures.
pub fn run_block(
    ctx: &Arc<PipelineContext>,
    direction: Direction,
    block: BasicBlockInfo,
) -> BlockOutcome {
    let mut info = ExBlockInfo::new(block);
    let started = Instant::now();

    loop {
        info.attempts += 1;
        let result = match direction {
            Direction::Backup => backup_block(ctx, &mut info, started),
            Direction::Restore => restore_block(ctx, &mut info).map(|()| Step::Done),
            Direction::VirtualBackup => virtual_block(ctx, &mut info).map(|()| Step::Done),
        };

        match result {
            Ok(Step::Done) => {
                info.elapsed = started.elapsed();
                ctx.finish(info);
                return BlockOutcome::Success;
            }
            Ok(Step::Detached) => return BlockOutcome::Detached,
            Err(e) if e.is_abort() => {
                debug!(index = info.index(), "block aborted");
                return BlockOutcome::Aborted;
            }
            Err(e)
                if e.is_retryable() && info.attempts < ctx.max_retries && ctx.pool.is_running() =>
            {
                warn!(
                    index = info.index(),
                    offset = info.block.offset(),
                    attempt = info.attempts,
                    max_retries = ctx.max_retries,
                    error = %e,
                    "block attempt failed, retrying"
                );
                ctx.notify(PipelineEvent::BlockRetry {
                    index: info.index(),
                    attempt: info.attempts,
                    reason: e.to_string(),
                });
                thread::sleep(ctx.retry_delay);
            }
            Err(e) => {
                let reason = e.to_string();
                info.elapsed = started.elapsed();
                info.mark_failed(reason.clone());
                ctx.finish(info);
                return BlockOutcome::Failed(reason);
            }
        }
    }
}

fn backup_block(
    ctx: &Arc<PipelineContext>,
    info: &mut ExBlockInfo,
    started: Instant,
) -> Result<Step> {
    let disk = ctx.disk()?;
    let mut slot = ctx.pool.acquire().ok_or(VbkError::AbortRequested)?;
    let extent = info.block.extent;

    ctx.pool
        .native("read", || disk.read(extent, &mut slot.raw))?;
    if slot.raw.len() as u64 != info.size_in_bytes {
        return Err(VbkError::TransientIo(format!(
            "short read at sector {}: {} of {} bytes",
            extent.offset,
            slot.raw.len(),
            info.size_in_bytes
        )));
    }

    let key = ContentKey::compute(ctx.crypto.content_key_secret(), &slot.raw);
    info.content_key = Some(key);

    if ctx.target.key_exists(&key)? || ctx.locks.is_locked(&key) {
        // The buffer goes back before the dedup waits on the key lock.
        drop(slot);
        let detached_ctx = Arc::clone(ctx);
        let mut detached = info.clone();
        ctx.pool.submit(move || {
            let result = register_existing(&detached_ctx, &mut detached, key);
            detached.elapsed = started.elapsed();
            if let Err(e) = result {
                detached.mark_failed(e.to_string());
            }
            detached_ctx.finish(detached);
        });
        return Ok(Step::Detached);
    }

    let record = info.block.clone();
    store(ctx, info, record, &mut slot, key)?;
    Ok(Step::Done)
}

/// Dedup branch: reference content another block already stored (or is storing).
fn register_existing(ctx: &PipelineContext, info: &mut ExBlockInfo, key: ContentKey) -> Result<()> {
    let _guard = ctx.locks.lock(key);
    let encoding = ctx.target.stored_encoding(&key)?.ok_or_else(|| {
        VbkError::Storage(format!(
            "content {key} is not stored, its writer did not complete"
        ))
    })?;
    let record = info.block.clone();
    reference(ctx, info, record, key, encoding)
}

/// Record `record` as a reference to the stored object `key`.
fn reference(
    ctx: &PipelineContext,
    info: &mut ExBlockInfo,
    mut record: BasicBlockInfo,
    key: ContentKey,
    encoding: StoredEncoding,
) -> Result<()> {
    record.key = Some(key);
    encoding.apply_to(&mut record);
    ctx.target.dedup_block(&record, &key)?;
    info.cipher_offset = encoding.cipher_offset;
    info.digest = encoding.digest;
    info.block = record;
    info.duplicated = true;
    info.stream_size = 0;
    Ok(())
}

/// Store branch: compress, encrypt, digest, then write under the key lock.
/// Another worker may have stored the same content meanwhile; then the block
/// is deduplicated instead.
fn store(
    ctx: &PipelineContext,
    info: &mut ExBlockInfo,
    mut record: BasicBlockInfo,
    slot: &mut BufferSlot,
    key: ContentKey,
) -> Result<()> {
    let BufferSlot {
        raw,
        compressed,
        ciphered,
        hasher,
        ..
    } = slot;

    let mut stream: &[u8] = raw;
    let is_compressed = ctx.compression.is_enabled();
    if is_compressed {
        compress_into(ctx.compression, stream, compressed)?;
        stream = compressed;
    }
    let is_ciphered = ctx.crypto.is_encrypting();
    let mut cipher_offset = 0;
    if is_ciphered {
        cipher_offset = ctx.crypto.encrypt_into(stream, &key.0, ciphered)?;
        stream = ciphered;
    }
    let digest = BufferSlot::digest_of(hasher, stream);

    record.key = Some(key);
    record.compressed = is_compressed;
    record.ciphered = is_ciphered;
    record.cipher_offset = cipher_offset;
    record.digest = Some(digest);

    let _guard = ctx.locks.lock(key);
    if let Some(encoding) = ctx.target.stored_encoding(&key)? {
        return reference(ctx, info, record, key, encoding);
    }
    ctx.target.put_block(&record, &key, stream)?;
    info.duplicated = false;
    info.stream_size = stream.len() as u64;
    info.cipher_offset = cipher_offset;
    info.digest = Some(digest);
    info.block = record;
    Ok(())
}

/// Fetch and verify the stored stream of `block` into `raw`.
fn fetch(
    ctx: &PipelineContext,
    block: &BasicBlockInfo,
    raw: &mut Vec<u8>,
    hasher: &mut sha2::Sha256,
) -> Result<()> {
    ctx.target.get_block(block, raw)?;
    if let Some(expected) = block.digest {
        if BufferSlot::digest_of(hasher, raw) != expected {
            return Err(VbkError::InvalidBlock(format!(
                "integrity digest mismatch for block at sector {}",
                block.offset()
            )));
        }
    }
    Ok(())
}

/// Undo encryption and compression of a stored stream.
fn decode<'s>(
    ctx: &PipelineContext,
    block: &BasicBlockInfo,
    key: &ContentKey,
    raw: &'s [u8],
    decrypted: &'s mut Vec<u8>,
    output: &'s mut Vec<u8>,
) -> Result<&'s [u8]> {
    let mut stream = raw;
    if block.ciphered {
        ctx.crypto
            .decrypt_into(stream, block.cipher_offset, &key.0, decrypted)?;
        stream = decrypted;
    }
    if block.compressed {
        *output = decompress_with_hint(stream, Some(block.original.size_in_bytes() as usize))?;
        stream = output;
    }
    Ok(stream)
}

/// The plain bytes `block` is responsible for, cut out of its stored object.
fn trimmed_plain<'p>(block: &BasicBlockInfo, plain: &'p [u8]) -> Result<&'p [u8]> {
    let range = block.plain_range();
    plain.get(range.clone()).ok_or_else(|| {
        VbkError::InvalidBlock(format!(
            "stored object for sector {} holds {} bytes, need {:?}",
            block.offset(),
            plain.len(),
            range
        ))
    })
}

fn stored_key(block: &BasicBlockInfo) -> Result<ContentKey> {
    block.key.ok_or_else(|| {
        VbkError::InvalidBlock(format!(
            "block at sector {} of generation {} has no stored content",
            block.offset(),
            block.generation_id
        ))
    })
}

fn restore_block(ctx: &PipelineContext, info: &mut ExBlockInfo) -> Result<()> {
    let disk = ctx.disk()?;
    let key = stored_key(&info.block)?;
    let mut slot = ctx.pool.acquire().ok_or(VbkError::AbortRequested)?;
    let BufferSlot {
        raw,
        compressed,
        output,
        hasher,
        ..
    } = &mut *slot;

    fetch(ctx, &info.block, raw, hasher)?;
    info.stream_size = raw.len() as u64;
    let plain = decode(ctx, &info.block, &key, raw, compressed, output)?;
    let data = trimmed_plain(&info.block, plain)?;

    let extent = info.block.extent;
    ctx.pool.native("write", || disk.write(extent, data))?;
    info.content_key = Some(key);
    info.digest = info.block.digest;
    info.cipher_offset = info.block.cipher_offset;
    Ok(())
}

fn virtual_block(ctx: &PipelineContext, info: &mut ExBlockInfo) -> Result<()> {
    let source_key = stored_key(&info.block)?;

    if !info.block.is_modified() {
        let mut record = info.block.clone();
        record.generation_id = ctx.output_generation;
        let encoding = StoredEncoding::of(&info.block);
        info.content_key = Some(source_key);
        let _guard = ctx.locks.lock(source_key);
        return reference(ctx, info, record, source_key, encoding);
    }

    let mut slot = ctx.pool.acquire().ok_or(VbkError::AbortRequested)?;
    let fresh = {
        let BufferSlot {
            raw,
            compressed,
            output,
            hasher,
            ..
        } = &mut *slot;
        fetch(ctx, &info.block, raw, hasher)?;
        let plain = decode(ctx, &info.block, &source_key, raw, compressed, output)?;
        trimmed_plain(&info.block, plain)?.to_vec()
    };
    slot.raw = fresh;

    let mut record = BasicBlockInfo::new(
        info.block.extent,
        info.block.disk_id,
        ctx.output_generation,
    );
    record.index = info.block.index;

    let key = ContentKey::compute(ctx.crypto.content_key_secret(), &slot.raw);
    info.content_key = Some(key);

    if ctx.target.key_exists(&key)? || ctx.locks.is_locked(&key) {
        let _guard = ctx.locks.lock(key);
        if let Some(encoding) = ctx.target.stored_encoding(&key)? {
            return reference(ctx, info, record, key, encoding);
        }
    }
    store(ctx, info, record, &mut slot, key)
}
