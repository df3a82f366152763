use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::content_key::ContentKey;

/// Size of a disk sector in bytes. All extents are expressed in sectors.
pub const SECTOR_SIZE: u64 = 512;

pub type DiskId = u32;
pub type GenerationId = u32;

/// A contiguous run of sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockExtent {
    pub offset: u64,
    pub length: u64,
}

impl BlockExtent {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Exclusive end sector.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Exclusive end sector, or `None` if it does not fit in a `u64`.
    pub fn checked_end(&self) -> Option<u64> {
        self.offset.checked_add(self.length)
    }

    /// Last covered sector (inclusive). Zero-length extents report their offset.
    pub fn last(&self) -> u64 {
        self.end().saturating_sub(1).max(self.offset)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.length * SECTOR_SIZE
    }

    pub fn overlaps(&self, other: &BlockExtent) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    pub fn contains(&self, other: &BlockExtent) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }

    /// Overlapping part of two extents, if any.
    pub fn intersection(&self, other: &BlockExtent) -> Option<BlockExtent> {
        let start = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        (start < end).then(|| BlockExtent::new(start, end - start))
    }
}

impl fmt::Display for BlockExtent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

/// One block of a generation's map.
///
/// `extent` is the range this block is responsible for; `original` is the
/// range the stored object was written for. Consolidation may trim `extent`
/// but never touches `original`, so restore can slice the right bytes out of
/// the stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicBlockInfo {
    pub extent: BlockExtent,
    pub original: BlockExtent,
    pub disk_id: DiskId,
    pub generation_id: GenerationId,
    pub compressed: bool,
    pub ciphered: bool,
    pub index: usize,
    /// Content key of the stored object, known once the block has been backed up.
    #[serde(default)]
    pub key: Option<ContentKey>,
    #[serde(default)]
    pub cipher_offset: u8,
    /// SHA-256 of the stored stream.
    #[serde(default)]
    pub digest: Option<[u8; 32]>,
}

impl BasicBlockInfo {
    pub fn new(extent: BlockExtent, disk_id: DiskId, generation_id: GenerationId) -> Self {
        Self {
            extent,
            original: extent,
            disk_id,
            generation_id,
            compressed: false,
            ciphered: false,
            index: 0,
            key: None,
            cipher_offset: 0,
            digest: None,
        }
    }

    pub fn offset(&self) -> u64 {
        self.extent.offset
    }

    pub fn length(&self) -> u64 {
        self.extent.length
    }

    pub fn end(&self) -> u64 {
        self.extent.end()
    }

    /// True when this block covers less than its stored object.
    pub fn is_modified(&self) -> bool {
        self.extent != self.original
    }

    /// A copy of this block narrowed to `extent`, keeping provenance.
    pub fn trimmed(&self, extent: BlockExtent) -> Self {
        Self {
            extent,
            ..self.clone()
        }
    }

    /// Byte range of `extent` inside the stored object's plain bytes.
    pub fn plain_range(&self) -> std::ops::Range<usize> {
        let start = (self.extent.offset.saturating_sub(self.original.offset) * SECTOR_SIZE) as usize;
        start..start + self.extent.size_in_bytes() as usize
    }
}

/// How a stored object was written. A block referencing the object must
/// carry the same encoding to be restorable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredEncoding {
    pub compressed: bool,
    pub ciphered: bool,
    pub cipher_offset: u8,
    pub digest: Option<[u8; 32]>,
}

impl StoredEncoding {
    pub fn of(block: &BasicBlockInfo) -> Self {
        Self {
            compressed: block.compressed,
            ciphered: block.ciphered,
            cipher_offset: block.cipher_offset,
            digest: block.digest,
        }
    }

    pub fn apply_to(&self, block: &mut BasicBlockInfo) {
        block.compressed = self.compressed;
        block.ciphered = self.ciphered;
        block.cipher_offset = self.cipher_offset;
        block.digest = self.digest;
    }
}

/// Pipeline-time view of a block. Owned by exactly one worker.
#[derive(Debug, Clone)]
pub struct ExBlockInfo {
    pub block: BasicBlockInfo,
    pub size_in_bytes: u64,
    pub stream_offset: u64,
    pub stream_size: u64,
    pub cipher_offset: u8,
    pub content_key: Option<ContentKey>,
    pub digest: Option<[u8; 32]>,
    pub duplicated: bool,
    pub failed: bool,
    pub reason: Option<String>,
    pub attempts: u32,
    pub elapsed: Duration,
}

impl ExBlockInfo {
    pub fn new(block: BasicBlockInfo) -> Self {
        let size_in_bytes = block.extent.size_in_bytes();
        Self {
            block,
            size_in_bytes,
            stream_offset: 0,
            stream_size: 0,
            cipher_offset: 0,
            content_key: None,
            digest: None,
            duplicated: false,
            failed: false,
            reason: None,
            attempts: 0,
            elapsed: Duration::ZERO,
        }
    }

    pub fn index(&self) -> usize {
        self.block.index
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.failed = true;
        self.reason = Some(reason.into());
    }

    pub fn digest_hex(&self) -> String {
        self.digest.map(hex::encode).unwrap_or_default()
    }
}
