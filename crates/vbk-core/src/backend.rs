//! Collaborator seams: the hypervisor disk, the backup repository and the
//! generation catalog. Each implementation owns its native handle for as long
//! as the value lives.

use vbk_types::block::{BasicBlockInfo, BlockExtent, DiskId, GenerationId, StoredEncoding};
use vbk_types::content_key::ContentKey;
use vbk_types::generation::GenerationProfile;

use crate::error::Result;

/// What the disk session can answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DiskCapabilities {
    /// The session can enumerate allocated sectors.
    pub allocated_query: bool,
    /// Changed-block tracking is active on the disk.
    pub change_tracking: bool,
}

pub trait DiskBackend: Send + Sync {
    fn capacity_in_sectors(&self) -> u64;

    fn capabilities(&self) -> DiskCapabilities;

    /// Read `extent` into `buf`, replacing its contents.
    fn read(&self, extent: BlockExtent, buf: &mut Vec<u8>) -> Result<()>;

    /// Write `data` (exactly `extent.size_in_bytes()` bytes) at `extent`.
    fn write(&self, extent: BlockExtent, data: &[u8]) -> Result<()>;

    /// Allocated extents within `[offset, offset + length)`, reported at
    /// `chunk_size` sector granularity.
    fn query_allocated(&self, offset: u64, length: u64, chunk_size: u64)
        -> Result<Vec<BlockExtent>>;

    /// Extents changed since the change id `since` (`"*"` means since creation).
    fn query_changed_areas(&self, since: &str) -> Result<Vec<BlockExtent>>;

    fn query_full(&self) -> Result<Vec<BlockExtent>> {
        Ok(vec![BlockExtent::new(0, self.capacity_in_sectors())])
    }
}

/// The backup repository as seen by block workers.
pub trait TargetBackend: Send + Sync {
    fn key_exists(&self, key: &ContentKey) -> Result<bool>;

    /// Fetch the stored stream of `block` (located by `block.key`) into `out`.
    fn get_block(&self, block: &BasicBlockInfo, out: &mut Vec<u8>) -> Result<()>;

    /// Store a new object for `key` and record `block` as referencing it.
    fn put_block(&self, block: &BasicBlockInfo, key: &ContentKey, stream: &[u8]) -> Result<()>;

    /// Encoding of the object stored for `key`, `None` when nothing is stored.
    fn stored_encoding(&self, key: &ContentKey) -> Result<Option<StoredEncoding>>;

    /// Record `block` as referencing the already stored object `key`.
    /// `block` already carries that object's encoding.
    fn dedup_block(&self, block: &BasicBlockInfo, key: &ContentKey) -> Result<()>;

    fn post_report(&self, disk_id: DiskId, generation_id: GenerationId, report: &str)
        -> Result<()>;
}

/// Catalog of generations, keyed by disk.
pub trait GenerationSource: Send + Sync {
    fn load_generation(
        &self,
        disk_id: DiskId,
        generation_id: GenerationId,
    ) -> Result<GenerationProfile>;
}
