use tracing::info;

use vbk_types::block::{BasicBlockInfo, BlockExtent, DiskId, GenerationId};

/// Backup block list ready for the pipeline.
#[derive(Debug, Clone)]
pub struct NormalizedBlocks {
    pub blocks: Vec<BasicBlockInfo>,
    /// Blocks created beyond the number of (non-empty) input extents.
    pub extension: usize,
}

/// Split every extent longer than `max_block_length` sectors into consecutive
/// sub-extents of at most that length. Order and coverage are preserved;
/// empty extents are dropped.
pub fn normalize(
    extents: &[BlockExtent],
    max_block_length: u64,
    disk_id: DiskId,
    generation_id: GenerationId,
) -> NormalizedBlocks {
    let max_block_length = max_block_length.max(1);
    let mut blocks = Vec::with_capacity(extents.len());
    let mut source_count = 0usize;

    for extent in extents.iter().filter(|e| !e.is_empty()) {
        source_count += 1;
        let mut offset = extent.offset;
        let end = extent.end();
        while offset < end {
            let length = (end - offset).min(max_block_length);
            let mut block = BasicBlockInfo::new(BlockExtent::new(offset, length), disk_id, generation_id);
            block.index = blocks.len();
            blocks.push(block);
            offset += length;
        }
    }

    let extension = blocks.len() - source_count;
    info!(
        extents = source_count,
        blocks = blocks.len(),
        extension,
        max_block_length,
        "normalized block list"
    );
    NormalizedBlocks { blocks, extension }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_extents_pass_through() {
        let extents = [BlockExtent::new(0, 10), BlockExtent::new(50, 20)];
        let out = normalize(&extents, 20, 3, 9);
        assert_eq!(out.extension, 0);
        assert_eq!(out.blocks.len(), 2);
        assert_eq!(out.blocks[1].extent, BlockExtent::new(50, 20));
        assert_eq!(out.blocks[1].index, 1);
        assert_eq!(out.blocks[1].disk_id, 3);
        assert_eq!(out.blocks[1].generation_id, 9);
    }

    #[test]
    fn long_extent_is_split_with_remainder() {
        let out = normalize(&[BlockExtent::new(100, 45)], 20, 1, 1);
        let extents: Vec<_> = out.blocks.iter().map(|b| b.extent).collect();
        assert_eq!(
            extents,
            vec![
                BlockExtent::new(100, 20),
                BlockExtent::new(120, 20),
                BlockExtent::new(140, 5),
            ]
        );
        assert_eq!(out.extension, 2);
        assert!(out.blocks.iter().all(|b| !b.is_modified()));
    }

    #[test]
    fn empty_extents_are_dropped() {
        let out = normalize(&[BlockExtent::new(0, 0), BlockExtent::new(8, 8)], 4, 1, 1);
        assert_eq!(out.blocks.len(), 2);
        assert_eq!(out.extension, 1);
        assert_eq!(out.blocks[0].index, 0);
    }

    #[test]
    fn coverage_is_preserved() {
        let extents = [BlockExtent::new(0, 1000), BlockExtent::new(4096, 333)];
        let out = normalize(&extents, 128, 1, 1);
        let total: u64 = out.blocks.iter().map(|b| b.length()).sum();
        assert_eq!(total, 1333);
        assert!(out.blocks.windows(2).all(|w| w[0].end() <= w[1].offset()));
    }
}
