//! Newest-wins merge of per-generation block maps.
//!
//! Generations are visited newest first. A block from an older generation only
//! fills sectors no newer block already covers: it is inserted whole, split
//! into the uncovered fragments, or dropped.

mod stats;

pub use self::stats::ConsolidationStatistics;

use std::collections::BTreeMap;

use tracing::{debug, info};

use vbk_types::block::{BasicBlockInfo, BlockExtent};
use vbk_types::generation::GenerationProfile;

use crate::error::{Result, VbkError};

pub struct GenerationConsolidator {
    blocks: BTreeMap<u64, BasicBlockInfo>,
    stats: ConsolidationStatistics,
    sort_by_generation: bool,
}

impl Default for GenerationConsolidator {
    fn default() -> Self {
        Self::new()
    }
}

impl GenerationConsolidator {
    pub fn new() -> Self {
        Self {
            blocks: BTreeMap::new(),
            stats: ConsolidationStatistics::default(),
            sort_by_generation: false,
        }
    }

    /// Emit blocks grouped by ascending generation id instead of by offset.
    pub fn sort_by_generation(mut self, enabled: bool) -> Self {
        self.sort_by_generation = enabled;
        self
    }

    /// Merge `generations` (newest first) into one ordered, disjoint block list.
    pub fn consolidate(
        mut self,
        generations: &[GenerationProfile],
    ) -> Result<(Vec<BasicBlockInfo>, ConsolidationStatistics)> {
        for generation in generations {
            self.stats.generations += 1;
            for block in &generation.blocks {
                if block.extent.is_empty() {
                    return Err(VbkError::InvalidBlock(format!(
                        "generation {} has an empty block at offset {}",
                        generation.generation_id,
                        block.offset()
                    )));
                }
                if block.extent.checked_end().is_none()
                    || block.original.checked_end().is_none()
                {
                    return Err(VbkError::InvalidBlock(format!(
                        "generation {} has a block at offset {} running past the last sector",
                        generation.generation_id,
                        block.offset()
                    )));
                }
                self.stats.total_blocks += 1;
                self.check(block);
            }
        }

        let result = self.take_result()?;
        if !self.stats.count_identity_holds(result.len()) {
            return Err(VbkError::ConsolidationInconsistency(format!(
                "input blocks {} != output {} + replaced {} - resized {}",
                self.stats.total_blocks,
                result.len(),
                self.stats.number_replacement,
                self.stats.resized_by_overlap
            )));
        }

        info!(
            generations = self.stats.generations,
            input_blocks = self.stats.total_blocks,
            output_blocks = result.len(),
            replaced = self.stats.number_replacement,
            resized = self.stats.resized_by_overlap,
            total_bytes = self.stats.total_size_bytes(),
            "consolidated generations"
        );
        Ok((result, self.stats))
    }

    /// Insert the parts of `block` not yet covered by the map.
    fn check(&mut self, block: &BasicBlockInfo) {
        let fragments = self.uncovered(block.extent);

        match fragments.as_slice() {
            [] => {
                debug!(
                    generation = block.generation_id,
                    offset = block.offset(),
                    length = block.length(),
                    "block fully covered by newer generations"
                );
                self.stats.number_replacement += 1;
            }
            [only] if *only == block.extent => self.add(block.clone()),
            _ => {
                debug!(
                    generation = block.generation_id,
                    offset = block.offset(),
                    length = block.length(),
                    fragments = fragments.len(),
                    "block trimmed by newer generations"
                );
                self.stats.resized_by_overlap += fragments.len() - 1;
                for fragment in fragments {
                    self.add(block.trimmed(fragment));
                }
            }
        }
    }

    /// Sub-extents of `extent` not covered by any block in the map, in order.
    fn uncovered(&self, extent: BlockExtent) -> Vec<BlockExtent> {
        let mut fragments = Vec::new();
        let mut cursor = extent.offset;

        // Floor neighbour: the last block starting before `extent` may reach into it.
        if let Some((_, floor)) = self.blocks.range(..extent.offset).next_back() {
            cursor = cursor.max(floor.end());
        }

        // Ceiling neighbours: every block starting inside `extent`.
        for (&offset, existing) in self.blocks.range(extent.offset..extent.end()) {
            if offset > cursor {
                fragments.push(BlockExtent::new(cursor, offset - cursor));
            }
            cursor = cursor.max(existing.end());
        }

        if cursor < extent.end() {
            fragments.push(BlockExtent::new(cursor, extent.end() - cursor));
        }
        fragments
    }

    fn add(&mut self, block: BasicBlockInfo) {
        self.stats.total_size += block.length();
        self.blocks.insert(block.offset(), block);
    }

    fn take_result(&mut self) -> Result<Vec<BasicBlockInfo>> {
        let mut result: Vec<BasicBlockInfo> = Vec::with_capacity(self.blocks.len());
        let mut prev_end: Option<u64> = None;

        for (index, mut block) in std::mem::take(&mut self.blocks).into_values().enumerate() {
            if let Some(end) = prev_end {
                if block.offset() < end {
                    return Err(VbkError::ConsolidationInconsistency(format!(
                        "blocks order not aligned: generation {} offset {} < previous end {end}",
                        block.generation_id,
                        block.offset()
                    )));
                }
            }
            prev_end = Some(block.end());
            block.index = index;
            self.stats.max_block_length = self.stats.max_block_length.max(block.length());
            *self
                .stats
                .blocks_per_generation
                .entry(block.generation_id)
                .or_insert(0) += 1;
            result.push(block);
        }

        if self.sort_by_generation {
            // Stable sort keeps offset order inside each generation.
            result.sort_by_key(|b| b.generation_id);
            for (index, block) in result.iter_mut().enumerate() {
                block.index = index;
            }
        }
        Ok(result)
    }
}

/// Convenience wrapper over [`GenerationConsolidator`].
pub fn consolidate(
    generations: &[GenerationProfile],
    sort_by_generation: bool,
) -> Result<(Vec<BasicBlockInfo>, ConsolidationStatistics)> {
    GenerationConsolidator::new()
        .sort_by_generation(sort_by_generation)
        .consolidate(generations)
}
