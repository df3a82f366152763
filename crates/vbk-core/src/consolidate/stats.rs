use std::collections::BTreeMap;

use serde::Serialize;

use vbk_types::block::{GenerationId, SECTOR_SIZE};

/// Counters accumulated while merging generations. Read-only once
/// consolidation returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationStatistics {
    /// Input blocks across all generations.
    pub total_blocks: usize,
    /// Input blocks dropped entirely because newer blocks already covered them.
    pub number_replacement: usize,
    /// Extra fragments created when an older block was split around newer ones.
    pub resized_by_overlap: usize,
    /// Sectors covered by the output.
    pub total_size: u64,
    pub max_block_length: u64,
    pub generations: usize,
    pub blocks_per_generation: BTreeMap<GenerationId, usize>,
}

impl ConsolidationStatistics {
    pub fn total_size_bytes(&self) -> u64 {
        self.total_size * SECTOR_SIZE
    }

    /// `total_blocks == output_len + number_replacement - resized_by_overlap`.
    pub fn count_identity_holds(&self, output_len: usize) -> bool {
        self.total_blocks + self.resized_by_overlap == output_len + self.number_replacement
    }
}
