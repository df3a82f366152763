use serde::{Deserialize, Serialize};
use std::fmt;

use crate::block::{BasicBlockInfo, GenerationId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    Full,
    Incremental,
}

impl fmt::Display for BackupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupMode::Full => write!(f, "FULL"),
            BackupMode::Incremental => write!(f, "INCR"),
        }
    }
}

/// One generation of one disk: its metadata and block map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationProfile {
    pub generation_id: GenerationId,
    pub previous_generation_id: Option<GenerationId>,
    pub backup_mode: BackupMode,
    pub compressed: bool,
    pub ciphered: bool,
    pub blocks: Vec<BasicBlockInfo>,
}

impl GenerationProfile {
    pub fn is_full(&self) -> bool {
        self.backup_mode == BackupMode::Full
    }

    /// Total sectors covered by this generation's map.
    pub fn covered_sectors(&self) -> u64 {
        self.blocks.iter().map(|b| b.length()).sum()
    }
}
