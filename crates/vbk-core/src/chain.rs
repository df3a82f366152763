use std::collections::HashSet;

use tracing::debug;

use vbk_types::block::{DiskId, GenerationId};
use vbk_types::generation::GenerationProfile;

use crate::backend::GenerationSource;
use crate::error::{Result, VbkError};

/// Generations needed to rebuild `newest`: from `newest` back to the first
/// full generation, newest first.
pub fn resolve_chain(
    source: &dyn GenerationSource,
    disk_id: DiskId,
    newest: GenerationId,
) -> Result<Vec<GenerationProfile>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut next = Some(newest);

    while let Some(generation_id) = next {
        if !seen.insert(generation_id) {
            return Err(VbkError::Config(format!(
                "generation chain of disk {disk_id} loops back to generation {generation_id}"
            )));
        }
        let profile = source.load_generation(disk_id, generation_id)?;
        debug!(
            disk_id,
            generation_id,
            mode = %profile.backup_mode,
            blocks = profile.blocks.len(),
            "loaded generation"
        );

        next = if profile.is_full() {
            None
        } else {
            match profile.previous_generation_id {
                Some(previous) => Some(previous),
                None => {
                    return Err(VbkError::Config(format!(
                        "incremental generation {generation_id} of disk {disk_id} has no parent"
                    )))
                }
            }
        };
        chain.push(profile);
    }
    Ok(chain)
}
