mod defaults;
mod types;

use std::path::Path;

use crate::error::{Result, VbkError};

pub use self::types::*;

/// Read a YAML pipeline configuration and validate it.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| VbkError::Config(format!("cannot read '{}': {e}", path.display())))?;
    let config: PipelineConfig = serde_yaml::from_str(&contents)
        .map_err(|e| VbkError::Config(format!("invalid config '{}': {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Parse and validate a YAML pipeline configuration document.
pub fn parse_config(yaml: &str) -> Result<PipelineConfig> {
    let config: PipelineConfig =
        serde_yaml::from_str(yaml).map_err(|e| VbkError::Config(format!("invalid config: {e}")))?;
    config.validate()?;
    Ok(config)
}
