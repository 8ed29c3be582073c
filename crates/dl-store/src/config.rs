use std::fs;
use std::path::Path;

use dl_core::StabilizerSettings;
use tracing::error;

use crate::error::{Result, StoreError};

/// Load and validate stabilizer settings from a TOML file. Missing sections
/// and keys take their defaults.
pub fn load_settings(path: &Path) -> Result<StabilizerSettings> {
    let contents = fs::read_to_string(path)?;
    parse_settings(&contents).inspect_err(|e| {
        error!(path = %path.display(), error = %e, "settings rejected");
    })
}

pub fn parse_settings(contents: &str) -> Result<StabilizerSettings> {
    let settings: StabilizerSettings =
        toml::from_str(contents).map_err(|e| StoreError::Config(e.to_string()))?;
    settings
        .validate()
        .map_err(|e| StoreError::Config(e.to_string()))?;
    Ok(settings)
}
