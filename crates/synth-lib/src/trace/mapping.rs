//! Entity index to session id mapping files

use csv::Reader;
use serde::Deserialize;
use std::path::Path;

use crate::error::{Result, SynthError};

#[derive(Debug, Deserialize)]
struct MappingRow {
    key: String,
}

/// Load a single-column `key` file. Row `i` names the session of entity `i`.
pub fn load_mapping(path: &Path) -> Result<Vec<String>> {
    let mut reader = Reader::from_path(path).map_err(|e| SynthError::setup(path, e))?;
    let mut keys = Vec::with_capacity(1000);
    for row in reader.deserialize::<MappingRow>() {
        let row = row.map_err(|e| SynthError::setup(path, e))?;
        keys.push(row.key);
    }
    tracing::info!(path = %path.display(), entries = keys.len(), "Loaded entity mapping");
    Ok(keys)
}
