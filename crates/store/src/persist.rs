//! JSON snapshot persistence shared by the stores.
//!
//! Snapshots are whole-file, pretty-printed JSON. A missing or corrupt file
//! starts the store empty with a logged warning rather than failing boot.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use butler_domain::Result;

/// Load a snapshot. `None` when the file is absent or unreadable.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(_) => return None,
    };
    match serde_json::from_str(&data) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "corrupt snapshot ignored");
            None
        }
    }
}

/// Write a snapshot, creating parent directories as needed.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}
