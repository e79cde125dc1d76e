use std::path::{Path, PathBuf};

/// Strips everything but ASCII alphanumerics, `-` and `_` from an identifier.
///
/// Upload storage and script working directories are both derived from
/// sanitized identifiers so a user id can never escape the storage root.
pub fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

/// Per-user storage directory, or `None` when the identifier sanitizes to nothing.
pub fn user_storage_dir(storage_root: &Path, user_id: &str) -> Option<PathBuf> {
    let safe = sanitize_id(user_id);
    if safe.is_empty() {
        return None;
    }
    Some(storage_root.join(safe))
}

/// Returns the config/data directory path for nodal.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("nodal")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("nodal")
    } else {
        PathBuf::from("/tmp/nodal")
    }
}

/// Returns the config file path for the nodal server.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}
