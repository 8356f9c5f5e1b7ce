//! Centralized path configuration for tessera.
//!
//! All data paths should go through this module so the CLI and worker mode
//! agree on where the content store and configuration live.

use std::path::PathBuf;

/// Directory inside build roots reserved for tessera itself.
pub const INTERNAL_DIR: &str = "/tessera-internal";

/// Get the tessera data directory.
///
/// Resolution order:
/// 1. `TESSERA_DATA_DIR` environment variable
/// 2. `/var/lib/tessera` if it exists (system install)
/// 3. `~/.tessera` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("TESSERA_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/tessera");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".tessera")).unwrap_or(system_dir)
}

/// Get the default content store directory.
pub fn storage_dir() -> PathBuf {
    data_dir().join("storage")
}

/// Get the default directory for the local-file cache backend.
pub fn local_cache_dir() -> PathBuf {
    data_dir().join("cache")
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    data_dir().join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths_share_data_dir() {
        let base = data_dir();
        assert_eq!(storage_dir(), base.join("storage"));
        assert_eq!(local_cache_dir(), base.join("cache"));
        assert_eq!(config_path(), base.join("config.json"));
    }
}
