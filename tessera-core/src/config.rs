//! Configuration management.

use crate::error::{Result, TesseraError};
use crate::paths;
use crate::tario::CompressionLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Persistent configuration for tessera.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    /// Root of the content store (layer tars, manifests, sandbox).
    pub storage_dir: PathBuf,
    /// Paths excluded from scans and copies, on top of the built-in list.
    pub blacklist: Vec<String>,
    /// Delay before a filesystem scan, guarding against 1s mtime resolution.
    pub scan_delay_ms: u64,
    /// Upper bound for draining pending cache pushes at the end of a build.
    pub push_timeout_secs: u64,
    pub compression: CompressionLevel,
    pub layer_cache_size: usize,
    pub manifest_cache_size: usize,
    pub cache: CacheBackendConfig,
    /// Registry used for image names that do not carry one.
    pub registry_default: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage_dir: paths::storage_dir(),
            blacklist: Vec::new(),
            scan_delay_ms: 1000,
            push_timeout_secs: 600,
            compression: CompressionLevel::Default,
            layer_cache_size: 256,
            manifest_cache_size: 16,
            cache: CacheBackendConfig::None,
            registry_default: crate::image::DOCKER_HUB_REGISTRY.to_string(),
        }
    }
}

/// Key-value backend used for the distributed layer cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum CacheBackendConfig {
    /// No distributed cache; every step executes.
    #[default]
    None,
    /// One file per key under `dir`.
    Local { dir: PathBuf },
    /// `GET`/`PUT` against `<address>/<key>`.
    Http {
        address: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    /// `GET`/`SET EX` against a Redis server at `address`.
    Redis {
        address: String,
        #[serde(default = "default_cache_ttl")]
        ttl_secs: u64,
    },
}

/// Seven days.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 7 * 24 * 3600;

fn default_cache_ttl() -> u64 {
    DEFAULT_CACHE_TTL_SECS
}

impl Config {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_path()
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| TesseraError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        serde_json::from_str(&content).map_err(|e| TesseraError::InvalidConfig {
            reason: format!("Failed to parse config: {}", e),
        })
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TesseraError::io(parent, e))?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| TesseraError::InvalidConfig {
            reason: format!("Failed to serialize config: {}", e),
        })?;
        std::fs::write(path, content).map_err(|e| TesseraError::io(path, e))
    }

    pub fn scan_delay(&self) -> Duration {
        Duration::from_millis(self.scan_delay_ms)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.scan_delay_ms, 1000);
        assert_eq!(config.push_timeout(), Duration::from_secs(600));
        assert_eq!(config.cache, CacheBackendConfig::None);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"scan_delay_ms": 0, "cache": {"type": "local", "dir": "/tmp/kv"}}"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.scan_delay(), Duration::ZERO);
        assert_eq!(config.cache, CacheBackendConfig::Local { dir: PathBuf::from("/tmp/kv") });
        assert_eq!(config.layer_cache_size, 256);
    }

    #[test]
    fn test_redis_backend_defaults_ttl() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"cache": {"type": "redis", "address": "cache.local:6379"}}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(
            config.cache,
            CacheBackendConfig::Redis { address: "cache.local:6379".into(), ttl_secs: DEFAULT_CACHE_TTL_SECS }
        );
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Config::default();
        config.blacklist.push("/opt/secrets".into());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.blacklist, vec!["/opt/secrets".to_string()]);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(Config::load_from(&path), Err(TesseraError::InvalidConfig { .. })));
    }
}
