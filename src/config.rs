use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Files at or above this size are memory-mapped instead of copied.
pub const DEFAULT_MMAP_THRESHOLD: usize = 1024 * 1024; // 1MB
pub const DEFAULT_TAB_WIDTH: usize = 8;
pub const DEFAULT_LOCAL_CACHE_LIMIT: usize = 64;
pub const DEFAULT_GLOBAL_STRIDE: usize = 16 * 1024; // 16KB

/// Tunables shared by every buffer and navigator created through one editor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mmap_threshold: usize,
    pub tab_width: usize,
    /// Soft bound on the navigator's local cache
    pub local_cache_limit: usize,
    /// Byte stride at which the navigator samples its global cache
    pub global_stride: usize,
    /// Register a file-change watch for every mapping
    pub watch_mappings: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
            tab_width: DEFAULT_TAB_WIDTH,
            local_cache_limit: DEFAULT_LOCAL_CACHE_LIMIT,
            global_stride: DEFAULT_GLOBAL_STRIDE,
            watch_mappings: true,
        }
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse config")?;
        Ok(config.normalized())
    }

    /// Loads a JSON config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to encode config")?;
        fs::write(path, json).with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// Clamps values that would make the navigator degenerate.
    pub fn normalized(mut self) -> Self {
        self.tab_width = self.tab_width.max(1);
        self.local_cache_limit = self.local_cache_limit.max(1);
        self.global_stride = self.global_stride.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json_str(r#"{"tab_width": 4}"#).unwrap();
        assert_eq!(config.tab_width, 4);
        assert_eq!(config.mmap_threshold, DEFAULT_MMAP_THRESHOLD);
        assert!(config.watch_mappings);
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let config = Config::from_json_str(r#"{"tab_width": 0, "global_stride": 0}"#).unwrap();
        assert_eq!(config.tab_width, 1);
        assert_eq!(config.global_stride, 1);
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("strata.json")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("strata.json");
        let config = Config {
            mmap_threshold: 4096,
            watch_mappings: false,
            ..Config::default()
        };
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(Config::from_json_str("{tab_width").is_err());
    }
}
