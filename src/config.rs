//! Configuration management for pagecryptfs

use crate::error::{Error, Result};
use crate::stack::{IoMode, StackOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default page capacity of a single mapping: 64 MiB of 4 KiB pages
pub const DEFAULT_CACHE_PAGES: usize = 16 * 1024;

/// Default shift applied by the placeholder codec
pub const DEFAULT_CODEC_DELTA: u8 = 1;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Mount configuration
    pub mount: MountConfig,

    /// Page cache configuration
    pub cache: CacheConfig,

    /// Content transform configuration
    pub codec: CodecConfig,

    /// I/O path configuration
    pub io: IoConfig,
}

/// Mount configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Directory holding the transformed (lower) content
    pub lower_path: PathBuf,

    /// Mount point path
    pub mount_point: PathBuf,

    /// Allow other users to access the mount
    pub allow_other: bool,

    /// Allow root to access the mount
    pub allow_root: bool,
}

/// Page cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum resident pages per file mapping (0 = unbounded)
    pub max_pages: usize,
}

/// Content transform configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Additive shift applied to every stored byte
    pub delta: u8,
}

/// I/O path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoConfig {
    /// How regular files move data
    pub mode: IoMode,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mount: MountConfig::default(),
            cache: CacheConfig::default(),
            codec: CodecConfig::default(),
            io: IoConfig::default(),
        }
    }
}

impl Default for MountConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pagecryptfs");

        MountConfig {
            lower_path: data_dir.join("lower"),
            mount_point: PathBuf::from("/mnt/pagecryptfs"),
            allow_other: false,
            allow_root: false,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_pages: DEFAULT_CACHE_PAGES,
        }
    }
}

impl Default for CodecConfig {
    fn default() -> Self {
        CodecConfig {
            delta: DEFAULT_CODEC_DELTA,
        }
    }
}

impl Default for IoConfig {
    fn default() -> Self {
        IoConfig {
            mode: IoMode::Cached,
        }
    }
}

impl Config {
    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pagecryptfs")
            .join("config.json")
    }

    /// Load configuration from a file, with environment variable overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read config file: {}", e))
        })?;

        let mut config: Config = serde_json::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file: {}", e))
        })?;

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    /// Load the file if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Self::from_env()
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(lower) = std::env::var("PAGECRYPTFS_LOWER") {
            let lower = lower.trim();
            if !lower.is_empty() {
                self.mount.lower_path = PathBuf::from(lower);
            }
        }

        if let Ok(pages) = std::env::var("PAGECRYPTFS_CACHE_PAGES") {
            if let Ok(pages) = pages.trim().parse::<usize>() {
                self.cache.max_pages = pages;
            }
        }

        if let Ok(mode) = std::env::var("PAGECRYPTFS_IO_MODE") {
            match mode.trim() {
                "cached" => self.io.mode = IoMode::Cached,
                "passthrough" => self.io.mode = IoMode::Passthrough,
                _ => {}
            }
        }
    }

    /// Create a new config from defaults and environment variables only
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            Error::Config(format!("Failed to serialize config: {}", e))
        })?;

        std::fs::write(path.as_ref(), content).map_err(|e| {
            Error::Config(format!("Failed to write config file: {}", e))
        })?;

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.codec.delta == 0 {
            return Err(Error::InvalidConfig(
                "Codec delta must be non-zero".to_string(),
            ));
        }

        if self.mount.lower_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "Lower path is required".to_string(),
            ));
        }

        if !self.mount.mount_point.as_os_str().is_empty()
            && self.mount.mount_point == self.mount.lower_path
        {
            return Err(Error::InvalidConfig(
                "Mount point must differ from the lower path".to_string(),
            ));
        }

        Ok(())
    }

    /// Options handed to the stacking layer
    pub fn stack_options(&self) -> StackOptions {
        StackOptions {
            io_mode: self.io.mode,
            cache_pages: (self.cache.max_pages > 0).then_some(self.cache.max_pages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.mount.lower_path = dir.path().join("lower");
        config.codec.delta = 7;
        config.io.mode = IoMode::Passthrough;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.codec.delta, 7);
        assert_eq!(loaded.io.mode, IoMode::Passthrough);
        assert_eq!(loaded.mount.lower_path, dir.path().join("lower"));
    }

    #[test]
    fn test_validate_rejects_zero_delta() {
        let mut config = Config::default();
        config.codec.delta = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_mount_over_lower() {
        let mut config = Config::default();
        config.mount.mount_point = config.mount.lower_path.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_stack_options() {
        let mut config = Config::default();
        config.cache.max_pages = 0;
        assert_eq!(config.stack_options().cache_pages, None);
        config.cache.max_pages = 8;
        assert_eq!(config.stack_options().cache_pages, Some(8));
    }
}
