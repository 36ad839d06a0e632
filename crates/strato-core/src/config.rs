//! Configuration for a mounted backend
//!
//! Supports TOML configuration files with sensible defaults. Configuration
//! is loaded from `<config dir>/stratofs/config.toml` unless a path is
//! given explicitly; a missing or unreadable file falls back to defaults.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};
use crate::types::DownloadType;
use crate::{CHUNK_SIZE, DEFAULT_RING_BUFFER_CHUNKS, MAX_RING_BUFFER_CHUNKS};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Data directory holding the scratch cache and the metadata store
    pub data_dir: PathBuf,
    /// Preferred chunk strategy for newly opened files
    pub preferred_download_type: DownloadType,
    /// Cache settings
    pub cache: CacheConfig,
    /// Download settings
    pub download: DownloadConfig,
    /// Upload settings
    pub upload: UploadConfig,
    /// Object encryption settings
    pub encryption: EncryptionConfig,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            data_dir: Self::default_data_dir(),
            preferred_download_type: DownloadType::Default,
            cache: CacheConfig::default(),
            download: DownloadConfig::default(),
            upload: UploadConfig::default(),
            encryption: EncryptionConfig::default(),
        }
    }
}

/// Object encryption settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// When set, objects are stored on the backend in the sealed-chunk
    /// format under this token
    pub token: Option<String>,
    /// Argon2id iteration count for newly written objects
    pub kdf_opslimit: u32,
    /// Argon2id memory cost in KiB for newly written objects
    pub kdf_memlimit_kib: u32,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            token: None,
            kdf_opslimit: 3,
            kdf_memlimit_kib: 64 * 1024,
        }
    }
}

/// Scratch-cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum scratch-file footprint in bytes (default 10 GiB)
    pub max_cache_size_bytes: u64,
    /// Close idle open files after this many minutes without access
    pub eviction_delay_mins: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size_bytes: 10 * 1024 * 1024 * 1024,
            eviction_delay_mins: 10,
        }
    }
}

/// Chunk download settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Chunks prefetched ahead of (and behind) the current read position
    pub read_ahead_count: usize,
    /// Ring-buffer window size in chunks (capped at 1024)
    pub ring_buffer_chunk_count: usize,
    /// Per-chunk fetch timeout in seconds
    pub chunk_downloader_timeout_secs: u64,
    /// Background downloading pauses after this long without a read
    pub download_timeout_secs: u64,
    /// Extra attempts for a chunk fetch that fails with a comm error
    pub retry_read_count: u32,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            read_ahead_count: 4,
            ring_buffer_chunk_count: DEFAULT_RING_BUFFER_CHUNKS,
            chunk_downloader_timeout_secs: 30,
            download_timeout_secs: 30,
            retry_read_count: 1,
        }
    }
}

/// Upload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Bounded worker pool size
    pub max_upload_count: usize,
    /// Delay before retrying a failed upload, in seconds
    pub upload_retry_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_upload_count: 2,
            upload_retry_secs: 5,
        }
    }
}

impl MountConfig {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("no config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "stratofs", "stratofs")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    fn default_data_dir() -> PathBuf {
        ProjectDirs::from("com", "stratofs", "stratofs")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("/tmp/stratofs"))
    }

    /// Directory holding cached scratch files
    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    /// Directory holding ring-buffer files
    pub fn buffer_dir(&self) -> PathBuf {
        self.data_dir.join("buffer")
    }

    /// Path of the metadata store
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("meta.redb")
    }

    /// Ring-buffer size in bytes, validated against the chunk size
    pub fn ring_buffer_size(&self) -> ApiResult<u64> {
        let chunks = self.download.ring_buffer_chunk_count;
        if chunks == 0 || chunks > MAX_RING_BUFFER_CHUNKS {
            return Err(ApiError::InvalidRingBufferSize);
        }
        Ok(chunks as u64 * CHUNK_SIZE as u64)
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    Serialize(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "serialization error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
