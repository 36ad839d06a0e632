//! Core type definitions for the filesystem core
//!
//! These types define the data model shared by the chunk engines, the
//! open-file table, the upload manager, and the mount glue.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Handle token issued by the file manager for each open
pub type FileHandle = u64;

/// 100-ns ticks since the Unix epoch
pub type Ticks = u64;

/// Ticks in one second
pub const TICKS_PER_SECOND: u64 = 10_000_000;

/// Current time in 100-ns ticks since the Unix epoch
pub fn now_ticks() -> Ticks {
    time_to_ticks(SystemTime::now())
}

/// Convert a [`SystemTime`] to 100-ns ticks since the Unix epoch
pub fn time_to_ticks(time: SystemTime) -> Ticks {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() * TICKS_PER_SECOND + u64::from(d.subsec_nanos()) / 100)
        .unwrap_or(0)
}

/// Cooperative cancellation flag
///
/// Cloned into provider callbacks and bitset-wait loops; every long
/// operation observes it.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; observers see it on their next check
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Canonical identity and local backing of a filesystem entity
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemItem {
    /// Slash-rooted API path
    pub api_path: String,
    /// String prefix of `api_path` up to the last `/` (or `/`)
    pub api_parent: String,
    pub directory: bool,
    pub size: u64,
    /// Local scratch-file path; empty for direct/ring strategies
    pub source_path: String,
}

/// Filesystem item plus provider metadata
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiFile {
    pub api_path: String,
    pub api_parent: String,
    pub directory: bool,
    pub size: u64,
    pub accessed: Ticks,
    pub changed: Ticks,
    pub created: Ticks,
    pub modified: Ticks,
    /// Set when the object is stored encrypted on the backend
    pub encryption_token: Option<String>,
    /// Provider-assigned opaque object key (may differ from the api path)
    pub key: String,
}

impl ApiFile {
    pub fn to_filesystem_item(&self, source_path: &str) -> FilesystemItem {
        FilesystemItem {
            api_path: self.api_path.clone(),
            api_parent: self.api_parent.clone(),
            directory: self.directory,
            size: self.size,
            source_path: source_path.to_owned(),
        }
    }
}

/// Per-path key→string metadata table
pub type MetaMap = BTreeMap<String, String>;

pub const META_ACCESSED: &str = "accessed";
pub const META_ATTRIBUTES: &str = "attributes";
pub const META_BACKUP: &str = "backup";
pub const META_CHANGED: &str = "changed";
pub const META_CREATION: &str = "creation";
pub const META_DIRECTORY: &str = "directory";
pub const META_GID: &str = "gid";
pub const META_KEY: &str = "key";
pub const META_MODE: &str = "mode";
pub const META_MODIFIED: &str = "modified";
pub const META_OSXFLAGS: &str = "flags";
pub const META_PINNED: &str = "pinned";
pub const META_SIZE: &str = "size";
pub const META_SOURCE: &str = "source";
pub const META_UID: &str = "uid";
pub const META_WRITTEN: &str = "written";

/// Coerce the invariants a directory's meta must satisfy
///
/// Directories always carry `size=0`, `pinned=false`, and an empty source
/// path; the `directory` flag itself is immutable after creation.
pub fn coerce_directory_meta(meta: &mut MetaMap) {
    if meta.get(META_DIRECTORY).map(String::as_str) == Some("true") {
        meta.insert(META_SIZE.to_owned(), "0".to_owned());
        meta.insert(META_PINNED.to_owned(), "false".to_owned());
        meta.insert(META_SOURCE.to_owned(), String::new());
    }
}

/// Read a boolean meta value (absent counts as false)
pub fn meta_bool(meta: &MetaMap, key: &str) -> bool {
    meta.get(key).map(String::as_str) == Some("true")
}

/// Read a numeric meta value (absent or malformed counts as zero)
pub fn meta_u64(meta: &MetaMap, key: &str) -> u64 {
    meta.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

/// Download strategy selected per open file
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadType {
    /// Let the engine pick (full-file cached unless the provider forbids it)
    #[default]
    Default,
    /// Stateless in-memory read-through
    Direct,
    /// Bounded on-disk window over the object
    RingBuffer,
}

impl DownloadType {
    pub fn as_str(self) -> &'static str {
        match self {
            DownloadType::Default => "cached",
            DownloadType::Direct => "direct",
            DownloadType::RingBuffer => "ring_buffer",
        }
    }
}

/// Per-handle open data
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFileData {
    pub read_only: bool,
}

/// Lifecycle of a queued upload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Queued,
    Active,
    Cancelled,
    Failed,
    Done,
}

/// Clamp a read to the end of the file
///
/// Returns the number of bytes actually available for a read of `len`
/// bytes at `offset` in a file of `total` bytes; zero at or past EOF.
pub fn calculate_read_size(total: u64, len: usize, offset: u64) -> usize {
    if offset >= total {
        0
    } else {
        std::cmp::min(total - offset, len as u64) as usize
    }
}

/// Number of chunks needed to cover `size` bytes
pub fn total_chunks(size: u64, chunk_size: usize) -> usize {
    if size == 0 {
        0
    } else {
        ((size - 1) / chunk_size as u64 + 1) as usize
    }
}

/// Length of chunk `index` in a file of `size` bytes
pub fn chunk_len(size: u64, chunk_size: usize, index: usize) -> usize {
    calculate_read_size(size, chunk_size, index as u64 * chunk_size as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_read_size() {
        assert_eq!(calculate_read_size(100, 10, 0), 10);
        assert_eq!(calculate_read_size(100, 10, 95), 5);
        assert_eq!(calculate_read_size(100, 10, 100), 0);
        assert_eq!(calculate_read_size(100, 10, 150), 0);
        assert_eq!(calculate_read_size(0, 10, 0), 0);
    }

    #[test]
    fn test_total_chunks() {
        assert_eq!(total_chunks(0, 1024), 0);
        assert_eq!(total_chunks(1, 1024), 1);
        assert_eq!(total_chunks(1024, 1024), 1);
        assert_eq!(total_chunks(1025, 1024), 2);
        assert_eq!(total_chunks(10 * 1024 + 17, 1024), 11);
    }

    #[test]
    fn test_chunk_len_uneven_tail() {
        // 10 full chunks plus 17 bytes
        let size = 10 * 1024 + 17;
        assert_eq!(chunk_len(size, 1024, 0), 1024);
        assert_eq!(chunk_len(size, 1024, 9), 1024);
        assert_eq!(chunk_len(size, 1024, 10), 17);
        assert_eq!(chunk_len(size, 1024, 11), 0);
    }

    #[test]
    fn test_stop_token() {
        let token = StopToken::new();
        let clone = token.clone();
        assert!(!clone.is_stopped());
        token.stop();
        assert!(clone.is_stopped());
    }

    #[test]
    fn test_directory_meta_coercion() {
        let mut meta = MetaMap::new();
        meta.insert(META_DIRECTORY.to_owned(), "true".to_owned());
        meta.insert(META_SIZE.to_owned(), "4096".to_owned());
        meta.insert(META_PINNED.to_owned(), "true".to_owned());
        meta.insert(META_SOURCE.to_owned(), "/tmp/cache/x".to_owned());

        coerce_directory_meta(&mut meta);

        assert_eq!(meta.get(META_SIZE).unwrap(), "0");
        assert_eq!(meta.get(META_PINNED).unwrap(), "false");
        assert_eq!(meta.get(META_SOURCE).unwrap(), "");
    }

    #[test]
    fn test_ticks_are_100ns() {
        let ticks = time_to_ticks(UNIX_EPOCH + std::time::Duration::from_secs(1));
        assert_eq!(ticks, TICKS_PER_SECOND);
    }
}
