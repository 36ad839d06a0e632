//! Backend capability trait
//!
//! The narrow surface every object backend must implement. The chunk
//! engines, upload manager, and file manager consume nothing beyond this
//! trait; concrete wire clients live outside the core.

use std::io::Read;
use std::sync::Arc;

use strato_core::{ApiFile, ApiResult, MetaMap, StopToken};

/// Shared handle to a backend
pub type ProviderPtr = Arc<dyn Provider>;

/// Capability a backend exposes to the core
pub trait Provider: Send + Sync {
    /// List the entries of a directory
    ///
    /// Fails with `DirectoryNotFound` when the path does not exist and
    /// `ItemExists` when it names a file.
    fn list_directory(&self, api_path: &str) -> ApiResult<Vec<ApiFile>>;

    /// Metadata for a file or directory, or `ItemNotFound`
    fn stat(&self, api_path: &str) -> ApiResult<ApiFile>;

    /// Fetch an arbitrary byte range of an object into `out`
    ///
    /// Fills `out` with exactly `len` bytes. Must honour `stop`
    /// cooperatively and return `DownloadStopped` when it fires.
    fn read_range(
        &self,
        api_path: &str,
        key: &str,
        offset: u64,
        len: usize,
        out: &mut Vec<u8>,
        stop: &StopToken,
    ) -> ApiResult<()>;

    /// Create a zero-byte object; fails with `ItemExists`
    fn create_object(&self, api_path: &str, meta: &MetaMap) -> ApiResult<()>;

    /// Create a directory, or something that lists/stats as one
    fn create_pseudo_directory(&self, api_path: &str, meta: &MetaMap) -> ApiResult<()>;

    /// Replace an object's content wholesale from a streaming source
    fn replace_object(
        &self,
        api_path: &str,
        key: &str,
        source: &mut dyn Read,
        size: u64,
        stop: &StopToken,
    ) -> ApiResult<()>;

    /// Remove an object or empty pseudo-directory; idempotent on
    /// `ItemNotFound`
    fn remove(&self, api_path: &str, key: &str) -> ApiResult<()>;

    /// Rename an object; optional
    fn rename(&self, _from: &str, _to: &str) -> ApiResult<()> {
        Err(strato_core::ApiError::NotSupported)
    }

    /// Cheap liveness probe
    fn is_online(&self) -> bool {
        true
    }

    fn get_total_space(&self) -> u64;

    fn get_used_space(&self) -> u64;

    /// When true only the direct strategy is permitted and writes are
    /// rejected
    fn is_direct_only(&self) -> bool {
        false
    }

    fn is_rename_supported(&self) -> bool {
        false
    }
}
