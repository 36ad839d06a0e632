//! Chunk engines
//!
//! Three interchangeable strategies serve reads (and, for the cached
//! strategy, writes) over a remote object:
//!
//! - [`cached::CachedFile`] - full backing file on local disk, read-ahead
//!   and read-behind workers, write support
//! - [`direct::DirectFile`] - stateless in-memory read-through, read-only
//! - [`ring::RingFile`] - bounded on-disk window with forward and reverse
//!   prefetchers, read-only
//!
//! Exactly one strategy is selected at open time; see
//! [`select_download_type`].

pub mod buffered;
pub mod cached;
pub mod direct;
pub mod ring;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use strato_core::{ApiError, ApiResult, DownloadType, StopToken};

/// Read-only opens at or above this size stream directly instead of
/// filling the cache
pub const DIRECT_SIZE_THRESHOLD: u64 = 4 * 1024 * 1024 * 1024;

/// One strategy serving a single open file
pub enum ChunkEngine {
    Cached(cached::CachedFile),
    Direct(direct::DirectFile),
    Ring(ring::RingFile),
}

impl ChunkEngine {
    pub fn read_bytes(&self, offset: u64, len: usize) -> ApiResult<Vec<u8>> {
        match self {
            ChunkEngine::Cached(f) => f.read_bytes(offset, len),
            ChunkEngine::Direct(f) => f.read_bytes(offset, len),
            ChunkEngine::Ring(f) => f.read_bytes(offset, len),
        }
    }

    pub fn write_bytes(&self, offset: u64, data: &[u8]) -> ApiResult<usize> {
        match self {
            ChunkEngine::Cached(f) => f.write_bytes(offset, data),
            _ => Err(ApiError::NotImplemented),
        }
    }

    pub fn resize(&self, size: u64) -> ApiResult<()> {
        match self {
            ChunkEngine::Cached(f) => f.resize(size),
            _ => Err(ApiError::NotImplemented),
        }
    }

    pub fn allocate(&self, size: u64) -> ApiResult<()> {
        match self {
            ChunkEngine::Cached(f) => f.allocate(size),
            _ => Err(ApiError::NotImplemented),
        }
    }

    /// Force every chunk resident (used before uploading a partial file)
    pub fn download_all(&self) -> ApiResult<()> {
        match self {
            ChunkEngine::Cached(f) => f.download_all(),
            _ => Err(ApiError::InvalidOperation),
        }
    }

    /// Current logical size in bytes
    pub fn size(&self) -> u64 {
        match self {
            ChunkEngine::Cached(f) => f.size(),
            ChunkEngine::Direct(f) => f.size(),
            ChunkEngine::Ring(f) => f.size(),
        }
    }

    /// Whether every chunk is resident locally
    ///
    /// Streaming strategies keep nothing to persist and always count as
    /// complete.
    pub fn is_complete(&self) -> bool {
        match self {
            ChunkEngine::Cached(f) => f.is_complete(),
            _ => true,
        }
    }

    pub fn is_modified(&self) -> bool {
        match self {
            ChunkEngine::Cached(f) => f.is_modified(),
            _ => false,
        }
    }

    pub fn clear_modified(&self) {
        if let ChunkEngine::Cached(f) = self {
            f.clear_modified();
        }
    }

    pub fn is_write_supported(&self) -> bool {
        matches!(self, ChunkEngine::Cached(_))
    }

    /// Scratch file backing this engine, when one exists
    pub fn source_path(&self) -> Option<PathBuf> {
        match self {
            ChunkEngine::Cached(f) => Some(f.source_path().to_path_buf()),
            _ => None,
        }
    }

    pub fn notify_stop_requested(&self) {
        match self {
            ChunkEngine::Cached(f) => f.notify_stop_requested(),
            ChunkEngine::Direct(f) => f.notify_stop_requested(),
            ChunkEngine::Ring(f) => f.notify_stop_requested(),
        }
    }

    pub fn strategy(&self) -> DownloadType {
        match self {
            ChunkEngine::Cached(_) => DownloadType::Default,
            ChunkEngine::Direct(_) => DownloadType::Direct,
            ChunkEngine::Ring(_) => DownloadType::RingBuffer,
        }
    }

    /// Redirect provider requests and events after a rename
    pub fn set_api_path(&self, api_path: &str, key: &str) {
        match self {
            ChunkEngine::Cached(f) => f.set_api_path(api_path, key),
            ChunkEngine::Direct(f) => f.set_api_path(api_path, key),
            ChunkEngine::Ring(f) => f.set_api_path(api_path, key),
        }
    }

    /// Snapshot of the resident-chunk bitset, for resume persistence
    pub fn read_state(&self) -> Option<Vec<bool>> {
        match self {
            ChunkEngine::Cached(f) => Some(f.read_state()),
            _ => None,
        }
    }

    /// Sticky error, if one has been recorded
    pub fn error(&self) -> Option<ApiError> {
        match self {
            ChunkEngine::Cached(f) => f.error(),
            ChunkEngine::Direct(f) => f.error(),
            ChunkEngine::Ring(f) => f.error(),
        }
    }
}

/// Pick the strategy for an open
pub fn select_download_type(
    size: u64,
    read_only: bool,
    provider_direct_only: bool,
    preference: DownloadType,
    pinned: bool,
) -> DownloadType {
    if provider_direct_only {
        return DownloadType::Direct;
    }
    // Pinned files must stay cacheable so eviction exemption means something
    if pinned || !read_only {
        return DownloadType::Default;
    }
    match preference {
        DownloadType::Direct => DownloadType::Direct,
        DownloadType::RingBuffer if size > 0 => DownloadType::RingBuffer,
        DownloadType::RingBuffer => DownloadType::Default,
        DownloadType::Default if size >= DIRECT_SIZE_THRESHOLD => DownloadType::Direct,
        DownloadType::Default => DownloadType::Default,
    }
}

/// In-flight fetch record shared by every caller waiting on one chunk
pub(crate) struct ActiveChunk {
    state: Mutex<Option<ApiResult<()>>>,
    cond: Condvar,
}

impl ActiveChunk {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Block until the owning fetch publishes its result
    pub(crate) fn wait(&self, stop: &StopToken) -> ApiResult<()> {
        let mut guard = self.state.lock();
        loop {
            if let Some(result) = *guard {
                return result;
            }
            if stop.is_stopped() {
                return Err(ApiError::DownloadStopped);
            }
            self.cond.wait_for(&mut guard, Duration::from_millis(250));
        }
    }

    fn complete(&self, result: ApiResult<()>) {
        *self.state.lock() = Some(result);
        self.cond.notify_all();
    }
}

/// Who a caller is for a given chunk: the one fetcher, or a waiter
pub(crate) enum ChunkRole {
    Fetch(Arc<ActiveChunk>),
    Wait(Arc<ActiveChunk>),
}

/// Guarantees at most one provider fetch per (open file, chunk)
#[derive(Default)]
pub(crate) struct ActiveChunkMap {
    inner: Mutex<HashMap<usize, Arc<ActiveChunk>>>,
}

impl ActiveChunkMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// First caller for a missing chunk becomes the fetcher; the rest wait
    pub(crate) fn begin(&self, index: usize) -> ChunkRole {
        let mut map = self.inner.lock();
        if let Some(active) = map.get(&index) {
            return ChunkRole::Wait(active.clone());
        }
        let active = Arc::new(ActiveChunk::new());
        map.insert(index, active.clone());
        ChunkRole::Fetch(active)
    }

    /// Publish the fetch result and drop the record
    pub(crate) fn finish(&self, index: usize, result: ApiResult<()>) {
        let active = self.inner.lock().remove(&index);
        if let Some(active) = active {
            active.complete(result);
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.inner.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_direct_only_provider() {
        let picked = select_download_type(100, false, true, DownloadType::Default, false);
        assert_eq!(picked, DownloadType::Direct);
    }

    #[test]
    fn test_select_write_open_is_cached() {
        let picked = select_download_type(100, false, false, DownloadType::Direct, false);
        assert_eq!(picked, DownloadType::Default);
        let picked = select_download_type(100, false, false, DownloadType::RingBuffer, false);
        assert_eq!(picked, DownloadType::Default);
    }

    #[test]
    fn test_select_pinned_is_cached() {
        let picked = select_download_type(100, true, false, DownloadType::RingBuffer, true);
        assert_eq!(picked, DownloadType::Default);
    }

    #[test]
    fn test_select_large_read_only_goes_direct() {
        let picked = select_download_type(
            DIRECT_SIZE_THRESHOLD,
            true,
            false,
            DownloadType::Default,
            false,
        );
        assert_eq!(picked, DownloadType::Direct);
    }

    #[test]
    fn test_select_ring_preference() {
        let picked = select_download_type(100, true, false, DownloadType::RingBuffer, false);
        assert_eq!(picked, DownloadType::RingBuffer);
        // Empty files have no window to stream
        let picked = select_download_type(0, true, false, DownloadType::RingBuffer, false);
        assert_eq!(picked, DownloadType::Default);
    }

    #[test]
    fn test_active_chunk_map_dedups() {
        let map = ActiveChunkMap::new();

        let ChunkRole::Fetch(fetcher) = map.begin(7) else {
            panic!("first caller must fetch");
        };
        let ChunkRole::Wait(waiter) = map.begin(7) else {
            panic!("second caller must wait");
        };

        let waiter_thread = std::thread::spawn({
            let stop = StopToken::new();
            move || waiter.wait(&stop)
        });

        assert_eq!(map.in_flight(), 1);
        map.finish(7, Ok(()));
        drop(fetcher);

        assert_eq!(waiter_thread.join().unwrap(), Ok(()));
        assert_eq!(map.in_flight(), 0);

        // A later request fetches again
        assert!(matches!(map.begin(7), ChunkRole::Fetch(_)));
    }

    #[test]
    fn test_active_chunk_wait_observes_stop() {
        let map = ActiveChunkMap::new();
        let ChunkRole::Fetch(_fetcher) = map.begin(0) else {
            panic!("first caller must fetch");
        };
        let ChunkRole::Wait(waiter) = map.begin(0) else {
            panic!("second caller must wait");
        };

        let stop = StopToken::new();
        stop.stop();
        assert_eq!(waiter.wait(&stop), Err(ApiError::DownloadStopped));
    }
}
