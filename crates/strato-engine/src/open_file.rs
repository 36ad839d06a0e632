//! Open-file record
//!
//! Groups every open handle on one api path with the chunk engine serving
//! it. The record carries the per-handle open data, the last access time
//! used by the idle sweeper, and the removed flag set when the item is
//! unlinked while still open.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use strato_core::{
    path as api_path_util, ApiError, ApiResult, DownloadType, FileHandle, FilesystemItem,
    OpenFileData,
};

use crate::chunk::ChunkEngine;

pub struct OpenFile {
    item: Mutex<FilesystemItem>,
    engine: ChunkEngine,
    open_data: Mutex<HashMap<FileHandle, OpenFileData>>,
    last_access: Mutex<Instant>,
    removed: AtomicBool,
}

impl std::fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenFile")
            .field("api_path", &self.item.lock().api_path)
            .field("removed", &self.removed.load(Ordering::Relaxed))
            .finish()
    }
}

impl OpenFile {
    pub fn new(item: FilesystemItem, engine: ChunkEngine) -> Self {
        Self {
            item: Mutex::new(item),
            engine,
            open_data: Mutex::new(HashMap::new()),
            last_access: Mutex::new(Instant::now()),
            removed: AtomicBool::new(false),
        }
    }

    pub fn api_path(&self) -> String {
        self.item.lock().api_path.clone()
    }

    pub fn filesystem_item(&self) -> FilesystemItem {
        self.item.lock().clone()
    }

    pub fn source_path(&self) -> String {
        self.item.lock().source_path.clone()
    }

    pub fn strategy(&self) -> DownloadType {
        self.engine.strategy()
    }

    pub fn engine(&self) -> &ChunkEngine {
        &self.engine
    }

    pub fn add_handle(&self, handle: FileHandle, data: OpenFileData) {
        self.open_data.lock().insert(handle, data);
        self.touch();
    }

    /// Remove a handle, returning how many remain
    pub fn remove_handle(&self, handle: FileHandle) -> usize {
        let mut open_data = self.open_data.lock();
        open_data.remove(&handle);
        open_data.len()
    }

    pub fn handle_count(&self) -> usize {
        self.open_data.lock().len()
    }

    pub fn has_handle(&self, handle: FileHandle) -> bool {
        self.open_data.lock().contains_key(&handle)
    }

    pub fn read(&self, handle: FileHandle, offset: u64, len: usize) -> ApiResult<Vec<u8>> {
        if !self.has_handle(handle) {
            return Err(ApiError::InvalidHandle);
        }
        self.touch();
        self.engine.read_bytes(offset, len)
    }

    pub fn write(&self, handle: FileHandle, offset: u64, data: &[u8]) -> ApiResult<usize> {
        let read_only = match self.open_data.lock().get(&handle) {
            Some(data) => data.read_only,
            None => return Err(ApiError::InvalidHandle),
        };
        if read_only {
            return Err(ApiError::AccessDenied);
        }
        self.touch();
        let written = self.engine.write_bytes(offset, data)?;
        let mut item = self.item.lock();
        item.size = item.size.max(offset + written as u64);
        Ok(written)
    }

    pub fn resize(&self, size: u64) -> ApiResult<()> {
        self.touch();
        self.engine.resize(size)?;
        self.item.lock().size = size;
        Ok(())
    }

    pub fn allocate(&self, size: u64) -> ApiResult<()> {
        self.touch();
        self.engine.allocate(size)?;
        self.item.lock().size = size;
        Ok(())
    }

    pub fn size(&self) -> u64 {
        self.engine.size()
    }

    pub fn is_modified(&self) -> bool {
        self.engine.is_modified()
    }

    pub fn is_complete(&self) -> bool {
        self.engine.is_complete()
    }

    pub fn error(&self) -> Option<ApiError> {
        self.engine.error()
    }

    pub fn set_removed(&self) {
        self.removed.store(true, Ordering::SeqCst);
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    /// Point the record and its engine at a new api path after a rename
    pub fn set_api_path(&self, api_path: &str, key: &str) {
        {
            let mut item = self.item.lock();
            item.api_path = api_path.to_owned();
            item.api_parent = api_path_util::parent_of(api_path);
        }
        self.engine.set_api_path(api_path, key);
    }

    pub fn notify_stop_requested(&self) {
        self.engine.notify_stop_requested();
    }

    fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }
}
