//! Open-file table
//!
//! Maps api paths to open-file records and handle tokens to api paths.
//! One lock protects both maps; structural operations (open, close,
//! rename, evict) serialize here, while per-file I/O goes through each
//! record's own engine. Provider I/O is never performed under the table
//! lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use strato_core::{ApiError, ApiResult, FileHandle, OpenFileData};
use tracing::trace;

use crate::open_file::OpenFile;

#[derive(Default)]
struct TableState {
    files: HashMap<String, Arc<OpenFile>>,
    handles: HashMap<FileHandle, String>,
}

pub struct OpenFileTable {
    state: Mutex<TableState>,
    next_handle: AtomicU64,
}

impl Default for OpenFileTable {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenFileTable {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Look up an open file by path
    pub fn get(&self, api_path: &str) -> Option<Arc<OpenFile>> {
        self.state.lock().files.get(api_path).cloned()
    }

    /// Look up an open file by handle
    pub fn get_by_handle(&self, handle: FileHandle) -> ApiResult<Arc<OpenFile>> {
        let state = self.state.lock();
        let api_path = state.handles.get(&handle).ok_or(ApiError::InvalidHandle)?;
        state
            .files
            .get(api_path)
            .cloned()
            .ok_or(ApiError::InvalidHandle)
    }

    /// Register a record created by the file manager; keeps any existing
    /// record for the same path (first one wins)
    pub fn insert(&self, file: Arc<OpenFile>) -> Arc<OpenFile> {
        let mut state = self.state.lock();
        let api_path = file.api_path();
        state
            .files
            .entry(api_path)
            .or_insert_with(|| file.clone())
            .clone()
    }

    /// Issue a handle against an already-registered record
    pub fn issue_handle(&self, file: &Arc<OpenFile>, data: OpenFileData) -> FileHandle {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        state.handles.insert(handle, file.api_path());
        file.add_handle(handle, data);
        trace!(handle, api_path = %file.api_path(), "handle issued");
        handle
    }

    /// Drop a handle; returns the record and how many handles remain
    pub fn release_handle(&self, handle: FileHandle) -> ApiResult<(Arc<OpenFile>, usize)> {
        let mut state = self.state.lock();
        let api_path = state.handles.remove(&handle).ok_or(ApiError::InvalidHandle)?;
        let file = state
            .files
            .get(&api_path)
            .cloned()
            .ok_or(ApiError::InvalidHandle)?;
        let remaining = file.remove_handle(handle);
        Ok((file, remaining))
    }

    /// Atomically swap the table entry for a rename
    ///
    /// Fails with `ItemExists` if the destination is itself open. The
    /// record and its engine are re-pointed under the table lock, so an
    /// in-flight chunk fetch completes against whichever path it captured;
    /// the handle map entries follow the record.
    pub fn rename(&self, from: &str, to: &str, key: &str) -> ApiResult<()> {
        let mut state = self.state.lock();
        if state.files.contains_key(to) {
            return Err(ApiError::ItemExists);
        }
        let Some(file) = state.files.remove(from) else {
            return Ok(());
        };
        file.set_api_path(to, key);
        state.files.insert(to.to_owned(), file);
        for target in state.handles.values_mut() {
            if target == from {
                *target = to.to_owned();
            }
        }
        Ok(())
    }

    /// Drop a record outright (no handles may remain)
    pub fn remove(&self, api_path: &str) -> ApiResult<Option<Arc<OpenFile>>> {
        let mut state = self.state.lock();
        if let Some(file) = state.files.get(api_path) {
            if file.handle_count() > 0 {
                return Err(ApiError::FileInUse);
            }
        }
        Ok(state.files.remove(api_path))
    }

    /// Records currently in the table
    pub fn files(&self) -> Vec<Arc<OpenFile>> {
        self.state.lock().files.values().cloned().collect()
    }

    /// Every outstanding handle token
    pub fn handles(&self) -> Vec<FileHandle> {
        self.state.lock().handles.keys().copied().collect()
    }

    pub fn open_handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn open_file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    pub fn has_no_open_file_handles(&self) -> bool {
        self.open_handle_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{direct::DirectFile, ChunkEngine};
    use crate::encryption::ItemReader;
    use crate::events::CollectingSink;
    use crate::local::LocalProvider;
    use crate::provider::Provider;
    use strato_core::{ApiFile, FilesystemItem, MetaMap, StopToken};

    fn open_file(dir: &tempfile::TempDir, api_path: &str) -> Arc<OpenFile> {
        let provider = LocalProvider::new(dir.path().join("objects")).unwrap();
        let _ = provider.create_object(api_path, &MetaMap::new());
        let mut cursor = std::io::Cursor::new(vec![5u8; 100]);
        provider
            .replace_object(api_path, "", &mut cursor, 100, &StopToken::new())
            .unwrap();

        let item = ApiFile {
            api_path: api_path.to_owned(),
            api_parent: "/".into(),
            size: 100,
            key: api_path.trim_start_matches('/').to_owned(),
            ..ApiFile::default()
        };
        let reader = Arc::new(ItemReader::new(Arc::new(provider), item).unwrap());
        let engine = ChunkEngine::Direct(DirectFile::new(reader, 2, Arc::new(CollectingSink::new())));
        Arc::new(OpenFile::new(
            FilesystemItem {
                api_path: api_path.to_owned(),
                api_parent: "/".into(),
                directory: false,
                size: 100,
                source_path: String::new(),
            },
            engine,
        ))
    }

    #[test]
    fn test_handle_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let table = OpenFileTable::new();
        let file = table.insert(open_file(&dir, "/a"));

        let h1 = table.issue_handle(&file, OpenFileData::default());
        let h2 = table.issue_handle(&file, OpenFileData::default());
        assert_ne!(h1, h2);
        assert_eq!(table.open_handle_count(), 2);
        assert!(table.get_by_handle(h1).is_ok());

        let (_, remaining) = table.release_handle(h1).unwrap();
        assert_eq!(remaining, 1);
        let (_, remaining) = table.release_handle(h2).unwrap();
        assert_eq!(remaining, 0);
        assert!(table.has_no_open_file_handles());

        assert_eq!(
            table.release_handle(h2).unwrap_err(),
            ApiError::InvalidHandle
        );
    }

    #[test]
    fn test_insert_is_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        let table = OpenFileTable::new();
        let first = table.insert(open_file(&dir, "/a"));
        let second = table.insert(open_file(&dir, "/a"));
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(table.open_file_count(), 1);
    }

    #[test]
    fn test_rename_follows_handles() {
        let dir = tempfile::tempdir().unwrap();
        let table = OpenFileTable::new();
        let file = table.insert(open_file(&dir, "/a"));
        let handle = table.issue_handle(&file, OpenFileData::default());

        table.rename("/a", "/b", "b").unwrap();

        assert!(table.get("/a").is_none());
        let moved = table.get("/b").unwrap();
        assert_eq!(moved.api_path(), "/b");
        assert_eq!(table.get_by_handle(handle).unwrap().api_path(), "/b");
    }

    #[test]
    fn test_remove_requires_no_handles() {
        let dir = tempfile::tempdir().unwrap();
        let table = OpenFileTable::new();
        let file = table.insert(open_file(&dir, "/a"));
        let handle = table.issue_handle(&file, OpenFileData::default());

        assert_eq!(table.remove("/a").unwrap_err(), ApiError::FileInUse);
        table.release_handle(handle).unwrap();
        assert!(table.remove("/a").unwrap().is_some());
        assert_eq!(table.open_file_count(), 0);
    }
}
