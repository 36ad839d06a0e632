//! File manager
//!
//! Top-level composition: owns the provider handle, the open-file table,
//! the upload manager, and the metadata store, and implements the
//! filesystem verbs the mount glue calls. Background sweepers close idle
//! files, queue uploads for completed dirty files, and evict
//! least-recently-used cache entries under space pressure.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use strato_core::{
    crypto, meta_bool, now_ticks, path as api_path_util, ApiError, ApiFile, ApiResult,
    DownloadType, FileHandle, FilesystemItem, MetaMap, MountConfig, OpenFileData, StopToken,
    CHUNK_SIZE, META_DIRECTORY, META_KEY, META_MODIFIED, META_PINNED, META_SIZE, META_SOURCE,
    META_WRITTEN,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::{cached::CachedFile, direct::DirectFile, ring::RingFile};
use crate::chunk::{select_download_type, ChunkEngine};
use crate::encryption::ItemReader;
use crate::events::{EventSinkPtr, FsEvent};
use crate::file_table::OpenFileTable;
use crate::meta::{MetaStore, ResumeRecord};
use crate::open_file::OpenFile;
use crate::provider::ProviderPtr;
use crate::upload::{UploadCallback, UploadManager};

const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

pub struct FileManager {
    inner: Arc<FmInner>,
}

struct FmInner {
    config: MountConfig,
    provider: ProviderPtr,
    store: Arc<MetaStore>,
    uploads: Arc<UploadManager>,
    events: EventSinkPtr,
    table: Arc<OpenFileTable>,
    used_space: AtomicU64,
    stop: StopToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// Lets the uploader clear the dirty flag without owning the table
struct UploadHook {
    inner: Weak<FmInner>,
}

impl UploadCallback for UploadHook {
    fn on_upload_complete(&self, api_path: &str) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        if let Some(file) = inner.table.get(api_path) {
            file.engine().clear_modified();
        }
        let _ = inner
            .store
            .update_item_meta(api_path, META_WRITTEN, &now_ticks().to_string());
    }
}

impl FileManager {
    pub fn new(
        config: MountConfig,
        provider: ProviderPtr,
        events: EventSinkPtr,
    ) -> ApiResult<Self> {
        std::fs::create_dir_all(config.cache_dir())?;
        std::fs::create_dir_all(config.buffer_dir())?;
        let store = Arc::new(MetaStore::open(&config.store_path())?);

        let uploads = Arc::new(UploadManager::new(
            provider.clone(),
            store.clone(),
            events.clone(),
            config.upload.max_upload_count,
            config.upload.upload_retry_secs,
            config.encryption.kdf_opslimit,
            config.encryption.kdf_memlimit_kib,
        ));

        let inner = Arc::new(FmInner {
            config,
            provider,
            store,
            uploads,
            events,
            table: Arc::new(OpenFileTable::new()),
            used_space: AtomicU64::new(0),
            stop: StopToken::new(),
            sweeper: Mutex::new(None),
        });

        inner.uploads.set_callback(Arc::new(UploadHook {
            inner: Arc::downgrade(&inner),
        }));

        Ok(Self { inner })
    }

    /// Reload persisted state and start the background sweeper
    pub fn start(&self) -> ApiResult<()> {
        let inner = &self.inner;

        // Partially downloaded cached files survive restart as handleless
        // open files
        for record in inner.store.load_resume()? {
            if let Err(error) = inner.recreate_from_resume(&record) {
                warn!(api_path = %record.api_path, %error, "dropping unusable resume record");
                let _ = inner.store.remove_resume(&record.api_path);
                let _ = std::fs::remove_file(&record.source_path);
            }
        }

        inner.uploads.restore(inner.store.load_uploads()?);
        inner.update_used_space();

        let sweeper = {
            let inner = inner.clone();
            std::thread::spawn(move || inner.sweeper_loop())
        };
        *inner.sweeper.lock() = Some(sweeper);
        info!("file manager started");
        Ok(())
    }

    /// Drain everything: handles, uploads, sweeper
    pub fn stop(&self) {
        self.inner.stop.stop();
        if let Some(handle) = self.inner.sweeper.lock().take() {
            let _ = handle.join();
        }
        self.close_all();
        self.inner.uploads.stop();
        info!("file manager stopped");
    }

    // --- create / remove ---

    pub fn create_file(&self, api_path: &str) -> ApiResult<()> {
        let api_path = api_path_util::create_api_path(api_path)?;
        let mut meta = MetaMap::new();
        self.inner.provider.create_object(&api_path, &meta)?;

        let key = self
            .inner
            .provider
            .stat(&api_path)
            .map(|f| f.key)
            .unwrap_or_default();
        meta.insert(META_DIRECTORY.to_owned(), "false".to_owned());
        meta.insert(META_KEY.to_owned(), key);
        meta.insert(META_SIZE.to_owned(), "0".to_owned());
        meta.insert(META_MODIFIED.to_owned(), now_ticks().to_string());
        self.inner.store.set_item_meta(&api_path, &meta)
    }

    pub fn create_directory(&self, api_path: &str) -> ApiResult<()> {
        let api_path = api_path_util::create_api_path(api_path)?;
        let mut meta = MetaMap::new();
        meta.insert(META_DIRECTORY.to_owned(), "true".to_owned());
        self.inner.provider.create_pseudo_directory(&api_path, &meta)?;
        self.inner.store.set_item_meta(&api_path, &meta)
    }

    pub fn remove_file(&self, api_path: &str) -> ApiResult<()> {
        let api_path = api_path_util::create_api_path(api_path)?;
        let key = self.inner.item_key(&api_path);

        self.inner.uploads.remove_upload(&api_path)?;
        self.inner.provider.remove(&api_path, &key)?;

        let source = self.inner.item_source(&api_path);
        self.inner.store.remove_item_meta(&api_path)?;
        self.inner.store.remove_resume(&api_path)?;

        if let Some(file) = self.inner.table.get(&api_path) {
            file.set_removed();
            if file.handle_count() == 0 {
                let _ = self.inner.table.remove(&api_path);
            } else {
                debug!(%api_path, "unlinked while open");
                return Ok(());
            }
        }
        if !source.is_empty() {
            let _ = std::fs::remove_file(&source);
        }
        Ok(())
    }

    pub fn remove_directory(&self, api_path: &str) -> ApiResult<()> {
        let api_path = api_path_util::create_api_path(api_path)?;
        if api_path == "/" {
            return Err(ApiError::InvalidOperation);
        }
        let key = self.inner.item_key(&api_path);
        self.inner.provider.remove(&api_path, &key)?;
        self.inner.store.remove_item_meta(&api_path)
    }

    // --- open / close / io ---

    pub fn open(&self, api_path: &str, data: OpenFileData) -> ApiResult<FileHandle> {
        let api_path = api_path_util::create_api_path(api_path)?;

        if let Some(file) = self.inner.table.get(&api_path) {
            if file.is_removed() {
                return Err(ApiError::ItemNotFound);
            }
            return Ok(self.inner.table.issue_handle(&file, data));
        }

        let file = Arc::new(self.inner.build_open_file(&api_path, data.read_only, None)?);
        let file = self.inner.table.insert(file);
        Ok(self.inner.table.issue_handle(&file, data))
    }

    pub fn close(&self, handle: FileHandle) -> ApiResult<()> {
        let (file, remaining) = self.inner.table.release_handle(handle)?;
        if remaining > 0 {
            return Ok(());
        }

        let api_path = file.api_path();
        if file.is_removed() {
            let source = file.source_path();
            let _ = self.inner.table.remove(&api_path);
            if !source.is_empty() {
                let _ = std::fs::remove_file(&source);
            }
            return Ok(());
        }

        if file.is_modified() {
            let _ = self
                .inner
                .store
                .update_item_meta(&api_path, META_SIZE, &file.size().to_string());
            let _ = self
                .inner
                .store
                .update_item_meta(&api_path, META_MODIFIED, &now_ticks().to_string());
        }

        self.inner.persist_or_upload(&file);
        Ok(())
    }

    pub fn close_all(&self) {
        for handle in self.inner.table.handles() {
            let _ = self.close(handle);
        }
        for file in self.inner.table.files() {
            if file.handle_count() == 0 && !self.inner.uploads.is_queued_or_active(&file.api_path())
            {
                file.notify_stop_requested();
                let _ = self.inner.table.remove(&file.api_path());
            }
        }
    }

    pub fn read(&self, handle: FileHandle, offset: u64, len: usize) -> ApiResult<Vec<u8>> {
        let file = self.inner.table.get_by_handle(handle)?;
        file.read(handle, offset, len)
    }

    pub fn write(&self, handle: FileHandle, offset: u64, data: &[u8]) -> ApiResult<usize> {
        let file = self.inner.table.get_by_handle(handle)?;
        file.write(handle, offset, data)
    }

    /// Resize through an open handle
    pub fn resize(&self, handle: FileHandle, size: u64) -> ApiResult<()> {
        let file = self.inner.table.get_by_handle(handle)?;
        file.resize(size)?;
        self.inner
            .store
            .update_item_meta(&file.api_path(), META_SIZE, &size.to_string())
    }

    /// Resize by path, opening transiently when needed
    pub fn truncate(&self, api_path: &str, size: u64) -> ApiResult<()> {
        let handle = self.open(api_path, OpenFileData { read_only: false })?;
        let result = self.resize(handle, size);
        let _ = self.close(handle);
        result
    }

    pub fn allocate(&self, handle: FileHandle, size: u64) -> ApiResult<()> {
        let file = self.inner.table.get_by_handle(handle)?;
        file.allocate(size)?;
        self.inner
            .store
            .update_item_meta(&file.api_path(), META_SIZE, &size.to_string())
    }

    // --- metadata ---

    pub fn get_item_meta(&self, api_path: &str) -> ApiResult<MetaMap> {
        let api_path = api_path_util::create_api_path(api_path)?;
        if let Some(meta) = self.inner.store.get_item_meta(&api_path)? {
            return Ok(meta);
        }
        // Synthesize from the provider for items never written locally
        let api_file = self.inner.provider.stat(&api_path)?;
        let meta = self.inner.meta_from_api_file(&api_file);
        self.inner.store.set_item_meta(&api_path, &meta)?;
        Ok(meta)
    }

    pub fn set_item_meta(&self, api_path: &str, key: &str, value: &str) -> ApiResult<()> {
        let api_path = api_path_util::create_api_path(api_path)?;
        let existing = self.inner.store.get_item_meta(&api_path)?.unwrap_or_default();

        // The directory flag is settled at creation
        if key == META_DIRECTORY {
            if let Some(current) = existing.get(META_DIRECTORY) {
                if current != value {
                    return Err(ApiError::InvalidOperation);
                }
            }
        }

        if key == META_PINNED {
            let was = meta_bool(&existing, META_PINNED);
            let now = value == "true";
            if was != now {
                let event = if now {
                    FsEvent::FilePinned {
                        api_path: api_path.clone(),
                    }
                } else {
                    FsEvent::FileUnpinned {
                        api_path: api_path.clone(),
                    }
                };
                self.inner.events.publish(&event);
            }
        }

        self.inner.store.update_item_meta(&api_path, key, value)
    }

    pub fn remove_item_meta(&self, api_path: &str) -> ApiResult<()> {
        let api_path = api_path_util::create_api_path(api_path)?;
        self.inner.store.remove_item_meta(&api_path)
    }

    // --- directory ---

    pub fn list_directory(&self, api_path: &str) -> ApiResult<Vec<ApiFile>> {
        let api_path = api_path_util::create_api_path(api_path)?;
        let mut entries = self.inner.provider.list_directory(&api_path)?;
        for entry in entries.iter_mut() {
            self.inner.localize(entry)?;
        }
        Ok(entries)
    }

    pub fn get_directory_item_count(&self, api_path: &str) -> ApiResult<usize> {
        Ok(self.list_directory(api_path)?.len())
    }

    // --- rename ---

    pub fn rename_file(&self, from: &str, to: &str) -> ApiResult<()> {
        if !self.inner.provider.is_rename_supported() {
            return Err(ApiError::InvalidOperation);
        }
        let from = api_path_util::create_api_path(from)?;
        let to = api_path_util::create_api_path(to)?;
        if from == to {
            return Ok(());
        }
        if self.inner.provider.stat(&to).is_ok() {
            return Err(ApiError::ItemExists);
        }

        self.inner.provider.rename(&from, &to)?;
        let new_key = self
            .inner
            .provider
            .stat(&to)
            .map(|f| f.key)
            .unwrap_or_default();

        self.inner.store.rename_item_meta(&from, &to)?;
        let _ = self.inner.store.update_item_meta(&to, META_KEY, &new_key);
        self.inner.store.rename_resume(&from, &to)?;
        self.inner.uploads.rename_upload(&from, &to)?;
        self.inner.table.rename(&from, &to, &new_key)?;
        debug!(%from, %to, "file renamed");
        Ok(())
    }

    pub fn rename_directory(&self, from: &str, to: &str) -> ApiResult<()> {
        if !self.inner.provider.is_rename_supported() {
            return Err(ApiError::InvalidOperation);
        }
        let from = api_path_util::create_api_path(from)?;
        let to = api_path_util::create_api_path(to)?;

        // Children with open handles would be left pointing at dead paths
        for file in self.inner.table.files() {
            if api_path_util::is_ancestor_or_self(&from, &file.api_path())
                && file.handle_count() > 0
            {
                return Err(ApiError::FileInUse);
            }
        }
        if self.inner.provider.stat(&to).is_ok() {
            return Err(ApiError::ItemExists);
        }

        self.inner.provider.rename(&from, &to)?;

        for path in self.inner.store.item_meta_paths()? {
            if api_path_util::is_ancestor_or_self(&from, &path) {
                let suffix = &path[from.len()..];
                let target = format!("{to}{suffix}");
                self.inner.store.rename_item_meta(&path, &target)?;
                self.inner.store.rename_resume(&path, &target)?;
                self.inner.uploads.rename_upload(&path, &target)?;
            }
        }
        debug!(%from, %to, "directory renamed");
        Ok(())
    }

    // --- eviction / sweeping ---

    /// Drop a file's local cache
    ///
    /// Refused while the file has open handles, unsynced modifications, or
    /// a pending upload. An explicit evict proceeds even for pinned files;
    /// the pin only shields against the automatic sweeps.
    pub fn evict(&self, api_path: &str) -> ApiResult<()> {
        let api_path = api_path_util::create_api_path(api_path)?;

        if let Some(file) = self.inner.table.get(&api_path) {
            if file.handle_count() > 0 {
                return Err(ApiError::FileInUse);
            }
            if file.is_modified() {
                return Err(ApiError::FileInUse);
            }
        }
        if self.inner.uploads.is_queued_or_active(&api_path) {
            return Err(ApiError::FileInUse);
        }

        self.inner.evict_now(&api_path)
    }

    pub fn update_used_space(&self) -> u64 {
        self.inner.update_used_space()
    }

    pub fn has_no_open_file_handles(&self) -> bool {
        self.inner.table.has_no_open_file_handles()
    }

    pub fn get_open_file_count(&self) -> usize {
        self.inner.table.open_file_count()
    }

    /// True while uploads are pending or dirty files remain open
    pub fn is_processing(&self) -> bool {
        self.inner.uploads.pending_count() > 0
            || self
                .inner
                .table
                .files()
                .iter()
                .any(|file| file.is_modified())
    }

}

impl Drop for FileManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl FmInner {
    /// Translate wire metadata into the view the mount layer sees
    fn localize(&self, api_file: &mut ApiFile) -> ApiResult<()> {
        if let Some(token) = &self.config.encryption.token {
            if !api_file.directory {
                api_file.encryption_token = Some(token.clone());
                // A freshly created object has no header yet
                if api_file.size > 0 {
                    api_file.size = crypto::decrypted_size(api_file.size)?;
                }
            }
        }
        Ok(())
    }

    fn meta_from_api_file(&self, api_file: &ApiFile) -> MetaMap {
        let mut meta = MetaMap::new();
        meta.insert(
            META_DIRECTORY.to_owned(),
            api_file.directory.to_string(),
        );
        meta.insert(META_KEY.to_owned(), api_file.key.clone());
        meta.insert(META_SIZE.to_owned(), api_file.size.to_string());
        meta.insert(META_MODIFIED.to_owned(), api_file.modified.to_string());
        meta
    }

    fn item_key(&self, api_path: &str) -> String {
        self.store
            .get_item_meta(api_path)
            .ok()
            .flatten()
            .and_then(|meta| meta.get(META_KEY).cloned())
            .or_else(|| self.provider.stat(api_path).ok().map(|f| f.key))
            .unwrap_or_default()
    }

    fn item_source(&self, api_path: &str) -> String {
        self.store
            .get_item_meta(api_path)
            .ok()
            .flatten()
            .and_then(|meta| meta.get(META_SOURCE).cloned())
            .unwrap_or_default()
    }

    /// Build the open-file record for a path, selecting the chunk strategy
    fn build_open_file(
        &self,
        api_path: &str,
        read_only: bool,
        resume: Option<&ResumeRecord>,
    ) -> ApiResult<OpenFile> {
        let mut api_file = self.provider.stat(api_path)?;
        if api_file.directory {
            return Err(ApiError::InvalidOperation);
        }
        self.localize(&mut api_file)?;

        let meta = self.store.get_item_meta(api_path)?.unwrap_or_default();
        let pinned = meta_bool(&meta, META_PINNED);

        let strategy = select_download_type(
            api_file.size,
            read_only,
            self.provider.is_direct_only(),
            self.config.preferred_download_type,
            pinned,
        );

        let reader = Arc::new(ItemReader::new(self.provider.clone(), api_file.clone())?);
        let plain_size = reader.plain_size();

        let (engine, source_path) = match strategy {
            DownloadType::Direct => (
                ChunkEngine::Direct(DirectFile::new(
                    reader,
                    self.config.download.read_ahead_count,
                    self.events.clone(),
                )),
                String::new(),
            ),
            DownloadType::RingBuffer => (
                ChunkEngine::Ring(RingFile::new(
                    reader,
                    &self.config.buffer_dir(),
                    self.config.download.ring_buffer_chunk_count,
                    self.events.clone(),
                )?),
                String::new(),
            ),
            DownloadType::Default => {
                let source_path = match resume {
                    Some(record) => PathBuf::from(&record.source_path),
                    None => {
                        let existing = self.item_source(api_path);
                        if existing.is_empty() {
                            self.config.cache_dir().join(Uuid::new_v4().to_string())
                        } else {
                            PathBuf::from(existing)
                        }
                    }
                };
                self.store.update_item_meta(
                    api_path,
                    META_SOURCE,
                    &source_path.to_string_lossy(),
                )?;

                let resume_bits = match resume {
                    Some(record) if record.chunk_size == CHUNK_SIZE => {
                        Some(record.read_state.clone())
                    }
                    Some(_) => None,
                    None => self
                        .store
                        .get_resume(api_path)?
                        .filter(|r| {
                            r.chunk_size == CHUNK_SIZE
                                && r.source_path == source_path.to_string_lossy()
                        })
                        .map(|r| r.read_state),
                };

                let engine = CachedFile::new(
                    reader,
                    &source_path,
                    self.config.download.read_ahead_count,
                    self.config.download.download_timeout_secs,
                    self.config.download.retry_read_count,
                    resume_bits,
                    self.events.clone(),
                )?;
                (
                    ChunkEngine::Cached(engine),
                    source_path.to_string_lossy().into_owned(),
                )
            }
        };

        let item = FilesystemItem {
            api_path: api_path.to_owned(),
            api_parent: api_path_util::parent_of(api_path),
            directory: false,
            size: plain_size,
            source_path,
        };
        Ok(OpenFile::new(item, engine))
    }

    fn recreate_from_resume(&self, record: &ResumeRecord) -> ApiResult<()> {
        if self.table.get(&record.api_path).is_some() {
            return Ok(());
        }
        if !Path::new(&record.source_path).is_file() {
            return Err(ApiError::ItemNotFound);
        }
        let file = Arc::new(self.build_open_file(&record.api_path, false, Some(record))?);
        self.table.insert(file);
        debug!(api_path = %record.api_path, "resume record restored");
        Ok(())
    }

    /// On last close: queue the upload or persist a resume record
    fn persist_or_upload(&self, file: &Arc<OpenFile>) {
        let api_path = file.api_path();
        let source = file.source_path();
        if source.is_empty() {
            return;
        }

        if file.is_modified() && file.is_complete() && file.error().is_none() {
            if let Err(error) = self.uploads.queue_upload(
                &api_path,
                &source,
                self.config.encryption.token.clone(),
            ) {
                warn!(%api_path, %error, "failed to queue upload");
            }
        } else if !file.is_complete() {
            let record = ResumeRecord {
                api_path: api_path.clone(),
                source_path: source,
                chunk_size: CHUNK_SIZE,
                read_state: file.engine().read_state().unwrap_or_default(),
            };
            if let Err(error) = self.store.put_resume(&record) {
                warn!(%api_path, %error, "failed to persist resume record");
            }
        }
    }

    /// Delete the local cache artifacts for a path and drop its record
    fn evict_now(&self, api_path: &str) -> ApiResult<()> {
        let source = match self.table.remove(api_path)? {
            Some(file) => {
                file.notify_stop_requested();
                file.source_path()
            }
            None => self.item_source(api_path),
        };

        if !source.is_empty() {
            let _ = std::fs::remove_file(&source);
        }
        self.store.remove_resume(api_path)?;
        let _ = self.store.update_item_meta(api_path, META_SOURCE, "");
        debug!(api_path, "evicted");
        Ok(())
    }

    fn update_used_space(&self) -> u64 {
        let mut total = 0u64;
        if let Ok(entries) = std::fs::read_dir(self.config.cache_dir()) {
            for entry in entries.flatten() {
                if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
        }
        self.used_space.store(total, Ordering::SeqCst);
        total
    }

    fn sweeper_loop(self: Arc<Self>) {
        while !self.stop.is_stopped() {
            std::thread::sleep(SWEEP_INTERVAL);
            if self.stop.is_stopped() {
                return;
            }
            self.sweep();
        }
    }

    fn sweep(&self) {
        let eviction_delay =
            Duration::from_secs(self.config.cache.eviction_delay_mins * 60);

        for file in self.table.files() {
            if file.handle_count() > 0 {
                continue;
            }
            let api_path = file.api_path();

            // A dirty file whose background download just finished still
            // needs its upload
            if file.is_modified()
                && file.is_complete()
                && file.error().is_none()
                && !file.source_path().is_empty()
                && !self.uploads.is_queued_or_active(&api_path)
            {
                let _ = self.uploads.queue_upload(
                    &api_path,
                    &file.source_path(),
                    self.config.encryption.token.clone(),
                );
                continue;
            }

            // Close files idle past the eviction delay
            if file.last_access().elapsed() >= eviction_delay
                && !file.is_modified()
                && !self.uploads.is_queued_or_active(&api_path)
            {
                let pinned = self
                    .store
                    .get_item_meta(&api_path)
                    .ok()
                    .flatten()
                    .map(|meta| meta_bool(&meta, META_PINNED))
                    .unwrap_or(false);

                self.persist_or_upload(&file);
                file.notify_stop_requested();
                if self.table.remove(&api_path).is_ok() && !pinned {
                    let _ = self.evict_now(&api_path);
                }
            }
        }

        self.evict_under_pressure();
        self.update_used_space();
    }

    /// LRU eviction of closed, unpinned, unmodified, non-uploading files
    fn evict_under_pressure(&self) {
        let max = self.config.cache.max_cache_size_bytes;
        if self.update_used_space() <= max {
            return;
        }

        let mut candidates: Vec<Arc<OpenFile>> = self
            .table
            .files()
            .into_iter()
            .filter(|file| {
                file.handle_count() == 0
                    && !file.is_modified()
                    && !file.source_path().is_empty()
                    && !self.uploads.is_queued_or_active(&file.api_path())
                    && !self
                        .store
                        .get_item_meta(&file.api_path())
                        .ok()
                        .flatten()
                        .map(|meta| meta_bool(&meta, META_PINNED))
                        .unwrap_or(false)
            })
            .collect();
        candidates.sort_by_key(|file| file.last_access());

        for file in candidates {
            if self.update_used_space() <= max {
                return;
            }
            let api_path = file.api_path();
            info!(%api_path, "evicting for cache pressure");
            self.persist_or_upload(&file);
            let _ = self.evict_now(&api_path);
        }

        // Scratch files left behind by closed records
        if self.update_used_space() > max {
            if let Ok(records) = self.store.load_resume() {
                for record in records {
                    if self.update_used_space() <= max {
                        return;
                    }
                    if self.table.get(&record.api_path).is_none()
                        && !self.uploads.is_queued_or_active(&record.api_path)
                    {
                        let _ = self.evict_now(&record.api_path);
                    }
                }
            }
        }
    }
}
