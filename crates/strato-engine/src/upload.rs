//! Upload manager
//!
//! A FIFO of dirty files persisted in the metadata store. Workers pop
//! entries and replace the whole remote object from the local scratch
//! file, through the encrypting writer when a token is configured. The
//! queue holds an api path at most once; a pending entry can be
//! cancelled, and a rename rewrites it in place. Failed uploads stay in
//! the store and retry after a backoff.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use strato_core::crypto::KdfConfig;
use strato_core::{ApiError, ApiResult, NativeFile, StopToken, UploadState, META_KEY};
use tracing::{debug, info, warn};

use crate::encryption::EncryptingReader;
use crate::events::{EventSinkPtr, FsEvent};
use crate::meta::{MetaStore, UploadRecord};
use crate::provider::ProviderPtr;

/// Non-owning hook back into the open-file side; breaks the ownership
/// cycle between uploader and file manager
pub trait UploadCallback: Send + Sync {
    /// A queued upload finished successfully
    fn on_upload_complete(&self, api_path: &str);
}

struct QueueState {
    queue: VecDeque<UploadRecord>,
    active: HashMap<String, StopToken>,
    stopping: bool,
}

struct UploadInner {
    provider: ProviderPtr,
    store: Arc<MetaStore>,
    events: EventSinkPtr,
    retry_delay: Duration,
    kdf_opslimit: u32,
    kdf_memlimit: u32,
    state: Mutex<QueueState>,
    cond: Condvar,
    callback: Mutex<Option<Arc<dyn UploadCallback>>>,
}

pub struct UploadManager {
    inner: Arc<UploadInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl UploadManager {
    pub fn new(
        provider: ProviderPtr,
        store: Arc<MetaStore>,
        events: EventSinkPtr,
        max_upload_count: usize,
        upload_retry_secs: u64,
        kdf_opslimit: u32,
        kdf_memlimit_kib: u32,
    ) -> Self {
        let inner = Arc::new(UploadInner {
            provider,
            store,
            events,
            retry_delay: Duration::from_secs(upload_retry_secs.max(1)),
            kdf_opslimit,
            kdf_memlimit: kdf_memlimit_kib,
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                active: HashMap::new(),
                stopping: false,
            }),
            cond: Condvar::new(),
            callback: Mutex::new(None),
        });

        let mut workers = Vec::new();
        for _ in 0..max_upload_count.max(1) {
            let inner = inner.clone();
            workers.push(std::thread::spawn(move || inner.worker_loop()));
        }

        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    /// Queue-only manager for tests that must observe the queue before a
    /// worker drains it
    #[cfg(test)]
    fn without_workers(provider: ProviderPtr, store: Arc<MetaStore>, events: EventSinkPtr) -> Self {
        Self {
            inner: Arc::new(UploadInner {
                provider,
                store,
                events,
                retry_delay: Duration::from_secs(1),
                kdf_opslimit: 1,
                kdf_memlimit: 8,
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    active: HashMap::new(),
                    stopping: false,
                }),
                cond: Condvar::new(),
                callback: Mutex::new(None),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_callback(&self, callback: Arc<dyn UploadCallback>) {
        *self.inner.callback.lock() = Some(callback);
    }

    /// Queue a whole-object upload; idempotent by api path
    pub fn queue_upload(
        &self,
        api_path: &str,
        source_path: &str,
        encryption_token: Option<String>,
    ) -> ApiResult<()> {
        let record = UploadRecord {
            api_path: api_path.to_owned(),
            source_path: source_path.to_owned(),
            encryption_token,
            state: UploadState::Queued,
        };

        {
            let mut state = self.inner.state.lock();
            if state.stopping {
                return Err(ApiError::InvalidOperation);
            }
            if state.active.contains_key(api_path)
                || state.queue.iter().any(|r| r.api_path == api_path)
            {
                return Ok(());
            }
            state.queue.push_back(record.clone());
        }
        self.inner.store.put_upload(&record)?;
        debug!(api_path, "upload queued");
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Cancel a pending (or in-flight) upload
    pub fn remove_upload(&self, api_path: &str) -> ApiResult<()> {
        {
            let mut state = self.inner.state.lock();
            state.queue.retain(|r| r.api_path != api_path);
            if let Some(stop) = state.active.get(api_path) {
                stop.stop();
            }
        }
        self.inner.store.remove_upload(api_path)?;
        debug!(api_path, "upload removed");
        Ok(())
    }

    /// Rewrite a pending entry after a rename; an in-flight upload for the
    /// old path is cancelled and re-queued under the new one
    pub fn rename_upload(&self, from: &str, to: &str) -> ApiResult<()> {
        let requeue = {
            let mut state = self.inner.state.lock();
            for record in state.queue.iter_mut() {
                if record.api_path == from {
                    record.api_path = to.to_owned();
                }
            }
            match state.active.get(from) {
                Some(stop) => {
                    stop.stop();
                    true
                }
                None => false,
            }
        };
        self.inner.store.rename_upload(from, to)?;
        if requeue {
            if let Some(record) = self.inner.store.get_upload(to)? {
                let mut state = self.inner.state.lock();
                if !state.queue.iter().any(|r| r.api_path == to) {
                    state.queue.push_back(record);
                    self.inner.cond.notify_all();
                }
            }
        }
        Ok(())
    }

    pub fn is_queued_or_active(&self, api_path: &str) -> bool {
        let state = self.inner.state.lock();
        state.active.contains_key(api_path) || state.queue.iter().any(|r| r.api_path == api_path)
    }

    pub fn pending_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.queue.len() + state.active.len()
    }

    /// Re-queue entries persisted by a previous run
    pub fn restore(&self, records: Vec<UploadRecord>) {
        let mut state = self.inner.state.lock();
        for mut record in records {
            if state.queue.iter().any(|r| r.api_path == record.api_path) {
                continue;
            }
            record.state = UploadState::Queued;
            info!(api_path = %record.api_path, "restored persisted upload");
            state.queue.push_back(record);
        }
        drop(state);
        self.inner.cond.notify_all();
    }

    /// Drain the workers; pending entries stay persisted for next start
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopping = true;
            for stop in state.active.values() {
                stop.stop();
            }
        }
        self.inner.cond.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for UploadManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl UploadInner {
    fn worker_loop(self: Arc<Self>) {
        loop {
            let stop = StopToken::new();
            let record = {
                let mut state = self.state.lock();
                loop {
                    if state.stopping {
                        return;
                    }
                    if let Some(record) = state.queue.pop_front() {
                        // Become active under the same lock so the entry is
                        // never invisible to queue_upload/pending_count
                        state.active.insert(record.api_path.clone(), stop.clone());
                        break record;
                    }
                    self.cond.wait(&mut state);
                }
            };

            let _ = self.store.put_upload(&UploadRecord {
                state: UploadState::Active,
                ..record.clone()
            });

            let api_path = record.api_path.clone();
            let result = self.perform(&record, &stop);

            match result {
                Ok(()) => {
                    info!(%api_path, "upload complete");
                    let _ = self.store.remove_upload(&api_path);
                    let _ = self.store.remove_resume(&api_path);
                    self.events.publish(&FsEvent::FileUploaded {
                        api_path: api_path.clone(),
                    });
                    let callback = self.callback.lock().clone();
                    if let Some(callback) = callback {
                        callback.on_upload_complete(&api_path);
                    }
                }
                Err(ApiError::DownloadStopped) => {
                    // Cancelled (or shutting down); the store row was
                    // already removed by remove_upload, or stays for the
                    // next start
                    debug!(%api_path, "upload cancelled");
                }
                Err(error) => {
                    warn!(%api_path, %error, "upload failed");
                    self.events.publish(&FsEvent::UploadFailed {
                        api_path: api_path.clone(),
                        reason: error,
                    });
                    let retained = UploadRecord {
                        state: UploadState::Queued,
                        ..record.clone()
                    };
                    let _ = self.store.put_upload(&retained);

                    // Back off before the retry becomes visible
                    let mut state = self.state.lock();
                    if !state.stopping {
                        self.cond.wait_for(&mut state, self.retry_delay);
                    }
                    if !state.stopping && !stop.is_stopped() {
                        state.queue.push_back(retained);
                    }
                }
            }

            // Leave the active set only once the outcome is fully recorded,
            // so the entry is never invisible to is_queued_or_active
            self.state.lock().active.remove(&api_path);
        }
    }

    fn perform(&self, record: &UploadRecord, stop: &StopToken) -> ApiResult<()> {
        if stop.is_stopped() {
            return Err(ApiError::DownloadStopped);
        }

        let key = self
            .store
            .get_item_meta(&record.api_path)?
            .and_then(|meta| meta.get(META_KEY).cloned())
            .unwrap_or_default();

        match &record.encryption_token {
            Some(token) => {
                let source = NativeFile::open(std::path::Path::new(&record.source_path), true)?;
                let cfg = KdfConfig::generate_with_limits(self.kdf_opslimit, self.kdf_memlimit)?;
                let mut reader = EncryptingReader::with_config(source, token, cfg, stop.clone())?;
                let size = reader.wire_size();
                self.provider
                    .replace_object(&record.api_path, &key, &mut reader, size, stop)
            }
            None => {
                let mut source = std::fs::File::open(&record.source_path)?;
                let size = source.metadata()?.len();
                self.provider
                    .replace_object(&record.api_path, &key, &mut source, size, stop)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingSink;
    use crate::local::LocalProvider;
    use crate::provider::Provider;
    use strato_core::MetaMap;

    struct Fixture {
        dir: tempfile::TempDir,
        provider: Arc<LocalProvider>,
        store: Arc<MetaStore>,
        sink: Arc<CollectingSink>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(LocalProvider::new(dir.path().join("objects")).unwrap());
        let store = Arc::new(MetaStore::open(&dir.path().join("meta.redb")).unwrap());
        Fixture {
            dir,
            provider,
            store,
            sink: Arc::new(CollectingSink::new()),
        }
    }

    fn manager(fx: &Fixture) -> UploadManager {
        UploadManager::new(
            fx.provider.clone(),
            fx.store.clone(),
            fx.sink.clone(),
            1,
            1,
            1,
            8,
        )
    }

    fn write_scratch(fx: &Fixture, name: &str, content: &[u8]) -> String {
        let path = fx.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn wait_for_drain(manager: &UploadManager) {
        let deadline = std::time::Instant::now() + Duration::from_secs(20);
        while manager.pending_count() > 0 {
            assert!(std::time::Instant::now() < deadline, "uploads stalled");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_upload_replaces_object() {
        let fx = fixture();
        let manager = manager(&fx);

        fx.provider.create_object("/a", &MetaMap::new()).unwrap();
        let source = write_scratch(&fx, "scratch-a", b"uploaded content");

        manager.queue_upload("/a", &source, None).unwrap();
        wait_for_drain(&manager);

        let mut out = Vec::new();
        fx.provider
            .read_range("/a", "a", 0, 16, &mut out, &StopToken::new())
            .unwrap();
        assert_eq!(out, b"uploaded content");

        assert_eq!(
            fx.sink
                .count_matching(|e| matches!(e, FsEvent::FileUploaded { .. })),
            1
        );
        // The persisted row is gone after success
        assert_eq!(fx.store.load_uploads().unwrap().len(), 0);
    }

    #[test]
    fn test_queue_is_idempotent_by_path() {
        let fx = fixture();
        let manager =
            UploadManager::without_workers(fx.provider.clone(), fx.store.clone(), fx.sink.clone());

        let source = write_scratch(&fx, "scratch-b", b"x");
        manager.queue_upload("/b", &source, None).unwrap();
        manager.queue_upload("/b", &source, None).unwrap();
        manager.queue_upload("/other", &source, None).unwrap();

        assert_eq!(manager.pending_count(), 2);
        assert!(manager.is_queued_or_active("/b"));

        manager.remove_upload("/b").unwrap();
        assert_eq!(manager.pending_count(), 1);
        assert!(!manager.is_queued_or_active("/b"));
        assert_eq!(fx.store.get_upload("/b").unwrap(), None);
    }

    #[test]
    fn test_rename_rewrites_queued_entry() {
        let fx = fixture();
        let manager =
            UploadManager::without_workers(fx.provider.clone(), fx.store.clone(), fx.sink.clone());

        let source = write_scratch(&fx, "scratch-r", b"x");
        manager.queue_upload("/old", &source, None).unwrap();
        manager.rename_upload("/old", "/new").unwrap();

        assert!(!manager.is_queued_or_active("/old"));
        assert!(manager.is_queued_or_active("/new"));
        assert_eq!(fx.store.get_upload("/old").unwrap(), None);
        assert!(fx.store.get_upload("/new").unwrap().is_some());
    }

    #[test]
    fn test_failed_upload_is_retained_and_retried() {
        let fx = fixture();
        let manager = manager(&fx);

        // Missing parent directory makes the provider reject the upload
        let source = write_scratch(&fx, "scratch-c", b"payload");
        manager
            .queue_upload("/missing/c", &source, None)
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(20);
        while fx
            .sink
            .count_matching(|e| matches!(e, FsEvent::UploadFailed { .. }))
            == 0
        {
            assert!(std::time::Instant::now() < deadline, "no failure observed");
            std::thread::sleep(Duration::from_millis(10));
        }

        // Still retained for retry
        assert!(fx.store.get_upload("/missing/c").unwrap().is_some());

        // Creating the directory lets a retry succeed
        fx.provider
            .create_pseudo_directory("/missing", &MetaMap::new())
            .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(30);
        while fx
            .sink
            .count_matching(|e| matches!(e, FsEvent::FileUploaded { .. }))
            == 0
        {
            assert!(std::time::Instant::now() < deadline, "retry never succeeded");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_encrypted_upload_round_trips() {
        let fx = fixture();
        let manager = manager(&fx);

        fx.provider.create_object("/enc", &MetaMap::new()).unwrap();
        let content = b"sealed payload".to_vec();
        let source = write_scratch(&fx, "scratch-enc", &content);

        manager
            .queue_upload("/enc", &source, Some("token".into()))
            .unwrap();
        wait_for_drain(&manager);

        let wire_size = fx.provider.stat("/enc").unwrap().size;
        assert_eq!(
            wire_size,
            strato_core::crypto::encrypted_size(content.len() as u64)
        );

        // Decrypt through an ItemReader to close the loop
        let item = strato_core::ApiFile {
            api_path: "/enc".into(),
            api_parent: "/".into(),
            size: strato_core::crypto::decrypted_size(wire_size).unwrap(),
            encryption_token: Some("token".into()),
            key: "enc".into(),
            ..strato_core::ApiFile::default()
        };
        let reader = crate::encryption::ItemReader::new(fx.provider.clone(), item).unwrap();
        let mut out = Vec::new();
        reader
            .read(0, content.len(), &mut out, &StopToken::new())
            .unwrap();
        assert_eq!(out, content);
    }

    #[test]
    fn test_restore_prefers_active_entries() {
        let fx = fixture();

        fx.provider.create_object("/one", &MetaMap::new()).unwrap();
        fx.provider.create_object("/two", &MetaMap::new()).unwrap();
        let one = write_scratch(&fx, "scratch-one", b"one");
        let two = write_scratch(&fx, "scratch-two", b"two");

        fx.store
            .put_upload(&UploadRecord {
                api_path: "/one".into(),
                source_path: one,
                encryption_token: None,
                state: UploadState::Queued,
            })
            .unwrap();
        fx.store
            .put_upload(&UploadRecord {
                api_path: "/two".into(),
                source_path: two,
                encryption_token: None,
                state: UploadState::Active,
            })
            .unwrap();

        let manager = manager(&fx);
        manager.restore(fx.store.load_uploads().unwrap());
        wait_for_drain(&manager);

        assert_eq!(
            fx.sink
                .count_matching(|e| matches!(e, FsEvent::FileUploaded { .. })),
            2
        );
    }
}
