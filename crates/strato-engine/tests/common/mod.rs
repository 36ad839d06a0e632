//! Shared fixtures for the integration tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use strato_core::{ApiFile, ApiResult, MetaMap, MountConfig, StopToken};
use strato_engine::{CollectingSink, FileManager, FsEvent, LocalProvider, Provider, ProviderPtr};

/// Provider wrapper that counts range fetches
pub struct CountingProvider {
    inner: ProviderPtr,
    pub read_ranges: AtomicUsize,
}

impl CountingProvider {
    pub fn new(inner: ProviderPtr) -> Self {
        Self {
            inner,
            read_ranges: AtomicUsize::new(0),
        }
    }

    pub fn fetches(&self) -> usize {
        self.read_ranges.load(Ordering::SeqCst)
    }
}

impl Provider for CountingProvider {
    fn list_directory(&self, api_path: &str) -> ApiResult<Vec<ApiFile>> {
        self.inner.list_directory(api_path)
    }

    fn stat(&self, api_path: &str) -> ApiResult<ApiFile> {
        self.inner.stat(api_path)
    }

    fn read_range(
        &self,
        api_path: &str,
        key: &str,
        offset: u64,
        len: usize,
        out: &mut Vec<u8>,
        stop: &StopToken,
    ) -> ApiResult<()> {
        self.read_ranges.fetch_add(1, Ordering::SeqCst);
        self.inner.read_range(api_path, key, offset, len, out, stop)
    }

    fn create_object(&self, api_path: &str, meta: &MetaMap) -> ApiResult<()> {
        self.inner.create_object(api_path, meta)
    }

    fn create_pseudo_directory(&self, api_path: &str, meta: &MetaMap) -> ApiResult<()> {
        self.inner.create_pseudo_directory(api_path, meta)
    }

    fn replace_object(
        &self,
        api_path: &str,
        key: &str,
        source: &mut dyn std::io::Read,
        size: u64,
        stop: &StopToken,
    ) -> ApiResult<()> {
        self.inner.replace_object(api_path, key, source, size, stop)
    }

    fn remove(&self, api_path: &str, key: &str) -> ApiResult<()> {
        self.inner.remove(api_path, key)
    }

    fn rename(&self, from: &str, to: &str) -> ApiResult<()> {
        self.inner.rename(from, to)
    }

    fn get_total_space(&self) -> u64 {
        self.inner.get_total_space()
    }

    fn get_used_space(&self) -> u64 {
        self.inner.get_used_space()
    }

    fn is_rename_supported(&self) -> bool {
        self.inner.is_rename_supported()
    }
}

/// Provider wrapper that slows every range fetch down
pub struct SlowProvider {
    inner: ProviderPtr,
    delay: Duration,
}

impl SlowProvider {
    pub fn new(inner: ProviderPtr, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

impl Provider for SlowProvider {
    fn list_directory(&self, api_path: &str) -> ApiResult<Vec<ApiFile>> {
        self.inner.list_directory(api_path)
    }

    fn stat(&self, api_path: &str) -> ApiResult<ApiFile> {
        self.inner.stat(api_path)
    }

    fn read_range(
        &self,
        api_path: &str,
        key: &str,
        offset: u64,
        len: usize,
        out: &mut Vec<u8>,
        stop: &StopToken,
    ) -> ApiResult<()> {
        std::thread::sleep(self.delay);
        self.inner.read_range(api_path, key, offset, len, out, stop)
    }

    fn create_object(&self, api_path: &str, meta: &MetaMap) -> ApiResult<()> {
        self.inner.create_object(api_path, meta)
    }

    fn create_pseudo_directory(&self, api_path: &str, meta: &MetaMap) -> ApiResult<()> {
        self.inner.create_pseudo_directory(api_path, meta)
    }

    fn replace_object(
        &self,
        api_path: &str,
        key: &str,
        source: &mut dyn std::io::Read,
        size: u64,
        stop: &StopToken,
    ) -> ApiResult<()> {
        self.inner.replace_object(api_path, key, source, size, stop)
    }

    fn remove(&self, api_path: &str, key: &str) -> ApiResult<()> {
        self.inner.remove(api_path, key)
    }

    fn rename(&self, from: &str, to: &str) -> ApiResult<()> {
        self.inner.rename(from, to)
    }

    fn get_total_space(&self) -> u64 {
        self.inner.get_total_space()
    }

    fn get_used_space(&self) -> u64 {
        self.inner.get_used_space()
    }

    fn is_rename_supported(&self) -> bool {
        self.inner.is_rename_supported()
    }
}

pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub provider: ProviderPtr,
    pub sink: Arc<CollectingSink>,
    pub fm: FileManager,
}

pub fn base_config(dir: &tempfile::TempDir) -> MountConfig {
    let mut config = MountConfig::default();
    config.data_dir = dir.path().join("data");
    config.download.read_ahead_count = 2;
    config.upload.upload_retry_secs = 1;
    config.encryption.kdf_opslimit = 1;
    config.encryption.kdf_memlimit_kib = 8;
    config
}

/// Opt into log output with `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Build a running file manager over a fresh local backend
pub fn env_with(
    tweak: impl FnOnce(&mut MountConfig),
    wrap: impl FnOnce(ProviderPtr) -> ProviderPtr,
) -> TestEnv {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let mut config = base_config(&dir);
    tweak(&mut config);

    let local: ProviderPtr = Arc::new(LocalProvider::new(dir.path().join("objects")).unwrap());
    let provider = wrap(local);
    let sink = Arc::new(CollectingSink::new());
    let fm = FileManager::new(config, provider.clone(), sink.clone()).unwrap();
    fm.start().unwrap();

    TestEnv {
        dir,
        provider,
        sink,
        fm,
    }
}

pub fn env() -> TestEnv {
    env_with(|_| {}, |p| p)
}

/// Place an object with content directly on the backend
pub fn put_object(provider: &ProviderPtr, api_path: &str, content: &[u8]) {
    let _ = provider.create_object(api_path, &MetaMap::new());
    let mut cursor = std::io::Cursor::new(content.to_vec());
    provider
        .replace_object(
            api_path,
            api_path.trim_start_matches('/'),
            &mut cursor,
            content.len() as u64,
            &StopToken::new(),
        )
        .unwrap();
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

/// Poll until `pred` holds or the deadline passes
pub fn wait_until(what: &str, pred: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(20));
    }
}

pub fn uploaded_count(sink: &CollectingSink, api_path: &str) -> usize {
    sink.count_matching(|e| matches!(e, FsEvent::FileUploaded { api_path: p } if p == api_path))
}
