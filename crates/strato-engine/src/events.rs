//! Event publication
//!
//! The core never talks to a global event system; it takes an [`EventSink`]
//! at construction and publishes lifecycle events through it. The default
//! sink emits structured log lines.

use std::sync::Arc;

use strato_core::ApiError;
use tracing::{info, warn};

/// Events raised by the chunk engines, the upload manager, and eviction
#[derive(Clone, Debug, PartialEq)]
pub enum FsEvent {
    DownloadBegin {
        api_path: String,
        strategy: &'static str,
    },
    DownloadProgress {
        api_path: String,
        fraction: f64,
    },
    DownloadEnd {
        api_path: String,
        strategy: &'static str,
        handle: u64,
        error: Option<ApiError>,
    },
    FileUploaded {
        api_path: String,
    },
    UploadFailed {
        api_path: String,
        reason: ApiError,
    },
    FilePinned {
        api_path: String,
    },
    FileUnpinned {
        api_path: String,
    },
    ChunkRemoved {
        api_path: String,
        index: usize,
    },
}

/// Pluggable destination for [`FsEvent`]s
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &FsEvent);
}

pub type EventSinkPtr = Arc<dyn EventSink>;

/// Default sink: structured log lines
#[derive(Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn publish(&self, event: &FsEvent) {
        match event {
            FsEvent::DownloadBegin { api_path, strategy } => {
                info!(%api_path, strategy, "download begin");
            }
            FsEvent::DownloadProgress { api_path, fraction } => {
                info!(%api_path, fraction, "download progress");
            }
            FsEvent::DownloadEnd {
                api_path,
                strategy,
                handle,
                error,
            } => {
                info!(%api_path, strategy, handle, ?error, "download end");
            }
            FsEvent::FileUploaded { api_path } => {
                info!(%api_path, "file uploaded");
            }
            FsEvent::UploadFailed { api_path, reason } => {
                warn!(%api_path, %reason, "upload failed");
            }
            FsEvent::FilePinned { api_path } => {
                info!(%api_path, "file pinned");
            }
            FsEvent::FileUnpinned { api_path } => {
                info!(%api_path, "file unpinned");
            }
            FsEvent::ChunkRemoved { api_path, index } => {
                info!(%api_path, index, "chunk removed");
            }
        }
    }
}

/// Sink that retains every event, for assertions in tests
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: parking_lot::Mutex<Vec<FsEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FsEvent> {
        self.events.lock().clone()
    }

    pub fn count_matching(&self, pred: impl Fn(&FsEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }
}

impl EventSink for CollectingSink {
    fn publish(&self, event: &FsEvent) {
        self.events.lock().push(event.clone());
    }
}
