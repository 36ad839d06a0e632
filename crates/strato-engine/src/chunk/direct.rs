//! Direct streaming engine
//!
//! Stateless read-through for read-only opens: no scratch file, no
//! persistence, just the in-memory [`BufferedReader`] window. Writes,
//! resize, and allocation are rejected.

use std::sync::Arc;

use parking_lot::Mutex;
use strato_core::{calculate_read_size, ApiError, ApiResult, StopToken, CHUNK_SIZE};
use tracing::debug;

use crate::chunk::buffered::BufferedReader;
use crate::encryption::ItemReader;
use crate::events::{EventSinkPtr, FsEvent};

const STRATEGY: &str = "direct";

pub struct DirectFile {
    reader: Arc<ItemReader>,
    buffered: Mutex<Option<Arc<BufferedReader>>>,
    size: u64,
    read_ahead_count: usize,
    stop: StopToken,
    events: EventSinkPtr,
    api_path: Mutex<String>,
    error: Mutex<Option<ApiError>>,
    end_notified: Mutex<bool>,
}

impl DirectFile {
    pub fn new(reader: Arc<ItemReader>, read_ahead_count: usize, events: EventSinkPtr) -> Self {
        let size = reader.plain_size();
        let api_path = reader.api_path();
        Self {
            reader,
            buffered: Mutex::new(None),
            size,
            read_ahead_count,
            stop: StopToken::new(),
            events,
            api_path: Mutex::new(api_path),
            error: Mutex::new(None),
            end_notified: Mutex::new(false),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn error(&self) -> Option<ApiError> {
        *self.error.lock()
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> ApiResult<Vec<u8>> {
        if let Some(error) = *self.error.lock() {
            return Err(error);
        }
        if self.stop.is_stopped() {
            return Err(ApiError::DownloadStopped);
        }

        let len = calculate_read_size(self.size, len, offset);
        if len == 0 {
            return Ok(Vec::new());
        }

        let buffered = self.ensure_buffered()?;

        let mut out = Vec::with_capacity(len);
        let mut chunk_index = (offset / CHUNK_SIZE as u64) as usize;
        let mut in_chunk = (offset % CHUNK_SIZE as u64) as usize;
        while out.len() < len {
            let chunk = match buffered.read_chunk(chunk_index) {
                Ok(chunk) => chunk,
                Err(error) => {
                    self.set_error(error);
                    return Err(error);
                }
            };
            let want = len - out.len();
            let take = std::cmp::min(chunk.len().saturating_sub(in_chunk), want);
            if take == 0 {
                break;
            }
            out.extend_from_slice(&chunk[in_chunk..in_chunk + take]);
            chunk_index += 1;
            in_chunk = 0;
        }

        self.events.publish(&FsEvent::DownloadProgress {
            api_path: self.api_path.lock().clone(),
            fraction: (offset + out.len() as u64) as f64 / self.size.max(1) as f64,
        });
        Ok(out)
    }

    pub fn notify_stop_requested(&self) {
        self.set_error(ApiError::DownloadStopped);
        self.stop.stop();
        if let Some(buffered) = self.buffered.lock().as_ref() {
            buffered.notify_stop_requested();
        }
        self.notify_end();
    }

    pub fn set_api_path(&self, api_path: &str, key: &str) {
        *self.api_path.lock() = api_path.to_owned();
        self.reader.set_api_path(api_path, key);
    }

    fn ensure_buffered(&self) -> ApiResult<Arc<BufferedReader>> {
        let mut guard = self.buffered.lock();
        if let Some(buffered) = guard.as_ref() {
            return Ok(buffered.clone());
        }

        let api_path = self.api_path.lock().clone();
        debug!(%api_path, "direct streaming begin");
        self.events.publish(&FsEvent::DownloadBegin {
            api_path,
            strategy: STRATEGY,
        });

        let buffered = Arc::new(BufferedReader::new(
            self.reader.clone(),
            self.read_ahead_count,
            self.stop.clone(),
        )?);
        *guard = Some(buffered.clone());
        Ok(buffered)
    }

    fn set_error(&self, error: ApiError) {
        let mut guard = self.error.lock();
        if guard.is_none() {
            *guard = Some(error);
        }
    }

    fn notify_end(&self) {
        let mut notified = self.end_notified.lock();
        if *notified || self.buffered.lock().is_none() {
            return;
        }
        *notified = true;
        let error = (*self.error.lock()).filter(|e| *e != ApiError::DownloadStopped);
        self.events.publish(&FsEvent::DownloadEnd {
            api_path: self.api_path.lock().clone(),
            strategy: STRATEGY,
            handle: 0,
            error,
        });
    }
}

impl Drop for DirectFile {
    fn drop(&mut self) {
        self.stop.stop();
        self.notify_end();
    }
}
