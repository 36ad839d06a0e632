//! Ring-buffer engine
//!
//! A fixed window of `R` chunks over a large read-only object, backed by a
//! pre-allocated on-disk ring of `R * CHUNK_SIZE` bytes. Chunk `i` lives at
//! ring offset `(i mod R) * CHUNK_SIZE` while `head <= i < head + R`.
//!
//! A forward prefetcher keeps up to `R/2` chunks ahead of the reader; a
//! reverse prefetcher walks `head` backwards to fill the remaining slots
//! behind it. A read whose target falls outside the window resets the
//! window atomically: every resident bit is cleared, the generation
//! counter advances (discarding in-flight fetches), and both prefetchers
//! restart around the new head.
//!
//! Window invariants while running:
//! `head <= read_chunk <= write_chunk < head + R`, and a set bit always
//! describes plaintext for the unique in-window chunk of its slot.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use strato_core::{
    calculate_read_size, chunk_len, total_chunks, ApiError, ApiResult, NativeFile, StopToken,
    CHUNK_SIZE, MAX_RING_BUFFER_CHUNKS,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::encryption::ItemReader;
use crate::events::{EventSinkPtr, FsEvent};

const STRATEGY: &str = "ring_buffer";

pub struct RingFile {
    inner: Arc<RingInner>,
    prefetchers: Mutex<Vec<JoinHandle<()>>>,
}

struct RingInner {
    reader: Arc<ItemReader>,
    size: u64,
    total: usize,
    ring: usize,
    nf: NativeFile,
    buffer_path: PathBuf,
    events: EventSinkPtr,
    stop: StopToken,
    api_path: Mutex<String>,
    io_lock: Mutex<()>,
    state: Mutex<RingState>,
    cond: Condvar,
}

struct RingState {
    head: usize,
    read_chunk: usize,
    write_chunk: usize,
    ring_state: Vec<bool>,
    /// Slots claimed by an in-flight fetch; keeps the forward fetcher (at
    /// `head + R - 1`) and the reverse fetcher (at `head - 1`) off the
    /// same slot
    busy: Vec<bool>,
    generation: u64,
    error: Option<ApiError>,
    end_notified: bool,
}

impl RingFile {
    pub fn new(
        reader: Arc<ItemReader>,
        buffer_dir: &std::path::Path,
        ring_chunks: usize,
        events: EventSinkPtr,
    ) -> ApiResult<Self> {
        if ring_chunks == 0 || ring_chunks > MAX_RING_BUFFER_CHUNKS {
            return Err(ApiError::InvalidRingBufferSize);
        }
        let size = reader.plain_size();
        let total = total_chunks(size, CHUNK_SIZE);
        if total == 0 {
            return Err(ApiError::InvalidRingBufferSize);
        }
        let api_path = reader.api_path();

        std::fs::create_dir_all(buffer_dir)?;
        let buffer_path = buffer_dir.join(Uuid::new_v4().to_string());
        let nf = NativeFile::create_or_open(&buffer_path)?;
        nf.allocate(ring_chunks as u64 * CHUNK_SIZE as u64)?;

        let inner = Arc::new(RingInner {
            reader,
            size,
            total,
            ring: ring_chunks,
            nf,
            buffer_path,
            events,
            stop: StopToken::new(),
            api_path: Mutex::new(api_path.clone()),
            io_lock: Mutex::new(()),
            state: Mutex::new(RingState {
                head: 0,
                read_chunk: 0,
                write_chunk: 0,
                ring_state: vec![false; ring_chunks],
                busy: vec![false; ring_chunks],
                generation: 0,
                error: None,
                end_notified: false,
            }),
            cond: Condvar::new(),
        });

        inner.events.publish(&FsEvent::DownloadBegin {
            api_path,
            strategy: STRATEGY,
        });

        let mut prefetchers = Vec::new();
        {
            let inner = inner.clone();
            prefetchers.push(std::thread::spawn(move || inner.forward_prefetcher()));
        }
        {
            let inner = inner.clone();
            prefetchers.push(std::thread::spawn(move || inner.reverse_prefetcher()));
        }

        Ok(Self {
            inner,
            prefetchers: Mutex::new(prefetchers),
        })
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn error(&self) -> Option<ApiError> {
        self.inner.state.lock().error
    }

    pub fn read_bytes(&self, offset: u64, len: usize) -> ApiResult<Vec<u8>> {
        let _io = self.inner.io_lock.lock();

        let len = calculate_read_size(self.inner.size, len, offset);
        if len == 0 {
            return Ok(Vec::new());
        }

        let mut out = Vec::with_capacity(len);
        let mut index = (offset / CHUNK_SIZE as u64) as usize;
        let mut in_chunk = (offset % CHUNK_SIZE as u64) as usize;
        while out.len() < len {
            let want = len - out.len();
            self.inner.read_from_chunk(index, in_chunk, want, &mut out)?;
            index += 1;
            in_chunk = 0;
        }
        Ok(out)
    }

    pub fn notify_stop_requested(&self) {
        self.inner.stop.stop();
        self.inner.cond.notify_all();
    }

    pub fn set_api_path(&self, api_path: &str, key: &str) {
        *self.inner.api_path.lock() = api_path.to_owned();
        self.inner.reader.set_api_path(api_path, key);
    }
}

impl Drop for RingFile {
    fn drop(&mut self) {
        self.notify_stop_requested();
        for handle in self.prefetchers.lock().drain(..) {
            let _ = handle.join();
        }
        let mut state = self.inner.state.lock();
        if !state.end_notified {
            state.end_notified = true;
            self.inner.events.publish(&FsEvent::DownloadEnd {
                api_path: self.inner.api_path.lock().clone(),
                strategy: STRATEGY,
                handle: 0,
                error: state.error,
            });
        }
        drop(state);
        let _ = std::fs::remove_file(&self.inner.buffer_path);
    }
}

impl RingInner {
    fn ahead_budget(&self) -> usize {
        self.ring / 2
    }

    /// Copy up to `want` bytes of chunk `index` starting at `in_chunk`,
    /// blocking until the chunk is resident in the window
    fn read_from_chunk(
        &self,
        index: usize,
        in_chunk: usize,
        want: usize,
        out: &mut Vec<u8>,
    ) -> ApiResult<()> {
        let mut state = self.state.lock();
        loop {
            if self.stop.is_stopped() {
                return Err(ApiError::DownloadStopped);
            }
            if let Some(error) = state.error {
                return Err(error);
            }

            if index < state.head || index >= state.head + self.ring {
                self.window_reset(&mut state, index);
                continue;
            }

            if state.read_chunk != index {
                state.read_chunk = index;
                if state.write_chunk < index {
                    // Forward seek inside the window: prefetch restarts
                    // here, the skipped chunks fall to the reverse side
                    state.write_chunk = index;
                }
                self.cond.notify_all();
            }

            let slot = index % self.ring;
            if state.ring_state[slot] {
                let take = std::cmp::min(
                    chunk_len(self.size, CHUNK_SIZE, index).saturating_sub(in_chunk),
                    want,
                );
                let mut buf = vec![0u8; take];
                let n = self
                    .nf
                    .read_at(&mut buf, (slot * CHUNK_SIZE) as u64 + in_chunk as u64)?;
                buf.truncate(n);
                out.extend_from_slice(&buf);
                return Ok(());
            }

            self.cond.wait_for(&mut state, Duration::from_millis(250));
        }
    }

    /// Move the window so `index` becomes its head; the only operation
    /// that clears resident bits, and it clears all of them
    fn window_reset(&self, state: &mut MutexGuard<'_, RingState>, index: usize) {
        trace!(index, head = state.head, "ring window reset");
        let api_path = self.api_path.lock().clone();
        for chunk in state.head..state.head + self.ring {
            if chunk < self.total && state.ring_state[chunk % self.ring] {
                self.events.publish(&FsEvent::ChunkRemoved {
                    api_path: api_path.clone(),
                    index: chunk,
                });
            }
        }
        state.ring_state.iter_mut().for_each(|bit| *bit = false);
        state.head = index;
        state.read_chunk = index;
        state.write_chunk = index;
        state.generation += 1;
        self.cond.notify_all();
    }

    /// Advance `write_chunk` while the read-ahead budget allows
    fn forward_prefetcher(self: Arc<Self>) {
        loop {
            let (target, generation) = {
                let mut state = self.state.lock();
                loop {
                    if self.stop.is_stopped() || state.error.is_some() {
                        return;
                    }
                    let target = state.write_chunk;
                    if target < self.total
                        && target < state.head + self.ring
                        && target - state.read_chunk <= self.ahead_budget()
                    {
                        if state.ring_state[target % self.ring] {
                            state.write_chunk += 1;
                            continue;
                        }
                        if !state.busy[target % self.ring] {
                            state.busy[target % self.ring] = true;
                            break (target, state.generation);
                        }
                    }
                    self.cond.wait_for(&mut state, Duration::from_millis(250));
                }
            };

            self.fetch_into_window(target, generation, true);
        }
    }

    /// Walk `head` backwards, filling the read-behind side of the window
    fn reverse_prefetcher(self: Arc<Self>) {
        let behind_budget = self.ring - self.ahead_budget();
        loop {
            let (target, generation) = {
                let mut state = self.state.lock();
                loop {
                    if self.stop.is_stopped() || state.error.is_some() {
                        return;
                    }
                    if state.head > 0
                        && state.read_chunk - state.head < behind_budget
                        && !state.ring_state[(state.head - 1) % self.ring]
                        && !state.busy[(state.head - 1) % self.ring]
                    {
                        let target = state.head - 1;
                        state.busy[target % self.ring] = true;
                        break (target, state.generation);
                    }
                    self.cond.wait_for(&mut state, Duration::from_millis(250));
                }
            };

            self.fetch_into_window(target, generation, false);
        }
    }

    /// Fetch one chunk and publish it, unless the window moved meanwhile
    fn fetch_into_window(&self, index: usize, generation: u64, forward: bool) {
        let len = chunk_len(self.size, CHUNK_SIZE, index);
        let mut buf = Vec::new();
        let fetched = self
            .reader
            .read(index as u64 * CHUNK_SIZE as u64, len, &mut buf, &self.stop);

        let mut state = self.state.lock();
        state.busy[index % self.ring] = false;
        match fetched {
            Ok(()) => {
                if state.generation != generation {
                    trace!(index, "discarding fetch from a stale window");
                } else {
                    let slot = index % self.ring;
                    if let Err(error) = self.nf.write_at(&buf, (slot * CHUNK_SIZE) as u64) {
                        state.error = Some(error);
                    } else {
                        state.ring_state[slot] = true;
                        if forward {
                            if state.write_chunk == index {
                                state.write_chunk += 1;
                            }
                        } else if state.head == index + 1 {
                            state.head = index;
                        }
                        self.events.publish(&FsEvent::DownloadProgress {
                            api_path: self.api_path.lock().clone(),
                            fraction: (index + 1) as f64 / self.total as f64,
                        });
                    }
                }
            }
            Err(ApiError::DownloadStopped) => {}
            Err(error) => {
                warn!(index, %error, "ring chunk fetch failed");
                state.error = Some(error);
            }
        }
        self.cond.notify_all();
        if state.error.is_none() {
            debug!(index, head = state.head, write = state.write_chunk, "ring chunk resident");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingSink;
    use crate::local::LocalProvider;
    use crate::provider::Provider;
    use strato_core::{ApiFile, MetaMap};

    fn ring_over(
        chunks: usize,
        ring: usize,
    ) -> (tempfile::TempDir, RingFile, Vec<u8>, Arc<CollectingSink>) {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path().join("objects")).unwrap();
        let content: Vec<u8> = (0..chunks * CHUNK_SIZE).map(|i| (i % 227) as u8).collect();
        provider.create_object("/big", &MetaMap::new()).unwrap();
        let mut cursor = std::io::Cursor::new(content.clone());
        provider
            .replace_object("/big", "big", &mut cursor, content.len() as u64, &StopToken::new())
            .unwrap();

        let item = ApiFile {
            api_path: "/big".into(),
            api_parent: "/".into(),
            size: content.len() as u64,
            key: "big".into(),
            ..ApiFile::default()
        };
        let reader = Arc::new(ItemReader::new(Arc::new(provider), item).unwrap());
        let sink = Arc::new(CollectingSink::new());
        let file = RingFile::new(reader, &dir.path().join("buffer"), ring, sink.clone()).unwrap();
        (dir, file, content, sink)
    }

    #[test]
    fn test_sequential_read_within_window() {
        let (_dir, file, content, _sink) = ring_over(6, 4);

        let mut rebuilt = Vec::new();
        let mut offset = 0u64;
        while offset < content.len() as u64 {
            let part = file.read_bytes(offset, CHUNK_SIZE / 2).unwrap();
            assert!(!part.is_empty());
            offset += part.len() as u64;
            rebuilt.extend_from_slice(&part);
        }
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn test_far_seeks_reset_window() {
        let (_dir, file, content, _sink) = ring_over(32, 8);

        for &chunk in &[0usize, 20, 4, 20] {
            let offset = chunk as u64 * CHUNK_SIZE as u64;
            let out = file.read_bytes(offset, 1000).unwrap();
            assert_eq!(&out[..], &content[offset as usize..offset as usize + 1000]);
        }
    }

    #[test]
    fn test_read_across_chunk_boundary() {
        let (_dir, file, content, _sink) = ring_over(4, 4);

        let offset = CHUNK_SIZE as u64 - 100;
        let out = file.read_bytes(offset, 300).unwrap();
        assert_eq!(&out[..], &content[offset as usize..offset as usize + 300]);
    }

    #[test]
    fn test_read_past_eof_is_short() {
        let (_dir, file, content, _sink) = ring_over(2, 2);
        let near_end = content.len() as u64 - 50;
        assert_eq!(file.read_bytes(near_end, 500).unwrap().len(), 50);
        assert!(file.read_bytes(content.len() as u64, 100).unwrap().is_empty());
    }

    #[test]
    fn test_ring_rejects_invalid_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path().join("objects")).unwrap();
        provider.create_object("/x", &MetaMap::new()).unwrap();
        let item = ApiFile {
            api_path: "/x".into(),
            api_parent: "/".into(),
            size: 0,
            key: "x".into(),
            ..ApiFile::default()
        };
        let reader = Arc::new(ItemReader::new(Arc::new(provider), item).unwrap());
        let sink: Arc<CollectingSink> = Arc::new(CollectingSink::new());

        // Zero-size object has no window
        assert!(RingFile::new(reader.clone(), &dir.path().join("buffer"), 8, sink.clone()).is_err());
        // Zero ring size is invalid
        assert!(RingFile::new(reader, &dir.path().join("buffer"), 0, sink).is_err());
    }

    #[test]
    fn test_stop_unblocks_readers() {
        let (_dir, file, _content, _sink) = ring_over(8, 4);
        file.notify_stop_requested();
        assert_eq!(file.read_bytes(0, 100), Err(ApiError::DownloadStopped));
    }

    #[test]
    fn test_buffer_file_removed_on_drop() {
        let (_dir, file, _content, _sink) = ring_over(2, 2);
        let path = file.inner.buffer_path.clone();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }
}
