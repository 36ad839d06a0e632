//! In-memory read-ahead over a remote object
//!
//! A short ring of `K` chunk slots plus dedicated first-chunk and
//! last-chunk slots; media players probe offset 0 and the file tail, so
//! those two chunks are fetched eagerly and never evicted. Sequential
//! access is served ahead of the reader by a prefetch thread; a far seek
//! resets the window.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use strato_core::{chunk_len, total_chunks, ApiError, ApiResult, StopToken, CHUNK_SIZE};
use tracing::{trace, warn};

use crate::chunk::{ActiveChunkMap, ChunkRole};
use crate::encryption::ItemReader;

pub struct BufferedReader {
    inner: Arc<BufferedInner>,
    prefetcher: Mutex<Option<JoinHandle<()>>>,
}

struct BufferedInner {
    reader: Arc<ItemReader>,
    size: u64,
    total: usize,
    slots: usize,
    stop: StopToken,
    state: Mutex<BufferedState>,
    cond: Condvar,
    active: ActiveChunkMap,
}

struct BufferedState {
    ring: Vec<Option<(usize, Arc<Vec<u8>>)>>,
    first: Option<Arc<Vec<u8>>>,
    last: Option<Arc<Vec<u8>>>,
    read_chunk: usize,
    write_chunk: usize,
    generation: u64,
    error: Option<ApiError>,
}

impl BufferedReader {
    /// Build a reader and eagerly fetch the first and last chunks
    pub fn new(
        reader: Arc<ItemReader>,
        read_ahead_count: usize,
        stop: StopToken,
    ) -> ApiResult<Self> {
        let size = reader.plain_size();
        let total = total_chunks(size, CHUNK_SIZE);
        let slots = read_ahead_count.max(1);

        let inner = Arc::new(BufferedInner {
            reader,
            size,
            total,
            slots,
            stop,
            state: Mutex::new(BufferedState {
                ring: vec![None; slots],
                first: None,
                last: None,
                read_chunk: 0,
                write_chunk: 0,
                generation: 0,
                error: None,
            }),
            cond: Condvar::new(),
            active: ActiveChunkMap::new(),
        });

        if total > 0 {
            let first = inner.fetch(0)?;
            inner.state.lock().first = Some(first);
        }
        if total > 1 {
            let last = inner.fetch(total - 1)?;
            inner.state.lock().last = Some(last);
        }

        let this = Self {
            inner: inner.clone(),
            prefetcher: Mutex::new(None),
        };
        if slots > 1 && total > 0 {
            let handle = std::thread::spawn(move || inner.prefetch_loop());
            *this.prefetcher.lock() = Some(handle);
        }
        Ok(this)
    }

    pub fn total_chunks(&self) -> usize {
        self.inner.total
    }

    /// Fetch or serve chunk `index`, serializing concurrent requests per
    /// chunk
    pub fn read_chunk(&self, index: usize) -> ApiResult<Arc<Vec<u8>>> {
        let inner = &self.inner;
        if index >= inner.total {
            return Err(ApiError::FileSizeMismatch);
        }

        loop {
            if inner.stop.is_stopped() {
                return Err(ApiError::DownloadStopped);
            }

            {
                let mut state = inner.state.lock();
                if let Some(error) = state.error {
                    return Err(error);
                }

                if index == 0 {
                    if let Some(data) = state.first.clone() {
                        return Ok(data);
                    }
                }
                if index + 1 == inner.total {
                    if let Some(data) = state.last.clone() {
                        return Ok(data);
                    }
                }
                let slot = index % inner.slots;
                if let Some((held, data)) = state.ring[slot].clone() {
                    if held == index {
                        state.read_chunk = index;
                        inner.cond.notify_all();
                        return Ok(data);
                    }
                }

                // Out-of-window request: restart the prefetch window here
                if index < state.read_chunk || index >= state.write_chunk + inner.slots {
                    trace!(index, read = state.read_chunk, "reader window reset");
                    state.generation += 1;
                    state.write_chunk = index;
                }
                state.read_chunk = index;
                if state.write_chunk < index {
                    state.generation += 1;
                    state.write_chunk = index;
                }
                inner.cond.notify_all();
            }

            inner.fetch_into_slot(index)?;
        }
    }

    pub fn notify_stop_requested(&self) {
        self.inner.stop.stop();
        self.inner.cond.notify_all();
    }

    pub fn error(&self) -> Option<ApiError> {
        self.inner.state.lock().error
    }
}

impl Drop for BufferedReader {
    fn drop(&mut self) {
        self.notify_stop_requested();
        if let Some(handle) = self.prefetcher.lock().take() {
            let _ = handle.join();
        }
    }
}

impl BufferedInner {
    /// One provider fetch of chunk `index`
    fn fetch(&self, index: usize) -> ApiResult<Arc<Vec<u8>>> {
        let len = chunk_len(self.size, CHUNK_SIZE, index);
        let mut buf = Vec::new();
        self.reader
            .read(index as u64 * CHUNK_SIZE as u64, len, &mut buf, &self.stop)?;
        Ok(Arc::new(buf))
    }

    /// Fetch `index` with at-most-once dedup and publish it into its slot
    fn fetch_into_slot(&self, index: usize) -> ApiResult<()> {
        match self.active.begin(index) {
            ChunkRole::Wait(active) => active.wait(&self.stop),
            ChunkRole::Fetch(_) => {
                let fetched = self.fetch(index);
                let result = match fetched {
                    Ok(data) => {
                        self.store(index, data);
                        Ok(())
                    }
                    Err(error) => {
                        if error != ApiError::DownloadStopped {
                            warn!(index, %error, "chunk fetch failed");
                            self.state.lock().error = Some(error);
                        }
                        Err(error)
                    }
                };
                self.active.finish(index, result);
                self.cond.notify_all();
                result
            }
        }
    }

    fn store(&self, index: usize, data: Arc<Vec<u8>>) {
        let mut state = self.state.lock();
        if index == 0 {
            state.first = Some(data);
        } else if index + 1 == self.total {
            state.last = Some(data);
        } else {
            let slot = index % self.slots;
            state.ring[slot] = Some((index, data));
        }
    }

    fn prefetch_loop(self: Arc<Self>) {
        loop {
            let (target, generation) = {
                let mut state = self.state.lock();
                loop {
                    if self.stop.is_stopped() {
                        return;
                    }
                    if state.error.is_some() {
                        return;
                    }

                    let target = state.write_chunk;
                    if target < self.total && target < state.read_chunk + self.slots {
                        let present = (target == 0 && state.first.is_some())
                            || (target + 1 == self.total && state.last.is_some())
                            || matches!(
                                state.ring[target % self.slots],
                                Some((held, _)) if held == target
                            );
                        if present {
                            state.write_chunk += 1;
                            continue;
                        }
                        break (target, state.generation);
                    }
                    self.cond.wait_for(&mut state, Duration::from_millis(250));
                }
            };

            let _ = self.fetch_into_slot(target);

            let mut state = self.state.lock();
            if state.generation == generation && state.write_chunk == target {
                state.write_chunk += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalProvider;
    use crate::provider::Provider;
    use strato_core::{ApiFile, MetaMap};

    fn reader_over(content: &[u8]) -> (tempfile::TempDir, Arc<ItemReader>) {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path().join("objects")).unwrap();
        provider.create_object("/media", &MetaMap::new()).unwrap();
        let mut cursor = std::io::Cursor::new(content.to_vec());
        provider
            .replace_object("/media", "media", &mut cursor, content.len() as u64, &StopToken::new())
            .unwrap();

        let item = ApiFile {
            api_path: "/media".into(),
            api_parent: "/".into(),
            size: content.len() as u64,
            key: "media".into(),
            ..ApiFile::default()
        };
        let reader = Arc::new(ItemReader::new(Arc::new(provider), item).unwrap());
        (dir, reader)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 239) as u8).collect()
    }

    #[test]
    fn test_first_and_last_chunks_are_resident() {
        let content = pattern(3 * CHUNK_SIZE + 100);
        let (_dir, item_reader) = reader_over(&content);

        let reader = BufferedReader::new(item_reader, 2, StopToken::new()).unwrap();
        assert_eq!(reader.total_chunks(), 4);

        let first = reader.read_chunk(0).unwrap();
        assert_eq!(&first[..], &content[..CHUNK_SIZE]);

        let last = reader.read_chunk(3).unwrap();
        assert_eq!(&last[..], &content[3 * CHUNK_SIZE..]);
    }

    #[test]
    fn test_sequential_read_through() {
        let content = pattern(5 * CHUNK_SIZE + 17);
        let (_dir, item_reader) = reader_over(&content);

        let reader = BufferedReader::new(item_reader, 3, StopToken::new()).unwrap();
        let mut rebuilt = Vec::new();
        for idx in 0..reader.total_chunks() {
            rebuilt.extend_from_slice(&reader.read_chunk(idx).unwrap());
        }
        assert_eq!(rebuilt, content);
    }

    #[test]
    fn test_random_access_with_window_resets() {
        let content = pattern(20 * CHUNK_SIZE);
        let (_dir, item_reader) = reader_over(&content);

        let reader = BufferedReader::new(item_reader, 2, StopToken::new()).unwrap();
        for &idx in &[10usize, 2, 17, 2, 10] {
            let chunk = reader.read_chunk(idx).unwrap();
            assert_eq!(&chunk[..], &content[idx * CHUNK_SIZE..(idx + 1) * CHUNK_SIZE]);
        }
    }

    #[test]
    fn test_stop_aborts_reads() {
        let content = pattern(4 * CHUNK_SIZE);
        let (_dir, item_reader) = reader_over(&content);

        let stop = StopToken::new();
        let reader = BufferedReader::new(item_reader, 2, stop.clone()).unwrap();
        stop.stop();
        assert_eq!(reader.read_chunk(2), Err(ApiError::DownloadStopped));
    }
}
