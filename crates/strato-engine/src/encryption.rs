//! Encrypting reader and random-access decryption over a provider
//!
//! [`ItemReader`] gives the chunk engines one uniform way to read plaintext
//! ranges of an object, whether the backend stores it in the clear or in
//! the sealed-chunk format. [`EncryptingReader`] is the inverse: it
//! presents an on-disk plaintext file as the encrypted wire stream for a
//! whole-object upload.

use std::io::{self, Read, Seek, SeekFrom};

use parking_lot::Mutex;
use strato_core::crypto::{
    self, chunk_wire_len, chunk_wire_offset, KdfConfig, Key256, DATA_CHUNK_SIZE,
    ENCRYPTED_CHUNK_SIZE, KDF_HEADER_SIZE,
};
use strato_core::{
    calculate_read_size, total_chunks, ApiError, ApiFile, ApiResult, NativeFile, StopToken,
};
use tracing::debug;

use crate::provider::ProviderPtr;

struct ItemKeys {
    cfg: KdfConfig,
    data_key: Key256,
}

/// Plaintext range reads over a provider-hosted object
pub struct ItemReader {
    provider: ProviderPtr,
    item: Mutex<ApiFile>,
    plain_size: u64,
    keys: Mutex<Option<ItemKeys>>,
}

impl ItemReader {
    /// Wrap an object; `item.size` is the plaintext size (the file
    /// manager translates wire sizes before building readers)
    pub fn new(provider: ProviderPtr, item: ApiFile) -> ApiResult<Self> {
        let plain_size = item.size;
        Ok(Self {
            provider,
            item: Mutex::new(item),
            plain_size,
            keys: Mutex::new(None),
        })
    }

    /// Plaintext size of the object
    pub fn plain_size(&self) -> u64 {
        self.plain_size
    }

    pub fn api_path(&self) -> String {
        self.item.lock().api_path.clone()
    }

    /// Redirect future range requests after a rename
    pub fn set_api_path(&self, api_path: &str, key: &str) {
        let mut item = self.item.lock();
        item.api_path = api_path.to_owned();
        item.key = key.to_owned();
    }

    /// Read `len` plaintext bytes at `offset` into `out`
    ///
    /// The caller clamps to EOF; requesting past the plaintext end is an
    /// error here.
    pub fn read(
        &self,
        offset: u64,
        len: usize,
        out: &mut Vec<u8>,
        stop: &StopToken,
    ) -> ApiResult<()> {
        out.clear();
        if len == 0 {
            return Ok(());
        }
        if offset + len as u64 > self.plain_size {
            return Err(ApiError::FileSizeMismatch);
        }

        let token = self.item.lock().encryption_token.clone();

        let Some(token) = token else {
            return self.read_range_retrying(offset, len, out, stop);
        };

        let keys = self.ensure_keys(&token, stop)?;

        let first = offset / DATA_CHUNK_SIZE as u64;
        let last = (offset + len as u64 - 1) / DATA_CHUNK_SIZE as u64;

        let wire_offset = chunk_wire_offset(first);
        let wire_len: usize = (first..=last)
            .map(|idx| chunk_wire_len(self.plain_size, idx))
            .sum();

        let mut wire = Vec::new();
        self.read_range_retrying(wire_offset, wire_len, &mut wire, stop)?;

        // Decrypt chunk by chunk, trimming the first and last to the range
        out.reserve(len);
        let mut consumed = 0usize;
        for idx in first..=last {
            let clen = chunk_wire_len(self.plain_size, idx);
            let sealed = wire
                .get(consumed..consumed + clen)
                .ok_or(ApiError::DecryptionError)?;
            consumed += clen;

            let plain =
                crypto::decrypt_chunk(&keys.data_key, &keys.cfg.unique_id, idx, sealed)?;

            let chunk_start = idx * DATA_CHUNK_SIZE as u64;
            let skip = offset.saturating_sub(chunk_start) as usize;
            let want = len - out.len();
            let take = std::cmp::min(plain.len().saturating_sub(skip), want);
            out.extend_from_slice(&plain[skip..skip + take]);
        }

        if out.len() != len {
            return Err(ApiError::FileSizeMismatch);
        }
        Ok(())
    }

    /// Provider range read that rides out a concurrent rename
    ///
    /// A fetch that captured the pre-rename path can land after the
    /// backend object has moved; the path on this reader is rewritten by
    /// the rename, so `ItemNotFound` is retried briefly against the
    /// freshly captured path before being surfaced.
    fn read_range_retrying(
        &self,
        offset: u64,
        len: usize,
        out: &mut Vec<u8>,
        stop: &StopToken,
    ) -> ApiResult<()> {
        let mut attempt = 0u32;
        loop {
            let (api_path, key) = {
                let item = self.item.lock();
                (item.api_path.clone(), item.key.clone())
            };
            match self
                .provider
                .read_range(&api_path, &key, offset, len, out, stop)
            {
                Err(ApiError::ItemNotFound) if attempt < 20 => {
                    attempt += 1;
                    std::thread::sleep(std::time::Duration::from_millis(25));
                }
                result => return result,
            }
        }
    }

    fn ensure_keys(&self, token: &str, stop: &StopToken) -> ApiResult<ItemKeys> {
        let mut guard = self.keys.lock();
        if let Some(keys) = guard.as_ref() {
            return Ok(ItemKeys {
                cfg: keys.cfg,
                data_key: keys.data_key,
            });
        }

        let mut header = Vec::new();
        self.read_range_retrying(0, KDF_HEADER_SIZE, &mut header, stop)?;
        let cfg = KdfConfig::from_bytes(&header)?;

        debug!(api_path = %self.item.lock().api_path, "deriving object keys");
        let master = crypto::derive_master_key(token, &cfg)?;
        let data_key = crypto::data_subkey(&master, &cfg.unique_id);

        *guard = Some(ItemKeys { cfg, data_key });
        Ok(ItemKeys { cfg, data_key })
    }
}

/// Streams an on-disk plaintext file as the encrypted wire format
///
/// Implements `Read + Seek` so the uploader can feed it to a provider
/// without buffering the whole object, and so multipart uploaders can
/// rewind. Nonces are generated once at construction; seeking back and
/// re-reading a chunk yields identical bytes.
pub struct EncryptingReader {
    source: NativeFile,
    cfg: KdfConfig,
    data_key: Key256,
    nonces: Vec<[u8; crypto::NONCE_SIZE]>,
    header: [u8; KDF_HEADER_SIZE],
    plain_size: u64,
    wire_size: u64,
    pos: u64,
    cached: Option<(u64, Vec<u8>)>,
    stop: StopToken,
}

impl EncryptingReader {
    pub fn new(source: NativeFile, token: &str, stop: StopToken) -> ApiResult<Self> {
        Self::with_config(source, token, KdfConfig::generate()?, stop)
    }

    pub fn with_config(
        source: NativeFile,
        token: &str,
        cfg: KdfConfig,
        stop: StopToken,
    ) -> ApiResult<Self> {
        let plain_size = source.size()?;
        let chunks = total_chunks(plain_size, DATA_CHUNK_SIZE);

        let mut nonces = Vec::with_capacity(chunks);
        for _ in 0..chunks {
            let mut nonce = [0u8; crypto::NONCE_SIZE];
            getrandom::getrandom(&mut nonce).map_err(|_| ApiError::OsError)?;
            nonces.push(nonce);
        }

        let master = crypto::derive_master_key(token, &cfg)?;
        let data_key = crypto::data_subkey(&master, &cfg.unique_id);

        Ok(Self {
            source,
            header: cfg.to_bytes(),
            cfg,
            data_key,
            nonces,
            plain_size,
            wire_size: crypto::encrypted_size(plain_size),
            pos: 0,
            cached: None,
            stop,
        })
    }

    /// Total size of the produced wire stream
    pub fn wire_size(&self) -> u64 {
        self.wire_size
    }

    fn sealed_chunk(&mut self, index: u64) -> io::Result<&[u8]> {
        if self.cached.as_ref().map(|(idx, _)| *idx) != Some(index) {
            let plain_len =
                calculate_read_size(self.plain_size, DATA_CHUNK_SIZE, index * DATA_CHUNK_SIZE as u64);
            let mut plain = vec![0u8; plain_len];
            let n = self
                .source
                .read_at(&mut plain, index * DATA_CHUNK_SIZE as u64)
                .map_err(io_err)?;
            if n != plain_len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "source shrank during upload",
                ));
            }

            let sealed = crypto::encrypt_chunk_with_nonce(
                &self.data_key,
                &self.cfg.unique_id,
                index,
                &self.nonces[index as usize],
                &plain,
            )
            .map_err(io_err)?;
            self.cached = Some((index, sealed));
        }
        Ok(&self.cached.as_ref().unwrap().1)
    }
}

fn io_err(err: ApiError) -> io::Error {
    io::Error::other(err.to_string())
}

impl Read for EncryptingReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.stop.is_stopped() {
            return Err(io::Error::new(io::ErrorKind::Interrupted, "stop requested"));
        }

        let mut produced = 0usize;
        while produced < buf.len() && self.pos < self.wire_size {
            let n = if self.pos < KDF_HEADER_SIZE as u64 {
                let off = self.pos as usize;
                let take = std::cmp::min(buf.len() - produced, KDF_HEADER_SIZE - off);
                buf[produced..produced + take].copy_from_slice(&self.header[off..off + take]);
                take
            } else {
                let body_pos = self.pos - KDF_HEADER_SIZE as u64;
                let index = body_pos / ENCRYPTED_CHUNK_SIZE as u64;
                let off = (body_pos % ENCRYPTED_CHUNK_SIZE as u64) as usize;
                let sealed = self.sealed_chunk(index)?;
                let take = std::cmp::min(buf.len() - produced, sealed.len() - off);
                buf[produced..produced + take].copy_from_slice(&sealed[off..off + take]);
                take
            };
            produced += n;
            self.pos += n as u64;
        }
        Ok(produced)
    }
}

impl Seek for EncryptingReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta,
            SeekFrom::End(delta) => self.wire_size as i64 + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn light_cfg() -> KdfConfig {
        KdfConfig::generate_with_limits(1, 8).unwrap()
    }

    #[test]
    fn test_encrypting_reader_wire_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        let source = NativeFile::create_or_open(&path).unwrap();
        let content: Vec<u8> = (0..(DATA_CHUNK_SIZE + 100)).map(|i| (i % 251) as u8).collect();
        source.write_at(&content, 0).unwrap();

        let mut reader =
            EncryptingReader::with_config(source, "token", light_cfg(), StopToken::new()).unwrap();
        assert_eq!(reader.wire_size(), crypto::encrypted_size(content.len() as u64));

        let mut wire = Vec::new();
        reader.read_to_end(&mut wire).unwrap();
        assert_eq!(wire.len() as u64, reader.wire_size());

        // The stream decrypts back to the plaintext
        let cfg = KdfConfig::from_bytes(&wire[..KDF_HEADER_SIZE]).unwrap();
        let master = crypto::derive_master_key("token", &cfg).unwrap();
        let data_key = crypto::data_subkey(&master, &cfg.unique_id);

        let mut plain = Vec::new();
        let mut consumed = KDF_HEADER_SIZE;
        for idx in 0..total_chunks(content.len() as u64, DATA_CHUNK_SIZE) as u64 {
            let clen = chunk_wire_len(content.len() as u64, idx);
            let opened =
                crypto::decrypt_chunk(&data_key, &cfg.unique_id, idx, &wire[consumed..consumed + clen])
                    .unwrap();
            consumed += clen;
            plain.extend_from_slice(&opened);
        }
        assert_eq!(plain, content);
    }

    #[test]
    fn test_encrypting_reader_seek_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        let source = NativeFile::create_or_open(&path).unwrap();
        source.write_at(&vec![42u8; 4096], 0).unwrap();

        let mut reader =
            EncryptingReader::with_config(source, "token", light_cfg(), StopToken::new()).unwrap();

        let mut first = Vec::new();
        reader.read_to_end(&mut first).unwrap();

        reader.seek(SeekFrom::Start(0)).unwrap();
        let mut second = Vec::new();
        reader.read_to_end(&mut second).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_encrypting_reader_stop_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        let source = NativeFile::create_or_open(&path).unwrap();
        source.write_at(&[1u8; 64], 0).unwrap();

        let stop = StopToken::new();
        let mut reader =
            EncryptingReader::with_config(source, "token", light_cfg(), stop.clone()).unwrap();
        stop.stop();

        let mut buf = [0u8; 8];
        let err = reader.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
    }
}
