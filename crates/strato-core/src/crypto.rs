//! Object encryption format
//!
//! Encrypted objects are laid out as a fixed KDF header followed by sealed
//! chunks:
//!
//! ```text
//! [ KDF header ] [ chunk 0: nonce(24) | ct | tag(16) ] ... [ chunk N-1 ]
//! ```
//!
//! The header carries the Argon2id parameters, a random salt, and a random
//! unique id. A 256-bit master key is derived from `(token, salt, params)`;
//! two independent subkeys are derived from it with keyed BLAKE2b, one for
//! path names and one for data. Each data chunk is sealed with
//! XChaCha20-Poly1305 under a per-chunk key; the nonce is generated fresh at
//! write time and stored inline.
//!
//! A reader that knows only the token and the size on the wire can recover
//! the plaintext size; see [`decrypted_size`].

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::Blake2bMac;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

use crate::error::{ApiError, ApiResult};
use crate::{path, CHUNK_SIZE};

/// Plaintext bytes per sealed chunk
pub const DATA_CHUNK_SIZE: usize = CHUNK_SIZE;

/// XChaCha20-Poly1305 nonce length
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag length
pub const TAG_SIZE: usize = 16;

/// Wire bytes per sealed chunk
pub const ENCRYPTED_CHUNK_SIZE: usize = DATA_CHUNK_SIZE + NONCE_SIZE + TAG_SIZE;

/// Serialized KDF header length
pub const KDF_HEADER_SIZE: usize = 4 + 1 + 4 + 4 + SALT_SIZE + UNIQUE_ID_SIZE;

pub const SALT_SIZE: usize = 16;
pub const UNIQUE_ID_SIZE: usize = 8;

const HEADER_MAGIC: [u8; 4] = *b"SKF1";
const ALG_ARGON2ID: u8 = 1;

const CONTEXT_DATA: &[u8] = b"strato.data";
const CONTEXT_PATH: &[u8] = b"strato.path";

/// 256-bit key
pub type Key256 = [u8; 32];

type KeyedBlake2b = Blake2bMac<U32>;

/// Argon2id parameters plus the per-object salt and unique id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfConfig {
    pub salt: [u8; SALT_SIZE],
    /// Argon2 iteration count
    pub opslimit: u32,
    /// Argon2 memory cost in KiB
    pub memlimit: u32,
    pub alg_id: u8,
    pub unique_id: [u8; UNIQUE_ID_SIZE],
}

impl KdfConfig {
    /// Fresh config with interactive-strength defaults
    pub fn generate() -> ApiResult<Self> {
        Self::generate_with_limits(3, 64 * 1024)
    }

    /// Fresh config with explicit cost parameters
    pub fn generate_with_limits(opslimit: u32, memlimit: u32) -> ApiResult<Self> {
        let mut salt = [0u8; SALT_SIZE];
        let mut unique_id = [0u8; UNIQUE_ID_SIZE];
        getrandom::getrandom(&mut salt).map_err(|_| ApiError::OsError)?;
        getrandom::getrandom(&mut unique_id).map_err(|_| ApiError::OsError)?;
        Ok(Self {
            salt,
            opslimit,
            memlimit,
            alg_id: ALG_ARGON2ID,
            unique_id,
        })
    }

    /// Fixed-layout serialization, always [`KDF_HEADER_SIZE`] bytes
    pub fn to_bytes(&self) -> [u8; KDF_HEADER_SIZE] {
        let mut out = [0u8; KDF_HEADER_SIZE];
        out[..4].copy_from_slice(&HEADER_MAGIC);
        out[4] = self.alg_id;
        out[5..9].copy_from_slice(&self.opslimit.to_le_bytes());
        out[9..13].copy_from_slice(&self.memlimit.to_le_bytes());
        out[13..13 + SALT_SIZE].copy_from_slice(&self.salt);
        out[13 + SALT_SIZE..].copy_from_slice(&self.unique_id);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> ApiResult<Self> {
        if bytes.len() < KDF_HEADER_SIZE || bytes[..4] != HEADER_MAGIC {
            return Err(ApiError::InvalidVersion);
        }
        let alg_id = bytes[4];
        if alg_id != ALG_ARGON2ID {
            return Err(ApiError::InvalidVersion);
        }
        let mut opslimit = [0u8; 4];
        let mut memlimit = [0u8; 4];
        opslimit.copy_from_slice(&bytes[5..9]);
        memlimit.copy_from_slice(&bytes[9..13]);
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[13..13 + SALT_SIZE]);
        let mut unique_id = [0u8; UNIQUE_ID_SIZE];
        unique_id.copy_from_slice(&bytes[13 + SALT_SIZE..KDF_HEADER_SIZE]);
        Ok(Self {
            salt,
            opslimit: u32::from_le_bytes(opslimit),
            memlimit: u32::from_le_bytes(memlimit),
            alg_id,
            unique_id,
        })
    }
}

/// Derive the 256-bit master key from a token and a KDF config
pub fn derive_master_key(token: &str, cfg: &KdfConfig) -> ApiResult<Key256> {
    let params = Params::new(cfg.memlimit, cfg.opslimit, 1, Some(32))
        .map_err(|_| ApiError::InvalidOperation)?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(token.as_bytes(), &cfg.salt, &mut key)
        .map_err(|_| ApiError::InvalidOperation)?;
    Ok(key)
}

fn keyed_hash(key: &[u8], parts: &[&[u8]]) -> Key256 {
    // Key length is always 32 here, well under the BLAKE2b limit
    let mut mac = <KeyedBlake2b as KeyInit>::new_from_slice(key).expect("BLAKE2b key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Subkey used for sealing data chunks
pub fn data_subkey(master: &Key256, unique_id: &[u8; UNIQUE_ID_SIZE]) -> Key256 {
    keyed_hash(master, &[CONTEXT_DATA, unique_id])
}

/// Subkey used for path-name encryption
pub fn path_subkey(master: &Key256, unique_id: &[u8; UNIQUE_ID_SIZE]) -> Key256 {
    keyed_hash(master, &[CONTEXT_PATH, unique_id])
}

/// Per-chunk key from the data subkey
fn chunk_key(data_key: &Key256, unique_id: &[u8; UNIQUE_ID_SIZE], index: u64) -> Key256 {
    keyed_hash(data_key, &[unique_id, &index.to_le_bytes()])
}

/// Seal one plaintext chunk; output is `nonce ‖ ct ‖ tag`
pub fn encrypt_chunk(
    data_key: &Key256,
    unique_id: &[u8; UNIQUE_ID_SIZE],
    index: u64,
    plaintext: &[u8],
) -> ApiResult<Vec<u8>> {
    let mut nonce = [0u8; NONCE_SIZE];
    getrandom::getrandom(&mut nonce).map_err(|_| ApiError::OsError)?;
    encrypt_chunk_with_nonce(data_key, unique_id, index, &nonce, plaintext)
}

/// Seal one plaintext chunk under a caller-chosen nonce
pub fn encrypt_chunk_with_nonce(
    data_key: &Key256,
    unique_id: &[u8; UNIQUE_ID_SIZE],
    index: u64,
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
) -> ApiResult<Vec<u8>> {
    let key = chunk_key(data_key, unique_id, index);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    let ct = cipher
        .encrypt(XNonce::from_slice(nonce), plaintext)
        .map_err(|_| ApiError::DecryptionError)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + ct.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(&ct);
    Ok(out)
}

/// Open one sealed chunk
///
/// A tag failure yields `DecryptionError`; no partial plaintext is ever
/// returned for a failed chunk.
pub fn decrypt_chunk(
    data_key: &Key256,
    unique_id: &[u8; UNIQUE_ID_SIZE],
    index: u64,
    wire: &[u8],
) -> ApiResult<Vec<u8>> {
    if wire.len() < NONCE_SIZE + TAG_SIZE {
        return Err(ApiError::DecryptionError);
    }
    let key = chunk_key(data_key, unique_id, index);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
    cipher
        .decrypt(XNonce::from_slice(&wire[..NONCE_SIZE]), &wire[NONCE_SIZE..])
        .map_err(|_| ApiError::DecryptionError)
}

/// Wire size of an encrypted object holding `plain_size` plaintext bytes
pub fn encrypted_size(plain_size: u64) -> u64 {
    let chunks = crate::types::total_chunks(plain_size, DATA_CHUNK_SIZE) as u64;
    KDF_HEADER_SIZE as u64 + plain_size + chunks * (NONCE_SIZE + TAG_SIZE) as u64
}

/// Plaintext size of an encrypted object of `wire_size` bytes
pub fn decrypted_size(wire_size: u64) -> ApiResult<u64> {
    if wire_size < KDF_HEADER_SIZE as u64 {
        return Err(ApiError::FileSizeMismatch);
    }
    let body = wire_size - KDF_HEADER_SIZE as u64;
    let chunks = crate::types::total_chunks(body, ENCRYPTED_CHUNK_SIZE) as u64;
    let overhead = chunks * (NONCE_SIZE + TAG_SIZE) as u64;
    if body < overhead {
        return Err(ApiError::FileSizeMismatch);
    }
    Ok(body - overhead)
}

/// Wire offset of sealed chunk `index`
pub fn chunk_wire_offset(index: u64) -> u64 {
    KDF_HEADER_SIZE as u64 + index * ENCRYPTED_CHUNK_SIZE as u64
}

/// Wire length of sealed chunk `index` for a `plain_size`-byte object
pub fn chunk_wire_len(plain_size: u64, index: u64) -> usize {
    let plain = crate::types::chunk_len(plain_size, DATA_CHUNK_SIZE, index as usize);
    if plain == 0 {
        0
    } else {
        plain + NONCE_SIZE + TAG_SIZE
    }
}

/// Encrypt a single path segment
///
/// The nonce is derived deterministically from the path subkey and the
/// segment, so a given name always encrypts to the same stable string; it
/// is still stored inline so decryption never re-derives it.
pub fn encrypt_segment(path_key: &Key256, segment: &str) -> ApiResult<String> {
    let derived = keyed_hash(path_key, &[b"segment-nonce", segment.as_bytes()]);
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&derived[..NONCE_SIZE]);

    let cipher = XChaCha20Poly1305::new(Key::from_slice(path_key));
    let ct = cipher
        .encrypt(XNonce::from_slice(&nonce), segment.as_bytes())
        .map_err(|_| ApiError::DecryptionError)?;

    let mut wire = Vec::with_capacity(NONCE_SIZE + ct.len());
    wire.extend_from_slice(&nonce);
    wire.extend_from_slice(&ct);
    Ok(URL_SAFE_NO_PAD.encode(wire))
}

/// Decrypt a single path segment produced by [`encrypt_segment`]
pub fn decrypt_segment(path_key: &Key256, encoded: &str) -> ApiResult<String> {
    let wire = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| ApiError::DecryptionError)?;
    if wire.len() < NONCE_SIZE + TAG_SIZE {
        return Err(ApiError::DecryptionError);
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(path_key));
    let plain = cipher
        .decrypt(XNonce::from_slice(&wire[..NONCE_SIZE]), &wire[NONCE_SIZE..])
        .map_err(|_| ApiError::DecryptionError)?;
    String::from_utf8(plain).map_err(|_| ApiError::DecryptionError)
}

/// Encrypt every segment of an api path; root is never encrypted
pub fn encrypt_api_path(path_key: &Key256, api_path: &str) -> ApiResult<String> {
    if api_path == "/" {
        return Ok("/".to_owned());
    }
    let mut out = String::new();
    for segment in path::segments(api_path) {
        out.push('/');
        out.push_str(&encrypt_segment(path_key, segment)?);
    }
    Ok(out)
}

/// Inverse of [`encrypt_api_path`]
pub fn decrypt_api_path(path_key: &Key256, api_path: &str) -> ApiResult<String> {
    if api_path == "/" {
        return Ok("/".to_owned());
    }
    let mut out = String::new();
    for segment in path::segments(api_path) {
        out.push('/');
        out.push_str(&decrypt_segment(path_key, segment)?);
    }
    Ok(out)
}
