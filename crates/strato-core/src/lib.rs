//! Strato Core - Shared types, configuration, native file I/O, and the
//! object encryption format
//!
//! This crate contains the foundational pieces used by the chunk-I/O engine.
//! It has no dependency on any concrete backend or on the mount glue.

pub mod config;
pub mod crypto;
pub mod error;
pub mod io;
pub mod path;
pub mod types;

pub use config::MountConfig;
pub use error::{ApiError, ApiResult};
pub use io::{NativeFile, NativeFilePtr};
pub use types::*;

/// Plaintext chunk size in bytes (1 MiB)
///
/// This is the unit of provider range I/O, of cache bookkeeping, and of the
/// encryption format's data chunks.
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Default number of chunks held by the ring-buffer strategy
pub const DEFAULT_RING_BUFFER_CHUNKS: usize = 512;

/// Hard cap on the ring-buffer chunk count
pub const MAX_RING_BUFFER_CHUNKS: usize = 1024;

/// Maximum filename length in bytes for a single path segment
pub const MAX_FILENAME_LEN: usize = 255;

/// Maximum api-path length in bytes
pub const MAX_PATH_LEN: usize = 4096;
