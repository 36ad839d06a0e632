//! Platform-uniform native file
//!
//! A thin wrapper over OS file descriptors providing positional reads and
//! writes, sparse allocation, and truncation. POSIX positional I/O
//! (`pread`/`pwrite`) is re-entrant; Windows positional I/O moves the file
//! pointer, so it is serialized by an internal mutex.
//!
//! Reads and writes loop until the full span is transferred or a hard error
//! occurs; a short read at EOF is reported as a short count, not an error.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};

#[cfg(windows)]
use parking_lot::Mutex;

/// Shared ownership of an already-open native file
pub type NativeFilePtr = Arc<NativeFile>;

/// Random-access local file
#[derive(Debug)]
pub struct NativeFile {
    file: File,
    path: PathBuf,
    #[cfg(windows)]
    pos_lock: Mutex<()>,
}

impl NativeFile {
    /// Open `path` read-write, creating it if missing
    pub fn create_or_open(path: &Path) -> ApiResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::attach(file, path))
    }

    /// Open an existing file
    pub fn open(path: &Path, read_only: bool) -> ApiResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(Self::attach(file, path))
    }

    fn attach(file: File, path: &Path) -> Self {
        Self {
            file,
            path: path.to_path_buf(),
            #[cfg(windows)]
            pos_lock: Mutex::new(()),
        }
    }

    /// Path this file was opened from
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read at `offset`, looping until `buf` is full or EOF
    ///
    /// Returns the number of bytes read; less than `buf.len()` only at EOF.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> ApiResult<usize> {
        let mut total = 0usize;
        while total < buf.len() {
            let n = self.read_at_once(&mut buf[total..], offset + total as u64)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Write at `offset`, looping until all of `buf` is written
    pub fn write_at(&self, buf: &[u8], offset: u64) -> ApiResult<usize> {
        let mut total = 0usize;
        while total < buf.len() {
            let n = self.write_at_once(&buf[total..], offset + total as u64)?;
            if n == 0 {
                return Err(ApiError::OsError);
            }
            total += n;
        }
        Ok(total)
    }

    #[cfg(unix)]
    fn read_at_once(&self, buf: &mut [u8], offset: u64) -> ApiResult<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.read_at(buf, offset)?)
    }

    #[cfg(unix)]
    fn write_at_once(&self, buf: &[u8], offset: u64) -> ApiResult<usize> {
        use std::os::unix::fs::FileExt;
        Ok(self.file.write_at(buf, offset)?)
    }

    #[cfg(windows)]
    fn read_at_once(&self, buf: &mut [u8], offset: u64) -> ApiResult<usize> {
        use std::os::windows::fs::FileExt;
        let _guard = self.pos_lock.lock();
        Ok(self.file.seek_read(buf, offset)?)
    }

    #[cfg(windows)]
    fn write_at_once(&self, buf: &[u8], offset: u64) -> ApiResult<usize> {
        use std::os::windows::fs::FileExt;
        let _guard = self.pos_lock.lock();
        Ok(self.file.seek_write(buf, offset)?)
    }

    /// Reserve `size` bytes of backing store, sparse where the OS allows
    #[cfg(target_os = "linux")]
    pub fn allocate(&self, size: u64) -> ApiResult<()> {
        use std::os::unix::io::AsRawFd;
        let res = unsafe { libc::fallocate(self.file.as_raw_fd(), 0, 0, size as libc::off_t) };
        if res != 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Reserve `size` bytes of backing store
    #[cfg(not(target_os = "linux"))]
    pub fn allocate(&self, size: u64) -> ApiResult<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    /// Extend or shrink the file to exactly `size` bytes
    pub fn truncate(&self, size: u64) -> ApiResult<()> {
        self.file.set_len(size)?;
        Ok(())
    }

    /// fsync
    pub fn flush(&self) -> ApiResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Current size in bytes
    pub fn size(&self) -> ApiResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}
