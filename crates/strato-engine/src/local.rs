//! Local-directory reference backend
//!
//! Stores objects as ordinary files under a root directory and
//! pseudo-directories as real directories. This is the backend the test
//! suite runs against; it implements every optional capability including
//! rename.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use strato_core::{
    path as api_path_util, time_to_ticks, ApiError, ApiFile, ApiResult, MetaMap, NativeFile,
    StopToken,
};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::provider::Provider;

/// How many bytes to move per copy step so the stop token stays responsive
const COPY_BLOCK: usize = 256 * 1024;

/// Filesystem-backed object store
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> ApiResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, api_path: &str) -> PathBuf {
        let mut out = self.root.clone();
        for segment in api_path_util::segments(api_path) {
            out.push(segment);
        }
        out
    }

    fn api_file_for(&self, api_path: &str, meta: &fs::Metadata) -> ApiFile {
        let modified = meta.modified().map(time_to_ticks).unwrap_or(0);
        let accessed = meta.accessed().map(time_to_ticks).unwrap_or(modified);
        let created = meta.created().map(time_to_ticks).unwrap_or(modified);

        ApiFile {
            api_path: api_path.to_owned(),
            api_parent: api_path_util::parent_of(api_path),
            directory: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            accessed,
            changed: modified,
            created,
            modified,
            encryption_token: None,
            key: api_path.trim_start_matches('/').to_owned(),
        }
    }

    fn dir_size(path: &Path) -> u64 {
        let Ok(entries) = fs::read_dir(path) else {
            return 0;
        };
        entries
            .flatten()
            .map(|entry| match entry.metadata() {
                Ok(meta) if meta.is_dir() => Self::dir_size(&entry.path()),
                Ok(meta) => meta.len(),
                Err(_) => 0,
            })
            .sum()
    }
}

impl Provider for LocalProvider {
    fn list_directory(&self, api_path: &str) -> ApiResult<Vec<ApiFile>> {
        let dir = self.resolve(api_path);
        let meta = fs::metadata(&dir).map_err(|_| ApiError::DirectoryNotFound)?;
        if !meta.is_dir() {
            return Err(ApiError::ItemExists);
        }

        let mut out = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let child = api_path_util::combine(api_path, name);
            out.push(self.api_file_for(&child, &entry.metadata()?));
        }
        out.sort_by(|a, b| a.api_path.cmp(&b.api_path));
        Ok(out)
    }

    fn stat(&self, api_path: &str) -> ApiResult<ApiFile> {
        let meta = fs::metadata(self.resolve(api_path)).map_err(|_| ApiError::ItemNotFound)?;
        Ok(self.api_file_for(api_path, &meta))
    }

    fn read_range(
        &self,
        api_path: &str,
        _key: &str,
        offset: u64,
        len: usize,
        out: &mut Vec<u8>,
        stop: &StopToken,
    ) -> ApiResult<()> {
        out.clear();
        if len == 0 {
            return Ok(());
        }

        let file = NativeFile::open(&self.resolve(api_path), true)?;
        out.resize(len, 0);

        let mut done = 0usize;
        while done < len {
            if stop.is_stopped() {
                return Err(ApiError::DownloadStopped);
            }
            let take = std::cmp::min(COPY_BLOCK, len - done);
            let n = file.read_at(&mut out[done..done + take], offset + done as u64)?;
            if n == 0 {
                return Err(ApiError::FileSizeMismatch);
            }
            done += n;
        }
        trace!(api_path, offset, len, "range read");
        Ok(())
    }

    fn create_object(&self, api_path: &str, _meta: &MetaMap) -> ApiResult<()> {
        let path = self.resolve(api_path);
        let parent = path.parent().ok_or(ApiError::DirectoryNotFound)?;
        if !parent.is_dir() {
            return Err(ApiError::DirectoryNotFound);
        }
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => {
                debug!(api_path, "object created");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(ApiError::ItemExists),
            Err(e) => Err(e.into()),
        }
    }

    fn create_pseudo_directory(&self, api_path: &str, _meta: &MetaMap) -> ApiResult<()> {
        let path = self.resolve(api_path);
        if path.exists() {
            return Err(ApiError::DirectoryExists);
        }
        fs::create_dir(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ApiError::DirectoryNotFound,
            _ => e.into(),
        })
    }

    fn replace_object(
        &self,
        api_path: &str,
        _key: &str,
        source: &mut dyn Read,
        size: u64,
        stop: &StopToken,
    ) -> ApiResult<()> {
        let path = self.resolve(api_path);
        let parent = path.parent().ok_or(ApiError::DirectoryNotFound)?;
        if !parent.is_dir() {
            return Err(ApiError::DirectoryNotFound);
        }

        // Land in a temp file first so a cancelled upload never clobbers
        // the existing object
        let tmp = parent.join(format!(".upload-{}", Uuid::new_v4()));
        let result = (|| -> ApiResult<()> {
            let mut out = fs::File::create(&tmp)?;
            let mut block = vec![0u8; COPY_BLOCK];
            let mut written = 0u64;
            loop {
                if stop.is_stopped() {
                    return Err(ApiError::DownloadStopped);
                }
                let n = source.read(&mut block).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::Interrupted {
                        ApiError::DownloadStopped
                    } else {
                        ApiError::CommError
                    }
                })?;
                if n == 0 {
                    break;
                }
                std::io::Write::write_all(&mut out, &block[..n])?;
                written += n as u64;
            }
            if written != size {
                return Err(ApiError::FileSizeMismatch);
            }
            out.sync_all()?;
            fs::rename(&tmp, &path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        } else {
            debug!(api_path, size, "object replaced");
        }
        result
    }

    fn remove(&self, api_path: &str, _key: &str) -> ApiResult<()> {
        let path = self.resolve(api_path);
        let meta = match fs::metadata(&path) {
            Ok(meta) => meta,
            // Idempotent on missing items
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            fs::remove_dir(&path).map_err(|e| {
                if e.raw_os_error() == Some(libc::ENOTEMPTY) {
                    ApiError::DirectoryNotEmpty
                } else {
                    e.into()
                }
            })
        } else {
            fs::remove_file(&path).map_err(Into::into)
        }
    }

    fn rename(&self, from: &str, to: &str) -> ApiResult<()> {
        let src = self.resolve(from);
        if !src.exists() {
            return Err(ApiError::ItemNotFound);
        }
        let dst = self.resolve(to);
        let parent = dst.parent().ok_or(ApiError::DirectoryNotFound)?;
        if !parent.is_dir() {
            return Err(ApiError::DirectoryNotFound);
        }
        fs::rename(&src, &dst)?;
        debug!(from, to, "object renamed");
        Ok(())
    }

    fn is_online(&self) -> bool {
        self.root.is_dir()
    }

    fn get_total_space(&self) -> u64 {
        1 << 40
    }

    fn get_used_space(&self) -> u64 {
        Self::dir_size(&self.root)
    }

    fn is_rename_supported(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> (tempfile::TempDir, LocalProvider) {
        let dir = tempfile::tempdir().unwrap();
        let provider = LocalProvider::new(dir.path().join("objects")).unwrap();
        (dir, provider)
    }

    #[test]
    fn test_create_stat_remove() {
        let (_dir, provider) = provider();

        provider.create_object("/a", &MetaMap::new()).unwrap();
        let file = provider.stat("/a").unwrap();
        assert!(!file.directory);
        assert_eq!(file.size, 0);
        assert_eq!(file.api_parent, "/");

        assert_eq!(
            provider.create_object("/a", &MetaMap::new()),
            Err(ApiError::ItemExists)
        );

        provider.remove("/a", "a").unwrap();
        assert_eq!(provider.stat("/a"), Err(ApiError::ItemNotFound));
        // Idempotent
        provider.remove("/a", "a").unwrap();
    }

    #[test]
    fn test_list_directory() {
        let (_dir, provider) = provider();

        provider
            .create_pseudo_directory("/docs", &MetaMap::new())
            .unwrap();
        provider.create_object("/docs/a", &MetaMap::new()).unwrap();
        provider.create_object("/docs/b", &MetaMap::new()).unwrap();

        let entries = provider.list_directory("/docs").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].api_path, "/docs/a");
        assert_eq!(entries[1].api_path, "/docs/b");

        assert_eq!(
            provider.list_directory("/missing"),
            Err(ApiError::DirectoryNotFound)
        );
        assert_eq!(
            provider.list_directory("/docs/a"),
            Err(ApiError::ItemExists)
        );
    }

    #[test]
    fn test_replace_and_read_range() {
        let (_dir, provider) = provider();
        provider.create_object("/data", &MetaMap::new()).unwrap();

        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 256) as u8).collect();
        let mut cursor = std::io::Cursor::new(content.clone());
        provider
            .replace_object("/data", "data", &mut cursor, content.len() as u64, &StopToken::new())
            .unwrap();

        assert_eq!(provider.stat("/data").unwrap().size, content.len() as u64);

        let mut out = Vec::new();
        provider
            .read_range("/data", "data", 100, 64, &mut out, &StopToken::new())
            .unwrap();
        assert_eq!(out, &content[100..164]);
    }

    #[test]
    fn test_read_range_honours_stop() {
        let (_dir, provider) = provider();
        provider.create_object("/data", &MetaMap::new()).unwrap();
        let mut cursor = std::io::Cursor::new(vec![0u8; 1024]);
        provider
            .replace_object("/data", "data", &mut cursor, 1024, &StopToken::new())
            .unwrap();

        let stop = StopToken::new();
        stop.stop();
        let mut out = Vec::new();
        assert_eq!(
            provider.read_range("/data", "data", 0, 1024, &mut out, &stop),
            Err(ApiError::DownloadStopped)
        );
    }

    #[test]
    fn test_rename() {
        let (_dir, provider) = provider();
        provider.create_object("/a", &MetaMap::new()).unwrap();

        assert!(provider.is_rename_supported());
        provider.rename("/a", "/b").unwrap();
        assert_eq!(provider.stat("/a"), Err(ApiError::ItemNotFound));
        assert!(provider.stat("/b").is_ok());
    }

    #[test]
    fn test_remove_non_empty_directory() {
        let (_dir, provider) = provider();
        provider
            .create_pseudo_directory("/d", &MetaMap::new())
            .unwrap();
        provider.create_object("/d/a", &MetaMap::new()).unwrap();

        assert_eq!(provider.remove("/d", "d"), Err(ApiError::DirectoryNotEmpty));
    }

    #[test]
    fn test_failed_replace_preserves_object() {
        let (_dir, provider) = provider();
        provider.create_object("/data", &MetaMap::new()).unwrap();
        let mut cursor = std::io::Cursor::new(vec![7u8; 100]);
        provider
            .replace_object("/data", "data", &mut cursor, 100, &StopToken::new())
            .unwrap();

        // Source claims more bytes than it yields
        let mut short = std::io::Cursor::new(vec![9u8; 10]);
        assert_eq!(
            provider.replace_object("/data", "data", &mut short, 100, &StopToken::new()),
            Err(ApiError::FileSizeMismatch)
        );

        let mut out = Vec::new();
        provider
            .read_range("/data", "data", 0, 100, &mut out, &StopToken::new())
            .unwrap();
        assert_eq!(out, vec![7u8; 100]);
    }
}
