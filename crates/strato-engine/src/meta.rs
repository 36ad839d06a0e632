//! Metadata store
//!
//! One embedded KV database with three tables: per-item meta maps, the
//! persisted upload queue, and resume records for partially downloaded
//! cached files. Rows are JSON documents keyed by api path; transactions
//! give single-process serializable read-your-writes.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use strato_core::{coerce_directory_meta, ApiError, ApiResult, MetaMap, UploadState};
use tracing::{debug, error};

const ITEM_META: TableDefinition<&str, &[u8]> = TableDefinition::new("item_meta");
const UPLOAD_QUEUE: TableDefinition<&str, &[u8]> = TableDefinition::new("upload_queue");
const RESUME: TableDefinition<&str, &[u8]> = TableDefinition::new("resume");

/// Persisted upload-queue entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub api_path: String,
    pub source_path: String,
    pub encryption_token: Option<String>,
    pub state: UploadState,
}

/// Persisted partial-download record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResumeRecord {
    pub api_path: String,
    pub source_path: String,
    pub chunk_size: usize,
    pub read_state: Vec<bool>,
}

pub struct MetaStore {
    db: Database,
}

fn store_err<E: std::fmt::Display>(err: E) -> ApiError {
    error!("meta store failure: {err}");
    ApiError::OsError
}

fn json_err<E: std::fmt::Display>(err: E) -> ApiError {
    error!("meta store row corrupt: {err}");
    ApiError::OsError
}

impl MetaStore {
    /// Open (or create) the store and make sure every table exists
    pub fn open(path: &Path) -> ApiResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(store_err)?;
        let txn = db.begin_write().map_err(store_err)?;
        {
            txn.open_table(ITEM_META).map_err(store_err)?;
            txn.open_table(UPLOAD_QUEUE).map_err(store_err)?;
            txn.open_table(RESUME).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)?;
        debug!(?path, "meta store open");
        Ok(Self { db })
    }

    fn get_raw(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> ApiResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(table).map_err(store_err)?;
        Ok(table
            .get(key)
            .map_err(store_err)?
            .map(|guard| guard.value().to_vec()))
    }

    fn put_raw(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> ApiResult<()> {
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(table).map_err(store_err)?;
            table.insert(key, value).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)
    }

    fn remove_raw(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> ApiResult<()> {
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(table).map_err(store_err)?;
            table.remove(key).map_err(store_err)?;
        }
        txn.commit().map_err(store_err)
    }

    fn rename_raw(
        &self,
        table: TableDefinition<&str, &[u8]>,
        from: &str,
        to: &str,
    ) -> ApiResult<()> {
        let txn = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = txn.open_table(table).map_err(store_err)?;
            let value = table
                .remove(from)
                .map_err(store_err)?
                .map(|guard| guard.value().to_vec());
            if let Some(value) = value {
                table.insert(to, value.as_slice()).map_err(store_err)?;
            }
        }
        txn.commit().map_err(store_err)
    }

    fn load_all<T: for<'de> Deserialize<'de>>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> ApiResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(table).map_err(store_err)?;
        let mut out = Vec::new();
        for row in table.iter().map_err(store_err)? {
            let (_, value) = row.map_err(store_err)?;
            out.push(serde_json::from_slice(value.value()).map_err(json_err)?);
        }
        Ok(out)
    }

    // --- item meta ---

    pub fn get_item_meta(&self, api_path: &str) -> ApiResult<Option<MetaMap>> {
        match self.get_raw(ITEM_META, api_path)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).map_err(json_err)?)),
            None => Ok(None),
        }
    }

    pub fn set_item_meta(&self, api_path: &str, meta: &MetaMap) -> ApiResult<()> {
        let mut meta = meta.clone();
        coerce_directory_meta(&mut meta);
        let raw = serde_json::to_vec(&meta).map_err(json_err)?;
        self.put_raw(ITEM_META, api_path, &raw)
    }

    /// Merge a single key into an item's meta map
    pub fn update_item_meta(&self, api_path: &str, key: &str, value: &str) -> ApiResult<()> {
        let mut meta = self.get_item_meta(api_path)?.unwrap_or_default();
        meta.insert(key.to_owned(), value.to_owned());
        self.set_item_meta(api_path, &meta)
    }

    pub fn remove_item_meta(&self, api_path: &str) -> ApiResult<()> {
        self.remove_raw(ITEM_META, api_path)
    }

    pub fn rename_item_meta(&self, from: &str, to: &str) -> ApiResult<()> {
        self.rename_raw(ITEM_META, from, to)
    }

    /// Every api path with a meta row
    pub fn item_meta_paths(&self) -> ApiResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(store_err)?;
        let table = txn.open_table(ITEM_META).map_err(store_err)?;
        let mut out = Vec::new();
        for row in table.iter().map_err(store_err)? {
            let (key, _) = row.map_err(store_err)?;
            out.push(key.value().to_owned());
        }
        Ok(out)
    }

    // --- upload queue ---

    pub fn put_upload(&self, record: &UploadRecord) -> ApiResult<()> {
        let raw = serde_json::to_vec(record).map_err(json_err)?;
        self.put_raw(UPLOAD_QUEUE, &record.api_path, &raw)
    }

    pub fn get_upload(&self, api_path: &str) -> ApiResult<Option<UploadRecord>> {
        match self.get_raw(UPLOAD_QUEUE, api_path)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).map_err(json_err)?)),
            None => Ok(None),
        }
    }

    pub fn remove_upload(&self, api_path: &str) -> ApiResult<()> {
        self.remove_raw(UPLOAD_QUEUE, api_path)
    }

    pub fn rename_upload(&self, from: &str, to: &str) -> ApiResult<()> {
        if let Some(mut record) = self.get_upload(from)? {
            record.api_path = to.to_owned();
            self.remove_upload(from)?;
            self.put_upload(&record)?;
        }
        Ok(())
    }

    /// Queued and in-flight uploads persisted from the previous run;
    /// entries that were mid-upload come back first
    pub fn load_uploads(&self) -> ApiResult<Vec<UploadRecord>> {
        let mut records: Vec<UploadRecord> = self.load_all(UPLOAD_QUEUE)?;
        records.retain(|r| matches!(r.state, UploadState::Queued | UploadState::Active));
        records.sort_by_key(|r| match r.state {
            UploadState::Active => 0,
            _ => 1,
        });
        Ok(records)
    }

    // --- resume records ---

    pub fn put_resume(&self, record: &ResumeRecord) -> ApiResult<()> {
        let raw = serde_json::to_vec(record).map_err(json_err)?;
        self.put_raw(RESUME, &record.api_path, &raw)
    }

    pub fn get_resume(&self, api_path: &str) -> ApiResult<Option<ResumeRecord>> {
        match self.get_raw(RESUME, api_path)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).map_err(json_err)?)),
            None => Ok(None),
        }
    }

    pub fn remove_resume(&self, api_path: &str) -> ApiResult<()> {
        self.remove_raw(RESUME, api_path)
    }

    pub fn rename_resume(&self, from: &str, to: &str) -> ApiResult<()> {
        if let Some(mut record) = self.get_resume(from)? {
            record.api_path = to.to_owned();
            self.remove_resume(from)?;
            self.put_resume(&record)?;
        }
        Ok(())
    }

    pub fn load_resume(&self) -> ApiResult<Vec<ResumeRecord>> {
        self.load_all(RESUME)
    }
}
