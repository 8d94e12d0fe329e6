//! Object-storage and record-store seams.
//!
//! The production deployment fronts a cloud bucket and a document database;
//! both are reduced here to the two traits the service actually needs, with
//! a filesystem-backed store for deployments that keep blobs on local disk
//! and an in-memory store used by tests.
//!
//! Blob layout:
//! - `snapshots/<recordId>` — JSON blob of a crawled snapshot
//! - `<prefix>/r<rev>/YYYY-MM-DD-<offset>.jsonl` — daily archive files

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ReaderError, Result};

/// One crawled-page record as the nightly batch sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawledRecord {
    pub id: String,
    pub created_at: DateTime<Utc>,
    /// Object name of the stored snapshot JSON blob
    pub snapshot_path: String,
}

/// Minimal object-storage surface
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn exists(&self, name: &str) -> Result<bool>;
    async fn put(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<()>;
    async fn put_file(&self, name: &str, path: &Path, content_type: &str) -> Result<()>;
    async fn get(&self, name: &str) -> Result<Vec<u8>>;
    /// Public URL for a stored object
    fn public_url(&self, name: &str) -> String;
}

/// Read-only view over crawled records, ordered by `created_at` ascending
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records with `created_at ∈ [from, to)`, ascending, paginated by
    /// numeric offset
    async fn list_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CrawledRecord>>;
}

// =============================================================================
// Filesystem object store
// =============================================================================

/// Object store rooted at a local directory; object names map to paths
pub struct FsObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into(),
        }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        // Object names are internal, but never let one escape the root.
        if name.split('/').any(|seg| seg == "..") {
            return Err(ReaderError::StorageFailure(format!(
                "object name escapes store root: {name}"
            )));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        Ok(tokio::fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))
            .map_err(|e| ReaderError::StorageFailure(format!("{e:#}")))?)
    }

    async fn put(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ReaderError::StorageFailure(format!("mkdir: {e}")))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ReaderError::StorageFailure(format!("write {}: {e}", path.display())))?;
        debug!(object = name, content_type, "stored object");
        Ok(())
    }

    async fn put_file(&self, name: &str, file: &Path, content_type: &str) -> Result<()> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ReaderError::StorageFailure(format!("mkdir: {e}")))?;
        }
        tokio::fs::copy(file, &path)
            .await
            .map_err(|e| ReaderError::StorageFailure(format!("copy {}: {e}", path.display())))?;
        debug!(object = name, content_type, "uploaded file");
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| ReaderError::StorageFailure(format!("read {}: {e}", path.display())))
    }

    fn public_url(&self, name: &str) -> String {
        format!("{}/{}", self.public_base_url.trim_end_matches('/'), name)
    }
}

// =============================================================================
// In-memory stores
// =============================================================================

/// Object store backed by a concurrent map; used in tests and dev runs
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: DashMap<String, (Vec<u8>, String)>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of every stored object, unordered
    pub fn object_names(&self) -> Vec<String> {
        self.objects.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.objects.contains_key(name))
    }

    async fn put(&self, name: &str, bytes: Vec<u8>, content_type: &str) -> Result<()> {
        self.objects
            .insert(name.to_string(), (bytes, content_type.to_string()));
        Ok(())
    }

    async fn put_file(&self, name: &str, path: &Path, content_type: &str) -> Result<()> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ReaderError::StorageFailure(format!("read {}: {e}", path.display())))?;
        self.put(name, bytes, content_type).await
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.objects
            .get(name)
            .map(|e| e.value().0.clone())
            .ok_or_else(|| ReaderError::StorageFailure(format!("no such object: {name}")))
    }

    fn public_url(&self, name: &str) -> String {
        format!("memory://{name}")
    }
}

/// Record store over a pre-sorted vector; used in tests
pub struct MemoryRecordStore {
    records: Vec<CrawledRecord>,
}

impl MemoryRecordStore {
    /// Records are sorted on construction so pagination is stable
    pub fn new(mut records: Vec<CrawledRecord>) -> Self {
        records.sort_by_key(|r| r.created_at);
        Self { records }
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn list_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CrawledRecord>> {
        Ok(self
            .records
            .iter()
            .filter(|r| r.created_at >= from && r.created_at < to)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Object name for a record's snapshot blob
pub fn snapshot_object_name(record_id: &str) -> String {
    format!("snapshots/{record_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_round_trips_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path(), "http://localhost/objects");
        store
            .put("snapshots/abc", b"{\"href\":\"x\"}".to_vec(), "application/json")
            .await
            .unwrap();
        assert!(store.exists("snapshots/abc").await.unwrap());
        assert!(!store.exists("snapshots/missing").await.unwrap());
        assert_eq!(store.get("snapshots/abc").await.unwrap(), b"{\"href\":\"x\"}");
        assert_eq!(
            store.public_url("snapshots/abc"),
            "http://localhost/objects/snapshots/abc"
        );
    }

    #[tokio::test]
    async fn fs_store_rejects_escaping_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path(), "http://localhost");
        assert!(store.get("../../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn memory_record_store_paginates_in_order() {
        let base = Utc::now();
        let records = (0..10)
            .map(|i| CrawledRecord {
                id: format!("r{i}"),
                created_at: base + chrono::Duration::seconds(i),
                snapshot_path: snapshot_object_name(&format!("r{i}")),
            })
            .rev()
            .collect();
        let store = MemoryRecordStore::new(records);
        let page = store
            .list_range(base, base + chrono::Duration::seconds(100), 3, 4)
            .await
            .unwrap();
        let ids: Vec<_> = page.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["r3", "r4", "r5", "r6"]);
    }
}
