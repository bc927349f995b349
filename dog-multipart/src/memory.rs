//! In-memory blob and metadata stores, for tests and single-process use.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::RwLock;

use crate::hash::ContentHasher;
use crate::store::verify_content;
use crate::upload::HashUpdate;
use crate::{
    BlobStore, ByteStream, MultipartError, MultipartResult, PartRecord, UploadId,
    UploadMetadataStore, UploadRecord,
};

/// In-memory blob store
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<HashMap<String, Bytes>>>,
    opens: Arc<AtomicUsize>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.blobs.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Number of successful `open` calls so far
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, name: &str, mut body: ByteStream, size: u64, hash: &str) -> MultipartResult<()> {
        let mut hasher = ContentHasher::new();
        let mut data = BytesMut::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            data.extend_from_slice(&chunk);
            if hasher.len() > size {
                break;
            }
        }
        let actual_size = hasher.len();
        verify_content(name, size, hash, actual_size, &hasher.finalize())?;
        self.blobs.write().insert(name.to_string(), data.freeze());
        Ok(())
    }

    async fn open(&self, name: &str) -> MultipartResult<(ByteStream, u64)> {
        let data = self
            .blobs
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MultipartError::blob_not_found(name))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        let size = data.len() as u64;
        let stream = futures_util::stream::once(async move { Ok::<_, std::io::Error>(data) });
        Ok((Box::pin(stream), size))
    }

    async fn remove(&self, name: &str) -> MultipartResult<()> {
        self.blobs
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| MultipartError::blob_not_found(name))
    }
}

/// In-memory upload metadata store.
///
/// Every conditional operation runs under a single write guard, which makes
/// it atomic with respect to all other operations.
#[derive(Clone, Default)]
pub struct MemoryUploadStore {
    uploads: Arc<RwLock<HashMap<UploadId, UploadRecord>>>,
}

impl MemoryUploadStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.uploads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.uploads.read().is_empty()
    }

    /// Move an upload's expiry into the past (test helper)
    pub fn force_expiry(&self, upload_id: &UploadId) {
        if let Some(record) = self.uploads.write().get_mut(upload_id) {
            record.expires = Utc::now() - chrono::Duration::seconds(1);
        }
    }
}

#[async_trait]
impl UploadMetadataStore for MemoryUploadStore {
    async fn insert(&self, record: UploadRecord) -> MultipartResult<()> {
        let mut uploads = self.uploads.write();
        if uploads.contains_key(&record.id) {
            return Err(MultipartError::conflict(format!(
                "upload {} already exists",
                record.id
            )));
        }
        uploads.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, upload_id: &UploadId) -> MultipartResult<Option<UploadRecord>> {
        Ok(self.uploads.read().get(upload_id).cloned())
    }

    async fn init_part(&self, upload_id: &UploadId, index: u32, part: PartRecord) -> MultipartResult<bool> {
        let mut uploads = self.uploads.write();
        match uploads.get_mut(upload_id) {
            Some(record) if !record.is_finished() && record.part(index).is_none() => {
                record.set_part(index, part);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_part(&self, upload_id: &UploadId, index: u32, part: PartRecord) -> MultipartResult<()> {
        let mut uploads = self.uploads.write();
        let record = uploads
            .get_mut(upload_id)
            .ok_or_else(|| MultipartError::upload_not_found(upload_id.as_str()))?;
        record.set_part(index, part);
        Ok(())
    }

    async fn set_hash_if_absent(&self, upload_id: &UploadId, hash: &str) -> MultipartResult<HashUpdate> {
        let mut uploads = self.uploads.write();
        let record = uploads
            .get_mut(upload_id)
            .ok_or_else(|| MultipartError::upload_not_found(upload_id.as_str()))?;
        match &record.hash {
            Some(existing) => Ok(HashUpdate::AlreadySet(existing.clone())),
            None => {
                record.hash = Some(hash.to_string());
                Ok(HashUpdate::Set)
            }
        }
    }

    async fn remove_if_unfinished(&self, upload_id: &UploadId) -> MultipartResult<Option<UploadRecord>> {
        let mut uploads = self.uploads.write();
        let unfinished = uploads.get(upload_id).is_some_and(|record| !record.is_finished());
        if !unfinished {
            return Ok(None);
        }
        Ok(uploads.remove(upload_id))
    }

    async fn remove(&self, upload_id: &UploadId) -> MultipartResult<()> {
        self.uploads.write().remove(upload_id);
        Ok(())
    }

    async fn expired(&self, now: DateTime<Utc>) -> MultipartResult<Vec<UploadRecord>> {
        Ok(self
            .uploads
            .read()
            .values()
            .filter(|record| record.is_expired(now))
            .cloned()
            .collect())
    }
}
