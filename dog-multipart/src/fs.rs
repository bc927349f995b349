//! Filesystem-backed blob and metadata stores.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hash::ContentHasher;
use crate::store::verify_content;
use crate::upload::HashUpdate;
use crate::{
    BlobStore, ByteStream, MultipartError, MultipartResult, PartRecord, UploadId,
    UploadMetadataStore, UploadRecord,
};

/// Blob store keeping one file per blob under a root directory.
///
/// Blob names map to relative paths, so `upl_x/3` becomes `<root>/upl_x/3`.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn new(root: impl Into<PathBuf>) -> MultipartResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> MultipartResult<PathBuf> {
        let relative = Path::new(name);
        let well_formed = !name.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !well_formed {
            return Err(MultipartError::invalid(format!("invalid blob name {:?}", name)));
        }
        Ok(self.root.join(relative))
    }

    async fn write_verified(
        &self,
        name: &str,
        tmp: &Path,
        mut body: ByteStream,
        size: u64,
        hash: &str,
    ) -> MultipartResult<()> {
        let mut file = tokio::fs::File::create(tmp).await?;
        let mut hasher = ContentHasher::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            if hasher.len() > size {
                break;
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        let actual_size = hasher.len();
        verify_content(name, size, hash, actual_size, &hasher.finalize())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, name: &str, body: ByteStream, size: u64, hash: &str) -> MultipartResult<()> {
        let path = self.path_for(name)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = temp_path(&path);
        if let Err(err) = self.write_verified(name, &tmp, body, size, hash).await {
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await {
                warn!("cannot remove temporary blob {:?}: {}", tmp, cleanup);
            }
            return Err(err);
        }
        tokio::fs::rename(&tmp, &path).await?;
        debug!("stored blob {:?} ({} bytes)", name, size);
        Ok(())
    }

    async fn open(&self, name: &str) -> MultipartResult<(ByteStream, u64)> {
        let path = self.path_for(name)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                return Err(MultipartError::blob_not_found(name))
            }
            Err(err) => return Err(err.into()),
        };
        let size = file.metadata().await?.len();
        Ok((Box::pin(ReaderStream::new(file)), size))
    }

    async fn remove(&self, name: &str) -> MultipartResult<()> {
        let path = self.path_for(name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(err) if err.kind() == IoErrorKind::NotFound => {
                return Err(MultipartError::blob_not_found(name))
            }
            Err(err) => return Err(err.into()),
        }
        // Drop the per-upload directory once its last part is gone.
        if let Some(parent) = path.parent() {
            if parent != self.root {
                let _ = tokio::fs::remove_dir(parent).await;
            }
        }
        Ok(())
    }
}

/// Metadata store keeping one JSON document per upload.
///
/// Documents are replaced atomically by renaming a temporary file over
/// them. Conditional updates are emulated with read-check-write under a
/// store-wide async mutex, so a single `FsUploadStore` instance must own
/// its directory.
#[derive(Debug, Clone)]
pub struct FsUploadStore {
    root: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FsUploadStore {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn new(root: impl Into<PathBuf>) -> MultipartResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn path_for(&self, upload_id: &UploadId) -> MultipartResult<PathBuf> {
        let id = upload_id.as_str();
        let well_formed = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !well_formed {
            return Err(MultipartError::invalid(format!("invalid upload id {:?}", id)));
        }
        Ok(self.root.join(format!("{}.json", id)))
    }

    async fn read(&self, upload_id: &UploadId) -> MultipartResult<Option<UploadRecord>> {
        read_record(&self.path_for(upload_id)?).await
    }

    async fn write(&self, record: &UploadRecord) -> MultipartResult<()> {
        let path = self.path_for(&record.id)?;
        let tmp = temp_path(&path);
        let data = serde_json::to_vec(record)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn delete(&self, upload_id: &UploadId) -> MultipartResult<()> {
        match tokio::fs::remove_file(self.path_for(upload_id)?).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == IoErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl UploadMetadataStore for FsUploadStore {
    async fn insert(&self, record: UploadRecord) -> MultipartResult<()> {
        let _guard = self.write_lock.lock().await;
        if self.read(&record.id).await?.is_some() {
            return Err(MultipartError::conflict(format!(
                "upload {} already exists",
                record.id
            )));
        }
        self.write(&record).await
    }

    async fn get(&self, upload_id: &UploadId) -> MultipartResult<Option<UploadRecord>> {
        self.read(upload_id).await
    }

    async fn init_part(&self, upload_id: &UploadId, index: u32, part: PartRecord) -> MultipartResult<bool> {
        let _guard = self.write_lock.lock().await;
        match self.read(upload_id).await? {
            Some(mut record) if !record.is_finished() && record.part(index).is_none() => {
                record.set_part(index, part);
                self.write(&record).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_part(&self, upload_id: &UploadId, index: u32, part: PartRecord) -> MultipartResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .read(upload_id)
            .await?
            .ok_or_else(|| MultipartError::upload_not_found(upload_id.as_str()))?;
        record.set_part(index, part);
        self.write(&record).await
    }

    async fn set_hash_if_absent(&self, upload_id: &UploadId, hash: &str) -> MultipartResult<HashUpdate> {
        let _guard = self.write_lock.lock().await;
        let mut record = self
            .read(upload_id)
            .await?
            .ok_or_else(|| MultipartError::upload_not_found(upload_id.as_str()))?;
        if let Some(existing) = record.hash {
            return Ok(HashUpdate::AlreadySet(existing));
        }
        record.hash = Some(hash.to_string());
        self.write(&record).await?;
        Ok(HashUpdate::Set)
    }

    async fn remove_if_unfinished(&self, upload_id: &UploadId) -> MultipartResult<Option<UploadRecord>> {
        let _guard = self.write_lock.lock().await;
        match self.read(upload_id).await? {
            Some(record) if !record.is_finished() => {
                self.delete(upload_id).await?;
                Ok(Some(record))
            }
            _ => Ok(None),
        }
    }

    async fn remove(&self, upload_id: &UploadId) -> MultipartResult<()> {
        let _guard = self.write_lock.lock().await;
        self.delete(upload_id).await
    }

    async fn expired(&self, now: DateTime<Utc>) -> MultipartResult<Vec<UploadRecord>> {
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut expired = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_record(&path).await {
                Ok(Some(record)) if record.is_expired(now) => expired.push(record),
                Ok(_) => {}
                Err(MultipartError::Serialization { source }) => {
                    warn!("skipping unreadable upload document {:?}: {}", path, source);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(expired)
    }
}

async fn read_record(path: &Path) -> MultipartResult<Option<UploadRecord>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
        Err(err) if err.kind() == IoErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Sibling path used while writing `path`; hidden and never ends in `.json`
fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}
