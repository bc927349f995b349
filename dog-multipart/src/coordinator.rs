use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::hash::{normalize_hash, ContentHasher};
use crate::upload::HashUpdate;
use crate::{
    BlobStore, ByteStream, DefaultPartKeys, FinishedUpload, MultipartConfig, MultipartError,
    MultipartIndex, MultipartResult, Part, PartKeyStrategy, PartRecord, UploadCoordinator,
    UploadId, UploadInfo, UploadMetadataStore, UploadRecord,
};

/// Upload coordinator backed by a blob store for part content and a
/// metadata store for upload records.
///
/// Holds no lock of its own: concurrent calls for the same upload are
/// coordinated only through the metadata store's conditional writes.
pub struct DefaultUploadCoordinator {
    pub(crate) blobs: Arc<dyn BlobStore>,
    pub(crate) uploads: Arc<dyn UploadMetadataStore>,
    pub(crate) keys: Arc<dyn PartKeyStrategy>,
    pub(crate) config: MultipartConfig,
}

/// What `put_part` still has to do once the part slot has been claimed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PartSlot {
    /// Content must be (re)written
    Pending,
    /// Identical part already stored
    Complete,
}

impl DefaultUploadCoordinator {
    pub fn new<B, U>(blobs: B, uploads: U, config: MultipartConfig) -> Self
    where
        B: BlobStore + 'static,
        U: UploadMetadataStore + 'static,
    {
        Self::with_key_strategy(blobs, uploads, DefaultPartKeys, config)
    }

    /// Create with a custom part naming strategy
    pub fn with_key_strategy<B, U, K>(blobs: B, uploads: U, keys: K, config: MultipartConfig) -> Self
    where
        B: BlobStore + 'static,
        U: UploadMetadataStore + 'static,
        K: PartKeyStrategy + 'static,
    {
        Self {
            blobs: Arc::new(blobs),
            uploads: Arc::new(uploads),
            keys: Arc::new(keys),
            config,
        }
    }

    /// Get configuration
    pub fn config(&self) -> &MultipartConfig {
        &self.config
    }

    pub(crate) fn part_key(&self, upload_id: &UploadId, index: u32) -> String {
        self.keys.part_key(upload_id, index)
    }

    async fn load(&self, upload_id: &UploadId) -> MultipartResult<UploadRecord> {
        self.uploads
            .get(upload_id)
            .await
            .map_err(|e| e.with_context(format!("cannot get upload id {:?}", upload_id.as_str())))?
            .ok_or_else(|| MultipartError::upload_not_found(upload_id.as_str()))
    }

    fn check_part_limits(&self, index: u32, size: u64) -> MultipartResult<()> {
        if index >= self.config.max_parts {
            return Err(MultipartError::invalid(format!(
                "part number {} too big (maximum {})",
                index,
                self.config.max_parts.saturating_sub(1)
            )));
        }
        if size == 0 {
            return Err(MultipartError::invalid(format!("non-positive part {} size {}", index, size)));
        }
        if size >= self.config.max_part_size {
            return Err(MultipartError::invalid(format!(
                "part {} too big (maximum {})",
                index, self.config.max_part_size
            )));
        }
        Ok(())
    }

    /// Make sure a record for the part exists before its content is written,
    /// so that removal knows to delete the blob.
    async fn claim_part(
        &self,
        record: &UploadRecord,
        index: u32,
        hash: &str,
        size: u64,
    ) -> MultipartResult<PartSlot> {
        if let Some(existing) = record.part(index) {
            return existing_slot(existing, index, hash, size);
        }
        if record.is_finished() {
            return Err(MultipartError::conflict(
                "cannot upload new part because upload is already complete",
            ));
        }
        let placeholder = PartRecord::initialized(hash, size);
        if self.uploads.init_part(&record.id, index, placeholder).await? {
            debug!("initialized part record");
            return Ok(PartSlot::Pending);
        }

        // Someone changed the record under us; see what they did.
        warn!("lost race initializing part record");
        let current = self.load(&record.id).await?;
        match current.part(index) {
            Some(existing) => existing_slot(existing, index, hash, size),
            None if current.is_finished() => Err(MultipartError::conflict(
                "cannot upload new part because upload is already complete",
            )),
            None => Err(MultipartError::conflict(
                "cannot update initial part record - concurrent upload of the same part?",
            )),
        }
    }

    /// Hash of the whole object, committed to the record if not already set
    async fn commit_hash(&self, record: &UploadRecord) -> MultipartResult<String> {
        if let Some(hash) = &record.hash {
            return Ok(hash.clone());
        }
        let hash = match record.parts.as_slice() {
            // A single part already carries the hash of the whole thing.
            [Some(only)] => only.hash.clone(),
            _ => self.hash_parts(record).await?,
        };
        match self.uploads.set_hash_if_absent(&record.id, &hash).await {
            Ok(HashUpdate::Set) => Ok(hash),
            Ok(HashUpdate::AlreadySet(existing)) => {
                debug!("upload was finished concurrently");
                Ok(existing)
            }
            Err(err) if err.is_not_found() => {
                warn!(upload_id = %record.id, "upload expired or removed while finishing");
                Err(MultipartError::upload_not_found(record.id.as_str()))
            }
            Err(err) => Err(err.with_context("could not update hash")),
        }
    }

    /// Stream every part, in order, through one hasher
    async fn hash_parts(&self, record: &UploadRecord) -> MultipartResult<String> {
        let mut hasher = ContentHasher::new();
        for index in 0..record.parts.len() as u32 {
            let name = self.part_key(&record.id, index);
            let (mut body, _) = self
                .blobs
                .open(&name)
                .await
                .map_err(|e| e.with_context(format!("cannot open blob {:?}", name)))?;
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(|e| {
                    MultipartError::from(e).with_context(format!("error reading blob {:?}", name))
                })?;
                hasher.update(&chunk);
            }
        }
        Ok(hasher.finalize())
    }
}

fn existing_slot(existing: &PartRecord, index: u32, hash: &str, size: u64) -> MultipartResult<PartSlot> {
    if existing.hash != hash {
        return Err(MultipartError::conflict(format!(
            "hash mismatch for already uploaded part {}",
            index
        )));
    }
    if existing.size != size {
        return Err(MultipartError::conflict(format!(
            "size mismatch for already uploaded part {} (got {}, recorded {})",
            index, size, existing.size
        )));
    }
    if existing.complete {
        Ok(PartSlot::Complete)
    } else {
        // Started before but never finished, perhaps because that upload failed.
        Ok(PartSlot::Pending)
    }
}

/// Check the minimum part size rule as far as the known parts allow.
///
/// Only the highest-indexed part may be smaller than `min_part_size`.
/// `uploading` is the part currently being uploaded, which counts as known
/// even before it has a record; pass `None` to check a final part set.
pub(crate) fn check_part_sizes(
    parts: &[Option<PartRecord>],
    uploading: Option<(u32, u64)>,
    min_part_size: u64,
) -> MultipartResult<()> {
    let count = match uploading {
        Some((index, _)) => parts.len().max(index as usize + 1),
        None => parts.len(),
    };
    for i in 0..count.saturating_sub(1) {
        let size = match uploading {
            Some((index, size)) if index as usize == i => Some(size),
            _ => parts.get(i).and_then(Option::as_ref).map(|p| p.size),
        };
        if let Some(size) = size {
            if size < min_part_size {
                return Err(MultipartError::invalid(format!(
                    "part {} too small (need at least {} bytes, got {})",
                    i, min_part_size, size
                )));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl UploadCoordinator for DefaultUploadCoordinator {
    async fn create_upload(&self, expires: DateTime<Utc>) -> MultipartResult<UploadId> {
        let upload_id = UploadId::new();
        self.uploads
            .insert(UploadRecord::new(upload_id.clone(), expires))
            .await
            .map_err(|e| e.with_context("cannot create new upload"))?;
        debug!(upload_id = %upload_id, %expires, "created upload");
        Ok(upload_id)
    }

    #[instrument(skip(self, body), fields(upload_id = %upload_id))]
    async fn put_part(
        &self,
        upload_id: &UploadId,
        index: u32,
        body: ByteStream,
        size: u64,
        hash: &str,
    ) -> MultipartResult<()> {
        self.check_part_limits(index, size)?;
        let record = self.load(upload_id).await?;
        check_part_sizes(&record.parts, Some((index, size)), self.config.min_part_size)?;

        let hash = normalize_hash(hash)?;
        let hash = hash.as_str();
        if self.claim_part(&record, index, hash, size).await? == PartSlot::Complete {
            debug!("part already uploaded");
            return Ok(());
        }

        let name = self.part_key(upload_id, index);
        self.blobs
            .put(&name, body, size, hash)
            .await
            .map_err(|e| e.with_context(format!("cannot upload part {:?}", name)))?;

        // Write the whole part record rather than just the complete flag;
        // the hash was already checked against any existing record.
        self.uploads
            .complete_part(upload_id, index, PartRecord::completed(hash, size))
            .await
            .map_err(|e| e.with_context("cannot mark part as complete"))?;
        debug!("part uploaded");
        Ok(())
    }

    async fn upload_info(&self, upload_id: &UploadId) -> MultipartResult<UploadInfo> {
        Ok(self.load(upload_id).await?.into())
    }

    #[instrument(skip(self, parts), fields(upload_id = %upload_id, parts = parts.len()))]
    async fn finish_upload(&self, upload_id: &UploadId, parts: &[Part]) -> MultipartResult<FinishedUpload> {
        let record = self.load(upload_id).await?;
        if parts.len() != record.parts.len() {
            return Err(MultipartError::invalid(format!(
                "part count mismatch (got {} but {} uploaded)",
                parts.len(),
                record.parts.len()
            )));
        }
        if parts.is_empty() {
            return Err(MultipartError::invalid("no parts uploaded"));
        }

        let mut sizes = Vec::with_capacity(parts.len());
        for (i, (expected, stored)) in parts.iter().zip(&record.parts).enumerate() {
            let stored = match stored {
                Some(part) if part.complete => part,
                _ => return Err(MultipartError::invalid(format!("part {} not uploaded yet", i))),
            };
            if normalize_hash(&expected.hash)? != stored.hash {
                return Err(MultipartError::invalid(format!(
                    "hash mismatch on part {} (got {:?} want {:?})",
                    i, expected.hash, stored.hash
                )));
            }
            let size = u32::try_from(stored.size).map_err(|_| {
                MultipartError::invalid(format!("part {} size {} does not fit the index", i, stored.size))
            })?;
            sizes.push(size);
        }

        // Parts may have been uploaded concurrently and out of order, so the
        // checks made during upload are not enough.
        check_part_sizes(&record.parts, None, self.config.min_part_size)?;

        let hash = self.commit_hash(&record).await?;
        info!(hash = %hash, "upload finished");
        Ok(FinishedUpload {
            index: MultipartIndex::new(sizes),
            hash,
        })
    }

    async fn release_upload(&self, upload_id: &UploadId) -> MultipartResult<()> {
        self.release(upload_id).await
    }

    async fn sweep_expired(&self) -> MultipartResult<usize> {
        self.sweep_expired_at(Utc::now()).await
    }
}
