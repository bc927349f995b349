use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    ByteStream, FinishedUpload, MultipartResult, Part, PartRecord, UploadId, UploadInfo,
    UploadRecord,
};

/// Coordinates resumable multipart uploads
#[async_trait]
pub trait UploadCoordinator: Send + Sync {
    /// Start tracking a new upload that may be reaped after `expires`
    async fn create_upload(&self, expires: DateTime<Utc>) -> MultipartResult<UploadId>;

    /// Upload part `index` with the given size and hex SHA-384.
    ///
    /// The hash may be in either case and is stored lowercased. Retrying
    /// with identical arguments after success is a no-op; a different hash,
    /// or the same hash with a different size, for an already recorded part
    /// is a conflict even when that part is complete.
    async fn put_part(
        &self,
        upload_id: &UploadId,
        index: u32,
        body: ByteStream,
        size: u64,
        hash: &str,
    ) -> MultipartResult<()>;

    /// Current state of an upload
    async fn upload_info(&self, upload_id: &UploadId) -> MultipartResult<UploadInfo>;

    /// Check the parts against `parts` and compute the hash of the whole
    /// object. Does not remove anything; call `release_upload` once the
    /// result has been stored.
    async fn finish_upload(
        &self,
        upload_id: &UploadId,
        parts: &[Part],
    ) -> MultipartResult<FinishedUpload>;

    /// Forget an upload. Unfinished uploads lose their part blobs too.
    /// Releasing an unknown upload succeeds.
    async fn release_upload(&self, upload_id: &UploadId) -> MultipartResult<()>;

    /// Remove every upload whose expiry has passed, returning how many
    async fn sweep_expired(&self) -> MultipartResult<usize>;
}

/// Outcome of [`UploadMetadataStore::set_hash_if_absent`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashUpdate {
    /// Our hash is now the upload hash
    Set,
    /// The upload had already been finished with this hash
    AlreadySet(String),
}

/// Storage for upload records.
///
/// The conditional operations are the only concurrency control the
/// coordinator relies on; each must be atomic with respect to every other
/// operation on the same upload.
#[async_trait]
pub trait UploadMetadataStore: Send + Sync {
    /// Insert a new record
    async fn insert(&self, record: UploadRecord) -> MultipartResult<()>;

    /// Get a record, `None` if it does not exist
    async fn get(&self, upload_id: &UploadId) -> MultipartResult<Option<UploadRecord>>;

    /// Create the placeholder for part `index` iff the upload exists, is
    /// unfinished, and has no record for that part. Returns whether the
    /// placeholder was written.
    async fn init_part(
        &self,
        upload_id: &UploadId,
        index: u32,
        part: PartRecord,
    ) -> MultipartResult<bool>;

    /// Overwrite part `index` unconditionally.
    /// Fails with `UploadNotFound` if the upload no longer exists.
    async fn complete_part(
        &self,
        upload_id: &UploadId,
        index: u32,
        part: PartRecord,
    ) -> MultipartResult<()>;

    /// Set the upload hash iff it is absent.
    /// Fails with `UploadNotFound` if the upload no longer exists.
    async fn set_hash_if_absent(&self, upload_id: &UploadId, hash: &str)
        -> MultipartResult<HashUpdate>;

    /// Delete the record iff it exists and has no hash, returning the
    /// record as it was at deletion time.
    async fn remove_if_unfinished(&self, upload_id: &UploadId)
        -> MultipartResult<Option<UploadRecord>>;

    /// Delete the record; a missing record is not an error
    async fn remove(&self, upload_id: &UploadId) -> MultipartResult<()>;

    /// All records with `expires < now`
    async fn expired(&self, now: DateTime<Utc>) -> MultipartResult<Vec<UploadRecord>>;
}
