use async_trait::async_trait;

use crate::{ByteStream, MultipartError, MultipartResult, UploadId};

/// Single-blob storage consumed by the coordinator.
///
/// Part content is written once per name and never modified in place,
/// only removed.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a blob from a stream.
    ///
    /// Implementations must check that the stream yields exactly `size`
    /// bytes hashing to `hash` (hex SHA-384) and must not leave a blob
    /// behind when it does not.
    async fn put(&self, name: &str, body: ByteStream, size: u64, hash: &str) -> MultipartResult<()>;

    /// Open a blob, returning its content and size.
    ///
    /// Fails with [`MultipartError::BlobNotFound`] if there is no such blob.
    async fn open(&self, name: &str) -> MultipartResult<(ByteStream, u64)>;

    /// Delete a blob.
    ///
    /// Fails with [`MultipartError::BlobNotFound`] if there is no such blob.
    async fn remove(&self, name: &str) -> MultipartResult<()>;
}

/// Strategy for naming part blobs
pub trait PartKeyStrategy: Send + Sync {
    /// Blob name for part `index` of the given upload
    fn part_key(&self, upload_id: &UploadId, index: u32) -> String;
}

/// Default naming: `{upload_id}/{index}`
#[derive(Debug, Clone, Default)]
pub struct DefaultPartKeys;

impl PartKeyStrategy for DefaultPartKeys {
    fn part_key(&self, upload_id: &UploadId, index: u32) -> String {
        format!("{}/{}", upload_id.as_str(), index)
    }
}

/// Compare what a store actually received against what the caller declared
pub(crate) fn verify_content(
    name: &str,
    expected_size: u64,
    expected_hash: &str,
    actual_size: u64,
    actual_hash: &str,
) -> MultipartResult<()> {
    if actual_size != expected_size {
        return Err(MultipartError::invalid(format!(
            "size mismatch for blob {:?} (got {} bytes, want {})",
            name, actual_size, expected_size
        )));
    }
    if !actual_hash.eq_ignore_ascii_case(expected_hash) {
        return Err(MultipartError::invalid(format!(
            "hash mismatch for blob {:?} (got {}, want {})",
            name, actual_hash, expected_hash
        )));
    }
    Ok(())
}
