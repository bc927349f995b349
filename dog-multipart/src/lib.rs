//! # dog-multipart: Resumable, content-addressed multipart uploads
//!
//! `dog-multipart` coordinates uploads that arrive as many independently
//! retried parts. Each part is hashed (SHA-384) and stored as its own blob;
//! finishing an upload checks the parts against what the client expects and
//! produces the hash of the whole object plus a [`MultipartIndex`] of part
//! sizes, which is all that is needed to read the object back later.
//!
//! ## Key Features
//!
//! - **Resumable**: re-sending a part that already arrived is a no-op
//! - **Content-addressed**: every part and the final object are identified by hash
//! - **Lock-free coordination**: concurrent clients are arbitrated by
//!   conditional writes in the metadata store, nothing else
//! - **Expiry**: abandoned uploads are swept together with their parts
//! - **Storage agnostic**: bring any [`BlobStore`] and [`UploadMetadataStore`];
//!   memory and filesystem implementations are included
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_multipart::prelude::*;
//! use bytes::Bytes;
//!
//! # #[tokio::main]
//! # async fn main() -> MultipartResult<()> {
//! let coordinator = DefaultUploadCoordinator::new(
//!     MemoryBlobStore::new(),
//!     MemoryUploadStore::new(),
//!     MultipartConfig::default(),
//! );
//!
//! let expires = chrono::Utc::now() + chrono::Duration::hours(1);
//! let upload_id = coordinator.create_upload(expires).await?;
//!
//! let data = Bytes::from_static(b"Hello, world!");
//! let hash = dog_multipart::hash_bytes(&data);
//! let body = futures_util::stream::once(async move { Ok::<_, std::io::Error>(data) });
//! coordinator.put_part(&upload_id, 0, Box::pin(body), 13, &hash).await?;
//!
//! let finished = coordinator.finish_upload(&upload_id, &[Part::new(hash.clone())]).await?;
//! assert_eq!(finished.hash, hash);
//!
//! // Store `finished` next to `upload_id`, then forget the upload record.
//! coordinator.release_upload(&upload_id).await?;
//! let opened = coordinator.open_upload(&upload_id, &finished.index, None).await?;
//! assert_eq!(opened.content_length(), 13);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────┐
//! │       Your Service       │  ← Request handling
//! ├──────────────────────────┤
//! │ DefaultUploadCoordinator │  ← Tracking, finalizing, reaping
//! ├────────────┬─────────────┤
//! │ BlobStore  │ UploadMeta- │  ← Part content / upload records
//! │            │ dataStore   │
//! └────────────┴─────────────┘
//! ```
//!
//! Run an [`UploadReaper`] next to the coordinator to sweep expired uploads.

mod config;
mod coordinator;
mod error;
mod fs;
mod hash;
mod memory;
mod reader;
mod reaper;
pub mod store;
mod types;
mod upload;

// Re-export main types for clean API
pub use config::MultipartConfig;
pub use coordinator::DefaultUploadCoordinator;
pub use error::{ErrorKind, MultipartError, MultipartResult};
pub use fs::{FsBlobStore, FsUploadStore};
pub use hash::{hash_bytes, normalize_hash, ContentHasher, HASH_HEX_LEN};
pub use memory::{MemoryBlobStore, MemoryUploadStore};
pub use reader::{OpenedUpload, ResolvedRange};
pub use reaper::{ReaperHandle, UploadReaper};
pub use store::{BlobStore, DefaultPartKeys, PartKeyStrategy};
pub use types::{
    ByteRange, ByteStream, FinishedUpload, MultipartIndex, Part, PartRecord, UploadId,
    UploadInfo, UploadRecord,
};
pub use upload::{HashUpdate, UploadCoordinator, UploadMetadataStore};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobStore, ByteStream, DefaultUploadCoordinator, MemoryBlobStore, MemoryUploadStore,
        MultipartConfig, MultipartError, MultipartResult, Part, UploadCoordinator, UploadId,
    };
}
