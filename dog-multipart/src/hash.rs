//! SHA-384 content hashing.
//!
//! Parts and finished uploads are identified by the lowercase hex encoding
//! of their SHA-384 digest.

use sha2::{Digest, Sha384};

use crate::{MultipartError, MultipartResult};

/// Length of a hex-encoded SHA-384 digest
pub const HASH_HEX_LEN: usize = 96;

/// Hash `data` in one go.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Incremental SHA-384 hasher producing hex digests.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha384,
    len: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.len += data.len() as u64;
    }

    /// Number of bytes fed so far
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Finalize and return the lowercase hex digest.
    pub fn finalize(self) -> String {
        hex::encode(self.inner.finalize())
    }
}

/// Canonical form of a caller-supplied digest.
///
/// Accepts upper or lower case hex of the right length and returns it
/// lowercased, so equal content always has one identity.
pub fn normalize_hash(hash: &str) -> MultipartResult<String> {
    if hash.len() != HASH_HEX_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(MultipartError::invalid(format!(
            "hash {:?} is not a hex SHA-384 digest",
            hash
        )));
    }
    Ok(hash.to_ascii_lowercase())
}
