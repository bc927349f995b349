use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use uuid::Uuid;

/// Stream of bytes for part content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Unique identifier for a multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(pub String);

impl UploadId {
    /// Generate a new random upload ID
    pub fn new() -> Self {
        Self(format!("upl_{}", Uuid::new_v4().simple()))
    }

    /// Create from existing string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for UploadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UploadId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Information about one part of a multipart upload.
///
/// Stored as-is inside [`UploadRecord`]; changing the field names changes
/// the persisted document format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRecord {
    /// Hex-encoded SHA-384 of the part content
    pub hash: String,
    /// Size of the part in bytes
    pub size: u64,
    /// Whether the part blob has been written to the blob store
    pub complete: bool,
}

impl PartRecord {
    /// Placeholder written before the part content is stored
    pub fn initialized(hash: impl Into<String>, size: u64) -> Self {
        Self {
            hash: hash.into(),
            size,
            complete: false,
        }
    }

    pub fn completed(hash: impl Into<String>, size: u64) -> Self {
        Self {
            hash: hash.into(),
            size,
            complete: true,
        }
    }
}

/// The metadata record held for a pending multipart upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: UploadId,

    /// When the upload becomes eligible for reaping
    pub expires: DateTime<Utc>,

    /// Part slots indexed by part number; `None` for parts not seen yet
    #[serde(default)]
    pub parts: Vec<Option<PartRecord>>,

    /// SHA-384 of all parts concatenated. Its presence marks the upload
    /// as finished and it never changes once set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl UploadRecord {
    pub fn new(id: UploadId, expires: DateTime<Utc>) -> Self {
        Self {
            id,
            expires,
            parts: Vec::new(),
            hash: None,
        }
    }

    pub fn part(&self, index: u32) -> Option<&PartRecord> {
        self.parts.get(index as usize).and_then(Option::as_ref)
    }

    pub fn is_finished(&self) -> bool {
        self.hash.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires < now
    }

    /// Store `part` at `index`, growing the slot list as needed
    pub(crate) fn set_part(&mut self, index: u32, part: PartRecord) {
        let index = index as usize;
        if self.parts.len() <= index {
            self.parts.resize(index + 1, None);
        }
        self.parts[index] = Some(part);
    }
}

/// Snapshot of an upload returned by `upload_info`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadInfo {
    /// All known parts. Parts not uploaded yet are `None`; parts in
    /// progress or aborted have `complete == false`.
    pub parts: Vec<Option<PartRecord>>,

    pub expires: DateTime<Utc>,

    /// Hash of the entire upload, set once it has been finished
    pub hash: Option<String>,
}

impl From<UploadRecord> for UploadInfo {
    fn from(record: UploadRecord) -> Self {
        Self {
            parts: record.parts,
            expires: record.expires,
            hash: record.hash,
        }
    }
}

/// The caller's expectation for one part at finish time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    pub hash: String,
}

impl Part {
    pub fn new(hash: impl Into<String>) -> Self {
        Self { hash: hash.into() }
    }
}

/// Sizes of all the parts of a finished upload, in order.
///
/// Store it next to the upload id and final hash; it is what allows the
/// object to be read back (or ranged into) without re-scanning the parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultipartIndex {
    pub sizes: Vec<u32>,
}

impl MultipartIndex {
    pub fn new(sizes: Vec<u32>) -> Self {
        Self { sizes }
    }

    pub fn part_count(&self) -> usize {
        self.sizes.len()
    }

    pub fn total_size(&self) -> u64 {
        self.sizes.iter().map(|s| u64::from(*s)).sum()
    }

    /// Byte offset at which each part starts
    pub fn offsets(&self) -> Vec<u64> {
        let mut offset = 0u64;
        self.sizes
            .iter()
            .map(|size| {
                let start = offset;
                offset += u64::from(*size);
                start
            })
            .collect()
    }

    /// Find the part containing `offset` and the position within that part
    pub fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        let mut start = 0u64;
        for (part, size) in self.sizes.iter().enumerate() {
            let end = start + u64::from(*size);
            if offset < end {
                return Some((part, offset - start));
            }
            start = end;
        }
        None
    }
}

/// Result of a successful finish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedUpload {
    pub index: MultipartIndex,
    /// Hex SHA-384 of the whole object
    pub hash: String,
}

/// Byte range for partial reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>, // inclusive; None means "to end of object"
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn length(&self, total_size: u64) -> u64 {
        match self.end {
            Some(end) => end.saturating_sub(self.start) + 1,
            None => total_size.saturating_sub(self.start),
        }
    }

    pub fn is_valid(&self, total_size: u64) -> bool {
        if self.start >= total_size {
            return false;
        }
        if let Some(end) = self.end {
            end >= self.start && end < total_size
        } else {
            true
        }
    }
}
