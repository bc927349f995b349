use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    ByteRange, ByteStream, DefaultUploadCoordinator, MultipartError, MultipartIndex,
    MultipartResult, UploadId,
};

/// Range information for partial content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRange {
    pub start: u64,
    /// Inclusive
    pub end: u64,
    pub total_size: u64,
}

impl ResolvedRange {
    /// Resolve a requested range against the object size, clamping an end
    /// past the last byte
    pub fn from_request(range: &ByteRange, total_size: u64) -> Self {
        let last = total_size.saturating_sub(1);
        let end = range.end.unwrap_or(last).min(last);
        Self {
            start: range.start,
            end,
            total_size,
        }
    }

    pub fn content_length(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn is_full_content(&self) -> bool {
        self.start == 0 && self.end + 1 == self.total_size
    }
}

/// A finished upload opened for reading
pub struct OpenedUpload {
    pub upload_id: UploadId,
    pub stream: ByteStream,
    pub resolved_range: Option<ResolvedRange>,
    pub total_size: u64,
}

impl OpenedUpload {
    /// Check if this is a partial content response
    pub fn is_partial(&self) -> bool {
        self.resolved_range
            .as_ref()
            .is_some_and(|r| !r.is_full_content())
    }

    /// Number of bytes the stream yields
    pub fn content_length(&self) -> u64 {
        self.resolved_range
            .as_ref()
            .map_or(self.total_size, ResolvedRange::content_length)
    }
}

/// Slice of one part blob
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    name: String,
    skip: u64,
    take: u64,
}

impl DefaultUploadCoordinator {
    /// Stream the content of a finished upload from its part blobs.
    ///
    /// The upload record is not needed, only the part blobs and the index
    /// returned by `finish_upload`, so this keeps working after release.
    pub async fn open_upload(
        &self,
        upload_id: &UploadId,
        index: &MultipartIndex,
        range: Option<ByteRange>,
    ) -> MultipartResult<OpenedUpload> {
        let total_size = index.total_size();
        if total_size == 0 {
            return Err(MultipartError::invalid("empty multipart index"));
        }
        let resolved = match &range {
            Some(range) => {
                if range.start >= total_size || range.end.is_some_and(|end| end < range.start) {
                    return Err(MultipartError::invalid(format!(
                        "range {}-{:?} not satisfiable for {} bytes",
                        range.start, range.end, total_size
                    )));
                }
                Some(ResolvedRange::from_request(range, total_size))
            }
            None => None,
        };
        let (start, end) = resolved
            .as_ref()
            .map_or((0, total_size - 1), |r| (r.start, r.end));

        let segments = self.plan_segments(upload_id, index, start, end)?;
        debug!(upload_id = %upload_id, start, end, parts = segments.len(), "opening upload");
        Ok(OpenedUpload {
            upload_id: upload_id.clone(),
            stream: self.segment_stream(segments),
            resolved_range: resolved,
            total_size,
        })
    }

    /// Parts covering the inclusive byte range `start..=end`
    fn plan_segments(
        &self,
        upload_id: &UploadId,
        index: &MultipartIndex,
        start: u64,
        end: u64,
    ) -> MultipartResult<Vec<Segment>> {
        let (first, mut skip) = index
            .locate(start)
            .ok_or_else(|| MultipartError::invalid(format!("offset {} outside upload", start)))?;
        let mut remaining = end - start + 1;
        let mut segments = Vec::new();
        for (part, size) in index.sizes.iter().enumerate().skip(first) {
            if remaining == 0 {
                break;
            }
            let take = (u64::from(*size) - skip).min(remaining);
            segments.push(Segment {
                name: self.part_key(upload_id, part as u32),
                skip,
                take,
            });
            remaining -= take;
            skip = 0;
        }
        Ok(segments)
    }

    /// Concatenate the segments into a single stream
    fn segment_stream(&self, segments: Vec<Segment>) -> ByteStream {
        let blobs = self.blobs.clone();
        let stream = async_stream::stream! {
            for segment in segments {
                let mut body = match blobs.open(&segment.name).await {
                    Ok((body, _)) => body,
                    Err(e) => {
                        yield Err(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            format!("Failed to read part {}: {}", segment.name, e),
                        ));
                        return;
                    }
                };
                let mut skip = segment.skip;
                let mut take = segment.take;
                while take > 0 {
                    let chunk = match StreamExt::next(&mut body).await {
                        Some(Ok(chunk)) => chunk,
                        Some(Err(e)) => {
                            yield Err(e);
                            return;
                        }
                        None => break,
                    };
                    if skip >= chunk.len() as u64 {
                        skip -= chunk.len() as u64;
                        continue;
                    }
                    let from = skip as usize;
                    skip = 0;
                    let to = chunk.len().min(from + take as usize);
                    let piece = chunk.slice(from..to);
                    take -= piece.len() as u64;
                    yield Ok(piece);
                }
                if take > 0 {
                    yield Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("part {} ended {} bytes early", segment.name, take),
                    ));
                    return;
                }
            }
        };
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryBlobStore, MemoryUploadStore, MultipartConfig};

    fn coordinator() -> DefaultUploadCoordinator {
        DefaultUploadCoordinator::new(
            MemoryBlobStore::new(),
            MemoryUploadStore::new(),
            MultipartConfig::default(),
        )
    }

    #[test]
    fn resolved_range() {
        let full = ResolvedRange::from_request(&ByteRange::from_start(0), 10);
        assert!(full.is_full_content());
        assert_eq!(full.content_length(), 10);

        let clamped = ResolvedRange::from_request(&ByteRange::new(4, Some(100)), 10);
        assert_eq!(clamped.end, 9);
        assert_eq!(clamped.content_length(), 6);
        assert!(!clamped.is_full_content());
    }

    #[test]
    fn segments_skip_leading_parts() {
        let coordinator = coordinator();
        let id = UploadId::from("u");
        let index = MultipartIndex::new(vec![10, 10, 5]);

        let segments = coordinator.plan_segments(&id, &index, 12, 21).unwrap();
        assert_eq!(
            segments,
            vec![
                Segment { name: "u/1".into(), skip: 2, take: 8 },
                Segment { name: "u/2".into(), skip: 0, take: 2 },
            ]
        );

        let whole = coordinator.plan_segments(&id, &index, 0, 24).unwrap();
        assert_eq!(whole.len(), 3);
        assert_eq!(whole.iter().map(|s| s.take).sum::<u64>(), 25);
    }

    #[test]
    fn segment_inside_one_part() {
        let coordinator = coordinator();
        let segments = coordinator
            .plan_segments(&UploadId::from("u"), &MultipartIndex::new(vec![10, 10]), 3, 5)
            .unwrap();
        assert_eq!(segments, vec![Segment { name: "u/0".into(), skip: 3, take: 3 }]);
    }

    #[tokio::test]
    async fn bad_ranges_are_rejected() {
        let coordinator = coordinator();
        let id = UploadId::from("u");
        let index = MultipartIndex::new(vec![10]);

        let err = coordinator
            .open_upload(&id, &index, Some(ByteRange::from_start(10)))
            .await
            .err()
            .map(|e| e.kind());
        assert_eq!(err, Some(crate::ErrorKind::Validation));

        let err = coordinator
            .open_upload(&id, &index, Some(ByteRange::new(5, Some(2))))
            .await
            .err()
            .map(|e| e.kind());
        assert_eq!(err, Some(crate::ErrorKind::Validation));

        let err = coordinator
            .open_upload(&id, &MultipartIndex::default(), None)
            .await
            .err()
            .map(|e| e.kind());
        assert_eq!(err, Some(crate::ErrorKind::Validation));
    }
}
