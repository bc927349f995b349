use std::sync::Arc;

use bytes::Bytes;
use chrono::{Duration, Utc};
use futures_util::StreamExt;
use tokio_test::{assert_err, assert_ok};

use dog_multipart::{
    hash_bytes, BlobStore, ByteRange, ByteStream, DefaultUploadCoordinator, ErrorKind,
    FsBlobStore, FsUploadStore, MemoryBlobStore, MemoryUploadStore, MultipartConfig,
    MultipartResult, Part, PartRecord, UploadCoordinator, UploadId, UploadMetadataStore,
};

const MIB5: usize = 5 * 1024 * 1024;

/// Test factory functions
struct Harness {
    coordinator: DefaultUploadCoordinator,
    blobs: MemoryBlobStore,
    uploads: MemoryUploadStore,
}

fn create_harness() -> Harness {
    create_harness_with(MultipartConfig::default())
}

fn create_harness_with(config: MultipartConfig) -> Harness {
    let blobs = MemoryBlobStore::new();
    let uploads = MemoryUploadStore::new();
    let coordinator = DefaultUploadCoordinator::new(blobs.clone(), uploads.clone(), config);
    Harness {
        coordinator,
        blobs,
        uploads,
    }
}

fn small_parts_config() -> MultipartConfig {
    MultipartConfig::default().with_min_part_size(8)
}

fn in_an_hour() -> chrono::DateTime<Utc> {
    Utc::now() + Duration::hours(1)
}

fn body(data: Vec<u8>) -> ByteStream {
    let chunks: Vec<Result<Bytes, std::io::Error>> = data
        .chunks(64 * 1024)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    Box::pin(futures_util::stream::iter(chunks))
}

async fn put(
    coordinator: &DefaultUploadCoordinator,
    id: &UploadId,
    index: u32,
    data: &[u8],
) -> MultipartResult<()> {
    coordinator
        .put_part(id, index, body(data.to_vec()), data.len() as u64, &hash_bytes(data))
        .await
}

async fn read_all(mut stream: ByteStream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.next().await {
        out.extend_from_slice(&chunk.unwrap());
    }
    out
}

/// End-to-end: two parts, finish, release
#[tokio::test]
async fn test_upload_finish_release() {
    let h = create_harness();
    let first = vec![b'a'; MIB5];
    let second = vec![b'b'; 1024];

    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    assert_ok!(put(&h.coordinator, &id, 0, &first).await);
    assert_ok!(put(&h.coordinator, &id, 1, &second).await);

    let info = h.coordinator.upload_info(&id).await.unwrap();
    assert_eq!(info.parts.len(), 2);
    assert!(info.parts.iter().all(|p| p.as_ref().is_some_and(|p| p.complete)));
    assert!(info.hash.is_none());

    let expected = [Part::new(hash_bytes(&first)), Part::new(hash_bytes(&second))];
    let finished = h.coordinator.finish_upload(&id, &expected).await.unwrap();
    assert_eq!(finished.index.sizes, vec![5_242_880, 1024]);
    let whole = [first.as_slice(), second.as_slice()].concat();
    assert_eq!(finished.hash, hash_bytes(&whole));
    assert_eq!(h.coordinator.upload_info(&id).await.unwrap().hash.as_deref(), Some(finished.hash.as_str()));

    assert_ok!(h.coordinator.release_upload(&id).await);
    let err = h.coordinator.upload_info(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    // Finished uploads keep their parts; they are the object's content.
    assert_eq!(h.blobs.len(), 2);
    let opened = h.coordinator.open_upload(&id, &finished.index, None).await.unwrap();
    assert_eq!(opened.content_length(), whole.len() as u64);
    assert!(!opened.is_partial());
    assert_eq!(read_all(opened.stream).await, whole);
}

#[tokio::test]
async fn test_put_part_is_idempotent() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();

    assert_ok!(put(&h.coordinator, &id, 0, b"abcdefgh").await);
    assert_ok!(put(&h.coordinator, &id, 0, b"abcdefgh").await);

    let info = h.coordinator.upload_info(&id).await.unwrap();
    assert_eq!(info.parts.len(), 1);
    assert_eq!(h.blobs.len(), 1);
}

#[tokio::test]
async fn test_conflicting_part_hash() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();

    assert_ok!(put(&h.coordinator, &id, 0, b"abcdefgh").await);
    let err = put(&h.coordinator, &id, 0, b"12345678").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let stored = h.coordinator.upload_info(&id).await.unwrap();
    assert_eq!(stored.parts[0].as_ref().map(|p| p.hash.clone()), Some(hash_bytes(b"abcdefgh")));
}

#[tokio::test]
async fn test_hash_case_does_not_change_identity() {
    let h = create_harness_with(small_parts_config());
    let upper = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    let lower = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    let digest = hash_bytes(b"tiny");

    assert_ok!(
        h.coordinator
            .put_part(&upper, 0, body(b"tiny".to_vec()), 4, &digest.to_ascii_uppercase())
            .await
    );
    assert_ok!(put(&h.coordinator, &lower, 0, b"tiny").await);
    let stored = h.coordinator.upload_info(&upper).await.unwrap();
    assert_eq!(stored.parts[0].as_ref().map(|p| p.hash.as_str()), Some(digest.as_str()));

    // A retry in the other case is the same part.
    assert_ok!(put(&h.coordinator, &upper, 0, b"tiny").await);

    let a = h
        .coordinator
        .finish_upload(&upper, &[Part::new(digest.clone())])
        .await
        .unwrap();
    let b = h
        .coordinator
        .finish_upload(&lower, &[Part::new(digest.to_ascii_uppercase())])
        .await
        .unwrap();
    assert_eq!(a.hash, digest);
    assert_eq!(a.hash, b.hash);
}

#[tokio::test]
async fn test_malformed_hash_is_rejected_before_recording() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();

    let err = h
        .coordinator
        .put_part(&id, 0, body(b"tiny".to_vec()), 4, "not-a-digest")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.coordinator.upload_info(&id).await.unwrap().parts.is_empty());
}

#[tokio::test]
async fn test_size_change_on_complete_part_conflicts() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    assert_ok!(put(&h.coordinator, &id, 0, b"abcdefgh").await);

    let err = h
        .coordinator
        .put_part(&id, 0, body(b"abcdefgh".to_vec()), 9, &hash_bytes(b"abcdefgh"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_body_must_match_declared_content() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();

    let declared = hash_bytes(b"something else");
    let err = h
        .coordinator
        .put_part(&id, 0, body(b"abcdefgh".to_vec()), 8, &declared)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.blobs.is_empty());

    // The placeholder pins the declared hash for that part.
    let info = h.coordinator.upload_info(&id).await.unwrap();
    let placeholder = info.parts[0].as_ref().unwrap();
    assert!(!placeholder.complete);
    assert_eq!(placeholder.hash, declared);
    let err = put(&h.coordinator, &id, 0, b"abcdefgh").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn test_part_limits() {
    let h = create_harness_with(small_parts_config().with_max_parts(3));
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();

    let err = put(&h.coordinator, &id, 3, b"abcdefgh").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = put(&h.coordinator, &id, 0, b"").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = put(&h.coordinator, &UploadId::from("upl_missing"), 0, b"abcdefgh")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_small_part_rejected_at_upload() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();

    // A short last part is fine until something is uploaded after it.
    assert_ok!(put(&h.coordinator, &id, 1, b"tiny").await);
    let err = put(&h.coordinator, &id, 0, b"tiny").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_ok!(put(&h.coordinator, &id, 0, b"abcdefgh").await);

    let err = put(&h.coordinator, &id, 2, b"abcdefgh").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_small_part_rejected_at_finish() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    assert_ok!(put(&h.coordinator, &id, 0, b"tiny").await);

    // A concurrent put of part 1 that loaded the record before part 0 existed
    // passes its own size check.
    let late = b"abcdefgh";
    h.blobs
        .put(&format!("{}/1", id), body(late.to_vec()), 8, &hash_bytes(late))
        .await
        .unwrap();
    h.uploads
        .complete_part(&id, 1, PartRecord::completed(hash_bytes(late), 8))
        .await
        .unwrap();

    let parts = [Part::new(hash_bytes(b"tiny")), Part::new(hash_bytes(late))];
    let err = h.coordinator.finish_upload(&id, &parts).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.coordinator.upload_info(&id).await.unwrap().hash.is_none());
}

#[tokio::test]
async fn test_single_part_shortcut() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    assert_ok!(put(&h.coordinator, &id, 0, b"tiny").await);

    let finished = h
        .coordinator
        .finish_upload(&id, &[Part::new(hash_bytes(b"tiny"))])
        .await
        .unwrap();
    assert_eq!(finished.hash, hash_bytes(b"tiny"));
    assert_eq!(finished.index.sizes, vec![4]);
    assert_eq!(h.blobs.open_count(), 0);
}

#[tokio::test]
async fn test_finish_requires_matching_parts() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();

    let err = h.coordinator.finish_upload(&id, &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_ok!(put(&h.coordinator, &id, 0, b"abcdefgh").await);
    assert_ok!(put(&h.coordinator, &id, 1, b"tail").await);

    let err = h
        .coordinator
        .finish_upload(&id, &[Part::new(hash_bytes(b"abcdefgh"))])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let err = h
        .coordinator
        .finish_upload(&id, &[Part::new(hash_bytes(b"abcdefgh")), Part::new(hash_bytes(b"TAIL"))])
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(h.coordinator.upload_info(&id).await.unwrap().hash.is_none());
}

#[tokio::test]
async fn test_finish_is_repeatable_and_freezes_parts() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    assert_ok!(put(&h.coordinator, &id, 0, b"abcdefgh").await);
    assert_ok!(put(&h.coordinator, &id, 1, b"ijklmnop").await);

    let parts = [Part::new(hash_bytes(b"abcdefgh")), Part::new(hash_bytes(b"ijklmnop"))];
    let first = h.coordinator.finish_upload(&id, &parts).await.unwrap();
    let second = h.coordinator.finish_upload(&id, &parts).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.hash, hash_bytes(b"abcdefghijklmnop"));

    let err = put(&h.coordinator, &id, 2, b"more").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    // Re-sending an existing part is still a no-op.
    assert_ok!(put(&h.coordinator, &id, 1, b"ijklmnop").await);
}

#[tokio::test]
async fn test_unfinished_part_blocks_finish() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    assert_ok!(put(&h.coordinator, &id, 1, b"tail").await);

    let parts = [Part::new(hash_bytes(b"abcdefgh")), Part::new(hash_bytes(b"tail"))];
    let err = h.coordinator.finish_upload(&id, &parts).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test]
async fn test_sweep_removes_expired_uploads_and_parts() {
    let h = create_harness_with(small_parts_config());
    let expired = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    let live = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    assert_ok!(put(&h.coordinator, &expired, 0, b"abcdefgh").await);
    assert_ok!(put(&h.coordinator, &expired, 1, b"tail").await);
    assert_ok!(put(&h.coordinator, &live, 0, b"abcdefgh").await);
    h.uploads.force_expiry(&expired);

    assert_eq!(h.coordinator.sweep_expired().await.unwrap(), 1);
    assert_err!(h.coordinator.upload_info(&expired).await);
    assert_ok!(h.coordinator.upload_info(&live).await);
    assert_eq!(h.blobs.len(), 1);
    assert!(h.blobs.contains(&format!("{}/0", live)));
}

#[tokio::test]
async fn test_sweep_keeps_parts_of_finished_uploads() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    assert_ok!(put(&h.coordinator, &id, 0, b"abcdefgh").await);
    assert_ok!(put(&h.coordinator, &id, 1, b"tail").await);
    let parts = [Part::new(hash_bytes(b"abcdefgh")), Part::new(hash_bytes(b"tail"))];
    let finished = h.coordinator.finish_upload(&id, &parts).await.unwrap();
    h.uploads.force_expiry(&id);

    assert_eq!(h.coordinator.sweep_expired().await.unwrap(), 1);
    assert!(h.uploads.is_empty());
    assert_eq!(h.blobs.len(), 2);

    let opened = h.coordinator.open_upload(&id, &finished.index, None).await.unwrap();
    assert_eq!(read_all(opened.stream).await, b"abcdefghtail");
}

#[tokio::test]
async fn test_release_unknown_upload_is_ok() {
    let h = create_harness();
    assert_ok!(h.coordinator.release_upload(&UploadId::from("upl_gone")).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_puts_of_same_part() {
    let h = create_harness_with(small_parts_config());
    let coordinator = Arc::new(h.coordinator);
    let id = coordinator.create_upload(in_an_hour()).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            put(&coordinator, &id, 0, b"abcdefgh").await
        }));
    }
    for task in tasks {
        // Losers find the same placeholder or the completed part and either
        // re-upload identical content or do nothing.
        assert_ok!(task.await.unwrap());
    }

    assert_ok!(put(&coordinator, &id, 0, b"abcdefgh").await);
    let finished = coordinator
        .finish_upload(&id, &[Part::new(hash_bytes(b"abcdefgh"))])
        .await
        .unwrap();
    assert_eq!(finished.hash, hash_bytes(b"abcdefgh"));
}

#[tokio::test]
async fn test_ranged_reads() {
    let h = create_harness_with(small_parts_config());
    let id = h.coordinator.create_upload(in_an_hour()).await.unwrap();
    assert_ok!(put(&h.coordinator, &id, 0, b"0123456789").await);
    assert_ok!(put(&h.coordinator, &id, 1, b"abcdefghij").await);
    assert_ok!(put(&h.coordinator, &id, 2, b"XYZ").await);
    let parts = [
        Part::new(hash_bytes(b"0123456789")),
        Part::new(hash_bytes(b"abcdefghij")),
        Part::new(hash_bytes(b"XYZ")),
    ];
    let finished = h.coordinator.finish_upload(&id, &parts).await.unwrap();
    assert_eq!(finished.hash, hash_bytes(b"0123456789abcdefghijXYZ"));

    let opens = h.blobs.open_count();
    let opened = h
        .coordinator
        .open_upload(&id, &finished.index, Some(ByteRange::new(12, Some(20))))
        .await
        .unwrap();
    assert!(opened.is_partial());
    assert_eq!(opened.content_length(), 9);
    assert_eq!(read_all(opened.stream).await, b"cdefghijX");
    // Part 0 lies before the range and is never opened.
    assert_eq!(h.blobs.open_count() - opens, 2);

    let opened = h
        .coordinator
        .open_upload(&id, &finished.index, Some(ByteRange::from_start(21)))
        .await
        .unwrap();
    assert_eq!(read_all(opened.stream).await, b"YZ");
}

#[tokio::test]
async fn test_filesystem_stores() {
    let dir = tempfile::tempdir().unwrap();
    let blobs = FsBlobStore::new(dir.path().join("blobs")).await.unwrap();
    let uploads = FsUploadStore::new(dir.path().join("uploads")).await.unwrap();
    let coordinator = DefaultUploadCoordinator::new(blobs, uploads, small_parts_config());

    let id = coordinator.create_upload(in_an_hour()).await.unwrap();
    assert_ok!(put(&coordinator, &id, 0, b"abcdefgh").await);
    assert_ok!(put(&coordinator, &id, 0, b"abcdefgh").await);
    assert_ok!(put(&coordinator, &id, 1, b"tail").await);
    let err = put(&coordinator, &id, 1, b"TAIL").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let parts = [Part::new(hash_bytes(b"abcdefgh")), Part::new(hash_bytes(b"tail"))];
    let finished = coordinator.finish_upload(&id, &parts).await.unwrap();
    assert_eq!(finished.hash, hash_bytes(b"abcdefghtail"));

    assert_ok!(coordinator.release_upload(&id).await);
    assert_eq!(coordinator.upload_info(&id).await.unwrap_err().kind(), ErrorKind::NotFound);
    let opened = coordinator
        .open_upload(&id, &finished.index, Some(ByteRange::new(6, None)))
        .await
        .unwrap();
    assert_eq!(read_all(opened.stream).await, b"ghtail");

    let abandoned = coordinator.create_upload(Utc::now() - Duration::seconds(1)).await.unwrap();
    assert_ok!(put(&coordinator, &abandoned, 0, b"abcdefgh").await);
    assert_eq!(coordinator.sweep_expired().await.unwrap(), 1);
    assert!(!dir.path().join("blobs").join(abandoned.as_str()).join("0").exists());
}
