use bytes::Bytes;
use region_store::atomic_file_store::{
    sibling_path, AtomicFileStore, RecoveryAction, NEW_SUFFIX, OLD_SUFFIX,
};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

fn assert_no_siblings(path: &Path) {
    assert!(!sibling_path(path, NEW_SUFFIX).unwrap().exists());
    assert!(!sibling_path(path, OLD_SUFFIX).unwrap().exists());
}

#[tokio::test]
async fn test_read_during_write_sees_pending_bytes() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("region/level.dat");
    let store = AtomicFileStore::default();

    store.write(path.clone(), vec![1u8; 4096]).await.unwrap();

    let payload = Bytes::from(vec![2u8; 4096]);
    let ticket = store.begin_write(path.clone(), payload.clone()).await.unwrap();

    // Pending bytes, never the disk content, while the ticket is held
    assert_eq!(store.read(&path).await.unwrap(), payload);
    assert_eq!(std::fs::read(&path).unwrap(), vec![1u8; 4096]);

    ticket.commit().await.unwrap();
    assert_eq!(store.read(&path).await.unwrap(), payload);
    assert_eq!(std::fs::read(&path).unwrap(), payload.to_vec());
    assert_no_siblings(&path);
}

#[tokio::test]
async fn test_concurrent_readers_never_see_mixed_content() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("data.bin");
    let store = Arc::new(AtomicFileStore::default());

    let old = vec![b'a'; 64 * 1024];
    let new = vec![b'b'; 64 * 1024];
    store.write(path.clone(), old.clone()).await.unwrap();

    let mut readers = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        let path = path.clone();
        let (old, new) = (old.clone(), new.clone());
        readers.push(tokio::spawn(async move {
            for _ in 0..50 {
                let data = store.read(&path).await.unwrap();
                assert!(
                    data.as_ref() == old.as_slice() || data.as_ref() == new.as_slice(),
                    "read returned partial or mixed content of {} bytes",
                    data.len()
                );
                tokio::task::yield_now().await;
            }
        }));
    }

    store.write(path.clone(), new.clone()).await.unwrap();

    for reader in readers {
        reader.await.unwrap();
    }
    assert_eq!(store.read(&path).await.unwrap().as_ref(), new.as_slice());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_leave_one_full_payload() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("players/uuid.dat");
    let store = Arc::new(AtomicFileStore::default());

    let payloads: Vec<Vec<u8>> = (0..8u8).map(|i| vec![i; 8 * 1024]).collect();

    let writers: Vec<_> = payloads
        .iter()
        .cloned()
        .map(|payload| {
            let store = store.clone();
            let path = path.clone();
            tokio::spawn(async move { store.write(path, payload).await })
        })
        .collect();

    for writer in writers {
        writer.await.unwrap().unwrap();
    }

    let on_disk = std::fs::read(&path).unwrap();
    assert!(payloads.contains(&on_disk), "file is not exactly one payload");
    assert_no_siblings(&path);
    assert_eq!(store.in_flight_count(), 0);
    assert_eq!(store.metrics().writes_committed, 8);
}

#[tokio::test]
async fn test_missing_file_reads_empty_and_is_not_created() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("missing.dat");
    let store = AtomicFileStore::default();

    assert!(store.read(&path).await.unwrap().is_empty());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_recovery_after_crash_between_renames() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("r.0.0.mca");
    let store = AtomicFileStore::default();

    // Target moved aside, new content written but not yet renamed in
    std::fs::write(sibling_path(&path, OLD_SUFFIX).unwrap(), b"old").unwrap();
    std::fs::write(sibling_path(&path, NEW_SUFFIX).unwrap(), b"new").unwrap();

    let action = store.recover_interrupted_write(&path).await.unwrap();
    assert_eq!(action, RecoveryAction::PromotedNew);
    assert_eq!(store.read(&path).await.unwrap(), Bytes::from_static(b"new"));
    assert_no_siblings(&path);

    assert_eq!(
        store.recover_interrupted_write(&path).await.unwrap(),
        RecoveryAction::Nothing
    );
}
