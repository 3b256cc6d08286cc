//! End-to-end scans of export archives delivered the way the runtime
//! delivers them: chunk by chunk over a channel.

use bytes::Bytes;
use dreg_archive::oci::ImageIndex;
use dreg_archive::testing::ExportBuilder;
use dreg_archive::{scan_channel, ScanError};
use dreg_cas::{ContentStore, Digest};
use tempfile::TempDir;
use tokio::sync::mpsc;

/// Feed `archive` into a channel in `chunk`-sized pieces from an async task.
fn feed(archive: Vec<u8>, chunk: usize) -> mpsc::Receiver<std::io::Result<Bytes>> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        for piece in archive.chunks(chunk) {
            if tx.send(Ok(Bytes::copy_from_slice(piece))).await.is_err() {
                return;
            }
        }
    });
    rx
}

#[tokio::test(flavor = "multi_thread")]
async fn scan_over_channel_populates_cache() {
    let temp = TempDir::new().unwrap();
    let store = ContentStore::new(temp.path()).unwrap();

    let mut builder = ExportBuilder::new();
    let manifest = builder.image(&[vec![0xabu8; 200_000], vec![0xcdu8; 70_001]]);
    let rx = feed(builder.build(), 7919);

    let scan_store = store.clone();
    let report = tokio::task::spawn_blocking(move || {
        scan_channel(&scan_store, rx, "library/app:1.0")
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(report.blobs_written, 4);
    assert!(store.contains_blob(&manifest.digest));

    let index: ImageIndex =
        serde_json::from_slice(&store.get_index("library/app:1.0").unwrap()).unwrap();
    assert_eq!(index.single_manifest().unwrap().digest, manifest.digest);
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_error_mid_export_fails_scan() {
    let temp = TempDir::new().unwrap();
    let store = ContentStore::new(temp.path()).unwrap();

    let mut builder = ExportBuilder::new();
    builder.image(&[vec![1u8; 50_000]]);
    let archive = builder.build();

    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let _ = tx.send(Ok(Bytes::copy_from_slice(&archive[..10_000]))).await;
        let _ = tx
            .send(Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "engine went away",
            )))
            .await;
    });

    let scan_store = store.clone();
    let result = tokio::task::spawn_blocking(move || scan_channel(&scan_store, rx, "library/app:1"))
        .await
        .unwrap();

    assert!(result.is_err(), "{result:?}");
    assert!(!store.contains_index("library/app:1"));
}

#[tokio::test(flavor = "multi_thread")]
async fn blob_found_after_scan_matches_its_digest() {
    let temp = TempDir::new().unwrap();
    let store = ContentStore::new(temp.path()).unwrap();

    let mut builder = ExportBuilder::new();
    let hello = builder.blob(b"hello");
    let rx = feed(builder.build(), 512);

    let scan_store = store.clone();
    tokio::task::spawn_blocking(move || scan_channel(&scan_store, rx, "library/hello:latest"))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(hello, "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824".parse::<Digest>().unwrap());
    assert_eq!(store.get_blob(&hello).unwrap(), b"hello");
    store.verify_blob(&hello).unwrap();
}

#[test]
fn malformed_archive_is_reported() {
    let temp = TempDir::new().unwrap();
    let store = ContentStore::new(temp.path()).unwrap();

    let (tx, rx) = mpsc::channel(1);
    tx.try_send(Ok(Bytes::from(vec![0xffu8; 512]))).unwrap();
    drop(tx);

    let result = scan_channel(&store, rx, "library/junk:1");
    assert!(matches!(result, Err(ScanError::MalformedArchive(_))), "{result:?}");
}
