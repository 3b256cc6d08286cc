use std::sync::Arc;
use std::thread;

use dreg_cas::{sweep, ContentStore, Digest, EvictionPolicy};
use tempfile::TempDir;

#[test]
fn stress_test_concurrent_writers() {
    const WRITERS: usize = 8;
    const BLOBS: usize = 50;

    let temp = TempDir::new().unwrap();
    let store = Arc::new(ContentStore::new(temp.path()).unwrap());

    // Every writer stores the same set, half of it shared content
    let contents: Vec<Vec<u8>> = (0..BLOBS)
        .map(|i| {
            if i % 2 == 0 {
                format!("content unique {i}").into_bytes()
            } else {
                b"shared content".to_vec()
            }
        })
        .collect();
    let contents = Arc::new(contents);

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let store = store.clone();
            let contents = contents.clone();
            thread::spawn(move || {
                for data in contents.iter() {
                    let digest = Digest::of(data);
                    store.put_blob(&digest, data.as_slice()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    // 25 unique + 1 shared
    let stats = store.stats().unwrap();
    assert_eq!(stats.blob_count, 26);
    for data in contents.iter() {
        let digest = Digest::of(data);
        assert_eq!(store.get_blob(&digest).unwrap(), *data);
        store.verify_blob(&digest).unwrap();
    }

    // No temp files left behind
    assert_eq!(std::fs::read_dir(store.blobs_dir()).unwrap().count(), 26);
}

#[test]
fn stress_test_index_overwrites_are_whole() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(ContentStore::new(temp.path()).unwrap());

    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            let store = store.clone();
            thread::spawn(move || {
                let doc = vec![b'a' + i; 64 * 1024];
                for _ in 0..10 {
                    store.put_index("library/app:latest", &doc).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let doc = store.get_index("library/app:latest").unwrap();
    assert_eq!(doc.len(), 64 * 1024);
    assert!(doc.iter().all(|b| *b == doc[0]));
}

#[test]
fn stress_test_sweep_to_size() {
    let temp = TempDir::new().unwrap();
    let store = ContentStore::new(temp.path()).unwrap();
    for i in 0..40u32 {
        store.put_blob_bytes(&vec![i as u8; 1024]).unwrap();
    }

    let policy = EvictionPolicy {
        max_bytes: Some(10 * 1024),
        max_age: None,
    };
    let report = sweep(&store, &policy, std::time::SystemTime::now(), false).unwrap();

    assert_eq!(report.blobs_scanned, 40);
    assert_eq!(report.blobs_removed, 30);
    assert!(report.bytes_remaining <= 10 * 1024);
    assert_eq!(store.stats().unwrap().blob_count, 10);
}
