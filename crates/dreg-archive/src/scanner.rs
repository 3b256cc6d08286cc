//! Export archive scanner
//!
//! Walks an image export tarball front to back and copies the parts the
//! registry serves into the content store:
//!
//! - `blobs/sha256/<hex>` entries are streamed into the blob cache
//! - `index.json` is hashed, stored as a blob, and stored as the index
//!   document for the image name
//! - everything else is skipped by seeking past it

use std::io::{self, Read, Seek};

use dreg_cas::{CasError, ContentStore, Digest};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::oci::{BLOBS_PREFIX, INDEX_PATH};
use crate::stream::StreamError;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("malformed archive: {0}")]
    MalformedArchive(#[source] io::Error),

    #[error("backward seek on export stream: {0}")]
    UnsupportedSeek(#[source] io::Error),

    #[error("cache write failed: {0}")]
    Cache(#[from] CasError),
}

pub type Result<T> = std::result::Result<T, ScanError>;

/// Largest `index.json` accepted; the document is held in memory.
pub const MAX_INDEX_BYTES: u64 = 16 * 1024 * 1024;

fn oversized_index(size: u64) -> ScanError {
    ScanError::MalformedArchive(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{INDEX_PATH} of {size} bytes exceeds {MAX_INDEX_BYTES}"),
    ))
}

impl From<io::Error> for ScanError {
    fn from(e: io::Error) -> Self {
        let backward = e
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<StreamError>())
            .is_some_and(|s| matches!(s, StreamError::NotSeekableBackward { .. }));
        if backward {
            ScanError::UnsupportedSeek(e)
        } else {
            ScanError::MalformedArchive(e)
        }
    }
}

/// Summary of one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Blobs newly written to the cache
    pub blobs_written: u64,
    /// Blob entries whose digest was already cached
    pub blobs_present: u64,
    /// Entries that were neither blobs nor the index
    pub skipped: u64,
    /// Bytes newly written to the cache
    pub bytes_written: u64,
    /// Digest of the archive's `index.json`, if it had one
    pub index_digest: Option<Digest>,
}

/// What an archive entry is, judged by its path.
#[derive(Debug, PartialEq, Eq)]
enum EntryKind {
    Blob(Digest),
    Index,
    Other,
}

fn classify(path: &str) -> EntryKind {
    let path = path.strip_prefix("./").unwrap_or(path);
    if path == INDEX_PATH {
        return EntryKind::Index;
    }
    match path.strip_prefix(BLOBS_PREFIX).and_then(Digest::from_hex) {
        Some(digest) => EntryKind::Blob(digest),
        None => EntryKind::Other,
    }
}

/// Populates a [`ContentStore`] from export archives.
pub struct BlobScanner<'a> {
    store: &'a ContentStore,
}

impl<'a> BlobScanner<'a> {
    pub fn new(store: &'a ContentStore) -> Self {
        Self { store }
    }

    /// Scan one export archive, storing its index under `image_name`.
    ///
    /// `reader` only needs forward seeks; a
    /// [`ForwardStream`](crate::stream::ForwardStream) is enough. Entries are
    /// handled strictly in archive order. Cache writes made before a failure
    /// are kept; each of them is complete and correctly addressed.
    #[instrument(skip(self, reader), fields(cache = %self.store.root().display()))]
    pub fn scan<R: Read + Seek>(&self, reader: R, image_name: &str) -> Result<ScanReport> {
        let mut report = ScanReport::default();
        let mut archive = tar::Archive::new(reader);

        for entry in archive.entries_with_seek()? {
            let mut entry = entry?;
            if entry.header().entry_type().is_dir() {
                continue;
            }
            let path = entry.path()?.to_string_lossy().into_owned();

            match classify(&path) {
                EntryKind::Blob(digest) => {
                    let present = self.store.contains_blob(&digest);
                    let written = self.store.put_blob(&digest, &mut entry)?;
                    if present {
                        report.blobs_present += 1;
                    } else {
                        report.blobs_written += 1;
                        report.bytes_written += written;
                        debug!(%digest, bytes = written, "stored blob");
                    }
                }
                EntryKind::Index => {
                    if entry.size() > MAX_INDEX_BYTES {
                        return Err(oversized_index(entry.size()));
                    }
                    let mut data = Vec::new();
                    entry.by_ref().take(MAX_INDEX_BYTES + 1).read_to_end(&mut data)?;
                    if data.len() as u64 > MAX_INDEX_BYTES {
                        return Err(oversized_index(data.len() as u64));
                    }
                    let digest = self.store.put_blob_bytes(&data)?;
                    self.store.put_index(image_name, &data)?;
                    debug!(%digest, name = image_name, "stored index");
                    if let Some(previous) = report.index_digest.replace(digest) {
                        warn!(%previous, %digest, "archive carries more than one index.json");
                    }
                }
                EntryKind::Other => {
                    report.skipped += 1;
                }
            }
        }

        info!(
            name = image_name,
            written = report.blobs_written,
            present = report.blobs_present,
            skipped = report.skipped,
            bytes = report.bytes_written,
            "scan complete"
        );
        Ok(report)
    }
}
