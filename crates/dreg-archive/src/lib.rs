//! # dreg-archive
//!
//! Reads image export archives straight off the wire.
//!
//! - [`stream`]: forward-only adapter that gives a non-rewindable byte source
//!   the read/skip-ahead interface the tar reader needs
//! - [`scanner`]: walks the archive and fills the content store
//! - [`oci`]: the OCI layout documents found inside an export
//! - [`testing`]: builds export archives in memory

pub mod oci;
pub mod scanner;
pub mod stream;
pub mod testing;

pub use scanner::{BlobScanner, ScanError, ScanReport, MAX_INDEX_BYTES};
pub use stream::{ChannelChunks, ForwardSeek, ForwardStream, ReaderChunks, StreamError};

use std::io;

use bytes::Bytes;
use dreg_cas::ContentStore;
use tokio::sync::mpsc;

/// Scan an export whose bytes arrive on `rx`.
///
/// Blocks the calling thread while waiting for chunks; run it under
/// `tokio::task::spawn_blocking`.
pub fn scan_channel(
    store: &ContentStore,
    rx: mpsc::Receiver<io::Result<Bytes>>,
    image_name: &str,
) -> scanner::Result<ScanReport> {
    BlobScanner::new(store).scan(ForwardStream::from_channel(rx), image_name)
}
