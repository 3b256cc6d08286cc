//! # dreg-cas
//!
//! Content-addressable blob cache plus a name-keyed index cache, both
//! rooted under one directory.
//!
//! ## Directory Layout
//!
//! ```text
//! <cache-root>/
//! ├── blobs/
//! │   └── sha256/
//! │       └── 2cf24dba...9824          # raw blob bytes, one file per digest
//! └── indexes/
//!     └── library/nginx:latest/
//!         └── index.json               # latest index document for that name
//! ```
//!
//! Blobs are write-once per digest. Index documents are overwritten on every
//! repopulation; the last writer wins.

mod digest;
pub mod eviction;

pub use digest::{Digest, DigestWriter, ParseDigestError, ALGORITHM};
pub use eviction::{sweep, EvictionPolicy, EvictionReport};

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::instrument;

/// Copy buffer used when streaming blobs to disk.
pub const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// File name of the index document inside each index directory.
pub const INDEX_FILE: &str = "index.json";

const BLOBS_DIR: &str = "blobs";
const INDEXES_DIR: &str = "indexes";
const TEMP_SUFFIX: &str = "tmp";

/// Errors that can occur during cache operations
#[derive(Error, Debug)]
pub enum CasError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Blob not found: {digest}")]
    NotFound { digest: String },

    #[error("Index not found: {name}")]
    IndexNotFound { name: String },

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Invalid index name: {0:?}")]
    InvalidName(String),
}

pub type Result<T> = std::result::Result<T, CasError>;

/// Disk-backed cache of blobs (by digest) and index documents (by name).
///
/// Cloning is cheap; all state lives on disk.
#[derive(Debug, Clone)]
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    /// Open a cache at the given root directory.
    ///
    /// The directory will be created if it doesn't exist.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Get the root path of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every blob file.
    pub fn blobs_dir(&self) -> PathBuf {
        self.root.join(BLOBS_DIR).join(ALGORITHM)
    }

    /// Directory holding every index document.
    pub fn indexes_dir(&self) -> PathBuf {
        self.root.join(INDEXES_DIR)
    }

    /// Path where a blob with the given digest is stored: `blobs/sha256/<hex>`.
    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blobs_dir().join(digest.to_hex())
    }

    /// Path where the index document for `name` is stored: `indexes/<name>/index.json`.
    ///
    /// The name is used verbatim as a nested path, so anything that could
    /// escape the index directory is refused.
    fn index_path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        let well_formed = !name.is_empty()
            && !name.split('/').any(str::is_empty)
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !well_formed {
            return Err(CasError::InvalidName(name.to_string()));
        }
        Ok(self.indexes_dir().join(relative).join(INDEX_FILE))
    }

    /// Check if a blob exists in the cache.
    pub fn contains_blob(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Get the filesystem path to a blob, if present (for streaming responses).
    pub fn blob_path_for_digest(&self, digest: &Digest) -> Option<PathBuf> {
        let path = self.blob_path(digest);
        path.is_file().then_some(path)
    }

    /// Stream `reader` into the cache under `digest`.
    ///
    /// Bytes are copied through a 1 MiB buffer into a temp file next to the
    /// final path, hashed on the way, and renamed into place only when the
    /// hash matches. A blob that already exists is not rewritten; the reader
    /// is drained so callers walking a stream stay positioned correctly.
    ///
    /// Returns the number of bytes newly written (0 when already present).
    #[instrument(skip(self, digest, reader), fields(digest = %digest), level = "debug")]
    pub fn put_blob<R: Read>(&self, digest: &Digest, mut reader: R) -> Result<u64> {
        let path = self.blob_path(digest);

        if path.is_file() {
            io::copy(&mut reader, &mut io::sink())?;
            return Ok(0);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = temp_path_for(&path);
        let written = match copy_hashed(&mut reader, &temp_path) {
            Ok((written, actual)) if actual == *digest => written,
            Ok((_, actual)) => {
                let _ = fs::remove_file(&temp_path);
                return Err(CasError::DigestMismatch {
                    expected: digest.to_string(),
                    actual: actual.to_string(),
                });
            }
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                return Err(e);
            }
        };

        // Same content either way if another writer got there first.
        if let Err(e) = fs::rename(&temp_path, &path) {
            let _ = fs::remove_file(&temp_path);
            if path.is_file() {
                return Ok(0);
            }
            return Err(CasError::Io(e));
        }

        tracing::debug!(bytes = written, path = %path.display(), "blob written");
        Ok(written)
    }

    /// Store in-memory bytes, returning their digest.
    pub fn put_blob_bytes(&self, data: &[u8]) -> Result<Digest> {
        let digest = Digest::of(data);
        self.put_blob(&digest, data)?;
        Ok(digest)
    }

    /// Retrieve blob bytes by digest.
    #[instrument(skip(self, digest), fields(digest = %digest), level = "debug")]
    pub fn get_blob(&self, digest: &Digest) -> Result<Vec<u8>> {
        match fs::read(self.blob_path(digest)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CasError::NotFound {
                digest: digest.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-hash a stored blob and check it still matches its digest.
    pub fn verify_blob(&self, digest: &Digest) -> Result<()> {
        let path = self.blob_path(digest);
        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(CasError::NotFound {
                    digest: digest.to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let mut hasher = DigestWriter::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let actual = hasher.finish();
        if actual != *digest {
            return Err(CasError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Delete a blob from the cache.
    pub fn delete_blob(&self, digest: &Digest) -> Result<()> {
        match fs::remove_file(self.blob_path(digest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CasError::NotFound {
                digest: digest.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the index document stored for `name`.
    #[instrument(skip(self, data), level = "debug")]
    pub fn put_index(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.index_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = temp_path_for(&path);
        let written = (|| -> io::Result<()> {
            let mut file = File::create(&temp_path)?;
            file.write_all(data)?;
            file.sync_all()
        })();
        if let Err(e) = written.and_then(|()| fs::rename(&temp_path, &path)) {
            let _ = fs::remove_file(&temp_path);
            return Err(CasError::Io(e));
        }
        Ok(())
    }

    /// Retrieve the latest index document stored for `name`.
    pub fn get_index(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.index_path(name)?;
        match fs::read(path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(CasError::IndexNotFound {
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Check if an index document exists for `name`.
    pub fn contains_index(&self, name: &str) -> bool {
        self.index_path(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Iterate over the digests of all stored blobs.
    ///
    /// Temp files and names that are not valid digests are skipped.
    pub fn iter_blobs(&self) -> Result<impl Iterator<Item = Result<Digest>>> {
        let dir = self.blobs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => Some(entries),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };
        Ok(entries.into_iter().flatten().filter_map(|entry| match entry {
            Ok(entry) => entry
                .file_name()
                .to_str()
                .and_then(Digest::from_hex)
                .map(Ok),
            Err(e) => Some(Err(CasError::Io(e))),
        }))
    }

    /// Get statistics about the cache.
    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();
        for digest in self.iter_blobs()? {
            let digest = digest?;
            if let Ok(meta) = fs::metadata(self.blob_path(&digest)) {
                stats.blob_count += 1;
                stats.blob_bytes += meta.len();
            }
        }
        let indexes = self.indexes_dir();
        if indexes.exists() {
            stats.index_count = walkdir::WalkDir::new(indexes)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file() && e.file_name() == INDEX_FILE)
                .count() as u64;
        }
        Ok(stats)
    }
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    /// Number of blobs stored
    pub blob_count: u64,
    /// Total blob bytes
    pub blob_bytes: u64,
    /// Number of index documents
    pub index_count: u64,
}

/// Unique temp name beside `path`, so the final rename never crosses filesystems.
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(
        ".{}.{}.{:?}.{}",
        name,
        std::process::id(),
        std::thread::current().id(),
        TEMP_SUFFIX
    ))
}

/// Whether a file name is one of our in-flight temp files.
pub(crate) fn is_temp_name(name: &str) -> bool {
    name.starts_with('.') && name.ends_with(TEMP_SUFFIX)
}

fn copy_hashed<R: Read>(reader: &mut R, temp_path: &Path) -> Result<(u64, Digest)> {
    let mut file = File::create(temp_path)?;
    let mut hasher = DigestWriter::new();
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut written = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])?;
        written += n as u64;
    }
    file.sync_all()?;
    Ok((written, hasher.finish()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_and_get_blob() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        let data = b"hello";
        let digest = Digest::of(data);
        let written = cas.put_blob(&digest, &data[..]).unwrap();
        assert_eq!(written, 5);

        assert_eq!(cas.get_blob(&digest).unwrap(), data);
        assert_eq!(
            digest.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_blob_path_layout() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        let digest = cas.put_blob_bytes(b"layout").unwrap();
        let expected = temp.path().join("blobs").join("sha256").join(digest.to_hex());
        assert_eq!(cas.blob_path_for_digest(&digest), Some(expected));
    }

    #[test]
    fn test_put_blob_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        let data = b"Duplicate content";
        let digest = Digest::of(data);
        assert_eq!(cas.put_blob(&digest, &data[..]).unwrap(), data.len() as u64);
        assert_eq!(cas.put_blob(&digest, &data[..]).unwrap(), 0);

        assert_eq!(cas.get_blob(&digest).unwrap(), data);
        assert_eq!(cas.stats().unwrap().blob_count, 1);
    }

    #[test]
    fn test_existing_blob_drains_reader() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        let digest = cas.put_blob_bytes(b"abc").unwrap();
        let mut reader = io::Cursor::new(b"abc".to_vec());
        cas.put_blob(&digest, &mut reader).unwrap();
        assert_eq!(reader.position(), 3);
    }

    #[test]
    fn test_digest_mismatch_leaves_nothing_behind() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        let claimed = Digest::of(b"expected");
        let result = cas.put_blob(&claimed, &b"something else"[..]);
        assert!(matches!(result, Err(CasError::DigestMismatch { .. })));

        assert!(!cas.contains_blob(&claimed));
        let leftovers: Vec<_> = fs::read_dir(cas.blobs_dir()).unwrap().collect();
        assert!(leftovers.is_empty(), "temp file must be removed");
    }

    #[test]
    fn test_not_found() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        let result = cas.get_blob(&Digest::of(b"missing"));
        assert!(matches!(result, Err(CasError::NotFound { .. })));
        let result = cas.get_index("library/missing:latest");
        assert!(matches!(result, Err(CasError::IndexNotFound { .. })));
    }

    #[test]
    fn test_empty_blob() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        let digest = cas.put_blob_bytes(b"").unwrap();
        assert!(cas.get_blob(&digest).unwrap().is_empty());
    }

    #[test]
    fn test_index_overwrite_last_writer_wins() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        let name = "ghcr.io/acme/app:v1";
        cas.put_index(name, b"{\"v\":1}").unwrap();
        cas.put_index(name, b"{\"v\":2}").unwrap();
        assert_eq!(cas.get_index(name).unwrap(), b"{\"v\":2}");

        let path = temp
            .path()
            .join("indexes/ghcr.io/acme/app:v1")
            .join(INDEX_FILE);
        assert!(path.is_file());
    }

    #[test]
    fn test_index_name_cannot_escape_root() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        for name in ["", "../etc", "a/../../b", "/abs", "a//b", "./a"] {
            assert!(
                matches!(cas.put_index(name, b"{}"), Err(CasError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
        assert!(!cas.contains_index("../etc"));
    }

    #[test]
    fn test_verify_blob_detects_corruption() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        let digest = cas.put_blob_bytes(b"pristine").unwrap();
        cas.verify_blob(&digest).unwrap();

        let path = cas.blob_path_for_digest(&digest).unwrap();
        fs::write(&path, b"tampered").unwrap();
        assert!(matches!(
            cas.verify_blob(&digest),
            Err(CasError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_iter_and_stats() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        let d1 = cas.put_blob_bytes(b"content1").unwrap();
        let d2 = cas.put_blob_bytes(b"content2").unwrap();
        cas.put_index("library/app:1", b"{}").unwrap();
        // A stray temp file is not a blob.
        fs::write(cas.blobs_dir().join(".partial.1.tmp"), b"x").unwrap();

        let mut found: Vec<_> = cas.iter_blobs().unwrap().map(|d| d.unwrap()).collect();
        found.sort();
        let mut expected = vec![d1, d2];
        expected.sort();
        assert_eq!(found, expected);

        let stats = cas.stats().unwrap();
        assert_eq!(stats.blob_count, 2);
        assert_eq!(stats.blob_bytes, 16);
        assert_eq!(stats.index_count, 1);
    }

    #[test]
    fn test_delete_blob() {
        let temp = TempDir::new().unwrap();
        let cas = ContentStore::new(temp.path()).unwrap();

        let digest = cas.put_blob_bytes(b"bye").unwrap();
        cas.delete_blob(&digest).unwrap();
        assert!(!cas.contains_blob(&digest));
        assert!(matches!(
            cas.delete_blob(&digest),
            Err(CasError::NotFound { .. })
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn blob_round_trip(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
                let temp = TempDir::new().unwrap();
                let cas = ContentStore::new(temp.path()).unwrap();
                let digest = Digest::of(&data);
                cas.put_blob(&digest, &data[..]).unwrap();
                prop_assert_eq!(cas.get_blob(&digest).unwrap(), data);
            }
        }
    }
}
