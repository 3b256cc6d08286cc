//! # Eviction
//!
//! Out-of-band sweep that bounds cache growth by age and total size.
//! Nothing on the request path calls into this module.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{is_temp_name, ContentStore, Result, INDEX_FILE};

/// What to remove during a sweep. The default policy removes nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionPolicy {
    /// Keep total blob bytes at or below this size, dropping least recently
    /// modified blobs first.
    pub max_bytes: Option<u64>,
    /// Drop blobs and index documents not modified within this window.
    pub max_age: Option<Duration>,
}

impl EvictionPolicy {
    pub fn is_noop(&self) -> bool {
        self.max_bytes.is_none() && self.max_age.is_none()
    }
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvictionReport {
    pub blobs_scanned: u64,
    pub blobs_removed: u64,
    pub bytes_removed: u64,
    pub indexes_removed: u64,
    pub bytes_remaining: u64,
}

struct Candidate {
    path: PathBuf,
    size: u64,
    modified: SystemTime,
}

/// Run one eviction pass over `store` using `now` as the reference time.
///
/// With `dry_run` the report is computed but nothing is deleted.
pub fn sweep(
    store: &ContentStore,
    policy: &EvictionPolicy,
    now: SystemTime,
    dry_run: bool,
) -> Result<EvictionReport> {
    let mut report = EvictionReport::default();
    if policy.is_noop() {
        return Ok(report);
    }

    let mut blobs = collect(store.blobs_dir(), |name| !is_temp_name(name))?;
    report.blobs_scanned = blobs.len() as u64;

    let expired = |c: &Candidate| match policy.max_age {
        Some(max_age) => now
            .duration_since(c.modified)
            .map(|age| age > max_age)
            .unwrap_or(false),
        None => false,
    };

    // Age pass
    let mut kept = Vec::with_capacity(blobs.len());
    for blob in blobs.drain(..) {
        if expired(&blob) {
            remove(&blob, dry_run, &mut report);
        } else {
            kept.push(blob);
        }
    }

    // Size pass: oldest first until under the cap
    let mut total: u64 = kept.iter().map(|c| c.size).sum();
    if let Some(max_bytes) = policy.max_bytes {
        kept.sort_by_key(|c| c.modified);
        for blob in kept.iter() {
            if total <= max_bytes {
                break;
            }
            if remove(blob, dry_run, &mut report) {
                total -= blob.size;
            }
        }
    }
    report.bytes_remaining = total;

    if policy.max_age.is_some() {
        let indexes = collect(store.indexes_dir(), |name| name == INDEX_FILE)?;
        for index in indexes.iter().filter(|c| expired(*c)) {
            debug!(path = %index.path.display(), "evicting index");
            if dry_run || fs::remove_file(&index.path).is_ok() {
                report.indexes_removed += 1;
            }
        }
    }

    info!(
        removed = report.blobs_removed,
        bytes = report.bytes_removed,
        indexes = report.indexes_removed,
        remaining = report.bytes_remaining,
        dry_run,
        "eviction sweep complete"
    );
    Ok(report)
}

fn collect(dir: PathBuf, keep: impl Fn(&str) -> bool) -> Result<Vec<Candidate>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if !keep(&name) {
            continue;
        }
        let meta = entry.metadata().map_err(std::io::Error::from)?;
        out.push(Candidate {
            path: entry.into_path(),
            size: meta.len(),
            modified: meta.modified()?,
        });
    }
    Ok(out)
}

fn remove(candidate: &Candidate, dry_run: bool, report: &mut EvictionReport) -> bool {
    if !dry_run {
        if let Err(e) = fs::remove_file(&candidate.path) {
            warn!(path = %candidate.path.display(), error = %e, "failed to evict blob");
            return false;
        }
    }
    debug!(path = %candidate.path.display(), size = candidate.size, "evicted blob");
    report.blobs_removed += 1;
    report.bytes_removed += candidate.size;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn age(store: &ContentStore, digest: &crate::Digest, when: SystemTime) {
        let path = store.blob_path_for_digest(digest).unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    #[test]
    fn test_noop_policy_keeps_everything() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::new(temp.path()).unwrap();
        let digest = store.put_blob_bytes(b"keep me").unwrap();

        let report = sweep(&store, &EvictionPolicy::default(), SystemTime::now(), false).unwrap();
        assert_eq!(report, EvictionReport::default());
        assert!(store.contains_blob(&digest));
    }

    #[test]
    fn test_size_cap_removes_oldest_first() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::new(temp.path()).unwrap();
        let now = SystemTime::now();

        let old = store.put_blob_bytes(&[1u8; 100]).unwrap();
        let mid = store.put_blob_bytes(&[2u8; 100]).unwrap();
        let new = store.put_blob_bytes(&[3u8; 100]).unwrap();
        age(&store, &old, now - Duration::from_secs(300));
        age(&store, &mid, now - Duration::from_secs(200));
        age(&store, &new, now - Duration::from_secs(100));

        let policy = EvictionPolicy {
            max_bytes: Some(150),
            max_age: None,
        };
        let report = sweep(&store, &policy, now, false).unwrap();

        assert_eq!(report.blobs_scanned, 3);
        assert_eq!(report.blobs_removed, 2);
        assert_eq!(report.bytes_remaining, 100);
        assert!(!store.contains_blob(&old));
        assert!(!store.contains_blob(&mid));
        assert!(store.contains_blob(&new));
    }

    #[test]
    fn test_age_limit_and_dry_run() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::new(temp.path()).unwrap();
        let now = SystemTime::now();

        let stale = store.put_blob_bytes(b"stale").unwrap();
        let fresh = store.put_blob_bytes(b"fresh").unwrap();
        age(&store, &stale, now - Duration::from_secs(7200));

        let policy = EvictionPolicy {
            max_bytes: None,
            max_age: Some(Duration::from_secs(3600)),
        };

        let report = sweep(&store, &policy, now, true).unwrap();
        assert_eq!(report.blobs_removed, 1);
        assert!(store.contains_blob(&stale), "dry run must not delete");

        sweep(&store, &policy, now, false).unwrap();
        assert!(!store.contains_blob(&stale));
        assert!(store.contains_blob(&fresh));
    }

    #[test]
    fn test_age_limit_applies_to_indexes() {
        let temp = TempDir::new().unwrap();
        let store = ContentStore::new(temp.path()).unwrap();
        store.put_index("library/app:1", b"{}").unwrap();

        let policy = EvictionPolicy {
            max_bytes: None,
            max_age: Some(Duration::from_secs(60)),
        };
        let later = SystemTime::now() + Duration::from_secs(3600);
        let report = sweep(&store, &policy, later, false).unwrap();

        assert_eq!(report.indexes_removed, 1);
        assert!(!store.contains_index("library/app:1"));
    }
}
