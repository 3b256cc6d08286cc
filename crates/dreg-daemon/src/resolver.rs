//! # Resolver
//!
//! Turns registry lookups into cache reads, populating the cache from the
//! runtime on a miss:
//!
//! ```text
//! cache hit? ──yes──▶ serve
//!     │no
//!     ▼
//! lock name ─▶ re-check ─▶ list (pull once if absent) ─▶ export ─▶ scan ─▶ re-check
//! ```
//!
//! Population runs on its own task, so a client that disconnects mid-request
//! does not cut a scan short.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use dreg_archive::scan_channel;
use dreg_cas::{CasError, ContentStore, Digest};
use dreg_config::{log_scan_info, log_scan_warn};
use dreg_runtime::{ImageRuntime, ImageSummary};
use tracing::instrument;

use crate::error::{RegistryError, Result};
use crate::keyed_lock::{KeyedGuard, KeyedLocks};

/// Key under which the index document of `repository:tag` is cached.
pub fn index_key(repository: &str, tag: &str) -> String {
    format!("{repository}:{tag}")
}

#[derive(Clone)]
pub struct Resolver {
    runtime: Arc<dyn ImageRuntime>,
    store: ContentStore,
    locks: KeyedLocks,
    serialize_scans: bool,
}

impl Resolver {
    pub fn new(runtime: Arc<dyn ImageRuntime>, store: ContentStore, serialize_scans: bool) -> Self {
        Self {
            runtime,
            store,
            locks: KeyedLocks::new(),
            serialize_scans,
        }
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    /// Path of the blob `digest`, exporting images of `repository` until one
    /// of them contains it.
    #[instrument(skip(self, digest), fields(digest = %digest))]
    pub async fn blob(&self, repository: &str, digest: &Digest) -> Result<PathBuf> {
        let wanted = *digest;
        if let Some(path) = self.cached(move |store| store.blob_path_for_digest(&wanted)).await? {
            return Ok(path);
        }

        let this = self.clone();
        let repo = repository.to_string();
        tokio::spawn(async move { this.populate_blob(&repo, &wanted).await })
            .await
            .map_err(|e| RegistryError::Internal(format!("blob population task: {e}")))??;

        self.cached(move |store| store.blob_path_for_digest(&wanted))
            .await?
            .ok_or(RegistryError::BlobUnknown(wanted))
    }

    /// Index document for `repository:tag`, pulling the image at most once.
    #[instrument(skip(self))]
    pub async fn index(&self, repository: &str, tag: &str) -> Result<Vec<u8>> {
        let key = index_key(repository, tag);
        if let Some(doc) = self.cached_index(&key).await? {
            return Ok(doc);
        }

        let this = self.clone();
        let (repo, tag_owned) = (repository.to_string(), tag.to_string());
        tokio::spawn(async move { this.populate_index(&repo, &tag_owned).await })
            .await
            .map_err(|e| RegistryError::Internal(format!("index population task: {e}")))??;

        // Eviction may remove the document again before it is read back.
        self.cached_index(&key)
            .await?
            .ok_or(RegistryError::Unmaterialized(key))
    }

    /// Run a cache read on the blocking pool.
    async fn cached<T, F>(&self, read: F) -> Result<T>
    where
        F: FnOnce(&ContentStore) -> T + Send + 'static,
        T: Send + 'static,
    {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || read(&store))
            .await
            .map_err(|e| RegistryError::Internal(format!("cache task: {e}")))
    }

    /// The cached index document under `key`, if any.
    async fn cached_index(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = key.to_string();
        match self.cached(move |store| store.get_index(&key)).await? {
            Ok(doc) => Ok(Some(doc)),
            Err(CasError::IndexNotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn lock(&self, repository: &str) -> Option<KeyedGuard> {
        if self.serialize_scans {
            Some(self.locks.lock(repository).await)
        } else {
            None
        }
    }

    async fn populate_blob(&self, repository: &str, digest: &Digest) -> Result<()> {
        let _guard = self.lock(repository).await;
        let wanted = *digest;
        if self.cached(move |store| store.contains_blob(&wanted)).await? {
            return Ok(());
        }

        let mut images = self.list(repository).await?;
        if images.is_empty() {
            // The digest may name a layer or config rather than a manifest,
            // in which case there is nothing to pull and the answer is 404.
            let reference = digest.to_string();
            match self.runtime.pull_image(repository, &reference).await {
                Ok(()) => images = self.list(repository).await?,
                Err(e) => {
                    log_scan_warn!(
                        "Pull by digest failed",
                        name = repository,
                        digest = reference.as_str(),
                        error = e.to_string()
                    );
                }
            }
        }

        for image in &images {
            // Tags of other repositories must not name this image's index.
            let key = match image.tags_in(repository).next() {
                Some(tag) => index_key(repository, tag),
                None => format!("{repository}@{}", image.id),
            };
            self.export_and_scan(&image.id, &key).await?;
            if self.cached(move |store| store.contains_blob(&wanted)).await? {
                break;
            }
        }
        Ok(())
    }

    async fn populate_index(&self, repository: &str, tag: &str) -> Result<()> {
        let key = index_key(repository, tag);
        let _guard = self.lock(repository).await;
        let cached_key = key.clone();
        if self.cached(move |store| store.contains_index(&cached_key)).await? {
            return Ok(());
        }

        let image = match tagged(&self.list(repository).await?, repository, tag)? {
            Some(image) => image,
            None => {
                // Exactly one pull per request; failure ends the request.
                self.runtime
                    .pull_image(repository, tag)
                    .await
                    .map_err(|e| RegistryError::upstream(key.clone(), e))?;
                match tagged(&self.list(repository).await?, repository, tag)? {
                    Some(image) => image,
                    None => {
                        log_scan_warn!("Pulled image not listed", name = key.as_str());
                        return Ok(());
                    }
                }
            }
        };

        self.export_and_scan(&image.id, &key).await
    }

    async fn list(&self, repository: &str) -> Result<Vec<ImageSummary>> {
        self.runtime
            .list_images(repository)
            .await
            .map_err(|e| RegistryError::upstream(repository, e))
    }

    /// Export image `id` and scan it, storing its index under `key`.
    async fn export_and_scan(&self, id: &str, key: &str) -> Result<()> {
        log_scan_info!("Exporting image", image = id, name = key);
        let rx = self
            .runtime
            .export_image(id)
            .await
            .map_err(|e| RegistryError::upstream(id, e))?;

        let store = self.store.clone();
        let name = key.to_string();
        let scanned = tokio::task::spawn_blocking(move || scan_channel(&store, rx, &name))
            .await
            .map_err(|e| RegistryError::Internal(format!("scan task: {e}")))?;
        scanned.map_err(|e| RegistryError::from_scan(id, e))?;
        Ok(())
    }
}

/// The single image carrying `repository:tag`; several distinct images is an
/// error.
fn tagged(images: &[ImageSummary], repository: &str, tag: &str) -> Result<Option<ImageSummary>> {
    let ids: BTreeSet<&str> = images
        .iter()
        .filter(|image| image.has_tag(repository, tag))
        .map(|image| image.id.as_str())
        .collect();
    match ids.len() {
        0 => Ok(None),
        1 => Ok(images.iter().find(|image| image.has_tag(repository, tag)).cloned()),
        _ => Err(RegistryError::AmbiguousTag {
            tag: tag.to_string(),
            ids: ids.into_iter().map(String::from).collect(),
        }),
    }
}
