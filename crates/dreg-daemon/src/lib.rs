//! # dreg-daemon
//!
//! Read-only registry facade over the local image store. Blobs and index
//! documents are served from the content cache; misses are filled by
//! exporting images from the runtime and scanning the archive.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::Router;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use dreg_cas::{sweep, CasError, ContentStore, EvictionPolicy};
use dreg_config::{log_cache_debug, log_cache_info, log_cache_warn, Config, RegistryConfig};
use dreg_runtime::ImageRuntime;

pub mod error;
pub mod keyed_lock;
pub mod reference;
pub mod resolver;
pub mod routes;

pub use error::{RegistryError, Result};
pub use resolver::Resolver;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Resolver,
    pub registry: RegistryConfig,
}

impl AppState {
    pub fn new(config: &Config, runtime: Arc<dyn ImageRuntime>) -> std::result::Result<Self, CasError> {
        let store = ContentStore::new(&config.storage.cache_root)?;
        Ok(Self {
            resolver: Resolver::new(runtime, store, config.registry.serialize_scans),
            registry: config.registry.clone(),
        })
    }
}

pub fn app(state: AppState) -> Router {
    routes::router()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Sweep the cache every `interval` until the task is aborted.
pub fn spawn_eviction(store: ContentStore, policy: EvictionPolicy, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let (store, policy) = (store.clone(), policy.clone());
            let swept =
                tokio::task::spawn_blocking(move || sweep(&store, &policy, SystemTime::now(), false)).await;
            match swept {
                Ok(Ok(report)) if report.blobs_removed > 0 || report.indexes_removed > 0 => {
                    log_cache_info!(
                        "Evicted",
                        blobs = report.blobs_removed,
                        bytes = report.bytes_removed,
                        indexes = report.indexes_removed,
                        remaining = report.bytes_remaining
                    );
                }
                Ok(Ok(_)) => log_cache_debug!("Eviction sweep found nothing"),
                Ok(Err(e)) => log_cache_warn!("Eviction sweep failed", error = e.to_string()),
                Err(e) => log_cache_warn!("Eviction task panicked", error = e.to_string()),
            }
        }
    })
}
