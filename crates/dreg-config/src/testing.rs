//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Temporary cache roots
//! - A matching `Config`
//!
//! # Usage
//!
//! ```ignore
//! use dreg_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let store = env.store().unwrap();
//!     // env.cache_root and env.config() are isolated per test
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use dreg_cas::ContentStore;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated cache root directory
    pub cache_root: PathBuf,
    /// Scratch directory for fixtures
    pub scratch_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let cache_root = root.join("cache");
        let scratch_dir = root.join("scratch");
        std::fs::create_dir_all(&cache_root)?;
        std::fs::create_dir_all(&scratch_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            cache_root,
            scratch_dir,
            test_id,
        })
    }

    /// Open the content store rooted at this environment's cache root.
    pub fn store(&self) -> anyhow::Result<ContentStore> {
        Ok(ContentStore::new(&self.cache_root)?)
    }

    /// Default config pointing at this environment's cache root and a
    /// socket path that never exists.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.cache_root = self.cache_root.clone();
        cfg.server.listen = "127.0.0.1:0".to_string();
        cfg.runtime.socket = self
            .scratch_dir
            .join(format!("docker-test-{}.sock", self.test_id));
        cfg
    }

    /// Write a fixture file under the scratch directory
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.scratch_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
