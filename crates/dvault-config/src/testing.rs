//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Isolated store roots
//! - A scratch directory for local client files
//! - A matching `Config`
//!
//! # Usage
//!
//! ```ignore
//! use dvault_config::testing::TestEnvironment;
//!
//! #[tokio::test]
//! async fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let config = env.config();
//!     // config.storage.root points at env.store_root
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated store root directory
    pub store_root: PathBuf,
    /// Local files uploaded or downloaded by the client
    pub work_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let store_root = root.join(format!("store-{}", test_id));
        let work_dir = root.join("work");
        std::fs::create_dir_all(&store_root)?;
        std::fs::create_dir_all(&work_dir)?;

        Ok(Self {
            _temp_dir: temp_dir,
            store_root,
            work_dir,
            test_id,
        })
    }

    /// Config rooted in this environment, listening on an ephemeral port.
    pub fn config(&self) -> Config {
        let mut cfg = Config::default();
        cfg.storage.root = self.store_root.clone();
        cfg.daemon.listen = "127.0.0.1:0".to_string();
        cfg
    }

    /// Config with a specific reserved capacity.
    pub fn config_with_capacity(&self, reserved_capacity: u64) -> Config {
        let mut cfg = self.config();
        cfg.storage.reserved_capacity = reserved_capacity;
        cfg
    }

    /// Create a local file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.work_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Path for a local file without creating it
    pub fn work_path(&self, relative_path: &str) -> PathBuf {
        self.work_dir.join(relative_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.store_root.exists());
        assert!(env.work_dir.exists());
    }

    #[test]
    fn test_environment_has_unique_roots() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.store_root, env2.store_root);
        assert_ne!(env1.test_id, env2.test_id);
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("docs/notes.txt", b"hello").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn test_config_points_at_environment() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.config_with_capacity(1234);
        assert_eq!(cfg.storage.root, env.store_root);
        assert_eq!(cfg.storage.reserved_capacity, 1234);
        assert_eq!(cfg.daemon.listen, "127.0.0.1:0");
    }
}
