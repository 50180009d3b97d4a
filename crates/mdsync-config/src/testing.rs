//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - Isolated global and project config files
//! - A scratch directory for workloads and reports
//!
//! # Usage
//!
//! ```ignore
//! use mdsync_config::testing::TestEnvironment;
//!
//! let env = TestEnvironment::new().unwrap();
//! env.write_project_config("[sync]\nwrite_strategy = \"centralized\"\n").unwrap();
//! let config = env.load_config().unwrap();
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::{Config, ConfigError};

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with its own config locations
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Stand-in for `~/.mdsync/config.toml`
    pub global_config: PathBuf,
    /// Stand-in for `.mdsync/config.toml`
    pub project_config: PathBuf,
    /// Project root for the test
    pub project_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let home = root.join("home").join(".mdsync");
        let project_root = root.join("project");
        let project_dir = project_root.join(".mdsync");

        std::fs::create_dir_all(&home)?;
        std::fs::create_dir_all(&project_dir)?;

        Ok(Self {
            global_config: home.join("config.toml"),
            project_config: project_dir.join("config.toml"),
            project_root,
            _temp_dir: temp_dir,
            test_id,
        })
    }

    /// Write the global config file
    pub fn write_global_config(&self, contents: &str) -> anyhow::Result<PathBuf> {
        std::fs::write(&self.global_config, contents)?;
        Ok(self.global_config.clone())
    }

    /// Write the project config file
    pub fn write_project_config(&self, contents: &str) -> anyhow::Result<PathBuf> {
        std::fs::write(&self.project_config, contents)?;
        Ok(self.project_config.clone())
    }

    /// Create a file under the project root
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.project_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Load config through the same layering as production
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        Config::load_from(Some(&self.global_config), &self.project_config)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}
