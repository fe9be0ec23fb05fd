//! Persisted layout of the work directory.
//!
//! ```text
//! <work_dir>/
//!   docker-compose.yaml
//!   .env
//!   layout.yaml
//!   genesis-artifacts/        genesis.blob, waypoint.txt, root keys
//!   validators/validator-<i>/ keys, identity, node config, genesis copies
//!   .posnet-run.json
//!   runs/<instance-id>/       per-run scratch (container logs)
//! ```

use std::path::{Path, PathBuf};

use crate::error::{TestnetError, TestnetResult};

pub const COMPOSE_FILE: &str = "docker-compose.yaml";
pub const ENV_FILE: &str = ".env";
pub const LAYOUT_FILE: &str = "layout.yaml";
pub const GENESIS_DIR: &str = "genesis-artifacts";
pub const VALIDATORS_DIR: &str = "validators";
pub const RUN_MARKER_FILE: &str = ".posnet-run.json";
pub const RUNS_DIR: &str = "runs";
pub const ROOT_KEYS_FILE: &str = "root-account-private-keys.yaml";
pub const GENESIS_BLOB_FILE: &str = "genesis.blob";
pub const WAYPOINT_FILE: &str = "waypoint.txt";
pub const FRAMEWORK_FILE: &str = "framework.mrb";

/// Paths under one work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkDir {
    root: PathBuf,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn compose_file(&self) -> PathBuf {
        self.root.join(COMPOSE_FILE)
    }

    pub fn env_file(&self) -> PathBuf {
        self.root.join(ENV_FILE)
    }

    pub fn layout_file(&self) -> PathBuf {
        self.root.join(LAYOUT_FILE)
    }

    pub fn framework_file(&self) -> PathBuf {
        self.root.join(FRAMEWORK_FILE)
    }

    pub fn genesis_dir(&self) -> PathBuf {
        self.root.join(GENESIS_DIR)
    }

    pub fn root_keys_file(&self) -> PathBuf {
        self.genesis_dir().join(ROOT_KEYS_FILE)
    }

    pub fn validators_dir(&self) -> PathBuf {
        self.root.join(VALIDATORS_DIR)
    }

    pub fn validator_dir(&self, index: usize) -> PathBuf {
        self.validators_dir().join(format!("validator-{index}"))
    }

    pub fn run_marker(&self) -> PathBuf {
        self.root.join(RUN_MARKER_FILE)
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join(RUNS_DIR)
    }

    pub fn run_dir(&self, instance_id: &str) -> PathBuf {
        self.runs_dir().join(instance_id)
    }

    /// Creates the directory tree, returning the first failure with its path.
    pub fn create_dirs(&self, validators: usize) -> TestnetResult<()> {
        let mut dirs = vec![self.root.clone(), self.genesis_dir(), self.runs_dir()];
        dirs.extend((0..validators).map(|i| self.validator_dir(i)));
        for dir in dirs {
            std::fs::create_dir_all(&dir).map_err(|e| TestnetError::io(&dir, e))?;
        }
        Ok(())
    }

    /// Removes generated genesis material so no stale artifact survives a
    /// regeneration.
    pub fn clear_generated(&self) -> TestnetResult<()> {
        for dir in [self.genesis_dir(), self.validators_dir()] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(TestnetError::io(&dir, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_clear() {
        let temp = TempDir::new().unwrap();
        let work = WorkDir::new(temp.path().join("net"));

        work.create_dirs(2).unwrap();
        assert!(work.validator_dir(1).is_dir());
        assert!(work.genesis_dir().is_dir());
        assert!(work.runs_dir().is_dir());

        std::fs::write(work.genesis_dir().join(GENESIS_BLOB_FILE), b"old").unwrap();
        work.clear_generated().unwrap();
        assert!(!work.genesis_dir().exists());
        assert!(!work.validators_dir().exists());
        assert!(work.runs_dir().is_dir());

        // Clearing twice is fine.
        work.clear_generated().unwrap();
    }

    #[test]
    fn test_paths() {
        let work = WorkDir::new("/w");
        assert_eq!(work.validator_dir(3), PathBuf::from("/w/validators/validator-3"));
        assert_eq!(
            work.root_keys_file(),
            PathBuf::from("/w/genesis-artifacts/root-account-private-keys.yaml")
        );
        assert_eq!(work.run_dir("abc"), PathBuf::from("/w/runs/abc"));
    }
}
