//! On-disk layout of the daemon state directory.
//!
//! Everything the daemon persists lives under `~/.ai-consultation-mcp/`:
//! the lock file, the database (plus WAL sidecars), legacy-migration
//! backups and the `.migrated` idempotency flag.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::BaseDirs;

pub const STATE_DIR_NAME: &str = ".ai-consultation-mcp";
pub const LOCK_FILE_NAME: &str = "daemon.lock";
pub const DB_FILE_NAME: &str = "data.db";
pub const MIGRATED_FLAG_NAME: &str = ".migrated";
pub const BACKUP_DIR_NAME: &str = "backup";

#[derive(Debug, Clone)]
pub struct DaemonPaths {
    root: PathBuf,
}

impl DaemonPaths {
    /// Resolve the state directory under the user's home, creating it if
    /// needed.
    pub fn resolve() -> Result<Self> {
        let base = BaseDirs::new().context("could not determine the user home directory")?;
        Self::at(base.home_dir().join(STATE_DIR_NAME))
    }

    /// Use an explicit root. Tests point this at a tempdir.
    pub fn at(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create state dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE_NAME)
    }

    pub fn db_file(&self) -> PathBuf {
        self.root.join(DB_FILE_NAME)
    }

    pub fn migrated_flag(&self) -> PathBuf {
        self.root.join(MIGRATED_FLAG_NAME)
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.root.join(BACKUP_DIR_NAME)
    }

    /// Directory the browser UI assets are served from.
    pub fn webui_dir(&self) -> PathBuf {
        self.root.join("webui")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let paths = DaemonPaths::at(dir.path().join("state")).unwrap();

        assert!(paths.root().exists());
        assert_eq!(paths.lock_file().file_name().unwrap(), LOCK_FILE_NAME);
        assert_eq!(paths.db_file().file_name().unwrap(), DB_FILE_NAME);
        assert!(paths.backup_dir().starts_with(paths.root()));
    }
}
