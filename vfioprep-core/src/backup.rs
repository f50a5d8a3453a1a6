//! Timestamped file backups taken before any in-place edit.
//!
//! Backups live flat in one directory. The original absolute path is encoded in
//! the file name so that two files with the same base name never collide:
//!
//! ```text
//! backups/
//! ├── etc_default_grub.vfio_bak.20261018142501
//! └── etc_modprobe.d_vfio.conf.vfio_bak.20261018142503
//! ```

use crate::error::{PrepError, Result};
use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Marker between the encoded source path and the timestamp.
const BACKUP_MARKER: &str = ".vfio_bak.";

/// Creates content-preserving copies of files before they are edited.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
    dry_run: bool,
}

impl BackupStore {
    /// Create a store writing into `dir` (created lazily on first backup).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), dry_run: false }
    }

    /// In dry-run mode no file is copied, but the intended backup path is returned.
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Directory backups are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Back up `source`.
    ///
    /// Returns `Ok(None)` when `source` does not exist (nothing to preserve).
    /// Never overwrites an earlier backup: a second backup within the same
    /// second gets a numeric suffix.
    pub fn backup(&self, source: &Path) -> Result<Option<PathBuf>> {
        if !source.exists() {
            debug!(path = %source.display(), "No backup needed, file does not exist");
            return Ok(None);
        }

        let timestamp = Local::now().format("%Y%m%d%H%M%S").to_string();
        let base = format!("{}{}{}", encode_path(source), BACKUP_MARKER, timestamp);
        let mut target = self.dir.join(&base);
        let mut counter = 1;
        while target.exists() {
            target = self.dir.join(format!("{}.{}", base, counter));
            counter += 1;
        }

        if self.dry_run {
            debug!(path = %source.display(), backup = %target.display(), "[dry run] Would back up");
            return Ok(Some(target));
        }

        fs::create_dir_all(&self.dir)
            .map_err(|e| PrepError::BackupFailed { path: self.dir.clone(), source: e })?;
        // fs::copy carries permission bits over with the contents.
        fs::copy(source, &target)
            .map_err(|e| PrepError::BackupFailed { path: source.to_path_buf(), source: e })?;

        info!(path = %source.display(), backup = %target.display(), "Created backup");
        Ok(Some(target))
    }
}

/// Turn `/etc/default/grub` into `etc_default_grub`.
fn encode_path(path: &Path) -> String {
    path.to_string_lossy().trim_start_matches('/').replace('/', "_")
}
