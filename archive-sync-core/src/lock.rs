//! One controller per archive.
//!
//! The guard holds an exclusive advisory lock on `<tmp>/<name>.lock`. The OS
//! drops the lock when the process dies, so a crashed controller never blocks
//! the next one; a live guard releases it on drop.

use crate::error::SyncError;
use fs2::FileExt;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Debug)]
pub struct ExclusivityGuard {
    file: File,
    name: String,
    path: PathBuf,
}

impl ExclusivityGuard {
    /// Lock name for an archive, stable for a given canonical path. An archive
    /// that does not exist yet resolves through its nearest existing ancestor.
    pub fn name_for_archive(archive: &Path) -> String {
        let canonical = canonical_or_nearest(archive);
        let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
        let hex: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        format!("archive-sync-{hex}")
    }

    pub fn lock_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{name}.lock"))
    }

    /// `Ok(None)` when another process already holds `name`.
    pub fn acquire(name: &str) -> Result<Option<Self>, SyncError> {
        let path = Self::lock_path(name);
        let lock_err = |source| SyncError::Lock {
            name: name.to_string(),
            source,
        };

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(lock_err)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                info!(lock = name, path = %path.display(), "Acquired exclusivity lock");
                Ok(Some(Self {
                    file,
                    name: name.to_string(),
                    path,
                }))
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                info!(lock = name, "Exclusivity lock is held by another process");
                Ok(None)
            }
            Err(e) => Err(lock_err(e)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        drop(self);
    }
}

fn canonical_or_nearest(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
            canonical_or_nearest(parent).join(name)
        }
        _ => path.to_path_buf(),
    }
}

impl Drop for ExclusivityGuard {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            debug!(error = %e, lock = %self.name, "Unlock failed, the OS releases it on close");
        }
    }
}
