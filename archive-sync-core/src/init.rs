//! `git-init`: clone an archive and keep its state directory out of git.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::git::{clone_archive, ProcessGitRunner, Repository};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{info, warn};

/// Clones `url` into `archive` (unless it already is a repository), checks out
/// the base branch and commits an ignore rule for the state directory.
pub async fn git_init(archive: &Path, url: &str, config: &SyncConfig) -> Result<()> {
    if archive.join(".git").exists() {
        info!(archive = %archive.display(), "Archive is already a git repository, skipping clone");
    } else {
        info!(url = url, archive = %archive.display(), "Will attempt to clone archive");
        warn!("Cloning times out after an hour; clone manually if the archive is larger than that allows");
        let parent = archive
            .parent()
            .ok_or_else(|| SyncError::ArchiveNotDirectory(archive.to_path_buf()))?;
        fs::create_dir_all(parent).map_err(|source| SyncError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
        let runner = ProcessGitRunner::new(parent).with_identity(config.identity.clone());
        clone_archive(&runner, url, archive).await?;
    }

    let runner = ProcessGitRunner::new(archive).with_identity(config.identity.clone());
    let repo = Repository::new(runner, config);
    if repo.head_is_unborn().await? {
        info!(branch = %config.base_branch, "Cloned an empty repository, starting the base branch");
        repo.adopt_base_as_unborn_head().await?;
    } else {
        repo.checkout_base().await?;
    }

    let gitignore = archive.join(".gitignore");
    let added = ensure_ignored(&gitignore, &config.state_dir).map_err(|source| SyncError::Io {
        path: gitignore.clone(),
        source,
    })?;
    if added {
        info!(path = %gitignore.display(), "Excluding state directory from git");
        repo.reset_index().await?;
        repo.add_path(".gitignore").await?;
        repo.commit("Ignore archive state directory").await?;
        repo.push_base().await?;
    }
    Ok(())
}

/// Appends `/<state_dir>/` to the ignore file unless an equivalent rule is
/// present. Returns whether the file changed.
pub fn ensure_ignored(gitignore: &Path, state_dir: &str) -> std::io::Result<bool> {
    let existing = match fs::read_to_string(gitignore) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e),
    };

    let bare = state_dir.trim_matches('/');
    let present = existing
        .lines()
        .map(str::trim)
        .any(|line| line.trim_matches('/') == bare && !line.is_empty());
    if present {
        return Ok(false);
    }

    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&format!("/{bare}/\n"));
    fs::write(gitignore, updated)?;
    Ok(true)
}
