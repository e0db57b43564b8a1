//! Throwaway archive setups: a bare "remote", the controller's clone of it, and
//! a contributor clone that pushes proposal branches.
//!
//! Backs the `--run-tests` self-test mode and the integration tests.

use crate::config::{Identity, SyncConfig};
use crate::error::{Result, SyncError};
use crate::git::{clone_archive, run_checked, ProcessGitRunner, Repository, LOCAL_TIMEOUT, NETWORK_TIMEOUT};
use crate::init::git_init;
use crate::merge_request::BranchOutcome;
use crate::synchronise::{discover_items, IterationReport, Synchroniser};
use chrono::Utc;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

fn timestamp_line() -> String {
    format!("{}\n", Utc::now().format("%Y-%m-%d %H:%M:%S%.f UTC"))
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> SyncError + '_ {
    move |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Configuration used for fixtures: commits immediately and fetches every
/// iteration.
pub fn fixture_config() -> SyncConfig {
    SyncConfig {
        quiet_window_secs: 0,
        fetch_interval_secs: 0,
        loop_delay_secs: 60,
        identity: Some(Identity {
            name: "Archive Sync Self-Test".to_string(),
            email: "selftest@archive-sync.invalid".to_string(),
        }),
        ..SyncConfig::default()
    }
}

pub struct ArchiveFixture {
    pub root: PathBuf,
    pub remote: PathBuf,
    pub local: PathBuf,
    pub contributor: PathBuf,
    pub config: SyncConfig,
}

impl ArchiveFixture {
    /// Creates (or reuses) the remote and local archive under `root` and
    /// seeds items `001` and `002` when the archive has none.
    pub async fn provision(root: &Path, config: SyncConfig) -> Result<Self> {
        let fixture = Self {
            root: root.to_path_buf(),
            remote: root.join("archive-remote"),
            local: root.join("archive-local"),
            contributor: root.join("archive-contributor"),
            config,
        };

        if !fixture.remote.exists() {
            fs::create_dir_all(&fixture.remote).map_err(io_err(&fixture.remote))?;
            let runner = ProcessGitRunner::new(&fixture.remote);
            run_checked(&runner, &["init", "-q", "--bare"], LOCAL_TIMEOUT).await?;
            let head = format!("refs/heads/{}", fixture.config.base_branch);
            run_checked(&runner, &["symbolic-ref", "HEAD", head.as_str()], LOCAL_TIMEOUT).await?;
            info!(path = %fixture.remote.display(), "Created bare test remote");
        }

        if !fixture.local.exists() {
            git_init(&fixture.local, &fixture.remote_url(), &fixture.config).await?;
        }

        if discover_items(&fixture.local, &fixture.config)?.is_empty() {
            info!("Archive is empty, seeding test items");
            fixture.write_file("001/subdir/subsubdir/file001.txt", &timestamp_line())?;
            fixture.write_file("002/subdir/file002.txt", &timestamp_line())?;
            let repo = Repository::new(fixture.local_runner(), &fixture.config);
            repo.reset_index().await?;
            repo.add_path(".").await?;
            repo.commit("Initialized test archive").await?;
            repo.push_base().await?;
        }
        Ok(fixture)
    }

    pub fn remote_url(&self) -> String {
        self.remote.to_string_lossy().into_owned()
    }

    pub fn local_runner(&self) -> ProcessGitRunner {
        ProcessGitRunner::new(&self.local).with_identity(self.config.identity.clone())
    }

    pub fn synchroniser(&self) -> Result<Synchroniser<ProcessGitRunner>> {
        Synchroniser::for_archive(&self.local, self.config.clone())
    }

    /// Writes `content` to `rel` inside the local archive, creating parents.
    pub fn write_file(&self, rel: &str, content: &str) -> Result<()> {
        let path = self.local.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        fs::write(&path, content).map_err(io_err(&path))
    }

    /// Appends a timestamp to `file.txt` in every item; returns the item ids.
    pub fn touch_items(&self) -> Result<Vec<String>> {
        let mut touched = Vec::new();
        for item in discover_items(&self.local, &self.config)? {
            let path = item.path.join("file.txt");
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(io_err(&path))?;
            file.write_all(timestamp_line().as_bytes())
                .map_err(io_err(&path))?;
            touched.push(item.id);
        }
        Ok(touched)
    }

    /// Pushes branch `branch`, forked from the remote base branch, with one
    /// commit writing `content` to `rel` under `message`.
    pub async fn propose(&self, branch: &str, message: &str, rel: &str, content: &str) -> Result<()> {
        self.push_proposal(branch, message, rel, Some(content)).await
    }

    /// Like [`ArchiveFixture::propose`], but the commit deletes `rel`.
    pub async fn propose_removal(&self, branch: &str, message: &str, rel: &str) -> Result<()> {
        self.push_proposal(branch, message, rel, None).await
    }

    async fn push_proposal(
        &self,
        branch: &str,
        message: &str,
        rel: &str,
        content: Option<&str>,
    ) -> Result<()> {
        let runner = ProcessGitRunner::new(&self.contributor).with_identity(self.config.identity.clone());
        if self.contributor.exists() {
            run_checked(&runner, &["fetch", "-q", "origin"], NETWORK_TIMEOUT).await?;
        } else {
            let parent = ProcessGitRunner::new(&self.root);
            clone_archive(&parent, &self.remote_url(), &self.contributor).await?;
        }

        let upstream = format!("origin/{}", self.config.base_branch);
        run_checked(&runner, &["checkout", "-q", "-B", branch, upstream.as_str()], LOCAL_TIMEOUT).await?;
        let path = self.contributor.join(rel);
        match content {
            Some(content) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(io_err(parent))?;
                }
                fs::write(&path, content).map_err(io_err(&path))?;
            }
            None => fs::remove_file(&path).map_err(io_err(&path))?,
        }
        run_checked(&runner, &["add", "-A", "--", rel], LOCAL_TIMEOUT).await?;
        run_checked(&runner, &["commit", "-q", "-m", message], LOCAL_TIMEOUT).await?;
        run_checked(&runner, &["push", "-q", "-f", "origin", branch], LOCAL_TIMEOUT).await?;
        info!(branch = branch, "Pushed proposal branch");
        Ok(())
    }

    pub async fn remote_has_branch(&self, branch: &str) -> Result<bool> {
        let output = run_checked(
            &self.local_runner(),
            &["ls-remote", "--heads", "origin", branch],
            NETWORK_TIMEOUT,
        )
        .await?;
        Ok(!output.stdout.trim().is_empty())
    }
}

/// Exercises the item-change path and the merge-request path once against a
/// fixture under `root`.
pub async fn run_self_test(root: &Path) -> Result<IterationReport> {
    let fixture = ArchiveFixture::provision(root, fixture_config()).await?;
    let touched = fixture.touch_items()?;

    let branch = format!("selftest-{}", Utc::now().format("%Y%m%d%H%M%S%f"));
    fixture
        .propose(
            &branch,
            "Self-test proposal\n\n[archive merge]",
            "001/proposal.txt",
            &timestamp_line(),
        )
        .await?;

    let report = fixture.synchroniser()?.iteration().await?;

    if report.committed.len() != touched.len() {
        return Err(SyncError::SelfTest(format!(
            "expected {} committed items, got {:?}",
            touched.len(),
            report.committed
        )));
    }
    let merged = report.branches.iter().any(|(b, outcome)| {
        b.short_name == branch
            && matches!(outcome, BranchOutcome::Merged | BranchOutcome::Conflicted { .. })
    });
    if !merged || fixture.remote_has_branch(&branch).await? {
        return Err(SyncError::SelfTest(format!(
            "proposal branch {branch} was not merged and deleted"
        )));
    }
    info!(committed = ?report.committed, branch = %branch, "Self-test passed");
    Ok(report)
}
