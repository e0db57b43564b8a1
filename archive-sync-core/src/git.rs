//! Repository driver: the git primitives the controller needs, each with a
//! bounded timeout and an explicit failure contract.
//!
//! - "must succeed" primitives return `Err(GitError)` on a non-zero exit and
//!   abort the current iteration.
//! - "best effort" primitives log a warning and report `false`.
//! - `merge` is neither: a non-zero exit is a normal outcome (conflict).

use crate::config::{Identity, SyncConfig};
use crate::contract::{GitOutput, GitRunner};
use crate::error::GitError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Timeout for commands that only touch the local repository (and push).
pub const LOCAL_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for clone and fetch.
pub const NETWORK_TIMEOUT: Duration = Duration::from_secs(3600);

/// Spawns the `git` executable in a fixed working directory.
#[derive(Debug, Clone)]
pub struct ProcessGitRunner {
    workdir: PathBuf,
    identity: Option<Identity>,
}

impl ProcessGitRunner {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: Option<Identity>) -> Self {
        self.identity = identity;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

#[async_trait]
impl GitRunner for ProcessGitRunner {
    async fn run(&self, args: Vec<String>, timeout: Duration) -> Result<GitOutput, GitError> {
        let command = args.join(" ");
        let mut cmd = tokio::process::Command::new("git");
        if let Some(identity) = &self.identity {
            cmd.arg("-c")
                .arg(format!("user.name={}", identity.name))
                .arg("-c")
                .arg(format!("user.email={}", identity.email));
        }
        cmd.args(&args)
            .current_dir(&self.workdir)
            // never wait for credentials when running unattended
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!(command = %command, workdir = %self.workdir.display(), "Running git");
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                error!(error = ?source, command = %command, "Failed to launch git process");
                return Err(GitError::Spawn { command, source });
            }
            Err(_) => {
                error!(command = %command, secs = timeout.as_secs(), "Git command timed out, killed");
                return Err(GitError::Timeout {
                    command,
                    secs: timeout.as_secs(),
                });
            }
        };

        let output = GitOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(command = %command, code = ?output.code, "Git finished");
        Ok(output)
    }
}

/// Which side of a conflicted file to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Ours,
    Theirs,
}

impl Side {
    fn flag(self) -> &'static str {
        match self {
            Side::Ours => "--ours",
            Side::Theirs => "--theirs",
        }
    }

    /// Index stage holding this side's version during a merge.
    fn stage(self) -> &'static str {
        match self {
            Side::Ours => "2",
            Side::Theirs => "3",
        }
    }
}

/// Runs `git <args>` through `runner`, turning a non-zero exit into an error.
pub async fn run_checked<R: GitRunner + ?Sized>(
    runner: &R,
    args: &[&str],
    timeout: Duration,
) -> Result<GitOutput, GitError> {
    let output = runner.run(owned(args), timeout).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(failed(args.join(" "), output))
    }
}

/// `git clone <url> <dest>`, run from `dest`'s parent by `runner`.
pub async fn clone_archive<R: GitRunner + ?Sized>(
    runner: &R,
    url: &str,
    dest: &Path,
) -> Result<(), GitError> {
    let dest_arg = dest.to_string_lossy();
    run_checked(runner, &["clone", url, &*dest_arg], NETWORK_TIMEOUT).await?;
    info!(url = url, path = %dest.display(), "Successfully cloned git repository");
    Ok(())
}

/// Git primitives bound to one working tree, one remote and one base branch.
pub struct Repository<R> {
    runner: R,
    remote: String,
    base_branch: String,
}

impl<R: GitRunner> Repository<R> {
    pub fn new(runner: R, config: &SyncConfig) -> Self {
        Self {
            runner,
            remote: config.remote.clone(),
            base_branch: config.base_branch.clone(),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn remote(&self) -> &str {
        self.remote.as_str()
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }

    async fn exec(&self, args: &[&str], timeout: Duration) -> Result<GitOutput, GitError> {
        self.runner.run(owned(args), timeout).await
    }

    async fn must(&self, args: &[&str], timeout: Duration) -> Result<GitOutput, GitError> {
        run_checked(&self.runner, args, timeout).await.map_err(|err| {
            error!(error = %err, "Git command failed");
            err
        })
    }

    async fn best_effort(&self, args: &[&str]) -> bool {
        match self.exec(args, LOCAL_TIMEOUT).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                warn!(
                    command = %args.join(" "),
                    code = ?output.code,
                    stderr = %output.stderr.trim(),
                    "Best-effort git command failed, continuing"
                );
                false
            }
            Err(e) => {
                warn!(error = %e, "Best-effort git command failed, continuing");
                false
            }
        }
    }

    /// True when a merge is in progress (`MERGE_HEAD` exists).
    pub async fn is_merging(&self) -> Result<bool, GitError> {
        let output = self
            .exec(&["rev-parse", "-q", "--verify", "MERGE_HEAD"], LOCAL_TIMEOUT)
            .await?;
        Ok(output.success())
    }

    pub async fn abort_merge(&self) -> bool {
        self.best_effort(&["merge", "--abort"]).await
    }

    /// Checks out the base branch, aborting any merge left behind by an
    /// interrupted run first.
    pub async fn checkout_base(&self) -> Result<(), GitError> {
        if self.is_merging().await? {
            warn!(branch = %self.base_branch, "[GIT] Merge in progress from an earlier run, aborting it");
            self.abort_merge().await;
        }

        let args = ["checkout", self.base_branch.as_str()];
        let output = self.exec(&args, LOCAL_TIMEOUT).await?;
        if output.success() {
            debug!(branch = %self.base_branch, "Base branch checked out");
            return Ok(());
        }

        let text = output.combined();
        if text.contains("needs merge") || text.contains("resolve your current index") {
            warn!(branch = %self.base_branch, "[GIT] Working tree needs merge, aborting merge and retrying checkout");
            self.abort_merge().await;
            self.must(&args, LOCAL_TIMEOUT).await?;
            info!(branch = %self.base_branch, "[GIT] Recovered base branch after interrupted merge");
            return Ok(());
        }

        let err = failed(args.join(" "), output);
        error!(error = %err, "Failed to check out base branch");
        Err(err)
    }

    /// Unstages everything, leaving the working tree untouched.
    pub async fn reset_index(&self) -> Result<(), GitError> {
        self.must(&["reset", "-q"], LOCAL_TIMEOUT).await.map(drop)
    }

    /// Stages additions, modifications and deletions under `path`.
    pub async fn add_path(&self, path: &str) -> Result<(), GitError> {
        self.must(&["add", "-A", "--", path], LOCAL_TIMEOUT).await.map(drop)
    }

    pub async fn has_staged_changes(&self) -> Result<bool, GitError> {
        let args = ["diff", "--staged", "--quiet"];
        let output = self.exec(&args, LOCAL_TIMEOUT).await?;
        match output.code {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(failed(args.join(" "), output)),
        }
    }

    pub async fn commit(&self, message: &str) -> Result<(), GitError> {
        self.must(&["commit", "-q", "-m", message], LOCAL_TIMEOUT)
            .await
            .map(drop)
    }

    /// Concludes a merge whose conflicts were resolved and staged.
    pub async fn commit_merge(&self) -> Result<(), GitError> {
        self.must(&["commit", "-q", "--no-edit"], LOCAL_TIMEOUT)
            .await
            .map(drop)
    }

    pub async fn push_base(&self) -> Result<(), GitError> {
        self.must(&["push", self.remote.as_str(), self.base_branch.as_str()], LOCAL_TIMEOUT)
            .await
            .map(drop)
    }

    pub async fn fetch(&self) -> Result<(), GitError> {
        self.must(&["fetch", "--prune", self.remote.as_str()], NETWORK_TIMEOUT)
            .await
            .map(drop)
    }

    pub async fn fetch_branch(&self, branch: &str) -> Result<(), GitError> {
        self.must(&["fetch", self.remote.as_str(), branch], NETWORK_TIMEOUT)
            .await
            .map(drop)
    }

    /// Remote-tracking branches not merged into base, symbolic refs skipped.
    pub async fn unmerged_remote_branches(&self) -> Result<Vec<String>, GitError> {
        let output = self
            .must(&["branch", "-r", "--no-merged", self.base_branch.as_str()], LOCAL_TIMEOUT)
            .await?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.contains(" -> "))
            .map(str::to_string)
            .collect())
    }

    /// Full message of the commit at the tip of `rev`.
    pub async fn tip_message(&self, rev: &str) -> Result<String, GitError> {
        let output = self
            .must(&["log", "-1", "--format=%B", rev, "--"], LOCAL_TIMEOUT)
            .await?;
        Ok(output.stdout)
    }

    /// Creates or moves local branch `branch` to `target`.
    pub async fn point_local_branch(&self, branch: &str, target: &str) -> Result<(), GitError> {
        self.must(&["branch", "-f", branch, target], LOCAL_TIMEOUT)
            .await
            .map(drop)
    }

    /// Non-fast-forward merge of `branch` into the checked-out branch.
    /// `Ok(false)` is a failed merge, not an error.
    pub async fn merge(&self, branch: &str, message: &str) -> Result<bool, GitError> {
        let output = self
            .exec(&["merge", "--no-ff", "-m", message, branch], LOCAL_TIMEOUT)
            .await?;
        if !output.success() {
            info!(branch = branch, code = ?output.code, "Merge did not complete cleanly");
        }
        Ok(output.success())
    }

    /// Unmerged paths, verbatim (`-z` keeps git from quoting non-ASCII names).
    pub async fn conflicted_files(&self) -> Result<Vec<String>, GitError> {
        let output = self
            .must(&["diff", "--name-only", "-z", "--diff-filter=U"], LOCAL_TIMEOUT)
            .await?;
        Ok(output
            .stdout
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Whether `side` has a version of the unmerged `file`. A file deleted on
    /// that side has no entry at its index stage.
    pub async fn side_has_file(&self, file: &str, side: Side) -> Result<bool, GitError> {
        let output = self
            .must(&["ls-files", "-u", "-z", "--", file], LOCAL_TIMEOUT)
            .await?;
        Ok(output.stdout.split('\0').any(|entry| {
            entry
                .split('\t')
                .next()
                .and_then(|meta| meta.split_whitespace().nth(2))
                == Some(side.stage())
        }))
    }

    pub async fn take_side(&self, file: &str, side: Side) -> bool {
        self.best_effort(&["checkout", side.flag(), "--", file]).await
    }

    /// Stages a file resolved to one side's version.
    pub async fn stage_resolution(&self, file: &str) -> Result<(), GitError> {
        self.add_path(file).await
    }

    /// Resolves an unmerged file by deleting it from the index and working tree.
    pub async fn remove_path(&self, file: &str) -> Result<(), GitError> {
        self.must(&["rm", "-q", "--", file], LOCAL_TIMEOUT)
            .await
            .map(drop)
    }

    pub async fn delete_remote_branch(&self, branch: &str) -> bool {
        self.best_effort(&["push", self.remote.as_str(), "--delete", branch])
            .await
    }

    pub async fn delete_local_branch(&self, branch: &str) -> bool {
        self.best_effort(&["branch", "-D", branch]).await
    }

    /// True when HEAD points at a branch with no commits yet.
    pub async fn head_is_unborn(&self) -> Result<bool, GitError> {
        let output = self
            .exec(&["rev-parse", "-q", "--verify", "HEAD"], LOCAL_TIMEOUT)
            .await?;
        Ok(!output.success())
    }

    /// Makes the unborn HEAD refer to the base branch.
    pub async fn adopt_base_as_unborn_head(&self) -> Result<(), GitError> {
        let target = format!("refs/heads/{}", self.base_branch);
        self.must(&["symbolic-ref", "HEAD", target.as_str()], LOCAL_TIMEOUT)
            .await
            .map(drop)
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

fn failed(command: String, output: GitOutput) -> GitError {
    GitError::Failed {
        command,
        code: output.code,
        stderr: output.stderr.trim().to_string(),
    }
}
