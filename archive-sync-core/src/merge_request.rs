//! Absorbs proposal branches pushed by contributors.
//!
//! Each unmerged remote branch goes through
//! `discovered -> classified -> {merged, conflicted, ignored}` within a single
//! iteration; nothing about branches is persisted, so every iteration starts
//! from the current branch listing.
//!
//! A branch is merge-eligible when a line of its tip commit message carries
//! `[archive <word>]` or `[<word> archive]` and `<word>` is the configured
//! merge tag (`merge` by default). Everything else is left untouched and will
//! be looked at again next iteration.

use crate::config::{ConflictPolicy, SyncConfig};
use crate::contract::GitRunner;
use crate::error::GitError;
use crate::git::{Repository, Side};
use regex::Regex;
use std::sync::OnceLock;
use tracing::{info, warn};

/// A remote branch not yet merged into base.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalBranch {
    /// Remote-qualified name, e.g. `origin/fix-typo`.
    pub remote_name: String,
    /// Name on the remote, e.g. `fix-typo`.
    pub short_name: String,
}

impl ProposalBranch {
    /// `None` for branches of other remotes.
    pub fn from_listing(remote: &str, listed: &str) -> Option<Self> {
        let short = listed.strip_prefix(remote)?.strip_prefix('/')?;
        if short.is_empty() {
            return None;
        }
        Some(Self {
            remote_name: listed.to_string(),
            short_name: short.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchOutcome {
    /// Merged cleanly, pushed, branch deleted.
    Merged,
    /// Merged after resolving conflicts by policy, pushed, branch deleted.
    Conflicted { files: Vec<String> },
    /// Not tagged for merging (or tagged with another word).
    Ignored { tag: Option<String> },
    /// git refused to start the merge (e.g. local edits in the way).
    Deferred,
    /// Conflicted under the `abandon` policy; merge aborted, branch kept.
    Abandoned { files: Vec<String> },
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\[archive\s+(\w+)\]|\[(\w+)\s+archive\]").expect("tag pattern is valid")
    })
}

/// The first archive tag found in `message`, lowercased.
pub fn classify_tag(message: &str) -> Option<String> {
    message.lines().find_map(|line| {
        let caps = tag_pattern().captures(line)?;
        caps.get(1)
            .or_else(|| caps.get(2))
            .map(|word| word.as_str().to_lowercase())
    })
}

pub struct MergeRequestProcessor<'a, R> {
    repo: &'a Repository<R>,
    merge_tag: String,
    policy: ConflictPolicy,
}

impl<'a, R: GitRunner> MergeRequestProcessor<'a, R> {
    pub fn new(repo: &'a Repository<R>, config: &SyncConfig) -> Self {
        Self {
            repo,
            merge_tag: config.merge_tag.to_lowercase(),
            policy: config.conflict_policy,
        }
    }

    /// Proposal branches in listing order, excluding the base branch itself.
    pub async fn discover(&self) -> Result<Vec<ProposalBranch>, GitError> {
        let listed = self.repo.unmerged_remote_branches().await?;
        Ok(listed
            .iter()
            .filter_map(|name| ProposalBranch::from_listing(self.repo.remote(), name))
            .filter(|branch| branch.short_name != self.repo.base_branch())
            .collect())
    }

    /// Handles every proposal branch, one after the other.
    pub async fn process_all(&self) -> Result<Vec<(ProposalBranch, BranchOutcome)>, GitError> {
        let branches = self.discover().await?;
        info!(count = branches.len(), "[MERGE] Unmerged proposal branches found");

        let mut outcomes = Vec::with_capacity(branches.len());
        for branch in branches {
            let outcome = self.process(&branch).await?;
            info!(branch = %branch.short_name, outcome = ?outcome, "[MERGE] Branch processed");
            outcomes.push((branch, outcome));
        }
        Ok(outcomes)
    }

    pub async fn process(&self, branch: &ProposalBranch) -> Result<BranchOutcome, GitError> {
        let message = self.repo.tip_message(&branch.remote_name).await?;
        let tag = classify_tag(&message);
        info!(branch = %branch.short_name, tag = ?tag, "[MERGE] Classified proposal branch");
        if tag.as_deref() != Some(self.merge_tag.as_str()) {
            return Ok(BranchOutcome::Ignored { tag });
        }

        self.repo.fetch_branch(&branch.short_name).await?;
        self.repo.checkout_base().await?;
        self.repo.reset_index().await?;
        self.repo
            .point_local_branch(&branch.short_name, &branch.remote_name)
            .await?;

        let message = format!(
            "Merge proposal branch '{}' into {}",
            branch.short_name,
            self.repo.base_branch()
        );
        if self.repo.merge(&branch.short_name, &message).await? {
            self.publish_and_clean_up(branch).await?;
            return Ok(BranchOutcome::Merged);
        }

        if !self.repo.is_merging().await? {
            warn!(branch = %branch.short_name, "[MERGE] Merge could not start, leaving branch for the next iteration");
            self.repo.delete_local_branch(&branch.short_name).await;
            return Ok(BranchOutcome::Deferred);
        }

        let files = self.repo.conflicted_files().await?;
        info!(branch = %branch.short_name, files = ?files, policy = ?self.policy, "[MERGE] Resolving conflicts");
        let side = match self.policy {
            ConflictPolicy::Theirs => Side::Theirs,
            ConflictPolicy::Ours => Side::Ours,
            ConflictPolicy::Abandon => {
                self.repo.abort_merge().await;
                self.repo.delete_local_branch(&branch.short_name).await;
                return Ok(BranchOutcome::Abandoned { files });
            }
        };
        for file in &files {
            if self.repo.side_has_file(file, side).await? {
                self.repo.take_side(file, side).await;
                self.repo.stage_resolution(file).await?;
            } else {
                info!(branch = %branch.short_name, file = %file, side = ?side, "[MERGE] Winning side deleted the file, removing it");
                self.repo.remove_path(file).await?;
            }
        }
        self.repo.commit_merge().await?;
        self.publish_and_clean_up(branch).await?;
        Ok(BranchOutcome::Conflicted { files })
    }

    async fn publish_and_clean_up(&self, branch: &ProposalBranch) -> Result<(), GitError> {
        self.repo.push_base().await?;
        self.repo.delete_remote_branch(&branch.short_name).await;
        self.repo.delete_local_branch(&branch.short_name).await;
        Ok(())
    }
}
