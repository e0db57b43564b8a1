use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Controller configuration. Every field has a default so an empty YAML
/// document (or no document at all) yields a working setup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// The only branch the controller commits to and pushes.
    pub base_branch: String,
    pub remote: String,
    /// Name of the state directory inside the archive root.
    pub state_dir: String,
    /// Minimum age of an item's latest write before it is committed.
    pub quiet_window_secs: u64,
    /// Network fetches happen at most once per this many seconds.
    pub fetch_interval_secs: u64,
    /// Pause between iterations in continuous mode.
    pub loop_delay_secs: u64,
    pub layout: ItemLayout,
    pub conflict_policy: ConflictPolicy,
    /// Tag word that makes a proposal branch merge-eligible.
    pub merge_tag: String,
    pub identity: Option<Identity>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_branch: "master".to_string(),
            remote: "origin".to_string(),
            state_dir: ".db".to_string(),
            quiet_window_secs: 60,
            fetch_interval_secs: 600,
            loop_delay_secs: 5,
            layout: ItemLayout::Flat,
            conflict_policy: ConflictPolicy::Theirs,
            merge_tag: "merge".to_string(),
            identity: None,
        }
    }
}

impl SyncConfig {
    pub fn quiet_window(&self) -> Duration {
        Duration::from_secs(self.quiet_window_secs)
    }

    pub fn fetch_interval(&self) -> Duration {
        Duration::from_secs(self.fetch_interval_secs)
    }

    pub fn loop_delay(&self) -> Duration {
        Duration::from_secs(self.loop_delay_secs)
    }

    pub fn trace_loaded(&self) {
        info!(
            base_branch = %self.base_branch,
            remote = %self.remote,
            state_dir = %self.state_dir,
            quiet_window_secs = self.quiet_window_secs,
            layout = ?self.layout,
            conflict_policy = ?self.conflict_policy,
            "Loaded SyncConfig"
        );
        debug!(?self, "SyncConfig loaded (full debug)");
    }
}

/// How items are laid out under the archive root.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ItemLayout {
    /// `<archive>/<id>/...`
    Flat,
    /// `<archive>/<format>/<id>/...`
    Format,
}

/// What to keep for a file both sides of a proposal merge touched.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// The proposal branch's version wins.
    Theirs,
    /// The base branch's version wins.
    Ours,
    /// Abort the merge and leave the branch for a human.
    Abandon,
}

/// Commit identity passed to git as `-c user.name/-c user.email`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}
