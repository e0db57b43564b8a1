//! Archive synchronisation controller: one iteration, and the continuous loop.
//!
//! One iteration, strictly in this order:
//!   1. check out the base branch, recovering from a merge an earlier run left behind
//!   2. make sure the state directory exists
//!   3. decide (and persist) whether this iteration fetches, at most once per fetch interval
//!   4. scan every item; commit and push each one whose changes have settled
//!   5. fetch, if decided in step 3
//!   6. absorb tagged proposal branches via [`MergeRequestProcessor`]
//!
//! # Error Handling
//! Any failing "must succeed" git command or state I/O error aborts the iteration
//! and is returned to the caller. Nothing is retried in-process: the next
//! iteration re-detects whatever was not captured, which is safe because an
//! item's state only advances after its commit went through.
//!
//! In continuous mode ([`Synchroniser::run_continuously`]) errors and panics are
//! logged at the iteration boundary and the loop carries on after the
//! configured delay.

use crate::config::{ItemLayout, SyncConfig};
use crate::contract::GitRunner;
use crate::detect::{is_changed, latest_modification};
use crate::error::{Result, SyncError};
use crate::git::{ProcessGitRunner, Repository};
use crate::merge_request::{BranchOutcome, MergeRequestProcessor, ProposalBranch};
use crate::state::{StateStore, CONTROLLER_KEY};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::fs;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// One content unit of the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// `001` for the flat layout, `epub/001` for the format layout.
    pub id: String,
    pub path: PathBuf,
    /// Path relative to the archive root, as handed to `git add`.
    pub rel_path: String,
    /// File stem of the item's state record.
    pub state_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    Unchanged,
    /// Newer than the recorded state but still inside the quiet window.
    Settling,
    Committed,
    /// Settled change that staged nothing; state advanced without a commit.
    NoDiff,
}

#[derive(Debug, Default)]
pub struct IterationReport {
    pub items_seen: usize,
    pub committed: Vec<String>,
    pub settling: Vec<String>,
    pub without_diff: Vec<String>,
    pub fetched: bool,
    pub branches: Vec<(ProposalBranch, BranchOutcome)>,
}

/// Fails unless `archive` is an existing directory.
pub fn check_archive(archive: &Path) -> Result<()> {
    if !archive.exists() {
        return Err(SyncError::ArchiveMissing(archive.to_path_buf()));
    }
    if !archive.is_dir() {
        return Err(SyncError::ArchiveNotDirectory(archive.to_path_buf()));
    }
    Ok(())
}

fn is_candidate(name: &str, config: &SyncConfig) -> bool {
    !name.starts_with('.') && !name.starts_with('_') && name != config.state_dir
}

fn candidate_dirs(dir: &Path, config: &SyncConfig) -> Result<Vec<(String, PathBuf)>> {
    let scan_err = |source| SyncError::Scan {
        path: dir.to_path_buf(),
        source,
    };
    let mut found = Vec::new();
    for entry_res in fs::read_dir(dir).map_err(scan_err)? {
        let entry = entry_res.map_err(scan_err)?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!(path = %path.display(), "Skipping directory with a non UTF-8 name");
            continue;
        };
        if is_candidate(&name, config) {
            found.push((name, path));
        }
    }
    found.sort();
    Ok(found)
}

/// Lists the archive's items in sorted order.
pub fn discover_items(archive: &Path, config: &SyncConfig) -> Result<Vec<Item>> {
    let mut items = Vec::new();
    for (name, path) in candidate_dirs(archive, config)? {
        match config.layout {
            ItemLayout::Flat => items.push(Item {
                id: name.clone(),
                path,
                rel_path: name.clone(),
                state_key: name,
            }),
            ItemLayout::Format => {
                for (book_id, book_path) in candidate_dirs(&path, config)? {
                    items.push(Item {
                        id: format!("{name}/{book_id}"),
                        path: book_path,
                        rel_path: format!("{name}/{book_id}"),
                        state_key: format!("{name}_{book_id}"),
                    });
                }
            }
        }
    }
    Ok(items)
}

pub struct Synchroniser<R> {
    archive: PathBuf,
    config: SyncConfig,
    store: StateStore,
    repo: Repository<R>,
}

impl Synchroniser<ProcessGitRunner> {
    /// Controller driving the real `git` executable inside `archive`.
    pub fn for_archive(archive: &Path, config: SyncConfig) -> Result<Self> {
        check_archive(archive)?;
        let runner = ProcessGitRunner::new(archive).with_identity(config.identity.clone());
        Ok(Self::new(archive, config, runner))
    }
}

impl<R: GitRunner> Synchroniser<R> {
    pub fn new(archive: &Path, config: SyncConfig, runner: R) -> Self {
        let store = StateStore::new(archive, &config.state_dir);
        let repo = Repository::new(runner, &config);
        Self {
            archive: archive.to_path_buf(),
            config,
            store,
            repo,
        }
    }

    pub fn archive(&self) -> &Path {
        &self.archive
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn repository(&self) -> &Repository<R> {
        &self.repo
    }

    pub async fn iteration(&self) -> Result<IterationReport> {
        self.iteration_at(Utc::now()).await
    }

    /// Runs one iteration treating `now` as the current time.
    pub async fn iteration_at(&self, now: DateTime<Utc>) -> Result<IterationReport> {
        info!(archive = %self.archive.display(), "[SYNC] Checking archive for updates");
        check_archive(&self.archive)?;

        self.repo.checkout_base().await?;
        self.store.ensure_dir()?;
        let fetch = self.decide_fetch(now)?;

        let items = discover_items(&self.archive, &self.config)?;
        let mut report = IterationReport {
            items_seen: items.len(),
            ..IterationReport::default()
        };
        for item in &items {
            match self.process_item(item, now).await? {
                ItemOutcome::Unchanged => {}
                ItemOutcome::Settling => report.settling.push(item.id.clone()),
                ItemOutcome::Committed => report.committed.push(item.id.clone()),
                ItemOutcome::NoDiff => report.without_diff.push(item.id.clone()),
            }
        }

        if fetch {
            info!(remote = %self.config.remote, "[SYNC] Fetching from remote");
            self.repo.fetch().await?;
            report.fetched = true;
        }

        report.branches = MergeRequestProcessor::new(&self.repo, &self.config)
            .process_all()
            .await?;

        info!(
            items = report.items_seen,
            committed = report.committed.len(),
            settling = report.settling.len(),
            fetched = report.fetched,
            branches = report.branches.len(),
            "[SYNC] Iteration complete"
        );
        Ok(report)
    }

    /// Decides whether this iteration fetches, persisting the decision before
    /// any other work so a crash cannot turn into a fetch storm.
    fn decide_fetch(&self, now: DateTime<Utc>) -> Result<bool> {
        let mut record = self.store.load(CONTROLLER_KEY)?;
        let due = match record.last_git_fetch() {
            None => true,
            // a timestamp from the future counts as due
            Some(last) => (now - last)
                .to_std()
                .map_or(true, |age| age >= self.config.fetch_interval()),
        };
        if due {
            record.set_last_git_fetch(now);
            self.store.save(CONTROLLER_KEY, &record)?;
        }
        debug!(due, "Fetch decision");
        Ok(due)
    }

    pub async fn process_item(&self, item: &Item, now: DateTime<Utc>) -> Result<ItemOutcome> {
        let latest = latest_modification(&item.path).map_err(|source| SyncError::Scan {
            path: item.path.clone(),
            source,
        })?;
        let Some(latest) = latest else {
            debug!(item = %item.id, "Item has no content, skipping");
            return Ok(ItemOutcome::Unchanged);
        };

        let mut record = self.store.load(&item.state_key)?;
        let previous = record
            .last_modified()
            .unwrap_or_else(|| now - chrono::Duration::days(1));
        info!(item = %item.id, last_modified = %latest, "Processing item");

        if !is_changed(latest, previous, now, self.config.quiet_window()) {
            if record.id() != Some(item.id.as_str()) {
                record.set_id(&item.id);
                self.store.save(&item.state_key, &record)?;
            }
            if latest > previous {
                info!(item = %item.id, "Change detected, waiting for the quiet window");
                return Ok(ItemOutcome::Settling);
            }
            return Ok(ItemOutcome::Unchanged);
        }

        info!(item = %item.id, "A change has occurred in item");
        self.repo.reset_index().await?;
        self.repo.add_path(&item.rel_path).await?;
        let outcome = if self.repo.has_staged_changes().await? {
            self.repo.commit(&format!("Updated book: {}", item.id)).await?;
            self.repo.push_base().await?;
            info!(item = %item.id, "Committed and pushed item");
            ItemOutcome::Committed
        } else {
            info!(item = %item.id, "Nothing staged for item, skipping commit");
            ItemOutcome::NoDiff
        };

        record.set_id(&item.id);
        record.set_last_modified(latest);
        self.store.save(&item.state_key, &record)?;
        Ok(outcome)
    }

    /// Runs iterations until `max_iterations` is reached, or forever when it
    /// is `None`. Returns how many iterations failed.
    pub async fn run_continuously(&self, max_iterations: Option<usize>) -> usize {
        let mut failures = 0;
        let mut done = 0;
        loop {
            info!("============================================================");
            info!(started = %Utc::now().format("%Y-%m-%d %H:%M:%S%.f UTC"), "Iteration start");

            match AssertUnwindSafe(self.iteration()).catch_unwind().await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    failures += 1;
                    error!(error = %error_chain(&e), "An error occurred while updating the archive");
                }
                Err(panic) => {
                    failures += 1;
                    error!(panic = %panic_message(panic.as_ref()), "Iteration panicked");
                }
            }

            done += 1;
            if max_iterations.is_some_and(|max| done >= max) {
                return failures;
            }
            tokio::time::sleep(self.config.loop_delay()).await;
        }
    }
}

/// Display of `e` followed by each of its sources.
pub fn error_chain(e: &dyn std::error::Error) -> String {
    let mut text = e.to_string();
    let mut source = e.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
