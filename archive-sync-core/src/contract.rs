#![allow(unused)]

//! # contract: the process-execution seam under the repository driver
//!
//! The controller never talks to git directly. [`crate::git::Repository`]
//! expresses every primitive (checkout, add, commit, merge, ...) as an argument
//! list and hands it to a [`GitRunner`], which executes it with a timeout and
//! returns exit status and captured output.
//!
//! ## Implementations
//! - [`crate::git::ProcessGitRunner`] spawns the `git` executable.
//! - `MockGitRunner` (generated by `mockall`) scripts outcomes in tests. It is
//!   exported behind the `test-export-mocks` feature so dependent crates can use it.
//!
//! ## Contract
//! - A non-zero exit is *not* an error at this layer: it is returned in
//!   [`GitOutput`] and the driver decides whether the command was
//!   "must succeed" or "best effort".
//! - Launch failures and timeouts are errors.

use crate::error::GitError;
use async_trait::async_trait;
use std::time::Duration;

use mockall::{automock, predicate::*};

/// Captured result of one git invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout and stderr together, for matching git's human-readable hints.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Runs `git <args>` in the repository working tree.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait GitRunner: Send + Sync {
    async fn run(&self, args: Vec<String>, timeout: Duration) -> Result<GitOutput, GitError>;
}
