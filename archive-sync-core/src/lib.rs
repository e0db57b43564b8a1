#![doc = "archive-sync-core: core logic library for archive-sync."]

//! This crate holds everything that decides *what* gets synchronised: change
//! detection, the JSON state store, the git driver, the merge-request processor
//! and the controller that ties them together. The `archive-sync` crate only
//! adds CLI glue and configuration loading on top.
//!
//! # Usage
//! Build a [`synchronise::Synchroniser`] for an archive and call
//! [`synchronise::Synchroniser::iteration`] or
//! [`synchronise::Synchroniser::run_continuously`]. Guard the call with a
//! [`lock::ExclusivityGuard`] so only one controller runs per archive.

pub mod config;
pub mod contract;
pub mod detect;
pub mod error;
pub mod fixture;
pub mod git;
pub mod init;
pub mod lock;
pub mod merge_request;
pub mod state;
pub mod synchronise;

pub use config::{ConflictPolicy, Identity, ItemLayout, SyncConfig};
pub use error::{GitError, Result, StateError, SyncError};
