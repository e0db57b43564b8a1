use std::path::PathBuf;
use thiserror::Error;

/// Failure of a single `git` invocation.
#[derive(Error, Debug)]
pub enum GitError {
    #[error("failed to launch `git {command}`")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`git {command}` timed out after {secs} seconds")]
    Timeout { command: String, secs: u64 },

    #[error("`git {command}` exited with {code:?}: {stderr}")]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("state I/O error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialise state record {key}")]
    Serialise {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("archive must exist: {} (use git-init to initialise an archive)", .0.display())]
    ArchiveMissing(PathBuf),

    #[error("archive must be a directory: {}", .0.display())]
    ArchiveNotDirectory(PathBuf),

    #[error("failed to scan {}", .path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("lock error for {name}")]
    Lock {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("self-test failed: {0}")]
    SelfTest(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;
