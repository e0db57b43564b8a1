///
/// This module implements the CLI interface for archive-sync: command parsing, argument
/// normalisation, the exclusivity check and dispatch into `archive-sync-core`.
///
/// All synchronisation logic (state, change detection, git driving, merge requests) lives in
/// [`archive-sync-core`]. This module is strictly glue.
///
/// ## Commands
/// - `update <PATH> [--forever]`: one iteration, or iterate forever with fault isolation.
/// - `git-init <PATH> <URL>`: clone an archive and ignore its state directory.
/// - `--run-tests [--forever]`: self-test against a throwaway local/remote pair.
///
/// Parsed arguments are resolved once into [`Command`], so nothing downstream inspects raw flags.
///
/// [`archive-sync-core`]: ../../archive-sync-core/
use crate::load_config::{load_config_or_default, resolve_config_path};
use anyhow::{bail, Result};
use archive_sync_core::fixture::run_self_test;
use archive_sync_core::init::git_init;
use archive_sync_core::lock::ExclusivityGuard;
use archive_sync_core::synchronise::{error_chain, Synchroniser};
use clap::{Parser, Subcommand};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Lock name shared by every self-test run on a host.
pub const SELF_TEST_LOCK: &str = "archive-sync-selftest";

/// Delay between self-test runs with `--run-tests --forever`.
const SELF_TEST_DELAY: Duration = Duration::from_secs(60);

/// CLI for archive-sync: monitors an archive and commits changes to git.
#[derive(Parser, Debug)]
#[clap(
    name = "archive-sync",
    version,
    about = "Monitors a content archive, commits settled changes to git and merges tagged proposal branches"
)]
pub struct Cli {
    /// Path to a YAML config file (defaults apply when omitted)
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    /// Run the built-in self-test against a throwaway repository pair
    #[clap(long)]
    pub run_tests: bool,

    /// Keep running: repeat the update or self-test forever
    #[clap(long)]
    pub forever: bool,

    #[clap(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check archive for changes and absorb tagged proposal branches
    Update {
        /// Path to the archive
        #[clap(value_name = "PATH")]
        archive: PathBuf,
        /// Loop forever, isolating failures per iteration
        #[clap(short, long)]
        forever: bool,
    },
    /// Initialize archive from remote git repository
    GitInit {
        /// Path to the archive
        #[clap(value_name = "PATH")]
        archive: PathBuf,
        /// Initialize the archive from this git repository
        #[clap(value_name = "URL")]
        url: String,
    },
}

/// A fully resolved invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Update { archive: PathBuf, forever: bool },
    GitInit { archive: PathBuf, url: String },
    SelfTest { forever: bool },
}

impl Command {
    /// Name of the exclusivity lock this command runs under.
    pub fn lock_name(&self) -> String {
        match self {
            Command::Update { archive, .. } | Command::GitInit { archive, .. } => {
                ExclusivityGuard::name_for_archive(archive)
            }
            Command::SelfTest { .. } => SELF_TEST_LOCK.to_string(),
        }
    }
}

impl Cli {
    pub fn resolve(self) -> Result<Command> {
        match (self.run_tests, self.command) {
            (true, None) => Ok(Command::SelfTest {
                forever: self.forever,
            }),
            (true, Some(_)) => bail!("--run-tests cannot be combined with a subcommand"),
            (false, Some(Commands::Update { archive, forever })) => Ok(Command::Update {
                archive: absolute(&archive)?,
                forever: forever || self.forever,
            }),
            (false, Some(Commands::GitInit { archive, url })) => Ok(Command::GitInit {
                archive: absolute(&archive)?,
                url: normalize_url(&url)?,
            }),
            (false, None) => bail!("no command given, see --help"),
        }
    }
}

/// Makes `path` absolute and resolves `.`/`..` lexically.
pub fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut normal = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normal.pop();
            }
            other => normal.push(other.as_os_str()),
        }
    }
    Ok(normal)
}

/// Remote URLs pass through; scheme-less local paths become absolute.
pub fn normalize_url(url: &str) -> Result<String> {
    let is_scp_like = url
        .split_once(':')
        .is_some_and(|(host, _)| !host.is_empty() && !host.contains('/'));
    if url.contains("://") || is_scp_like {
        return Ok(url.to_string());
    }
    Ok(absolute(Path::new(url))?.to_string_lossy().into_owned())
}

/// CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    let config_path = resolve_config_path(cli.config.clone());
    let command = cli.resolve()?;
    tracing::info!(?command, "Resolved command");

    let lock_name = command.lock_name();
    let Some(_guard) = ExclusivityGuard::acquire(&lock_name)? else {
        println!("Another archive-sync instance holds lock {lock_name}, exiting.");
        return Ok(());
    };

    match command {
        Command::Update { archive, forever } => {
            let config = load_config_or_default(config_path.as_deref())?;
            let sync = Synchroniser::for_archive(&archive, config)?;
            if forever {
                sync.run_continuously(None).await;
            } else {
                let report = sync.iteration().await?;
                tracing::info!(command = "update", ?report, "Update complete");
            }
        }
        Command::GitInit { archive, url } => {
            let config = load_config_or_default(config_path.as_deref())?;
            git_init(&archive, &url, &config).await?;
            tracing::info!(command = "git-init", archive = %archive.display(), "Archive initialised");
        }
        Command::SelfTest { forever } => {
            let root = std::env::temp_dir().join("archive-sync-selftest");
            loop {
                match run_self_test(&root).await {
                    Ok(report) => {
                        tracing::info!(command = "run-tests", ?report, "Self-test passed")
                    }
                    Err(e) if forever => {
                        tracing::error!(command = "run-tests", error = %error_chain(&e), "Self-test failed")
                    }
                    Err(e) => return Err(e.into()),
                }
                if !forever {
                    break;
                }
                tokio::time::sleep(SELF_TEST_DELAY).await;
            }
        }
    }

    Ok(())
}
