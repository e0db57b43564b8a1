use archive_sync::cli::{absolute, normalize_url, Cli, Command, SELF_TEST_LOCK};
use clap::Parser;
use std::path::PathBuf;

fn resolve(args: &[&str]) -> anyhow::Result<Command> {
    Cli::try_parse_from(args)?.resolve()
}

#[test]
fn update_resolves_to_an_absolute_archive() {
    let command = resolve(&["archive-sync", "update", "archive/./books/../books"]).unwrap();
    let expected = std::env::current_dir().unwrap().join("archive/books");
    assert_eq!(
        command,
        Command::Update {
            archive: expected,
            forever: false
        }
    );
}

#[test]
fn forever_is_accepted_before_and_after_the_subcommand() {
    for args in [
        ["archive-sync", "--forever", "update", "/srv/archive"],
        ["archive-sync", "update", "--forever", "/srv/archive"],
        ["archive-sync", "update", "-f", "/srv/archive"],
    ] {
        assert_eq!(
            resolve(&args).unwrap(),
            Command::Update {
                archive: PathBuf::from("/srv/archive"),
                forever: true
            },
            "args {args:?}"
        );
    }
}

#[test]
fn run_tests_resolves_to_self_test() {
    assert_eq!(
        resolve(&["archive-sync", "--run-tests"]).unwrap(),
        Command::SelfTest { forever: false }
    );
    let forever = resolve(&["archive-sync", "--run-tests", "--forever"]).unwrap();
    assert_eq!(forever, Command::SelfTest { forever: true });
    assert_eq!(forever.lock_name(), SELF_TEST_LOCK);
}

#[test]
fn invalid_combinations_are_rejected() {
    assert!(resolve(&["archive-sync"]).is_err());
    assert!(resolve(&["archive-sync", "--run-tests", "update", "/srv/archive"]).is_err());
    assert!(resolve(&["archive-sync", "git-init", "/srv/archive"]).is_err());
}

#[test]
fn git_init_keeps_remote_urls_and_absolutises_local_paths() {
    let cases = [
        ("https://git.example.org/archive.git", true),
        ("ssh://git@example.org/archive.git", true),
        ("git@example.org:team/archive.git", true),
        ("../remote.git", false),
        ("/srv/remote.git", false),
    ];
    for (url, passes_through) in cases {
        let normalised = normalize_url(url).unwrap();
        if passes_through {
            assert_eq!(normalised, url);
        } else {
            assert!(PathBuf::from(&normalised).is_absolute(), "{url} -> {normalised}");
        }
    }

    let command = resolve(&["archive-sync", "git-init", "/srv/archive", "../remote.git"]).unwrap();
    let expected_url = absolute(&PathBuf::from("../remote.git")).unwrap();
    assert_eq!(
        command,
        Command::GitInit {
            archive: PathBuf::from("/srv/archive"),
            url: expected_url.to_string_lossy().into_owned(),
        }
    );
}

#[test]
fn archive_commands_share_a_lock_per_archive() {
    let update = resolve(&["archive-sync", "update", "/srv/archive"]).unwrap();
    let init = resolve(&["archive-sync", "git-init", "/srv/archive/", "/srv/remote.git"]).unwrap();
    assert_eq!(update.lock_name(), init.lock_name());
    assert_ne!(update.lock_name(), SELF_TEST_LOCK);
}
