use archive_sync_core::contract::{GitOutput, MockGitRunner};
use archive_sync_core::git::Repository;
use archive_sync_core::merge_request::{
    classify_tag, BranchOutcome, MergeRequestProcessor, ProposalBranch,
};
use archive_sync_core::{ConflictPolicy, GitError, SyncConfig};
use std::sync::{Arc, Mutex};

type Calls = Arc<Mutex<Vec<String>>>;

fn ok(stdout: &str) -> Result<GitOutput, GitError> {
    Ok(GitOutput {
        code: Some(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

fn exit(code: i32, stderr: &str) -> Result<GitOutput, GitError> {
    Ok(GitOutput {
        code: Some(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

/// A mock runner answering every git command through `respond`, recording the
/// command lines in order.
fn scripted<F>(calls: Calls, mut respond: F) -> MockGitRunner
where
    F: FnMut(&str) -> Result<GitOutput, GitError> + Send + 'static,
{
    let mut runner = MockGitRunner::new();
    runner.expect_run().returning(move |args, _timeout| {
        let command = args.join(" ");
        calls.lock().unwrap().push(command.clone());
        respond(&command)
    });
    runner
}

/// `git ls-files -u -z` output for `path` with entries at `stages`.
fn unmerged(path: &str, stages: &[u8]) -> Result<GitOutput, GitError> {
    let listing: String = stages
        .iter()
        .map(|stage| format!("100644 {stage:040} {stage}\t{path}\0"))
        .collect();
    ok(&listing)
}

fn branch(short: &str) -> ProposalBranch {
    ProposalBranch {
        remote_name: format!("origin/{short}"),
        short_name: short.to_string(),
    }
}

struct TagCase {
    name: &'static str,
    message: &'static str,
    expected: Option<&'static str>,
}

#[test]
fn classify_tag_table_driven() {
    let cases = vec![
        TagCase {
            name: "archive first",
            message: "Fix typo\n\n[archive merge]\n",
            expected: Some("merge"),
        },
        TagCase {
            name: "word first",
            message: "Fix typo [merge archive]",
            expected: Some("merge"),
        },
        TagCase {
            name: "case insensitive",
            message: "[Archive MERGE] please",
            expected: Some("merge"),
        },
        TagCase {
            name: "other word",
            message: "Draft\n[archive ignore]",
            expected: Some("ignore"),
        },
        TagCase {
            name: "first tag wins",
            message: "[archive hold]\n[archive merge]",
            expected: Some("hold"),
        },
        TagCase {
            name: "no tag",
            message: "Just a commit",
            expected: None,
        },
        TagCase {
            name: "tag split over lines",
            message: "[archive\nmerge]",
            expected: None,
        },
        TagCase {
            name: "unrelated brackets",
            message: "[wip] merge archive later",
            expected: None,
        },
    ];

    for case in cases {
        assert_eq!(
            classify_tag(case.message).as_deref(),
            case.expected,
            "case '{}'",
            case.name
        );
    }
}

#[test]
fn proposal_branch_from_listing() {
    assert_eq!(
        ProposalBranch::from_listing("origin", "origin/fix-typo"),
        Some(branch("fix-typo"))
    );
    assert_eq!(
        ProposalBranch::from_listing("origin", "origin/feature/nested"),
        Some(ProposalBranch {
            remote_name: "origin/feature/nested".into(),
            short_name: "feature/nested".into(),
        })
    );
    assert_eq!(ProposalBranch::from_listing("origin", "upstream/fix"), None);
    assert_eq!(ProposalBranch::from_listing("origin", "originals/fix"), None);
    assert_eq!(ProposalBranch::from_listing("origin", "origin/"), None);
}

#[tokio::test]
async fn tagged_branch_is_merged_and_others_ignored() {
    let calls: Calls = Arc::default();
    let runner = scripted(calls.clone(), |cmd| match cmd {
        "branch -r --no-merged master" => ok(
            "  origin/HEAD -> origin/master\n  origin/fix\n  origin/idea\n  origin/plain\n  upstream/other\n",
        ),
        "log -1 --format=%B origin/fix --" => ok("Fix typo\n\n[archive merge]\n"),
        "log -1 --format=%B origin/idea --" => ok("Idea\n\n[archive ignore]\n"),
        "log -1 --format=%B origin/plain --" => ok("Plain commit\n"),
        "rev-parse -q --verify MERGE_HEAD" => exit(1, ""),
        _ => ok(""),
    });
    let config = SyncConfig::default();
    let repo = Repository::new(runner, &config);

    let outcomes = MergeRequestProcessor::new(&repo, &config)
        .process_all()
        .await
        .expect("processing should succeed");

    assert_eq!(
        outcomes,
        vec![
            (branch("fix"), BranchOutcome::Merged),
            (
                branch("idea"),
                BranchOutcome::Ignored {
                    tag: Some("ignore".into())
                }
            ),
            (branch("plain"), BranchOutcome::Ignored { tag: None }),
        ]
    );

    let calls = calls.lock().unwrap();
    let position = |needle: &str| {
        calls
            .iter()
            .position(|c| c == needle)
            .unwrap_or_else(|| panic!("missing '{needle}' in {calls:?}"))
    };
    let merge = position("merge --no-ff -m Merge proposal branch 'fix' into master fix");
    assert!(position("fetch origin fix") < merge);
    assert!(position("branch -f fix origin/fix") < merge);
    assert!(merge < position("push origin master"));
    assert!(position("push origin master") < position("push origin --delete fix"));
    assert!(calls.iter().any(|c| c == "branch -D fix"));
    assert!(!calls.iter().any(|c| c.contains("idea") && c.starts_with("merge")));
    assert!(!calls.iter().any(|c| c.contains("--delete idea") || c.contains("--delete plain")));
}

#[tokio::test]
async fn base_branch_is_never_a_proposal() {
    let calls: Calls = Arc::default();
    let runner = scripted(calls.clone(), |cmd| match cmd {
        "branch -r --no-merged master" => ok("  origin/master\n"),
        _ => ok(""),
    });
    let config = SyncConfig::default();
    let repo = Repository::new(runner, &config);

    let branches = MergeRequestProcessor::new(&repo, &config)
        .discover()
        .await
        .expect("discover should succeed");
    assert!(branches.is_empty());
}

#[tokio::test]
async fn conflicts_resolve_to_the_proposal_side() {
    let calls: Calls = Arc::default();
    let mut merging = false;
    let runner = scripted(calls.clone(), move |cmd| match cmd {
        "branch -r --no-merged master" => ok("  origin/edit\n"),
        "log -1 --format=%B origin/edit --" => ok("Edit\n\n[archive merge]\n"),
        "rev-parse -q --verify MERGE_HEAD" if merging => ok("abc123\n"),
        "rev-parse -q --verify MERGE_HEAD" => exit(1, ""),
        c if c.starts_with("merge --no-ff") => {
            merging = true;
            exit(1, "CONFLICT (add/add): Merge conflict in 001/file.txt")
        }
        "diff --name-only -z --diff-filter=U" => ok("001/file.txt\0002/notes.txt\0"),
        c if c.starts_with("ls-files -u -z -- ") => unmerged(&c["ls-files -u -z -- ".len()..], &[1, 2, 3]),
        "commit -q --no-edit" => {
            merging = false;
            ok("")
        }
        _ => ok(""),
    });
    let config = SyncConfig::default();
    let repo = Repository::new(runner, &config);

    let outcome = MergeRequestProcessor::new(&repo, &config)
        .process(&branch("edit"))
        .await
        .expect("conflicted merge should still complete");

    assert_eq!(
        outcome,
        BranchOutcome::Conflicted {
            files: vec!["001/file.txt".into(), "002/notes.txt".into()]
        }
    );
    let calls = calls.lock().unwrap();
    for file in ["001/file.txt", "002/notes.txt"] {
        assert!(calls.contains(&format!("checkout --theirs -- {file}")));
        assert!(calls.contains(&format!("add -A -- {file}")));
    }
    assert!(calls.contains(&"commit -q --no-edit".to_string()));
    assert!(calls.contains(&"push origin --delete edit".to_string()));
}

#[tokio::test]
async fn ours_policy_keeps_the_base_side() {
    let calls: Calls = Arc::default();
    let mut merging = false;
    let runner = scripted(calls.clone(), move |cmd| match cmd {
        "log -1 --format=%B origin/edit --" => ok("[merge archive]"),
        "rev-parse -q --verify MERGE_HEAD" if merging => ok("abc123\n"),
        "rev-parse -q --verify MERGE_HEAD" => exit(1, ""),
        c if c.starts_with("merge --no-ff") => {
            merging = true;
            exit(1, "")
        }
        "diff --name-only -z --diff-filter=U" => ok("001/file.txt\0"),
        "ls-files -u -z -- 001/file.txt" => unmerged("001/file.txt", &[1, 2, 3]),
        _ => ok(""),
    });
    let config = SyncConfig {
        conflict_policy: ConflictPolicy::Ours,
        ..SyncConfig::default()
    };
    let repo = Repository::new(runner, &config);

    let outcome = MergeRequestProcessor::new(&repo, &config)
        .process(&branch("edit"))
        .await
        .unwrap();

    assert!(matches!(outcome, BranchOutcome::Conflicted { .. }));
    assert!(calls
        .lock()
        .unwrap()
        .contains(&"checkout --ours -- 001/file.txt".to_string()));
}

struct DeletionCase {
    name: &'static str,
    policy: ConflictPolicy,
    stages: &'static [u8],
    removes: bool,
}

#[tokio::test]
async fn modify_delete_conflicts_follow_the_policy() {
    let cases = vec![
        DeletionCase {
            name: "theirs deleted, theirs wins",
            policy: ConflictPolicy::Theirs,
            stages: &[1, 2],
            removes: true,
        },
        DeletionCase {
            name: "ours deleted, ours wins",
            policy: ConflictPolicy::Ours,
            stages: &[1, 3],
            removes: true,
        },
        DeletionCase {
            name: "theirs deleted, ours wins",
            policy: ConflictPolicy::Ours,
            stages: &[1, 2],
            removes: false,
        },
        DeletionCase {
            name: "ours deleted, theirs wins",
            policy: ConflictPolicy::Theirs,
            stages: &[1, 3],
            removes: false,
        },
    ];

    for case in cases {
        let calls: Calls = Arc::default();
        let mut merging = false;
        let stages = case.stages;
        let runner = scripted(calls.clone(), move |cmd| match cmd {
            "log -1 --format=%B origin/del --" => ok("[archive merge]"),
            "rev-parse -q --verify MERGE_HEAD" if merging => ok("abc123\n"),
            "rev-parse -q --verify MERGE_HEAD" => exit(1, ""),
            c if c.starts_with("merge --no-ff") => {
                merging = true;
                exit(1, "CONFLICT (modify/delete)")
            }
            "diff --name-only -z --diff-filter=U" => ok("002/subdir/file002.txt\0"),
            "ls-files -u -z -- 002/subdir/file002.txt" => {
                unmerged("002/subdir/file002.txt", stages)
            }
            _ => ok(""),
        });
        let config = SyncConfig {
            conflict_policy: case.policy,
            ..SyncConfig::default()
        };
        let repo = Repository::new(runner, &config);

        let outcome = MergeRequestProcessor::new(&repo, &config)
            .process(&branch("del"))
            .await
            .unwrap_or_else(|e| panic!("case '{}': {e}", case.name));

        assert_eq!(
            outcome,
            BranchOutcome::Conflicted {
                files: vec!["002/subdir/file002.txt".into()]
            },
            "case '{}'",
            case.name
        );
        let calls = calls.lock().unwrap();
        let removed = calls.contains(&"rm -q -- 002/subdir/file002.txt".to_string());
        let staged = calls.contains(&"add -A -- 002/subdir/file002.txt".to_string());
        assert_eq!(removed, case.removes, "case '{}': {calls:?}", case.name);
        assert_eq!(staged, !case.removes, "case '{}': {calls:?}", case.name);
    }
}

#[tokio::test]
async fn non_ascii_conflict_paths_are_used_verbatim() {
    let calls: Calls = Arc::default();
    let mut merging = false;
    let runner = scripted(calls.clone(), move |cmd| match cmd {
        "log -1 --format=%B origin/edit --" => ok("[archive merge]"),
        "rev-parse -q --verify MERGE_HEAD" if merging => ok("abc123\n"),
        "rev-parse -q --verify MERGE_HEAD" => exit(1, ""),
        c if c.starts_with("merge --no-ff") => {
            merging = true;
            exit(1, "")
        }
        "diff --name-only -z --diff-filter=U" => ok("001/kapittel_æ.txt\0001/blåbær øl.txt\0"),
        c if c.starts_with("ls-files -u -z -- ") => unmerged(&c["ls-files -u -z -- ".len()..], &[2, 3]),
        _ => ok(""),
    });
    let config = SyncConfig::default();
    let repo = Repository::new(runner, &config);

    let outcome = MergeRequestProcessor::new(&repo, &config)
        .process(&branch("edit"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        BranchOutcome::Conflicted {
            files: vec!["001/kapittel_æ.txt".into(), "001/blåbær øl.txt".into()]
        }
    );
    let calls = calls.lock().unwrap();
    assert!(calls.contains(&"checkout --theirs -- 001/kapittel_æ.txt".to_string()));
    assert!(calls.contains(&"add -A -- 001/blåbær øl.txt".to_string()));
}

#[tokio::test]
async fn abandon_policy_aborts_and_keeps_the_branch() {
    let calls: Calls = Arc::default();
    let mut merging = false;
    let runner = scripted(calls.clone(), move |cmd| match cmd {
        "log -1 --format=%B origin/edit --" => ok("[archive merge]"),
        "rev-parse -q --verify MERGE_HEAD" if merging => ok("abc123\n"),
        "rev-parse -q --verify MERGE_HEAD" => exit(1, ""),
        c if c.starts_with("merge --no-ff") => {
            merging = true;
            exit(1, "")
        }
        "merge --abort" => {
            merging = false;
            ok("")
        }
        "diff --name-only -z --diff-filter=U" => ok("001/file.txt\0"),
        _ => ok(""),
    });
    let config = SyncConfig {
        conflict_policy: ConflictPolicy::Abandon,
        ..SyncConfig::default()
    };
    let repo = Repository::new(runner, &config);

    let outcome = MergeRequestProcessor::new(&repo, &config)
        .process(&branch("edit"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        BranchOutcome::Abandoned {
            files: vec!["001/file.txt".into()]
        }
    );
    let calls = calls.lock().unwrap();
    assert!(calls.contains(&"merge --abort".to_string()));
    assert!(!calls.iter().any(|c| c.starts_with("push")));
}

#[tokio::test]
async fn merge_that_cannot_start_is_deferred() {
    let calls: Calls = Arc::default();
    let runner = scripted(calls.clone(), |cmd| match cmd {
        "log -1 --format=%B origin/edit --" => ok("[archive merge]"),
        "rev-parse -q --verify MERGE_HEAD" => exit(1, ""),
        c if c.starts_with("merge --no-ff") => exit(
            1,
            "error: Your local changes to the following files would be overwritten by merge",
        ),
        _ => ok(""),
    });
    let config = SyncConfig::default();
    let repo = Repository::new(runner, &config);

    let outcome = MergeRequestProcessor::new(&repo, &config)
        .process(&branch("edit"))
        .await
        .unwrap();

    assert_eq!(outcome, BranchOutcome::Deferred);
    let calls = calls.lock().unwrap();
    assert!(!calls.iter().any(|c| c.starts_with("push")));
    assert!(!calls.iter().any(|c| c.starts_with("diff --name-only")));
}

#[tokio::test]
async fn failing_push_aborts_processing() {
    let calls: Calls = Arc::default();
    let runner = scripted(calls.clone(), |cmd| match cmd {
        "log -1 --format=%B origin/fix --" => ok("[archive merge]"),
        "rev-parse -q --verify MERGE_HEAD" => exit(1, ""),
        "push origin master" => exit(1, "rejected"),
        _ => ok(""),
    });
    let config = SyncConfig::default();
    let repo = Repository::new(runner, &config);

    let err = MergeRequestProcessor::new(&repo, &config)
        .process(&branch("fix"))
        .await
        .expect_err("push failure must surface");

    assert!(matches!(err, GitError::Failed { ref command, .. } if command == "push origin master"));
    assert!(!calls
        .lock()
        .unwrap()
        .iter()
        .any(|c| c.contains("--delete")));
}

#[tokio::test]
async fn checkout_base_recovers_from_interrupted_merge() {
    let calls: Calls = Arc::default();
    let mut attempts = 0;
    let runner = scripted(calls.clone(), move |cmd| match cmd {
        "rev-parse -q --verify MERGE_HEAD" => exit(1, ""),
        "checkout master" => {
            attempts += 1;
            if attempts == 1 {
                exit(
                    1,
                    "001/file.txt: needs merge\nerror: you need to resolve your current index first",
                )
            } else {
                ok("")
            }
        }
        _ => ok(""),
    });
    let config = SyncConfig::default();
    let repo = Repository::new(runner, &config);

    repo.checkout_base().await.expect("checkout should recover");

    let calls = calls.lock().unwrap();
    let checkouts: Vec<_> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.as_str() == "checkout master")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(checkouts.len(), 2);
    let abort = calls.iter().position(|c| c == "merge --abort").unwrap();
    assert!(checkouts[0] < abort && abort < checkouts[1]);
}

#[tokio::test]
async fn checkout_base_aborts_pending_merge_first() {
    let calls: Calls = Arc::default();
    let mut merging = true;
    let runner = scripted(calls.clone(), move |cmd| match cmd {
        "rev-parse -q --verify MERGE_HEAD" if merging => ok("abc123\n"),
        "merge --abort" => {
            merging = false;
            ok("")
        }
        _ => ok(""),
    });
    let config = SyncConfig::default();
    let repo = Repository::new(runner, &config);

    repo.checkout_base().await.unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(
        *calls,
        vec![
            "rev-parse -q --verify MERGE_HEAD",
            "merge --abort",
            "checkout master"
        ]
    );
}

#[tokio::test]
async fn checkout_base_fails_on_other_errors() {
    let runner = scripted(Arc::default(), |cmd| match cmd {
        "rev-parse -q --verify MERGE_HEAD" => exit(1, ""),
        "checkout master" => exit(1, "error: pathspec 'master' did not match"),
        _ => ok(""),
    });
    let config = SyncConfig::default();
    let repo = Repository::new(runner, &config);

    let err = repo.checkout_base().await.unwrap_err();
    assert!(matches!(err, GitError::Failed { code: Some(1), .. }));
}

#[tokio::test]
async fn timeouts_propagate_from_must_succeed_commands() {
    let mut runner = MockGitRunner::new();
    runner.expect_run().returning(|args, timeout| {
        Err(GitError::Timeout {
            command: args.join(" "),
            secs: timeout.as_secs(),
        })
    });
    let config = SyncConfig::default();
    let repo = Repository::new(runner, &config);

    let err = repo.fetch().await.unwrap_err();
    assert!(matches!(err, GitError::Timeout { secs: 3600, .. }));
    assert!(!repo.delete_remote_branch("fix").await);
}
