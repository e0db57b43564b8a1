use archive_sync_core::lock::ExclusivityGuard;
use tempfile::tempdir;

fn unique_name(label: &str) -> String {
    format!(
        "archive-sync-test-{label}-{}-{}",
        std::process::id(),
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

#[test]
fn second_acquire_reports_the_lock_as_held() {
    let name = unique_name("held");

    let first = ExclusivityGuard::acquire(&name)
        .expect("acquire should not fail")
        .expect("first acquire should get the lock");
    let second = ExclusivityGuard::acquire(&name).expect("acquire should not fail");

    assert!(second.is_none(), "lock must not be granted twice");
    assert_eq!(first.name(), name);
    assert!(first.path().ends_with(format!("{name}.lock")));
}

#[test]
fn released_lock_can_be_taken_again() {
    let name = unique_name("release");

    let first = ExclusivityGuard::acquire(&name).unwrap().unwrap();
    first.release();

    assert!(ExclusivityGuard::acquire(&name).unwrap().is_some());
}

#[test]
fn archive_lock_names_are_stable_per_path() {
    let dir = tempdir().unwrap();
    let a = dir.path().join("a");
    let b = dir.path().join("b");
    std::fs::create_dir(&a).unwrap();
    std::fs::create_dir(&b).unwrap();

    let name_a = ExclusivityGuard::name_for_archive(&a);
    assert_eq!(name_a, ExclusivityGuard::name_for_archive(&a.join(".")));
    assert_ne!(name_a, ExclusivityGuard::name_for_archive(&b));
    assert!(name_a.starts_with("archive-sync-"));
}

#[cfg(unix)]
#[test]
fn archive_not_yet_created_shares_its_lock_across_symlinks() {
    let dir = tempdir().unwrap();
    let real = dir.path().join("real");
    let link = dir.path().join("link");
    std::fs::create_dir(&real).unwrap();
    std::os::unix::fs::symlink(&real, &link).unwrap();

    let via_link = ExclusivityGuard::name_for_archive(&link.join("new-archive"));
    assert_eq!(via_link, ExclusivityGuard::name_for_archive(&real.join("new-archive")));

    std::fs::create_dir(real.join("new-archive")).unwrap();
    assert_eq!(via_link, ExclusivityGuard::name_for_archive(&link.join("new-archive")));
}
