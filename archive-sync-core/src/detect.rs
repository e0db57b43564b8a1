//! Change detection: the newest mtime under an item, and the settled-window rule.

use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Newest modification time of `path` and of any file or directory below it.
///
/// `None` means there is nothing below `path`; otherwise the root's own mtime
/// counts too, so deleting a file directly inside it is noticed. Symlinked
/// directories are not followed.
pub fn latest_modification(path: &Path) -> std::io::Result<Option<DateTime<Utc>>> {
    fn visit_dir(dir: &Path, latest: &mut Option<DateTime<Utc>>) -> std::io::Result<()> {
        for entry_res in fs::read_dir(dir)? {
            let entry = entry_res?;
            let path = entry.path();
            let meta = fs::symlink_metadata(&path)?;
            let modified: DateTime<Utc> = meta.modified()?.into();
            if latest.map_or(true, |current| modified > current) {
                *latest = Some(modified);
            }
            if meta.is_dir() {
                visit_dir(&path, latest)?;
            }
        }
        Ok(())
    }

    let mut latest = None;
    visit_dir(path, &mut latest)?;
    let Some(below) = latest else {
        return Ok(None);
    };
    let root: DateTime<Utc> = fs::symlink_metadata(path)?.modified()?.into();
    Ok(Some(below.max(root)))
}

/// An item is committable once it moved past its recorded state and has been
/// left alone for at least `quiet_window`.
pub fn is_changed(
    latest: DateTime<Utc>,
    previous: DateTime<Utc>,
    now: DateTime<Utc>,
    quiet_window: Duration,
) -> bool {
    if latest <= previous {
        return false;
    }
    match (now - latest).to_std() {
        Ok(age) => age >= quiet_window,
        // latest is in the future relative to `now`
        Err(_) => quiet_window.is_zero(),
    }
}
