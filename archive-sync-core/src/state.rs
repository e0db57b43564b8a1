//! Per-item and controller-wide state records.
//!
//! Each record is a flat JSON object stored as `<state_dir>/<key>.json`. Records
//! are loaded leniently: a missing file becomes an empty record (and an empty
//! placeholder on disk), and a file that does not parse is logged and treated
//! the same way. Re-detecting a change is always preferred over failing an
//! iteration because of a damaged state file.
//!
//! Keys the controller does not know about are kept as-is, so documents
//! written by newer or older versions survive a load/modify/save cycle.

use crate::error::StateError;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Key of the singleton controller record. Item discovery skips `_`-prefixed
/// names, so no item can map onto it.
pub const CONTROLLER_KEY: &str = "_main";

const ID_FIELD: &str = "id";
const LAST_MODIFIED_FIELD: &str = "last_modified";
const LAST_GIT_FETCH_FIELD: &str = "last_git_fetch";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateRecord {
    fields: Map<String, Value>,
}

impl StateRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn id(&self) -> Option<&str> {
        self.fields.get(ID_FIELD).and_then(Value::as_str)
    }

    pub fn set_id(&mut self, id: &str) {
        self.set(ID_FIELD, id);
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.timestamp(LAST_MODIFIED_FIELD)
    }

    pub fn set_last_modified(&mut self, at: DateTime<Utc>) {
        self.set(LAST_MODIFIED_FIELD, format_timestamp(at));
    }

    pub fn last_git_fetch(&self) -> Option<DateTime<Utc>> {
        self.timestamp(LAST_GIT_FETCH_FIELD)
    }

    pub fn set_last_git_fetch(&mut self, at: DateTime<Utc>) {
        self.set(LAST_GIT_FETCH_FIELD, format_timestamp(at));
    }

    fn timestamp(&self, key: &str) -> Option<DateTime<Utc>> {
        let raw = self.fields.get(key)?.as_str()?;
        let parsed = parse_timestamp(raw);
        if parsed.is_none() {
            warn!(field = key, value = raw, "Ignoring unparseable timestamp in state record");
        }
        parsed
    }
}

/// RFC 3339 in UTC with full sub-second precision, so a stored value compares
/// exactly against the mtime it was taken from.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Accepts RFC 3339 and the naive `YYYY-MM-DD HH:MM:SS[.ffffff]` UTC form
/// found in older archives.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// JSON documents under `<archive>/<state_dir>`.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(archive_root: &Path, state_dir: &str) -> Self {
        Self {
            dir: archive_root.join(state_dir),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub fn ensure_dir(&self) -> Result<(), StateError> {
        if self.dir.is_dir() {
            return Ok(());
        }
        info!(path = %self.dir.display(), "Creating JSON state directory");
        fs::create_dir_all(&self.dir).map_err(|source| StateError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    pub fn load(&self, key: &str) -> Result<StateRecord, StateError> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "Creating empty state record");
                self.save(key, &StateRecord::new())?;
                return Ok(StateRecord::new());
            }
            Err(source) => return Err(StateError::Io { path, source }),
        };

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(fields)) => {
                debug!(path = %path.display(), keys = fields.len(), "Loaded state record");
                Ok(StateRecord { fields })
            }
            Ok(other) => {
                warn!(path = %path.display(), kind = ?other, "State record is not a JSON object, starting empty");
                Ok(StateRecord::new())
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read JSON state record, starting empty");
                Ok(StateRecord::new())
            }
        }
    }

    pub fn save(&self, key: &str, record: &StateRecord) -> Result<(), StateError> {
        let path = self.path_for(key);
        let json = serde_json::to_string(&record.fields).map_err(|source| StateError::Serialise {
            key: key.to_string(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| StateError::Io { path, source })
    }
}
