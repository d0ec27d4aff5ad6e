//! Per-import progress log.
//!
//! The log lives in a transient key-value store under a key derived from the
//! import's record kind, mapping slug and principal, so concurrent imports by
//! different principals never overwrite each other. Entries expire after
//! [`RETENTION_SECS`]. The importer writes the log through a
//! [`ProgressTracker`]; pollers only ever read it.
//!
//! Status moves `saving -> processing -> complete`, and any non-terminal
//! state may move to `error`. A log read before the first write has no
//! status at all.

use std::{
    collections::{BTreeMap, HashMap},
    fmt, fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use chrono::{DateTime, TimeDelta, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::{
    error::{ImportError, ImportResult},
    store::EntityId,
};

pub const RETENTION_SECS: i64 = 24 * 60 * 60;

const KEY_PREFIX: &str = "import_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Saving,
    Processing,
    Complete,
    Error,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Complete | Status::Error)
    }

    fn may_follow(self, previous: Option<Status>) -> bool {
        match (previous, self) {
            (None, Status::Saving) => true,
            (Some(Status::Saving), Status::Processing) => true,
            (Some(Status::Processing), Status::Complete) => true,
            (previous, Status::Error) => !previous.is_some_and(Status::is_terminal),
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Status::Saving => "saving",
            Status::Processing => "processing",
            Status::Complete => "complete",
            Status::Error => "error",
        };
        f.write_str(label)
    }
}

/// What reconciliation did with a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Inserted,
    Updated,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Inserted => f.write_str("inserted"),
            Outcome::Updated => f.write_str("updated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressLog {
    pub status: Option<Status>,
    /// Data rows below the header row.
    pub total: usize,
    pub processed: usize,
    pub posts: BTreeMap<EntityId, Outcome>,
    pub error_message: Option<String>,
    pub stored_path: Option<String>,
}

impl ProgressLog {
    pub fn is_finished(&self) -> bool {
        self.status.is_some_and(Status::is_terminal)
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.posts.values().filter(|value| **value == outcome).count()
    }
}

/// Key for the progress log of an import of `kind` records with mapping
/// `slug` started by `principal`.
pub fn progress_key(kind: &str, slug: &str, principal: &str) -> String {
    let digest = Sha256::digest(format!("{kind}_{slug}_{principal}").as_bytes());
    format!("{KEY_PREFIX}{digest:x}")
}

/// Expiring key-value storage shared by writers and pollers.
pub trait TransientStore: Send + Sync {
    fn get(&self, key: &str) -> ImportResult<Option<JsonValue>>;
    fn set(&self, key: &str, value: JsonValue, ttl: TimeDelta) -> ImportResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryTransientStore {
    entries: Mutex<HashMap<String, (DateTime<Utc>, JsonValue)>>,
}

impl MemoryTransientStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransientStore for MemoryTransientStore {
    fn get(&self, key: &str) -> ImportResult<Option<JsonValue>> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ImportError::ProgressStorage("progress store lock poisoned".into()))?;
        match entries.get(key) {
            Some((expires_at, _)) if *expires_at <= Utc::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((_, value)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: JsonValue, ttl: TimeDelta) -> ImportResult<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ImportError::ProgressStorage("progress store lock poisoned".into()))?;
        entries.insert(key.to_string(), (Utc::now() + ttl, value));
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEntry {
    expires_at: DateTime<Utc>,
    value: JsonValue,
}

/// One JSON file per key inside a directory. Writes go through a temporary
/// file and a rename so readers never observe a partial log. Reads never
/// touch the directory; an expired file stays until the next write replaces
/// it.
#[derive(Debug, Clone)]
pub struct FileTransientStore {
    dir: PathBuf,
}

impl FileTransientStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl TransientStore for FileTransientStore {
    fn get(&self, key: &str) -> ImportResult<Option<JsonValue>> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read(&path)?;
        let entry: StoredEntry = serde_json::from_slice(&raw).map_err(|err| {
            ImportError::ProgressStorage(format!("{}: {err}", path.display()))
        })?;
        if entry.expires_at <= Utc::now() {
            debug!("Progress entry {key} expired at {}", entry.expires_at);
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    fn set(&self, key: &str, value: JsonValue, ttl: TimeDelta) -> ImportResult<()> {
        fs::create_dir_all(&self.dir)?;
        let entry = StoredEntry {
            expires_at: Utc::now() + ttl,
            value,
        };
        let path = self.entry_path(key);
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer(&mut file, &entry)
            .map_err(|err| ImportError::ProgressStorage(err.to_string()))?;
        file.flush()?;
        drop(file);
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Read-modify-write access to one progress log.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn TransientStore>,
    key: String,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("key", &self.key)
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn TransientStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the stored log, or an empty one when nothing is stored or the
    /// entry has expired.
    pub fn read(&self) -> ImportResult<ProgressLog> {
        match self.store.get(&self.key)? {
            Some(value) => serde_json::from_value(value)
                .map_err(|err| ImportError::ProgressStorage(err.to_string())),
            None => Ok(ProgressLog::default()),
        }
    }

    /// Replaces whatever is stored with an empty log.
    pub fn init(&self) -> ImportResult<ProgressLog> {
        let log = ProgressLog::default();
        self.write(&log)?;
        Ok(log)
    }

    pub fn update(&self, change: impl FnOnce(&mut ProgressLog)) -> ImportResult<ProgressLog> {
        let mut log = self.read()?;
        change(&mut log);
        self.write(&log)?;
        Ok(log)
    }

    /// Moves the log to `status`, applying `change` in the same write.
    pub fn transition(
        &self,
        status: Status,
        change: impl FnOnce(&mut ProgressLog),
    ) -> ImportResult<ProgressLog> {
        let mut log = self.read()?;
        if !status.may_follow(log.status) {
            return Err(ImportError::ProgressTransition {
                from: log
                    .status
                    .map_or_else(|| "unset".to_string(), |status| status.to_string()),
                to: status.to_string(),
            });
        }
        log.status = Some(status);
        change(&mut log);
        self.write(&log)?;
        debug!("Progress {} -> {status}", self.key);
        Ok(log)
    }

    pub fn fail(&self, message: impl Into<String>) -> ImportResult<ProgressLog> {
        let message = message.into();
        self.transition(Status::Error, |log| log.error_message = Some(message))
    }

    fn write(&self, log: &ProgressLog) -> ImportResult<()> {
        let value =
            serde_json::to_value(log).map_err(|err| ImportError::ProgressStorage(err.to_string()))?;
        self.store
            .set(&self.key, value, TimeDelta::seconds(RETENTION_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(key: &str) -> ProgressTracker {
        ProgressTracker::new(Arc::new(MemoryTransientStore::new()), key)
    }

    #[test]
    fn keys_differ_by_every_component() {
        let base = progress_key("post", "default", "7");
        assert!(base.starts_with("import_"));
        assert_eq!(base.len(), KEY_PREFIX.len() + 64);
        assert_eq!(base, progress_key("post", "default", "7"));
        assert_ne!(base, progress_key("page", "default", "7"));
        assert_ne!(base, progress_key("post", "other", "7"));
        assert_ne!(base, progress_key("post", "default", "8"));
    }

    #[test]
    fn status_follows_lifecycle() {
        let progress = tracker("lifecycle");
        assert_eq!(progress.read().unwrap().status, None);
        progress.init().unwrap();
        progress.transition(Status::Saving, |_| {}).unwrap();
        let err = progress
            .transition(Status::Complete, |_| {})
            .expect_err("saving cannot complete");
        assert!(matches!(err, ImportError::ProgressTransition { .. }));
        progress.transition(Status::Processing, |log| log.total = 3).unwrap();
        let log = progress.transition(Status::Complete, |_| {}).unwrap();
        assert!(log.is_finished());
        assert_eq!(log.total, 3);
        assert!(progress.fail("too late").is_err());
    }

    #[test]
    fn failure_records_message() {
        let progress = tracker("failure");
        progress.init().unwrap();
        progress.transition(Status::Saving, |_| {}).unwrap();
        let log = progress.fail("boom").unwrap();
        assert_eq!(log.status, Some(Status::Error));
        assert_eq!(log.error_message.as_deref(), Some("boom"));
    }

    #[test]
    fn expired_entries_read_as_absent() {
        let store = MemoryTransientStore::new();
        store
            .set("gone", JsonValue::from(1), TimeDelta::seconds(-1))
            .unwrap();
        assert_eq!(store.get("gone").unwrap(), None);
    }

    #[test]
    fn log_serializes_with_lowercase_status() {
        let mut log = ProgressLog {
            status: Some(Status::Processing),
            total: 2,
            processed: 1,
            ..ProgressLog::default()
        };
        log.posts.insert(10, Outcome::Inserted);
        let value = serde_json::to_value(&log).unwrap();
        assert_eq!(value["status"], "processing");
        assert_eq!(value["posts"]["10"], "inserted");
    }
}
