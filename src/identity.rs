use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::store::{EntityId, StoreError};

const IDENTITY_INDEX_VERSION: u32 = 1;

/// Maps spreadsheet identity keys to record ids, scoped by record kind.
pub trait IdentityIndex {
    fn lookup(&self, key: &str, kind: &str) -> Option<EntityId>;

    /// Registers `key` for `kind`, replacing any existing entry.
    fn register(&mut self, key: &str, id: EntityId, kind: &str) -> Result<(), StoreError>;
}

type Entries = BTreeMap<(String, String), EntityId>;

fn entry_key(key: &str, kind: &str) -> (String, String) {
    (kind.to_string(), key.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct MemoryIdentityIndex {
    entries: Entries,
}

impl MemoryIdentityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IdentityIndex for MemoryIdentityIndex {
    fn lookup(&self, key: &str, kind: &str) -> Option<EntityId> {
        self.entries.get(&entry_key(key, kind)).copied()
    }

    fn register(&mut self, key: &str, id: EntityId, kind: &str) -> Result<(), StoreError> {
        self.entries.insert(entry_key(key, kind), id);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    version: u32,
    entries: Vec<(String, String, EntityId)>,
}

/// Identity index persisted as a bincode file, replaced through a temp file
/// on every new registration.
#[derive(Debug)]
pub struct FileIdentityIndex {
    path: PathBuf,
    entries: Entries,
}

impl FileIdentityIndex {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let entries = if path.exists() {
            Self::load(path)?
        } else {
            Entries::new()
        };
        Ok(Self {
            path: path.to_path_buf(),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn load(path: &Path) -> Result<Entries, StoreError> {
        let bytes = fs::read(path)?;
        let (file, _): (IndexFile, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|err| StoreError::Corrupt(format!("{}: {err}", path.display())))?;
        if file.version != IDENTITY_INDEX_VERSION {
            return Err(StoreError::Corrupt(format!(
                "Unsupported identity index version {} (expected {IDENTITY_INDEX_VERSION})",
                file.version
            )));
        }
        Ok(file
            .entries
            .into_iter()
            .map(|(kind, key, id)| ((kind, key), id))
            .collect())
    }

    fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = IndexFile {
            version: IDENTITY_INDEX_VERSION,
            entries: self
                .entries
                .iter()
                .map(|((kind, key), id)| (kind.clone(), key.clone(), *id))
                .collect(),
        };
        let tmp = self.path.with_extension("bin.tmp");
        let mut writer = BufWriter::new(File::create(&tmp)?);
        bincode::serde::encode_into_std_write(&file, &mut writer, bincode::config::standard())
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl IdentityIndex for FileIdentityIndex {
    fn lookup(&self, key: &str, kind: &str) -> Option<EntityId> {
        self.entries.get(&entry_key(key, kind)).copied()
    }

    fn register(&mut self, key: &str, id: EntityId, kind: &str) -> Result<(), StoreError> {
        if self.entries.insert(entry_key(key, kind), id) == Some(id) {
            return Ok(());
        }
        debug!("Identity {kind}/{key} -> {id}");
        self.save()
    }
}
