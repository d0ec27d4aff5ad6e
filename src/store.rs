//! Record store boundary.
//!
//! The import engine never owns records. It talks to a [`RecordStore`] for
//! create, update, metadata and classification writes, and to an
//! [`IdentityIndex`](crate::identity::IdentityIndex) for the mapping from
//! spreadsheet identity keys to record ids. Two stores ship with the crate:
//! [`MemoryRecordStore`] for embedding and tests, and [`JsonRecordStore`],
//! which persists every mutation to a JSON document on disk.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    cell::{Cell, Node},
    progress::ProgressLog,
    template::{CATEGORY, TAG},
    terms::Term,
};

pub type EntityId = u64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record {0} does not exist")]
    NotFound(EntityId),

    #[error("classification '{0}' is not registered")]
    UnknownClassification(String),

    #[error("{0}")]
    Rejected(String),

    #[error("record store data is unreadable: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Audit entry written once per import that got as far as saving its file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub id: Uuid,
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    /// `<kind>_<slug>` of the import that produced it.
    pub tag: String,
    pub log: ProgressLog,
}

impl UploadRecord {
    pub fn new(file_name: impl Into<String>, tag: impl Into<String>, log: ProgressLog) -> Self {
        Self {
            id: Uuid::new_v4(),
            file_name: file_name.into(),
            created_at: Utc::now(),
            tag: tag.into(),
            log,
        }
    }
}

/// Write surface of the host record store.
pub trait RecordStore {
    /// Creates a record from core fields and returns its id.
    fn create(&mut self, fields: &BTreeMap<String, Cell>) -> Result<EntityId, StoreError>;

    /// Merges core fields into an existing record.
    fn update(&mut self, id: EntityId, fields: &BTreeMap<String, Cell>) -> Result<(), StoreError>;

    fn set_metadata(&mut self, id: EntityId, key: &str, value: &Node<Cell>)
    -> Result<(), StoreError>;

    /// Writes a field owned by the structured-field extension.
    fn set_structured_field(
        &mut self,
        id: EntityId,
        key: &str,
        value: &Node<Cell>,
    ) -> Result<(), StoreError>;

    /// Replaces the record's terms for `classification`, or adds to them when
    /// `append` is set. Term sets never hold duplicates.
    fn set_classification(
        &mut self,
        id: EntityId,
        classification: &str,
        terms: &[Term],
        append: bool,
    ) -> Result<(), StoreError>;

    fn has_classification(&self, name: &str) -> bool;

    fn record_upload(&mut self, upload: UploadRecord) -> Result<(), StoreError>;

    /// Audit entries carrying `tag`, oldest first.
    fn uploads(&self, tag: &str) -> Vec<UploadRecord>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entity {
    pub fields: BTreeMap<String, Cell>,
    pub meta: BTreeMap<String, Node<Cell>>,
    pub structured: BTreeMap<String, Node<Cell>>,
    pub classifications: BTreeMap<String, Vec<Term>>,
}

impl Entity {
    pub fn field(&self, name: &str) -> Option<&Cell> {
        self.fields.get(name)
    }

    pub fn terms(&self, classification: &str) -> &[Term] {
        self.classifications
            .get(classification)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct StoreState {
    next_id: EntityId,
    entities: BTreeMap<EntityId, Entity>,
    classifications: BTreeSet<String>,
    uploads: Vec<UploadRecord>,
}

impl Default for StoreState {
    fn default() -> Self {
        Self {
            next_id: 1,
            entities: BTreeMap::new(),
            classifications: [CATEGORY, TAG].into_iter().map(str::to_string).collect(),
            uploads: Vec::new(),
        }
    }
}

impl StoreState {
    fn entity_mut(&mut self, id: EntityId) -> Result<&mut Entity, StoreError> {
        self.entities.get_mut(&id).ok_or(StoreError::NotFound(id))
    }

    fn create(&mut self, fields: &BTreeMap<String, Cell>) -> EntityId {
        let id = self.next_id;
        self.next_id += 1;
        self.entities.insert(
            id,
            Entity {
                fields: fields.clone(),
                ..Entity::default()
            },
        );
        id
    }

    fn update(&mut self, id: EntityId, fields: &BTreeMap<String, Cell>) -> Result<(), StoreError> {
        let entity = self.entity_mut(id)?;
        for (name, value) in fields {
            entity.fields.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    fn set_classification(
        &mut self,
        id: EntityId,
        classification: &str,
        terms: &[Term],
        append: bool,
    ) -> Result<(), StoreError> {
        if !self.classifications.contains(classification) {
            return Err(StoreError::UnknownClassification(classification.to_string()));
        }
        let entity = self.entity_mut(id)?;
        let current = entity
            .classifications
            .entry(classification.to_string())
            .or_default();
        if !append {
            current.clear();
        }
        for term in terms {
            if !current.contains(term) {
                current.push(term.clone());
            }
        }
        Ok(())
    }

    fn uploads(&self, tag: &str) -> Vec<UploadRecord> {
        self.uploads
            .iter()
            .filter(|upload| upload.tag == tag)
            .cloned()
            .collect()
    }
}

/// Volatile store; everything is lost when it is dropped.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordStore {
    state: StoreState,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_classification(&mut self, name: impl Into<String>) {
        self.state.classifications.insert(name.into());
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.state.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.state.entities.iter().map(|(id, entity)| (*id, entity))
    }

    pub fn len(&self) -> usize {
        self.state.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.entities.is_empty()
    }

    /// Deletes a record outright, leaving any identity index entry dangling.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        self.state.entities.remove(&id)
    }
}

impl RecordStore for MemoryRecordStore {
    fn create(&mut self, fields: &BTreeMap<String, Cell>) -> Result<EntityId, StoreError> {
        Ok(self.state.create(fields))
    }

    fn update(&mut self, id: EntityId, fields: &BTreeMap<String, Cell>) -> Result<(), StoreError> {
        self.state.update(id, fields)
    }

    fn set_metadata(
        &mut self,
        id: EntityId,
        key: &str,
        value: &Node<Cell>,
    ) -> Result<(), StoreError> {
        let entity = self.state.entity_mut(id)?;
        entity.meta.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn set_structured_field(
        &mut self,
        id: EntityId,
        key: &str,
        value: &Node<Cell>,
    ) -> Result<(), StoreError> {
        let entity = self.state.entity_mut(id)?;
        entity.structured.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn set_classification(
        &mut self,
        id: EntityId,
        classification: &str,
        terms: &[Term],
        append: bool,
    ) -> Result<(), StoreError> {
        self.state.set_classification(id, classification, terms, append)
    }

    fn has_classification(&self, name: &str) -> bool {
        self.state.classifications.contains(name)
    }

    fn record_upload(&mut self, upload: UploadRecord) -> Result<(), StoreError> {
        self.state.uploads.push(upload);
        Ok(())
    }

    fn uploads(&self, tag: &str) -> Vec<UploadRecord> {
        self.state.uploads(tag)
    }
}

/// Store backed by a single JSON document, rewritten after every mutation.
#[derive(Debug)]
pub struct JsonRecordStore {
    path: PathBuf,
    state: StoreState,
}

impl JsonRecordStore {
    /// Opens the document at `path`, starting empty when it does not exist.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let state = if path.exists() {
            let raw = fs::read(path)?;
            serde_json::from_slice(&raw)
                .map_err(|err| StoreError::Corrupt(format!("{}: {err}", path.display())))?
        } else {
            StoreState::default()
        };
        Ok(Self {
            path: path.to_path_buf(),
            state,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.state.entities.get(&id)
    }

    pub fn entities(&self) -> impl Iterator<Item = (EntityId, &Entity)> {
        self.state.entities.iter().map(|(id, entity)| (*id, entity))
    }

    pub fn register_classification(&mut self, name: impl Into<String>) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.classifications.insert(name.into());
            Ok(())
        })
    }

    fn mutate<T>(
        &mut self,
        change: impl FnOnce(&mut StoreState) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let out = change(&mut self.state)?;
        self.save()?;
        Ok(out)
    }

    fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut writer = BufWriter::new(fs::File::create(&tmp)?);
        serde_json::to_writer_pretty(&mut writer, &self.state)
            .map_err(|err| StoreError::Corrupt(err.to_string()))?;
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp, &self.path)?;
        debug!(
            "Saved {} record(s) to {}",
            self.state.entities.len(),
            self.path.display()
        );
        Ok(())
    }
}

impl RecordStore for JsonRecordStore {
    fn create(&mut self, fields: &BTreeMap<String, Cell>) -> Result<EntityId, StoreError> {
        self.mutate(|state| Ok(state.create(fields)))
    }

    fn update(&mut self, id: EntityId, fields: &BTreeMap<String, Cell>) -> Result<(), StoreError> {
        self.mutate(|state| state.update(id, fields))
    }

    fn set_metadata(
        &mut self,
        id: EntityId,
        key: &str,
        value: &Node<Cell>,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .entity_mut(id)?
                .meta
                .insert(key.to_string(), value.clone());
            Ok(())
        })
    }

    fn set_structured_field(
        &mut self,
        id: EntityId,
        key: &str,
        value: &Node<Cell>,
    ) -> Result<(), StoreError> {
        self.mutate(|state| {
            state
                .entity_mut(id)?
                .structured
                .insert(key.to_string(), value.clone());
            Ok(())
        })
    }

    fn set_classification(
        &mut self,
        id: EntityId,
        classification: &str,
        terms: &[Term],
        append: bool,
    ) -> Result<(), StoreError> {
        self.mutate(|state| state.set_classification(id, classification, terms, append))
    }

    fn has_classification(&self, name: &str) -> bool {
        self.state.classifications.contains(name)
    }

    fn record_upload(&mut self, upload: UploadRecord) -> Result<(), StoreError> {
        self.mutate(|state| {
            state.uploads.push(upload);
            Ok(())
        })
    }

    fn uploads(&self, tag: &str) -> Vec<UploadRecord> {
        self.state.uploads(tag)
    }
}
