use log::{debug, warn};

use crate::{
    cell::Cell,
    error::{ImportError, ImportResult},
    identity::IdentityIndex,
    mapping::Settings,
    progress::Outcome,
    store::{EntityId, RecordStore, StoreError},
    template::{CompiledRecord, KIND_FIELD, STATUS_FIELD},
    terms::flatten_and_split,
};

pub const PUBLISHED: &str = "published";
/// Kind used when neither the record nor the importer names one.
pub const GENERIC_KIND: &str = "post";
/// Metadata keys routed to the structured-field API when it is enabled.
pub const STRUCTURED_FIELD_PREFIX: &str = "field_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessingOptions {
    pub force_publish: bool,
    pub append_terms: bool,
}

impl From<&Settings> for ProcessingOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            force_publish: settings.force_publish,
            append_terms: settings.append_terms,
        }
    }
}

pub struct Reconciler<'a, S: ?Sized, I: ?Sized> {
    store: &'a mut S,
    identities: &'a mut I,
    bound_kind: Option<&'a str>,
    structured_fields: bool,
}

impl<'a, S, I> Reconciler<'a, S, I>
where
    S: RecordStore + ?Sized,
    I: IdentityIndex + ?Sized,
{
    pub fn new(store: &'a mut S, identities: &'a mut I, bound_kind: Option<&'a str>) -> Self {
        Self {
            store,
            identities,
            bound_kind,
            structured_fields: false,
        }
    }

    pub fn with_structured_fields(mut self, enabled: bool) -> Self {
        self.structured_fields = enabled;
        self
    }

    /// Writes `record` to the store, updating the record previously imported
    /// under the same identity key and kind or creating a new one.
    ///
    /// Rows with a blank identity key are always inserted and never
    /// registered, so they cannot be matched by a later import.
    pub fn reconcile(
        &mut self,
        record: CompiledRecord,
        options: &ProcessingOptions,
    ) -> ImportResult<(EntityId, Outcome)> {
        let CompiledRecord {
            identity,
            mut core,
            meta,
            classification,
        } = record;

        if options.force_publish {
            core.insert(STATUS_FIELD.to_string(), Cell::text(PUBLISHED));
        }

        let kind = match core.get(KIND_FIELD).filter(|value| !value.is_blank()) {
            Some(value) => value.as_text().into_owned(),
            None => {
                let kind = self.bound_kind.unwrap_or(GENERIC_KIND).to_string();
                core.insert(KIND_FIELD.to_string(), Cell::text(kind.as_str()));
                kind
            }
        };

        let key = identity.as_text().into_owned();
        let existing = if key.is_empty() {
            warn!("Row has a blank identity key; inserting a new {kind} record");
            None
        } else {
            self.identities.lookup(&key, &kind)
        };

        let (id, outcome) = match existing {
            Some(id) => {
                self.store
                    .update(id, &core)
                    .map_err(|err| update_failed(id, err))?;
                (id, Outcome::Updated)
            }
            None => {
                let id = self.store.create(&core).map_err(|err| {
                    ImportError::StoreOperationFailed(format!("Record creation failed: {err}"))
                })?;
                if !key.is_empty() {
                    self.identities
                        .register(&key, id, &kind)
                        .map_err(store_failed)?;
                }
                (id, Outcome::Inserted)
            }
        };
        debug!("Identity '{key}' ({kind}) {outcome} as record {id}");

        for (name, value) in &meta {
            let written = if self.structured_fields && name.starts_with(STRUCTURED_FIELD_PREFIX) {
                self.store.set_structured_field(id, name, value)
            } else {
                self.store.set_metadata(id, name, value)
            };
            written.map_err(store_failed)?;
        }

        for (category, values) in &classification {
            let terms = flatten_and_split(values);
            self.store
                .set_classification(id, category, &terms, options.append_terms)
                .map_err(store_failed)?;
        }

        Ok((id, outcome))
    }
}

fn update_failed(id: EntityId, err: StoreError) -> ImportError {
    ImportError::StoreOperationFailed(format!(
        "Update failed for record {id}; the target record may have been deleted. ({err})"
    ))
}

fn store_failed(err: StoreError) -> ImportError {
    ImportError::StoreOperationFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        cell::Node,
        identity::MemoryIdentityIndex,
        store::MemoryRecordStore,
        template::CATEGORY,
        terms::Term,
    };

    fn record(identity: &str, title: &str) -> CompiledRecord {
        CompiledRecord {
            identity: Cell::from(identity),
            core: BTreeMap::from([("title".to_string(), Cell::from(title))]),
            meta: BTreeMap::new(),
            classification: BTreeMap::new(),
        }
    }

    #[test]
    fn repeated_identity_updates_same_record() {
        let mut store = MemoryRecordStore::new();
        let mut identities = MemoryIdentityIndex::new();
        let mut reconciler = Reconciler::new(&mut store, &mut identities, None);
        let options = ProcessingOptions::default();

        let (first, outcome) = reconciler.reconcile(record("1", "Alpha"), &options).unwrap();
        assert_eq!(outcome, Outcome::Inserted);
        let (second, outcome) = reconciler.reconcile(record("1", "Beta"), &options).unwrap();
        assert_eq!(outcome, Outcome::Updated);
        assert_eq!(first, second);

        assert_eq!(identities.lookup("1", GENERIC_KIND), Some(first));
        let entity = store.entity(first).unwrap();
        assert_eq!(entity.field("title"), Some(&Cell::from("Beta")));
        assert_eq!(entity.field("kind"), Some(&Cell::from("post")));
    }

    #[test]
    fn force_publish_and_bound_kind_apply() {
        let mut store = MemoryRecordStore::new();
        let mut identities = MemoryIdentityIndex::new();
        let mut draft = record("9", "Draft");
        draft
            .core
            .insert(STATUS_FIELD.to_string(), Cell::from("draft"));
        let options = ProcessingOptions {
            force_publish: true,
            append_terms: false,
        };
        let (id, _) = Reconciler::new(&mut store, &mut identities, Some("page"))
            .reconcile(draft, &options)
            .unwrap();

        let entity = store.entity(id).unwrap();
        assert_eq!(entity.field("status"), Some(&Cell::from(PUBLISHED)));
        assert_eq!(entity.field("kind"), Some(&Cell::from("page")));
        assert_eq!(identities.lookup("9", "page"), Some(id));
        assert_eq!(identities.lookup("9", "post"), None);
    }

    #[test]
    fn update_of_deleted_record_fails_with_hint() {
        let mut store = MemoryRecordStore::new();
        let mut identities = MemoryIdentityIndex::new();
        let options = ProcessingOptions::default();
        let (id, _) = Reconciler::new(&mut store, &mut identities, None)
            .reconcile(record("1", "Alpha"), &options)
            .unwrap();
        store.remove(id);

        let err = Reconciler::new(&mut store, &mut identities, None)
            .reconcile(record("1", "Again"), &options)
            .expect_err("update of a deleted record");
        assert!(matches!(err, ImportError::StoreOperationFailed(_)));
        assert!(err.to_string().contains("may have been deleted"));
    }

    #[test]
    fn metadata_routes_structured_fields_and_terms_split() {
        let mut store = MemoryRecordStore::new();
        let mut identities = MemoryIdentityIndex::new();
        let mut row = record("5", "Routed");
        row.meta
            .insert("field_price".to_string(), Node::Leaf(Cell::Integer(10)));
        row.meta
            .insert("color".to_string(), Node::Leaf(Cell::from("red")));
        row.classification.insert(
            CATEGORY.to_string(),
            vec![Node::Leaf(Cell::from("news|tech"))],
        );

        let (id, _) = Reconciler::new(&mut store, &mut identities, None)
            .with_structured_fields(true)
            .reconcile(row, &ProcessingOptions::default())
            .unwrap();

        let entity = store.entity(id).unwrap();
        assert!(entity.structured.contains_key("field_price"));
        assert!(!entity.meta.contains_key("field_price"));
        assert_eq!(entity.meta["color"], Node::Leaf(Cell::from("red")));
        assert_eq!(
            entity.terms(CATEGORY),
            &[Term::from("news"), Term::from("tech")]
        );
    }

    #[test]
    fn blank_identity_never_matches() {
        let mut store = MemoryRecordStore::new();
        let mut identities = MemoryIdentityIndex::new();
        let mut reconciler = Reconciler::new(&mut store, &mut identities, None);
        let options = ProcessingOptions::default();
        let (first, _) = reconciler.reconcile(record("", "One"), &options).unwrap();
        let (second, outcome) = reconciler.reconcile(record("", "Two"), &options).unwrap();
        assert_ne!(first, second);
        assert_eq!(outcome, Outcome::Inserted);
        assert!(identities.is_empty());
    }
}
