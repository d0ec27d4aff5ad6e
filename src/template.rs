//! Mapping template assembly and per-row interpolation.
//!
//! [`Template::assemble`] runs once per import against the header row. It
//! sorts every mapping entry into one of four buckets (identity key, core
//! field, metadata, classification) and rewrites each column reference into a
//! canonical 0-based index. The resulting template is immutable and reused for
//! every data row, so per-row work is a single walk over the template.

use std::collections::BTreeMap;

use crate::{
    cell::{Cell, Node},
    columns::ColumnRefs,
    error::{ImportError, ImportResult},
    mapping::{IDENTITY_KEY, Mapping, Reference},
};

/// Record fields passed straight to the store's create/update operations.
pub const CORE_FIELDS: &[&str] = &[
    "title",
    "body",
    "name",
    "status",
    "author",
    "excerpt",
    "kind",
    "parent",
    "menu_order",
    "password",
    "publish_date",
    "publish_date_gmt",
    "comment_status",
    "ping_status",
    "to_ping",
    "pinged",
    "template",
];

pub const STATUS_FIELD: &str = "status";
pub const KIND_FIELD: &str = "kind";

pub const CATEGORY: &str = "category";
pub const TAG: &str = "tag";

const CATEGORY_SYNONYMS: &[&str] = &["category", "categories", "cat", "cats"];
const TAG_SYNONYMS: &[&str] = &["tag", "tags"];

const CORE_PREFIX: &str = "core/";
const CLASSIFY_PREFIX: &str = "classify/";
const META_PREFIX: &str = "meta/";

/// A resolved template leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum Slot {
    Column(usize),
    Literal(Cell),
}

impl Slot {
    fn fill(&self, row: &[Cell]) -> Cell {
        match self {
            // Short rows leave trailing columns empty.
            Slot::Column(index) => row.get(*index).cloned().unwrap_or_default(),
            Slot::Literal(cell) => cell.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Bucket {
    Identity,
    Core(String),
    Meta(String),
    Classification(String),
}

fn classify_name(name: &str, is_registered: &dyn Fn(&str) -> bool) -> ImportResult<Bucket> {
    if name.eq_ignore_ascii_case(IDENTITY_KEY) {
        return Ok(Bucket::Identity);
    }
    if CORE_FIELDS.contains(&name) {
        return Ok(Bucket::Core(name.to_string()));
    }
    if let Some(field) = name.strip_prefix(CORE_PREFIX) {
        if CORE_FIELDS.contains(&field) {
            return Ok(Bucket::Core(field.to_string()));
        }
        return Err(ImportError::MalformedMapping(format!(
            "{field} is not a valid core field."
        )));
    }
    let (classification, prefixed) = match name.strip_prefix(CLASSIFY_PREFIX) {
        Some(rest) => (rest, true),
        None => (name, false),
    };
    if CATEGORY_SYNONYMS.contains(&classification) {
        return Ok(Bucket::Classification(CATEGORY.to_string()));
    }
    if TAG_SYNONYMS.contains(&classification) {
        return Ok(Bucket::Classification(TAG.to_string()));
    }
    if prefixed {
        if is_registered(classification) {
            return Ok(Bucket::Classification(classification.to_string()));
        }
        return Err(ImportError::MalformedMapping(format!(
            "{classification} is not a registered classification."
        )));
    }
    let key = name.strip_prefix(META_PREFIX).unwrap_or(name);
    Ok(Bucket::Meta(key.to_string()))
}

fn resolve_leaf(reference: &Reference, refs: &ColumnRefs) -> ImportResult<Slot> {
    match reference {
        Reference::Column(text) => refs
            .resolve(text)
            .map(Slot::Column)
            .ok_or_else(|| ImportError::UnresolvedColumnReference {
                reference: text.clone(),
            }),
        Reference::Position(position) => refs.resolve_position(*position).map(Slot::Column).ok_or_else(|| {
            ImportError::MalformedMapping(format!(
                "Column {position} is outside the scope of the spreadsheet. Columns follow 1-based counting and only columns with data in the header row are processed."
            ))
        }),
        Reference::Literal(cell) => Ok(Slot::Literal(cell.clone())),
    }
}

fn resolve_single(name: &str, node: &Node<Reference>, refs: &ColumnRefs) -> ImportResult<Slot> {
    match node.as_leaf() {
        Some(reference) => resolve_leaf(reference, refs),
        None => Err(ImportError::MalformedMapping(format!(
            "{name} must reference a single column."
        ))),
    }
}

/// Fully resolved, reusable transformation plan for one import.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    identity: Slot,
    core: BTreeMap<String, Slot>,
    meta: BTreeMap<String, Node<Slot>>,
    classification: BTreeMap<String, Vec<Node<Slot>>>,
}

impl Template {
    /// Builds the template for `mapping` against the header described by
    /// `refs`. `is_registered` reports whether a custom classification name
    /// exists in the record store.
    pub fn assemble(
        mapping: &Mapping,
        refs: &ColumnRefs,
        is_registered: impl Fn(&str) -> bool,
    ) -> ImportResult<Self> {
        if !mapping.has_identity() {
            return Err(ImportError::MalformedMapping(
                "A unique ID must be established for every record and defined in the map."
                    .to_string(),
            ));
        }

        let classified = mapping
            .entries()
            .map(|(name, node)| Ok((name, classify_name(name, &is_registered)?, node)))
            .collect::<ImportResult<Vec<_>>>()?;

        let mut identity = None;
        let mut core = BTreeMap::new();
        let mut meta = BTreeMap::new();
        let mut classification: BTreeMap<String, Vec<Node<Slot>>> = BTreeMap::new();
        for (name, bucket, node) in classified {
            match bucket {
                Bucket::Identity => identity = Some(resolve_single(name, node, refs)?),
                Bucket::Core(field) => {
                    core.insert(field, resolve_single(name, node, refs)?);
                }
                Bucket::Meta(key) => {
                    meta.insert(key, node.try_map(&mut |leaf| resolve_leaf(leaf, refs))?);
                }
                Bucket::Classification(category) => {
                    let resolved = node.try_map(&mut |leaf| resolve_leaf(leaf, refs))?;
                    classification.entry(category).or_default().push(resolved);
                }
            }
        }

        let identity = identity.ok_or_else(|| {
            ImportError::MalformedMapping("The unique ID entry could not be resolved.".to_string())
        })?;
        Ok(Template {
            identity,
            core,
            meta,
            classification,
        })
    }

    pub fn identity(&self) -> &Slot {
        &self.identity
    }

    pub fn core(&self) -> &BTreeMap<String, Slot> {
        &self.core
    }

    pub fn meta(&self) -> &BTreeMap<String, Node<Slot>> {
        &self.meta
    }

    pub fn classification(&self) -> &BTreeMap<String, Vec<Node<Slot>>> {
        &self.classification
    }

    /// Number of leaves visited per row.
    pub fn size(&self) -> usize {
        1 + self.core.len()
            + self.meta.values().map(Node::leaf_count).sum::<usize>()
            + self
                .classification
                .values()
                .flatten()
                .map(Node::leaf_count)
                .sum::<usize>()
    }

    /// Replaces every column slot with the matching cell of `row`.
    pub fn interpolate(&self, row: &[Cell]) -> CompiledRecord {
        let mut fill = |slot: &Slot| slot.fill(row);
        CompiledRecord {
            identity: self.identity.fill(row),
            core: self
                .core
                .iter()
                .map(|(field, slot)| (field.clone(), slot.fill(row)))
                .collect(),
            meta: self
                .meta
                .iter()
                .map(|(key, node)| (key.clone(), node.map(&mut fill)))
                .collect(),
            classification: self
                .classification
                .iter()
                .map(|(category, nodes)| {
                    (
                        category.clone(),
                        nodes.iter().map(|node| node.map(&mut fill)).collect(),
                    )
                })
                .collect(),
        }
    }
}

/// One row's data laid out in the template's four buckets.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledRecord {
    pub identity: Cell,
    pub core: BTreeMap<String, Cell>,
    pub meta: BTreeMap<String, Node<Cell>>,
    pub classification: BTreeMap<String, Vec<Node<Cell>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never(_: &str) -> bool {
        false
    }

    #[test]
    fn classify_routes_names_to_buckets() {
        assert_eq!(classify_name("UNIQID", &never).unwrap(), Bucket::Identity);
        assert_eq!(
            classify_name("title", &never).unwrap(),
            Bucket::Core("title".into())
        );
        assert_eq!(
            classify_name("core/status", &never).unwrap(),
            Bucket::Core("status".into())
        );
        assert_eq!(
            classify_name("cats", &never).unwrap(),
            Bucket::Classification(CATEGORY.into())
        );
        assert_eq!(
            classify_name("classify/tags", &never).unwrap(),
            Bucket::Classification(TAG.into())
        );
        assert_eq!(
            classify_name("meta/title", &never).unwrap(),
            Bucket::Meta("title".into())
        );
        assert_eq!(
            classify_name("price", &never).unwrap(),
            Bucket::Meta("price".into())
        );
    }

    #[test]
    fn classify_rejects_unknown_prefixed_names() {
        let err = classify_name("core/headline", &never).unwrap_err();
        assert!(err.to_string().contains("headline is not a valid core field"));

        let err = classify_name("classify/genre", &never).unwrap_err();
        assert!(err.to_string().contains("genre is not a registered"));

        let registered = |name: &str| name == "genre";
        assert_eq!(
            classify_name("classify/genre", &registered).unwrap(),
            Bucket::Classification("genre".into())
        );
    }

    #[test]
    fn short_rows_fill_missing_columns_with_empty() {
        assert_eq!(Slot::Column(3).fill(&[Cell::from("a")]), Cell::Empty);
        assert_eq!(
            Slot::Literal(Cell::from("x")).fill(&[]),
            Cell::from("x")
        );
    }
}
