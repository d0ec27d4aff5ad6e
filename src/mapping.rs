//! User-authored column mappings.
//!
//! A mapping is a YAML document whose keys are field names and whose values
//! are column references: a 1-based integer position, a one or two letter
//! column code, or header text. Values may nest as sequences or mappings of
//! references. A `!literal` tag marks a value copied verbatim into every
//! record instead of being read from a column.
//!
//! ```yaml
//! _settings:
//!   header_row: 2
//!   append_terms: true
//! uniqid: UID
//! core/title: Title
//! status: !literal draft
//! classify/category: [Cat, D]
//! address:
//!   street: 4
//!   city: City
//! ```

use std::{collections::BTreeMap, fs, path::Path};

use serde::{Deserialize, Serialize};
use serde_yaml::Value as YamlValue;

use crate::{
    cell::{Cell, Node},
    error::{ImportError, ImportResult},
};

/// Reserved entry carrying [`Settings`]; matched case-insensitively.
pub const SETTINGS_KEY: &str = "_settings";
/// Mandatory entry naming the identity key column; matched case-insensitively.
pub const IDENTITY_KEY: &str = "uniqid";

#[derive(Debug, Clone, PartialEq)]
pub enum Reference {
    /// Letter code or header text, disambiguated against the header row.
    Column(String),
    /// 1-based column position as written by the user.
    Position(i64),
    Literal(Cell),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// 1-based row holding the column headers.
    pub header_row: usize,
    pub force_publish: bool,
    pub append_terms: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            header_row: 1,
            force_publish: false,
            append_terms: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Mapping {
    entries: Vec<(String, Node<Reference>)>,
    settings: Settings,
}

impl Mapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, name: impl Into<String>, reference: Node<Reference>) -> Self {
        self.entries.push((name.into(), reference));
        self
    }

    pub fn load(path: &Path) -> ImportResult<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    pub fn from_yaml_str(input: &str) -> ImportResult<Self> {
        let document: YamlValue = serde_yaml::from_str(input)
            .map_err(|err| ImportError::MalformedMapping(format!("Invalid YAML: {err}")))?;
        let YamlValue::Mapping(root) = document else {
            return Err(ImportError::MalformedMapping(
                "The map must be a mapping of field names to column references.".to_string(),
            ));
        };

        let mut mapping = Mapping::new();
        for (key, value) in root {
            let name = yaml_key(&key)?;
            if name.eq_ignore_ascii_case(SETTINGS_KEY) {
                mapping.settings = parse_settings(value)?;
                continue;
            }
            let reference = parse_reference(&value)
                .map_err(|err| with_field_context(err, &name))?;
            mapping.entries.push((name, reference));
        }
        Ok(mapping)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Node<Reference>)> {
        self.entries
            .iter()
            .map(|(name, reference)| (name.as_str(), reference))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn has_identity(&self) -> bool {
        self.entries
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case(IDENTITY_KEY))
    }
}

fn yaml_key(key: &YamlValue) -> ImportResult<String> {
    match key {
        YamlValue::String(name) => Ok(name.clone()),
        YamlValue::Number(number) => Ok(number.to_string()),
        other => Err(ImportError::MalformedMapping(format!(
            "Field names must be strings, found {other:?}."
        ))),
    }
}

fn parse_settings(value: YamlValue) -> ImportResult<Settings> {
    let settings: Settings = serde_yaml::from_value(value)
        .map_err(|err| ImportError::MalformedMapping(format!("Invalid settings: {err}")))?;
    if settings.header_row == 0 {
        return Err(ImportError::MalformedMapping(
            "header_row counts from 1.".to_string(),
        ));
    }
    Ok(settings)
}

fn parse_reference(value: &YamlValue) -> ImportResult<Node<Reference>> {
    match value {
        YamlValue::String(text) => Ok(Node::Leaf(Reference::Column(text.clone()))),
        YamlValue::Number(number) => number
            .as_i64()
            .map(|position| Node::Leaf(Reference::Position(position)))
            .ok_or_else(wrong_type),
        YamlValue::Sequence(items) => items
            .iter()
            .map(parse_reference)
            .collect::<ImportResult<Vec<_>>>()
            .map(Node::Seq),
        YamlValue::Mapping(entries) => entries
            .iter()
            .map(|(key, item)| Ok((yaml_key(key)?, parse_reference(item)?)))
            .collect::<ImportResult<BTreeMap<_, _>>>()
            .map(Node::Map),
        YamlValue::Tagged(tagged) if tagged.tag == "literal" => {
            parse_literal(&tagged.value).map(|cell| Node::Leaf(Reference::Literal(cell)))
        }
        YamlValue::Null | YamlValue::Bool(_) | YamlValue::Tagged(_) => Err(wrong_type()),
    }
}

fn parse_literal(value: &YamlValue) -> ImportResult<Cell> {
    match value {
        YamlValue::Null => Ok(Cell::Empty),
        YamlValue::String(text) => Ok(Cell::Text(text.clone())),
        YamlValue::Bool(flag) => Ok(Cell::Text(flag.to_string())),
        YamlValue::Number(number) => Ok(number
            .as_i64()
            .map(Cell::Integer)
            .or_else(|| number.as_f64().map(Cell::Number))
            .unwrap_or_else(|| Cell::Text(number.to_string()))),
        _ => Err(ImportError::MalformedMapping(
            "Literal values must be scalars.".to_string(),
        )),
    }
}

fn wrong_type() -> ImportError {
    ImportError::MalformedMapping("Column references must be a string or integer.".to_string())
}

fn with_field_context(err: ImportError, field: &str) -> ImportError {
    match err {
        ImportError::MalformedMapping(message) => {
            ImportError::MalformedMapping(format!("{message} (field '{field}')"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_settings_and_nested_references() {
        let mapping = Mapping::from_yaml_str(
            r#"
_Settings:
  header_row: 2
  force_publish: true
UniqId: UID
core/title: 1
status: !literal draft
classify/category: [Cat, D]
"#,
        )
        .expect("mapping parses");

        assert_eq!(
            *mapping.settings(),
            Settings {
                header_row: 2,
                force_publish: true,
                append_terms: false,
            }
        );
        assert!(mapping.has_identity());
        let entries: Vec<_> = mapping.entries().collect();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].0, "UniqId");
        assert_eq!(entries[1].1, &Node::Leaf(Reference::Position(1)));
        assert_eq!(
            entries[2].1,
            &Node::Leaf(Reference::Literal(Cell::text("draft")))
        );
        assert_eq!(
            entries[3].1,
            &Node::Seq(vec![
                Node::Leaf(Reference::Column("Cat".to_string())),
                Node::Leaf(Reference::Column("D".to_string())),
            ])
        );
    }

    #[test]
    fn rejects_non_reference_leaves() {
        for document in ["uniqid: true", "uniqid: 1.5", "uniqid: ~", "uniqid: [A, false]"] {
            let err = Mapping::from_yaml_str(document).expect_err(document);
            assert!(
                matches!(err, ImportError::MalformedMapping(_)),
                "{document}: {err}"
            );
        }
    }

    #[test]
    fn rejects_zero_header_row() {
        let err = Mapping::from_yaml_str("_settings: {header_row: 0}\nuniqid: A")
            .expect_err("header row 0");
        assert!(err.to_string().contains("header_row"));
    }

    #[test]
    fn rejects_non_mapping_documents() {
        let err = Mapping::from_yaml_str("- A\n- B").expect_err("sequence document");
        assert!(matches!(err, ImportError::MalformedMapping(_)));
    }
}
