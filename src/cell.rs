use std::{borrow::Cow, collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// A single spreadsheet cell value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Cell {
    #[default]
    Empty,
    Integer(i64),
    Number(f64),
    Text(String),
}

impl Cell {
    pub fn text(value: impl Into<String>) -> Self {
        Cell::Text(value.into())
    }

    /// Empty cells and empty strings are blank; whitespace and zero are not.
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(text) => text.is_empty(),
            Cell::Integer(_) | Cell::Number(_) => false,
        }
    }

    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Cell::Text(text) => Cow::Borrowed(text.as_str()),
            Cell::Empty => Cow::Borrowed(""),
            other => Cow::Owned(other.to_string()),
        }
    }
}

impl fmt::Display for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cell::Empty => Ok(()),
            Cell::Integer(value) => write!(f, "{value}"),
            Cell::Number(value) => {
                if value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
                    write!(f, "{}", *value as i64)
                } else {
                    write!(f, "{value}")
                }
            }
            Cell::Text(text) => f.write_str(text),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Integer(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Number(value)
    }
}

/// A scalar leaf, a sequence, or a string-keyed mapping, recursively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node<T> {
    Leaf(T),
    Seq(Vec<Node<T>>),
    Map(BTreeMap<String, Node<T>>),
}

impl<T> Node<T> {
    pub fn as_leaf(&self) -> Option<&T> {
        match self {
            Node::Leaf(value) => Some(value),
            _ => None,
        }
    }

    /// Rebuilds the tree with every leaf passed through `f`, stopping at the
    /// first error.
    pub fn try_map<U, E, F>(&self, f: &mut F) -> Result<Node<U>, E>
    where
        F: FnMut(&T) -> Result<U, E>,
    {
        Ok(match self {
            Node::Leaf(value) => Node::Leaf(f(value)?),
            Node::Seq(items) => Node::Seq(
                items
                    .iter()
                    .map(|item| item.try_map(&mut *f))
                    .collect::<Result<Vec<_>, E>>()?,
            ),
            Node::Map(entries) => Node::Map(
                entries
                    .iter()
                    .map(|(key, item)| Ok((key.clone(), item.try_map(&mut *f)?)))
                    .collect::<Result<BTreeMap<_, _>, E>>()?,
            ),
        })
    }

    pub fn map<U, F>(&self, f: &mut F) -> Node<U>
    where
        F: FnMut(&T) -> U,
    {
        match self {
            Node::Leaf(value) => Node::Leaf(f(value)),
            Node::Seq(items) => Node::Seq(items.iter().map(|item| item.map(&mut *f)).collect()),
            Node::Map(entries) => Node::Map(
                entries
                    .iter()
                    .map(|(key, item)| (key.clone(), item.map(&mut *f)))
                    .collect(),
            ),
        }
    }

    /// Number of leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            Node::Leaf(_) => 1,
            Node::Seq(items) => items.iter().map(Node::leaf_count).sum(),
            Node::Map(entries) => entries.values().map(Node::leaf_count).sum(),
        }
    }
}
