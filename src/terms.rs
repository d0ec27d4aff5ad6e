use std::{fmt, sync::OnceLock};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cell::{Cell, Node};

static TERM_DELIMITERS: OnceLock<Regex> = OnceLock::new();

fn term_delimiters() -> &'static Regex {
    TERM_DELIMITERS.get_or_init(|| Regex::new(r"[\s|,]+").expect("valid delimiter pattern"))
}

/// A classification term: an existing term id or a term name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Term {
    Id(i64),
    Name(String),
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Id(id) => write!(f, "{id}"),
            Term::Name(name) => f.write_str(name),
        }
    }
}

impl From<&str> for Term {
    fn from(value: &str) -> Self {
        Term::Name(value.to_string())
    }
}

impl From<i64> for Term {
    fn from(value: i64) -> Self {
        Term::Id(value)
    }
}

/// Flattens nested term values depth-first, splitting delimited strings
/// (whitespace, `|`, `,`) and coercing numeric values to term ids.
///
/// Order and duplicates are preserved; blank values produce no terms.
pub fn flatten_and_split(values: &[Node<Cell>]) -> Vec<Term> {
    let mut terms = Vec::new();
    for value in values {
        collect(value, &mut terms);
    }
    terms
}

fn collect(node: &Node<Cell>, terms: &mut Vec<Term>) {
    match node {
        Node::Leaf(cell) => split_cell(cell, terms),
        Node::Seq(items) => items.iter().for_each(|item| collect(item, terms)),
        Node::Map(entries) => entries.values().for_each(|item| collect(item, terms)),
    }
}

fn split_cell(cell: &Cell, terms: &mut Vec<Term>) {
    match cell {
        Cell::Empty => {}
        Cell::Integer(id) => terms.push(Term::Id(*id)),
        Cell::Number(value) => terms.push(Term::Id(value.trunc() as i64)),
        Cell::Text(text) => terms.extend(
            term_delimiters()
                .split(text)
                .filter(|part| !part.is_empty())
                .map(text_term),
        ),
    }
}

fn text_term(part: &str) -> Term {
    if let Ok(id) = part.parse::<i64>() {
        return Term::Id(id);
    }
    match part.parse::<f64>() {
        Ok(value) if value.is_finite() => Term::Id(value.trunc() as i64),
        _ => Term::Name(part.to_string()),
    }
}
