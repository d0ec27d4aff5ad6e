//! Column addressing derived from a header row.
//!
//! Every column can be referred to three ways: its 1-based position, its
//! spreadsheet letter code (`A`, `B`, ..., `Z`, `AA`, ...) and the slug of its
//! header text. [`ColumnRefs`] maps the latter two back to the canonical
//! 0-based index.

use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::cell::Cell;

static CODE_PATTERN: OnceLock<Regex> = OnceLock::new();
static SLUG_SEPARATORS: OnceLock<Regex> = OnceLock::new();

fn code_pattern() -> &'static Regex {
    CODE_PATTERN.get_or_init(|| Regex::new(r"^[A-Z][A-Z]?$").expect("valid code pattern"))
}

fn slug_separators() -> &'static Regex {
    SLUG_SEPARATORS.get_or_init(|| Regex::new(r"[^a-z0-9_]+").expect("valid slug pattern"))
}

/// Whether `reference` is written as a one or two letter column code.
pub fn is_column_code(reference: &str) -> bool {
    code_pattern().is_match(reference)
}

/// Lowercases and collapses every run of non-alphanumeric characters into a
/// single `-`, trimming separators from both ends.
pub fn slugify(value: &str) -> String {
    let lowered = value.trim().to_lowercase();
    slug_separators()
        .replace_all(&lowered, "-")
        .trim_matches('-')
        .to_string()
}

/// Spreadsheet letter code for a 0-based column index (bijective base-26).
pub fn column_code(index: usize) -> String {
    let mut remaining = index + 1;
    let mut letters = Vec::new();
    while remaining > 0 {
        let digit = (remaining - 1) % 26;
        letters.push(char::from(b'A' + digit as u8));
        remaining = (remaining - 1) / 26;
    }
    letters.iter().rev().collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnRefs {
    slugs: Vec<String>,
    codes: Vec<String>,
}

impl ColumnRefs {
    pub fn from_header(header: &[Cell]) -> Self {
        let slugs = header.iter().map(|cell| slugify(&cell.as_text())).collect();
        let codes = (0..header.len()).map(column_code).collect();
        ColumnRefs { slugs, codes }
    }

    pub fn total(&self) -> usize {
        self.slugs.len()
    }

    pub fn slug(&self, index: usize) -> Option<&str> {
        self.slugs.get(index).map(String::as_str)
    }

    pub fn code(&self, index: usize) -> Option<&str> {
        self.codes.get(index).map(String::as_str)
    }

    /// Resolves a letter code or header text to its 0-based index.
    ///
    /// Duplicate slugs resolve to the leftmost column. Empty header cells
    /// produce empty slugs, which never match.
    pub fn resolve(&self, reference: &str) -> Option<usize> {
        if is_column_code(reference) {
            return self.codes.iter().position(|code| code == reference);
        }
        let slug = slugify(reference);
        if slug.is_empty() {
            return None;
        }
        self.slugs.iter().position(|candidate| *candidate == slug)
    }

    /// Converts a 1-based position into a 0-based index when it is within
    /// `[1, total]`.
    pub fn resolve_position(&self, position: i64) -> Option<usize> {
        let index = usize::try_from(position).ok()?.checked_sub(1)?;
        (index < self.total()).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(values: &[&str]) -> Vec<Cell> {
        values.iter().map(|value| Cell::from(*value)).collect()
    }

    #[test]
    fn column_codes_follow_spreadsheet_lettering() {
        assert_eq!(column_code(0), "A");
        assert_eq!(column_code(25), "Z");
        assert_eq!(column_code(26), "AA");
        assert_eq!(column_code(27), "AB");
        assert_eq!(column_code(701), "ZZ");
        assert_eq!(column_code(702), "AAA");
    }

    #[test]
    fn slugify_collapses_punctuation_and_case() {
        assert_eq!(slugify("Post Title"), "post-title");
        assert_eq!(slugify("  Price (USD) "), "price-usd");
        assert_eq!(slugify("snake_case"), "snake_case");
        assert_eq!(slugify("--"), "");
    }

    #[test]
    fn resolve_prefers_codes_for_uppercase_letters() {
        let refs = ColumnRefs::from_header(&header(&["ID", "B", "Title"]));
        assert_eq!(refs.resolve("B"), Some(1));
        assert_eq!(refs.resolve("id"), Some(0));
        assert_eq!(refs.resolve("ID"), None);
        assert_eq!(refs.resolve("title"), Some(2));
        assert_eq!(refs.resolve("TITLE"), Some(2));
    }

    #[test]
    fn empty_header_cells_never_match() {
        let refs = ColumnRefs::from_header(&[Cell::Empty, Cell::from("Name")]);
        assert_eq!(refs.slug(0), Some(""));
        assert_eq!(refs.resolve(""), None);
        assert_eq!(refs.resolve("name"), Some(1));
    }

    #[test]
    fn positions_are_one_based_and_inclusive() {
        let refs = ColumnRefs::from_header(&header(&["a", "b", "c"]));
        assert_eq!(refs.resolve_position(1), Some(0));
        assert_eq!(refs.resolve_position(3), Some(2));
        assert_eq!(refs.resolve_position(4), None);
        assert_eq!(refs.resolve_position(0), None);
        assert_eq!(refs.resolve_position(-2), None);
    }
}
