use std::{borrow::Cow, fmt::Write as _};

#[derive(Debug, Clone, Default)]
pub struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<H: Into<String>>(headers: impl IntoIterator<Item = H>) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Appends a row; cells past the header count are dropped and missing
    /// cells render empty.
    pub fn push<C: Into<String>>(&mut self, cells: impl IntoIterator<Item = C>) -> &mut Self {
        let mut row: Vec<String> = cells
            .into_iter()
            .take(self.headers.len())
            .map(Into::into)
            .collect();
        row.resize(self.headers.len(), String::new());
        self.rows.push(row);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn render(&self) -> String {
        let mut widths: Vec<usize> = self
            .headers
            .iter()
            .map(|header| header.chars().count().max(3))
            .collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(flatten(cell).chars().count());
            }
        }

        let mut output = String::new();
        let separators: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
        for line in std::iter::once(&self.headers)
            .chain(std::iter::once(&separators))
            .chain(&self.rows)
        {
            let _ = writeln!(output, "{}", format_line(line, &widths));
        }
        output
    }

    pub fn print(&self) {
        print!("{}", self.render());
    }
}

fn format_line(cells: &[String], widths: &[usize]) -> String {
    let mut line = String::new();
    for (idx, (cell, width)) in cells.iter().zip(widths).enumerate() {
        if idx > 0 {
            line.push_str("  ");
        }
        let _ = write!(line, "{:<width$}", flatten(cell), width = *width);
    }
    line.trim_end().to_string()
}

/// Keeps multi-line cell values on one line.
fn flatten(value: &str) -> Cow<'_, str> {
    if value.contains(['\n', '\r', '\t']) {
        Cow::Owned(value.replace(['\n', '\r', '\t'], " "))
    } else {
        Cow::Borrowed(value)
    }
}
