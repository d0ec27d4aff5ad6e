//! Spreadsheet reading.
//!
//! Delimited text (`.csv`, `.tsv`) is read with the `csv` crate and decoded
//! through `encoding_rs`; workbooks (`.xls`, `.xlsx`, `.xlsm`, `.ods`) are
//! read with `calamine`, first worksheet only. Either way the reader yields
//! `(row_number, cells)` pairs where `row_number` is 0-based and counts the
//! header row.

use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use calamine::{Data, Reader, open_workbook_auto};
use csv::ByteRecord;
use encoding_rs::{Encoding, UTF_8};
use log::debug;

use crate::{
    cell::Cell,
    error::{ImportError, ImportResult},
};

pub const DEFAULT_CSV_DELIMITER: u8 = b',';
pub const DEFAULT_TSV_DELIMITER: u8 = b'\t';

const WORKBOOK_EXTENSIONS: &[&str] = &["xls", "xlsx", "xlsm", "ods"];
const DELIMITED_EXTENSIONS: &[&str] = &["csv", "tsv"];

pub type SheetRow = (usize, Vec<Cell>);
type RowIter = Box<dyn Iterator<Item = ImportResult<SheetRow>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetFormat {
    Delimited(u8),
    Workbook,
}

pub fn resolve_encoding(label: Option<&str>) -> ImportResult<&'static Encoding> {
    match label {
        Some(value) => Encoding::for_label(value.trim().as_bytes())
            .ok_or_else(|| ImportError::SheetRead(format!("Unknown encoding '{value}'"))),
        None => Ok(UTF_8),
    }
}

/// Picks a reader from the file extension. `delimiter` overrides the
/// delimiter of delimited files.
pub fn detect_format(path: &Path, delimiter: Option<u8>) -> ImportResult<SheetFormat> {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if WORKBOOK_EXTENSIONS.contains(&ext.as_str()) {
        return Ok(SheetFormat::Workbook);
    }
    if DELIMITED_EXTENSIONS.contains(&ext.as_str()) {
        let fallback = if ext == "tsv" {
            DEFAULT_TSV_DELIMITER
        } else {
            DEFAULT_CSV_DELIMITER
        };
        return Ok(SheetFormat::Delimited(delimiter.unwrap_or(fallback)));
    }
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Err(ImportError::UnsupportedFileType(name))
}

#[derive(Debug, Clone)]
pub struct SheetReader {
    path: PathBuf,
    format: SheetFormat,
    encoding: &'static Encoding,
}

impl SheetReader {
    /// Validates that `path` exists and has an accepted file type.
    pub fn open(
        path: &Path,
        delimiter: Option<u8>,
        encoding: &'static Encoding,
    ) -> ImportResult<Self> {
        if !path.is_file() {
            return Err(ImportError::NoFileReceived);
        }
        let format = detect_format(path, delimiter)?;
        Ok(Self {
            path: path.to_path_buf(),
            format,
            encoding,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts a fresh forward pass over every row.
    pub fn rows(&self) -> ImportResult<RowIter> {
        match self.format {
            SheetFormat::Delimited(delimiter) => self.delimited_rows(delimiter),
            SheetFormat::Workbook => self.workbook_rows(),
        }
    }

    /// Counts every row, header included, and captures the row at
    /// `header_index` in the same pass.
    pub fn scan(&self, header_index: usize) -> ImportResult<(Option<Vec<Cell>>, usize)> {
        let mut header = None;
        let mut count = 0;
        for row in self.rows()? {
            let (row_number, cells) = row?;
            if row_number == header_index {
                header = Some(cells);
            }
            count += 1;
        }
        Ok((header, count))
    }

    /// Cells of the row at 0-based `row_number`, if the sheet has it.
    pub fn row_at(&self, row_number: usize) -> ImportResult<Option<Vec<Cell>>> {
        for row in self.rows()? {
            let (number, cells) = row?;
            if number == row_number {
                return Ok(Some(cells));
            }
        }
        Ok(None)
    }

    fn delimited_rows(&self, delimiter: u8) -> ImportResult<RowIter> {
        let file = BufReader::new(File::open(&self.path)?);
        let reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(delimiter)
            .double_quote(true)
            .flexible(true)
            .from_reader(file);
        Ok(Box::new(DelimitedRows {
            records: reader.into_byte_records(),
            encoding: self.encoding,
            row_number: 0,
            next_line: 1,
            pending: None,
        }))
    }

    fn workbook_rows(&self) -> ImportResult<RowIter> {
        let mut workbook = open_workbook_auto(&self.path)?;
        let range = workbook
            .worksheet_range_at(0)
            .ok_or_else(|| ImportError::SheetRead("The workbook has no worksheets.".into()))??;
        let (first_row, first_col) = range
            .start()
            .map(|(row, col)| (row as usize, col as usize))
            .unwrap_or_default();
        debug!(
            "Worksheet {} starts at row {first_row}, column {first_col}",
            self.path.display()
        );

        let leading = (0..first_row).map(|row_number| (row_number, Vec::new()));
        let rows: Vec<SheetRow> = range
            .rows()
            .enumerate()
            .map(|(offset, data)| {
                let mut cells = vec![Cell::Empty; first_col];
                cells.extend(data.iter().map(data_to_cell));
                (first_row + offset, cells)
            })
            .collect();
        Ok(Box::new(leading.chain(rows).map(Ok)))
    }
}

/// Delimited records numbered by physical line.
///
/// The csv reader skips blank lines; each one is yielded here as an empty row.
struct DelimitedRows {
    records: csv::ByteRecordsIntoIter<BufReader<File>>,
    encoding: &'static Encoding,
    row_number: usize,
    next_line: u64,
    pending: Option<ByteRecord>,
}

impl DelimitedRows {
    fn emit(&mut self, cells: Vec<Cell>) -> SheetRow {
        let row = (self.row_number, cells);
        self.row_number += 1;
        row
    }
}

impl Iterator for DelimitedRows {
    type Item = ImportResult<SheetRow>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = match self.pending.take() {
            Some(record) => record,
            None => match self.records.next()? {
                Ok(record) => record,
                Err(err) => return Some(Err(err.into())),
            },
        };

        let line = record
            .position()
            .map(|position| position.line())
            .unwrap_or(self.next_line);
        if line > self.next_line {
            self.next_line += 1;
            self.pending = Some(record);
            return Some(Ok(self.emit(Vec::new())));
        }

        // Quoted fields may span lines.
        let embedded = record
            .iter()
            .map(|field| field.iter().filter(|byte| **byte == b'\n').count() as u64)
            .sum::<u64>();
        self.next_line = line + 1 + embedded;

        let cells = record
            .iter()
            .map(|field| decode_field(field, self.encoding))
            .collect::<ImportResult<Vec<_>>>();
        Some(cells.map(|cells| self.emit(cells)))
    }
}

fn decode_field(field: &[u8], encoding: &'static Encoding) -> ImportResult<Cell> {
    let (text, _, had_errors) = encoding.decode(field);
    if had_errors {
        return Err(ImportError::SheetRead(format!(
            "Failed to decode text with encoding {}",
            encoding.name()
        )));
    }
    Ok(if text.is_empty() {
        Cell::Empty
    } else {
        Cell::Text(text.into_owned())
    })
}

fn data_to_cell(data: &Data) -> Cell {
    match data {
        Data::Empty => Cell::Empty,
        Data::Int(value) => Cell::Integer(*value),
        Data::Float(value) => Cell::Number(*value),
        Data::String(text) if text.is_empty() => Cell::Empty,
        Data::String(text) => Cell::Text(text.clone()),
        other => Cell::Text(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn detects_format_by_extension() {
        assert_eq!(
            detect_format(Path::new("rows.CSV"), None).unwrap(),
            SheetFormat::Delimited(b',')
        );
        assert_eq!(
            detect_format(Path::new("rows.tsv"), None).unwrap(),
            SheetFormat::Delimited(b'\t')
        );
        assert_eq!(
            detect_format(Path::new("rows.csv"), Some(b';')).unwrap(),
            SheetFormat::Delimited(b';')
        );
        assert_eq!(
            detect_format(Path::new("book.xlsm"), None).unwrap(),
            SheetFormat::Workbook
        );
        let err = detect_format(Path::new("notes.txt"), None).expect_err("txt rejected");
        assert!(matches!(err, ImportError::UnsupportedFileType(name) if name == "notes.txt"));
    }

    #[test]
    fn missing_file_is_not_received() {
        let err = SheetReader::open(Path::new("/nonexistent/rows.csv"), None, UTF_8)
            .expect_err("missing file");
        assert!(matches!(err, ImportError::NoFileReceived));
    }

    #[test]
    fn delimited_rows_are_numbered_from_zero_and_may_be_ragged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.csv");
        fs::write(&path, "Title,UID\nAlpha,1\nBeta\n").unwrap();

        let reader = SheetReader::open(&path, None, UTF_8).unwrap();
        let rows: Vec<SheetRow> = reader.rows().unwrap().collect::<ImportResult<_>>().unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0], (0, vec![Cell::from("Title"), Cell::from("UID")]));
        assert_eq!(rows[2], (2, vec![Cell::from("Beta")]));
        let (header, count) = reader.scan(0).unwrap();
        assert_eq!(count, 3);
        assert_eq!(header, Some(vec![Cell::from("Title"), Cell::from("UID")]));
        assert_eq!(
            reader.row_at(1).unwrap(),
            Some(vec![Cell::from("Alpha"), Cell::from("1")])
        );
    }

    #[test]
    fn blank_lines_keep_their_row_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.csv");
        fs::write(
            &path,
            "Export\n\nUID,Notes\n1,\"two\nlines\"\n\n2,plain\n",
        )
        .unwrap();

        let reader = SheetReader::open(&path, None, UTF_8).unwrap();
        let rows: Vec<SheetRow> = reader.rows().unwrap().collect::<ImportResult<_>>().unwrap();
        assert_eq!(
            rows,
            vec![
                (0, vec![Cell::from("Export")]),
                (1, Vec::new()),
                (2, vec![Cell::from("UID"), Cell::from("Notes")]),
                (3, vec![Cell::from("1"), Cell::from("two\nlines")]),
                (4, Vec::new()),
                (5, vec![Cell::from("2"), Cell::from("plain")]),
            ]
        );
        assert_eq!(
            reader.scan(2).unwrap(),
            (Some(vec![Cell::from("UID"), Cell::from("Notes")]), 6)
        );
    }

    #[test]
    fn decodes_configured_encoding() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latin.csv");
        let (bytes, _, _) = encoding_rs::WINDOWS_1252.encode("Caf\u{e9}\n");
        fs::write(&path, bytes).unwrap();

        let encoding = resolve_encoding(Some("windows-1252")).unwrap();
        let reader = SheetReader::open(&path, None, encoding).unwrap();
        assert_eq!(
            reader.row_at(0).unwrap(),
            Some(vec![Cell::from("Caf\u{e9}")])
        );
    }
}
