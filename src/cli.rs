use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_STATE_DIR: &str = ".sheet-importer";

#[derive(Debug, Parser)]
#[command(author, version, about = "Import spreadsheet rows as records", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Import a spreadsheet through a column mapping
    Import(ImportArgs),
    /// Show the progress log of the latest import
    Progress(ProgressArgs),
    /// List previous uploads and their outcomes
    History(HistoryArgs),
    /// List the position, letter code and slug of each header column
    Columns(ColumnsArgs),
}

/// Identifies one importer: its record kind, mapping slug and state.
#[derive(Debug, Clone, Args)]
pub struct TargetArgs {
    /// Record kind the importer is bound to (omit for a generic importer)
    #[arg(long)]
    pub kind: Option<String>,
    /// Name distinguishing importers of the same kind
    #[arg(long, default_value = "default")]
    pub slug: String,
    /// Acting user id; progress logs are kept per principal
    #[arg(long, default_value = "0")]
    pub principal: String,
    /// Directory holding records, identities, progress and saved uploads
    #[arg(long = "state-dir", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,
}

#[derive(Debug, Args)]
pub struct ImportArgs {
    /// Spreadsheet to import (.xls, .xlsx, .xlsm, .ods, .csv, .tsv)
    #[arg(short, long)]
    pub input: PathBuf,
    /// YAML mapping of field names to column references
    #[arg(short, long)]
    pub mapping: PathBuf,
    #[command(flatten)]
    pub target: TargetArgs,
    /// 1-based header row (overrides the mapping's settings)
    #[arg(long = "header-row")]
    pub header_row: Option<usize>,
    /// Publish every imported record regardless of its status column
    #[arg(long = "force-publish")]
    pub force_publish: bool,
    /// Add classification terms instead of replacing existing ones
    #[arg(long = "append-terms")]
    pub append_terms: bool,
    /// Route `field_` metadata keys through the structured-field API
    #[arg(long = "structured-fields")]
    pub structured_fields: bool,
    /// Register a custom classification name (repeatable)
    #[arg(long = "classification", action = clap::ArgAction::Append)]
    pub classifications: Vec<String>,
    /// Cell filter `ADDR=EXPR`; ADDR is a position, letter code or header text
    #[arg(long = "cell-filter", action = clap::ArgAction::Append)]
    pub cell_filters: Vec<String>,
    /// Boolean expression over `c1..cN`; rows evaluating to false abort the import
    #[arg(long = "row-guard")]
    pub row_guard: Option<String>,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of delimited input (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

#[derive(Debug, Args)]
pub struct ProgressArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    /// Print the raw JSON log instead of a summary
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[command(flatten)]
    pub target: TargetArgs,
    /// Also list per-record outcomes of each upload
    #[arg(long)]
    pub detailed: bool,
}

#[derive(Debug, Args)]
pub struct ColumnsArgs {
    /// Spreadsheet to inspect
    #[arg(short, long)]
    pub input: PathBuf,
    /// 1-based header row
    #[arg(long = "header-row", default_value_t = 1)]
    pub header_row: usize,
    /// CSV delimiter character (supports ',', 'tab', ';', '|')
    #[arg(long, value_parser = parse_delimiter)]
    pub delimiter: Option<u8>,
    /// Character encoding of delimited input (defaults to utf-8)
    #[arg(long = "input-encoding")]
    pub input_encoding: Option<String>,
}

pub fn parse_delimiter(value: &str) -> Result<u8, String> {
    match value {
        "tab" | "\t" => Ok(b'\t'),
        "comma" | "," => Ok(b','),
        "|" | "pipe" => Ok(b'|'),
        ";" | "semicolon" => Ok(b';'),
        other => {
            let mut chars = other.chars();
            let first = chars
                .next()
                .ok_or_else(|| "Delimiter cannot be empty".to_string())?;
            if chars.next().is_some() {
                return Err("Delimiter must be a single character".to_string());
            }
            if !first.is_ascii() {
                return Err("Delimiter must be ASCII".to_string());
            }
            Ok(first as u8)
        }
    }
}

/// Splits `ADDR=EXPR` at the first `=` that is not part of `==`.
pub fn split_cell_filter(raw: &str) -> Result<(&str, &str), String> {
    let bytes = raw.as_bytes();
    let position = (0..bytes.len())
        .find(|&idx| {
            bytes[idx] == b'='
                && bytes.get(idx + 1) != Some(&b'=')
                && (idx == 0 || !matches!(bytes[idx - 1], b'=' | b'!' | b'<' | b'>'))
        })
        .ok_or_else(|| format!("Cell filter '{raw}' must look like ADDR=EXPR"))?;
    let (address, expression) = (raw[..position].trim(), raw[position + 1..].trim());
    if address.is_empty() || expression.is_empty() {
        return Err(format!("Cell filter '{raw}' must look like ADDR=EXPR"));
    }
    Ok((address, expression))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_filter_splits_at_assignment() {
        assert_eq!(
            split_cell_filter("Title=str::to_uppercase(value)").unwrap(),
            ("Title", "str::to_uppercase(value)")
        );
        assert_eq!(
            split_cell_filter("2 = if(value == \"x\", \"y\", value)").unwrap(),
            ("2", "if(value == \"x\", \"y\", value)")
        );
        assert!(split_cell_filter("no-assignment").is_err());
        assert!(split_cell_filter("=value").is_err());
    }

    #[test]
    fn delimiter_aliases() {
        assert_eq!(parse_delimiter("tab").unwrap(), b'\t');
        assert_eq!(parse_delimiter(";").unwrap(), b';');
        assert!(parse_delimiter("ab").is_err());
    }
}
