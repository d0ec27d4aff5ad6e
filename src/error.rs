use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("The map is malformed. {0}")]
    MalformedMapping(String),

    #[error(
        "The map is malformed. Column reference '{reference}' does not match the spreadsheet header. The document was saved but not processed."
    )]
    UnresolvedColumnReference { reference: String },

    #[error("A row filter rejected row {row}.")]
    RowFilterRejected { row: usize },

    #[error("A cell filter blanked column {column} in row {row}.")]
    CellFilterRejected { row: usize, column: String },

    #[error("Filter expression '{expression}' failed: {message}")]
    FilterExpression { expression: String, message: String },

    #[error("{0}")]
    StoreOperationFailed(String),

    #[error(
        "The file type '{0}' is not supported. Accepted file types: .xls, .xlsx, .xlsm, .ods, .csv, .tsv"
    )]
    UnsupportedFileType(String),

    #[error("No file was received.")]
    NoFileReceived,

    #[error("Header row {0} was not found in the document.")]
    MissingHeaderRow(usize),

    #[error("Unable to read the spreadsheet: {0}")]
    SheetRead(String),

    #[error("Progress log storage failed: {0}")]
    ProgressStorage(String),

    #[error("Progress cannot move from {from} to {to}")]
    ProgressTransition { from: String, to: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<csv::Error> for ImportError {
    fn from(err: csv::Error) -> Self {
        ImportError::SheetRead(err.to_string())
    }
}

impl From<calamine::Error> for ImportError {
    fn from(err: calamine::Error) -> Self {
        ImportError::SheetRead(err.to_string())
    }
}

pub type ImportResult<T> = Result<T, ImportError>;
