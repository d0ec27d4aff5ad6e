//! Row and cell filter hooks.
//!
//! Before a data row is interpolated it passes through an optional row hook
//! and then, cell by cell, through the hooks registered for that cell's
//! 1-based position, header slug and letter code, in that order. Every
//! addressing scheme is consulted for every cell regardless of how the
//! mapping referred to the column.
//!
//! Hooks are either Rust closures or `evalexpr` expressions supplied on the
//! command line.

use std::{collections::HashMap, fmt};

use evalexpr::{ContextWithMutableVariables, HashMapContext, Value as EvalValue, eval_with_context};
use log::debug;

use crate::{
    cell::Cell,
    columns::{ColumnRefs, column_code, is_column_code, slugify},
    error::{ImportError, ImportResult},
};

type RowHook = Box<dyn Fn(Vec<Cell>) -> ImportResult<Option<Vec<Cell>>> + Send + Sync>;
type CellHook = Box<dyn Fn(Cell) -> ImportResult<Cell> + Send + Sync>;

/// How a cell hook addresses its column.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CellAddress {
    /// 1-based column position.
    Position(usize),
    Slug(String),
    Code(String),
}

impl CellAddress {
    /// Interprets digits as a position, one or two uppercase letters as a
    /// code, and anything else as header text.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if let Ok(position) = trimmed.parse::<usize>() {
            return CellAddress::Position(position);
        }
        if is_column_code(trimmed) {
            return CellAddress::Code(trimmed.to_string());
        }
        CellAddress::Slug(slugify(trimmed))
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellAddress::Position(position) => write!(f, "#{position}"),
            CellAddress::Slug(slug) => write!(f, "'{slug}'"),
            CellAddress::Code(code) => f.write_str(code),
        }
    }
}

#[derive(Default)]
pub struct FilterHooks {
    row: Option<RowHook>,
    cells: HashMap<CellAddress, Vec<CellHook>>,
}

impl fmt::Debug for FilterHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterHooks")
            .field("row", &self.row.is_some())
            .field("cells", &self.cells.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FilterHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the row hook, replacing any previous one. Returning `None` or
    /// an empty row rejects the row and aborts the import.
    pub fn on_row<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(Vec<Cell>) -> Option<Vec<Cell>> + Send + Sync + 'static,
    {
        self.row = Some(Box::new(move |row| Ok(hook(row))));
        self
    }

    /// Installs a boolean expression as the row hook. Cells are bound as
    /// `c1`, `c2`, ... by position; a `false` result rejects the row.
    pub fn on_row_guard(&mut self, expression: &str) -> &mut Self {
        let expression = expression.to_string();
        self.row = Some(Box::new(move |row| {
            let mut context: HashMapContext = HashMapContext::new();
            for (idx, cell) in row.iter().enumerate() {
                context
                    .set_value(format!("c{}", idx + 1), cell_to_evalexpr(cell))
                    .map_err(|err| expression_error(&expression, err))?;
            }
            match eval_with_context(&expression, &context)
                .map_err(|err| expression_error(&expression, err))?
            {
                EvalValue::Boolean(true) => Ok(Some(row)),
                EvalValue::Boolean(false) => Ok(None),
                other => Err(ImportError::FilterExpression {
                    expression: expression.clone(),
                    message: format!("expected a boolean, got {other}"),
                }),
            }
        }));
        self
    }

    pub fn on_cell<F>(&mut self, address: CellAddress, hook: F) -> &mut Self
    where
        F: Fn(Cell) -> Cell + Send + Sync + 'static,
    {
        self.cells
            .entry(address)
            .or_default()
            .push(Box::new(move |cell| Ok(hook(cell))));
        self
    }

    /// Registers an expression evaluated with the cell bound as `value`.
    pub fn on_cell_expression(&mut self, address: CellAddress, expression: &str) -> &mut Self {
        let expression = expression.to_string();
        self.cells
            .entry(address)
            .or_default()
            .push(Box::new(move |cell| {
                let mut context: HashMapContext = HashMapContext::new();
                context
                    .set_value("value".to_string(), cell_to_evalexpr(&cell))
                    .map_err(|err| expression_error(&expression, err))?;
                let result = eval_with_context(&expression, &context)
                    .map_err(|err| expression_error(&expression, err))?;
                Ok(match result {
                    EvalValue::String(text) => Cell::Text(text),
                    EvalValue::Int(value) => Cell::Integer(value),
                    EvalValue::Float(value) => Cell::Number(value),
                    EvalValue::Empty => Cell::Empty,
                    other => Cell::Text(other.to_string()),
                })
            }));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.row.is_none() && self.cells.is_empty()
    }

    /// Runs the row hook and then every cell hook over `row`.
    ///
    /// `row_number` is the 0-based spreadsheet row, used in error messages.
    pub fn apply(
        &self,
        row_number: usize,
        row: Vec<Cell>,
        refs: &ColumnRefs,
    ) -> ImportResult<Vec<Cell>> {
        let mut row = match &self.row {
            Some(hook) => hook(row)?
                .filter(|filtered| !filtered.is_empty())
                .ok_or(ImportError::RowFilterRejected { row: row_number })?,
            None => row,
        };
        if self.cells.is_empty() {
            return Ok(row);
        }

        for (index, cell) in row.iter_mut().enumerate() {
            let addresses = [
                Some(CellAddress::Position(index + 1)),
                refs.slug(index)
                    .map(|slug| CellAddress::Slug(slug.to_string())),
                Some(CellAddress::Code(column_code(index))),
            ];
            for address in addresses.into_iter().flatten() {
                let Some(hooks) = self.cells.get(&address) else {
                    continue;
                };
                for hook in hooks {
                    let was_blank = cell.is_blank();
                    *cell = hook(std::mem::take(cell))?;
                    if cell.is_blank() && !was_blank {
                        debug!("Cell hook for {address} blanked row {row_number}");
                        return Err(ImportError::CellFilterRejected {
                            row: row_number,
                            column: address.to_string(),
                        });
                    }
                }
            }
        }
        Ok(row)
    }
}

fn cell_to_evalexpr(cell: &Cell) -> EvalValue {
    match cell {
        Cell::Empty => EvalValue::String(String::new()),
        Cell::Integer(value) => EvalValue::Int(*value),
        Cell::Number(value) => EvalValue::Float(*value),
        Cell::Text(text) => EvalValue::String(text.clone()),
    }
}

fn expression_error(expression: &str, err: impl fmt::Display) -> ImportError {
    ImportError::FilterExpression {
        expression: expression.to_string(),
        message: err.to_string(),
    }
}
