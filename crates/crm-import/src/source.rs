//! Workbook backends feeding the importer.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Range, Reader, Sheets};
use crm_core::{dates::parse_date_text, Cell};

use crate::sheet::SheetGrid;
use crate::ImportError;

/// Anything that can list sheets and hand back one sheet as a cell grid.
pub trait WorkbookSource {
    fn sheet_names(&self) -> Vec<String>;

    fn read_sheet(&mut self, name: &str) -> Result<SheetGrid, ImportError>;
}

/// `.xlsx`, `.xlsm`, `.xls` or `.ods` file read through calamine.
pub struct CalamineWorkbook {
    path: PathBuf,
    sheets: Sheets<BufReader<File>>,
}

impl CalamineWorkbook {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ImportError> {
        let path = path.as_ref();
        let sheets = open_workbook_auto(path).map_err(|source| ImportError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            sheets,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WorkbookSource for CalamineWorkbook {
    fn sheet_names(&self) -> Vec<String> {
        self.sheets.sheet_names().to_owned()
    }

    fn read_sheet(&mut self, name: &str) -> Result<SheetGrid, ImportError> {
        let range = self
            .sheets
            .worksheet_range(name)
            .map_err(|err| ImportError::Sheet {
                sheet: name.to_string(),
                reason: err.to_string(),
            })?;
        Ok(grid_from_range(&range))
    }
}

/// calamine ranges start at the first used cell; the grid is re-anchored at A1
/// so template positions stay absolute.
fn grid_from_range(range: &Range<Data>) -> SheetGrid {
    let (Some(start), Some(end)) = (range.start(), range.end()) else {
        return SheetGrid::default();
    };
    let height = end.0 as usize + 1;
    let width = end.1 as usize + 1;
    let mut rows = vec![vec![Cell::Empty; width]; height];
    for (row, col, value) in range.used_cells() {
        let abs_row = start.0 as usize + row;
        let abs_col = start.1 as usize + col;
        if let Some(slot) = rows.get_mut(abs_row).and_then(|r| r.get_mut(abs_col)) {
            *slot = convert_value(value);
        }
    }
    SheetGrid::from_rows(rows)
}

fn convert_value(value: &Data) -> Cell {
    match value {
        Data::Empty => Cell::Empty,
        Data::String(s) => Cell::from(s.as_str()),
        Data::Int(v) => Cell::Number(*v as f64),
        Data::Float(v) => Cell::Number(*v),
        Data::Bool(v) => Cell::Bool(*v),
        Data::DateTime(v) => v
            .as_datetime()
            .map(Cell::DateTime)
            .unwrap_or(Cell::Number(v.as_f64())),
        Data::DateTimeIso(v) => parse_date_text(v)
            .map(Cell::DateTime)
            .unwrap_or_else(|| Cell::Text(v.clone())),
        Data::DurationIso(v) => Cell::Text(v.clone()),
        Data::Error(e) => Cell::Error(e.to_string()),
    }
}

/// Sheets held in memory, in insertion order. Sheets registered as
/// unreadable fail on read the way a corrupt worksheet part would.
#[derive(Debug, Default)]
pub struct InMemoryWorkbook {
    sheets: Vec<(String, Result<SheetGrid, String>)>,
}

impl InMemoryWorkbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sheet(mut self, name: impl Into<String>, grid: SheetGrid) -> Self {
        self.sheets.push((name.into(), Ok(grid)));
        self
    }

    pub fn with_unreadable_sheet(mut self, name: impl Into<String>, reason: impl Into<String>) -> Self {
        self.sheets.push((name.into(), Err(reason.into())));
        self
    }
}

impl WorkbookSource for InMemoryWorkbook {
    fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|(name, _)| name.clone()).collect()
    }

    fn read_sheet(&mut self, name: &str) -> Result<SheetGrid, ImportError> {
        match self.sheets.iter().find(|(n, _)| n == name) {
            Some((_, Ok(grid))) => Ok(grid.clone()),
            Some((_, Err(reason))) => Err(ImportError::Sheet {
                sheet: name.to_string(),
                reason: reason.clone(),
            }),
            None => Err(ImportError::Sheet {
                sheet: name.to_string(),
                reason: "no such sheet".to_string(),
            }),
        }
    }
}
