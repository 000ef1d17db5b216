//! In-memory workbook buffer.
//!
//! Templates are read with calamine into a plain cell grid and edited there.
//! Saving patches the template's own xlsx package, so only cells that were
//! set or cleared are rewritten; styling, column widths, merged ranges and
//! cached formula results everywhere else are kept as they were.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;

use calamine::{Data, DataType, Reader, Xlsx};

use crate::error::{PosmapError, Result};
use crate::package::{Package, SheetEdit};

/// Excel date cells come back from calamine as serial numbers.
const DATE_FORMAT: &str = "yyyy-mm-dd";

#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Number(f64),
    Bool(bool),
    /// Formula text without the leading `=`.
    Formula(String),
}

impl CellValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Display form used for header inventories.
    pub fn display(&self) -> String {
        match self {
            CellValue::Text(s) => s.clone(),
            CellValue::Number(n) => n.to_string(),
            CellValue::Bool(b) => b.to_string().to_uppercase(),
            CellValue::Formula(f) => format!("={f}"),
        }
    }
}

impl From<&str> for CellValue {
    fn from(s: &str) -> Self {
        CellValue::Text(s.to_string())
    }
}

impl From<String> for CellValue {
    fn from(s: String) -> Self {
        CellValue::Text(s)
    }
}

impl From<f64> for CellValue {
    fn from(n: f64) -> Self {
        CellValue::Number(n)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub value: CellValue,
    pub num_format: Option<String>,
}

/// One worksheet. Rows and columns are 1-based, as users see them.
#[derive(Debug, Clone, PartialEq)]
pub struct Sheet {
    name: String,
    cells: BTreeMap<(u32, u16), Cell>,
    /// Cells set or cleared since load.
    touched: BTreeSet<(u32, u16)>,
    /// Contents were wiped; the saved sheet holds only `cells`.
    rebuilt: bool,
    freeze_panes: Option<(u32, u16)>,
}

impl Sheet {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cells: BTreeMap::new(),
            touched: BTreeSet::new(),
            rebuilt: false,
            freeze_panes: None,
        }
    }

    /// Record a cell read from the template without marking it for writing.
    fn load(&mut self, row: u32, col: u16, value: impl Into<CellValue>, num_format: Option<&str>) {
        let cell = Cell {
            value: value.into(),
            num_format: num_format.map(String::from),
        };
        self.cells.insert((row, col), cell);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, row: u32, col: u16) -> Option<&CellValue> {
        self.cells.get(&(row, col)).map(|c| &c.value)
    }

    pub fn cell(&self, row: u32, col: u16) -> Option<&Cell> {
        self.cells.get(&(row, col))
    }

    pub fn set(&mut self, row: u32, col: u16, value: impl Into<CellValue>) {
        self.touched.insert((row, col));
        self.cells.insert(
            (row, col),
            Cell {
                value: value.into(),
                num_format: None,
            },
        );
    }

    pub fn set_with_format(&mut self, row: u32, col: u16, value: impl Into<CellValue>, format: &str) {
        self.touched.insert((row, col));
        self.cells.insert(
            (row, col),
            Cell {
                value: value.into(),
                num_format: Some(format.to_string()),
            },
        );
    }

    pub fn clear(&mut self, row: u32, col: u16) {
        self.cells.remove(&(row, col));
        self.touched.insert((row, col));
    }

    pub fn clear_all(&mut self) {
        self.cells.clear();
        self.touched.clear();
        self.rebuilt = true;
        self.freeze_panes = None;
    }

    /// Last row holding any value, 0 for an empty sheet.
    pub fn max_row(&self) -> u32 {
        self.cells.keys().map(|(r, _)| *r).max().unwrap_or(0)
    }

    /// Cells of `row`, ordered by column.
    pub fn row(&self, row: u32) -> impl Iterator<Item = (u16, &CellValue)> + '_ {
        self.cells
            .range((row, 0)..=(row, u16::MAX))
            .map(|((_, c), cell)| (*c, &cell.value))
    }

    /// Append below the last used row; `None` leaves a gap in that column.
    pub fn append_row(&mut self, values: Vec<Option<CellValue>>) {
        let row = self.max_row() + 1;
        for (i, value) in values.into_iter().enumerate() {
            if let Some(value) = value {
                self.set(row, i as u16 + 1, value);
            }
        }
        if self.row_is_empty(row) {
            // Keep blank spacer rows by anchoring an empty string.
            self.set(row, 1, "");
        }
    }

    fn row_is_empty(&self, row: u32) -> bool {
        self.row(row).next().is_none()
    }

    pub fn set_freeze_panes(&mut self, row: u32, col: u16) {
        self.freeze_panes = Some((row, col));
    }

    #[cfg(test)]
    pub fn freeze_panes(&self) -> Option<(u32, u16)> {
        self.freeze_panes
    }

    fn edit(&self) -> SheetEdit<'_> {
        let cells = if self.rebuilt {
            self.cells.iter().map(|(&key, cell)| (key, Some(cell))).collect()
        } else {
            self.touched.iter().map(|key| (*key, self.cells.get(key))).collect()
        };
        SheetEdit {
            name: &self.name,
            cells,
            rebuild: self.rebuilt,
            freeze_panes: self.freeze_panes,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Workbook {
    sheets: Vec<Sheet>,
    /// Package the workbook was read from; saves are patched into it.
    package: Option<Package>,
}

impl Workbook {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_xlsx_bytes(bytes: &[u8]) -> Result<Self> {
        let mut xlsx: Xlsx<_> = Xlsx::new(Cursor::new(bytes.to_vec()))?;
        let mut sheets = Vec::new();
        for name in xlsx.sheet_names() {
            let mut sheet = Sheet::new(name.clone());
            let range = xlsx.worksheet_range(&name)?;
            let (r0, c0) = range.start().unwrap_or((0, 0));
            for (r, c, data) in range.used_cells() {
                let row = r0 + r as u32 + 1;
                let col = (c0 as usize + c + 1) as u16;
                match data {
                    Data::String(s) => sheet.load(row, col, s.as_str(), None),
                    Data::Float(f) => sheet.load(row, col, *f, None),
                    Data::Int(i) => sheet.load(row, col, *i as f64, None),
                    Data::Bool(b) => sheet.load(row, col, CellValue::Bool(*b), None),
                    Data::DateTime(_) => {
                        if let Some(serial) = data.as_f64() {
                            sheet.load(row, col, serial, Some(DATE_FORMAT));
                        }
                    }
                    Data::DateTimeIso(s) | Data::DurationIso(s) => sheet.load(row, col, s.as_str(), None),
                    Data::Error(e) => sheet.load(row, col, e.to_string(), None),
                    Data::Empty => {}
                }
            }
            // Formulas stand in for their cached values in the grid.
            if let Ok(formulas) = xlsx.worksheet_formula(&name) {
                let (r0, c0) = formulas.start().unwrap_or((0, 0));
                for (r, c, f) in formulas.used_cells() {
                    if f.is_empty() {
                        continue;
                    }
                    let row = r0 + r as u32 + 1;
                    let col = (c0 as usize + c + 1) as u16;
                    let format = sheet.cell(row, col).and_then(|c| c.num_format.clone());
                    let value = CellValue::Formula(f.trim_start_matches('=').to_string());
                    sheet.load(row, col, value, format.as_deref());
                }
            }
            sheets.push(sheet);
        }
        Ok(Self {
            sheets,
            package: Some(Package::open(bytes)?),
        })
    }

    pub fn to_xlsx_bytes(&self) -> Result<Vec<u8>> {
        let edits: Vec<SheetEdit<'_>> = self.sheets.iter().map(Sheet::edit).collect();
        match &self.package {
            Some(package) => package.save(&edits),
            None => Package::open(&self.blank_package()?)?.save(&edits),
        }
    }

    /// A fresh package with one empty worksheet per sheet, for workbooks not
    /// read from a file.
    fn blank_package(&self) -> Result<Vec<u8>> {
        let mut book = rust_xlsxwriter::Workbook::new();
        for sheet in &self.sheets {
            book.add_worksheet().set_name(sheet.name.as_str())?;
        }
        Ok(book.save_to_buffer()?)
    }

    pub fn sheets(&self) -> &[Sheet] {
        &self.sheets
    }

    pub fn sheets_mut(&mut self) -> &mut [Sheet] {
        &mut self.sheets
    }

    #[cfg(test)]
    pub fn sheet_names(&self) -> Vec<&str> {
        self.sheets.iter().map(|s| s.name.as_str()).collect()
    }

    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        self.sheets.iter().find(|s| s.name == name)
    }

    pub fn sheet_mut(&mut self, name: &str) -> Option<&mut Sheet> {
        self.sheets.iter_mut().find(|s| s.name == name)
    }

    /// Insert a new sheet at `index` (clamped), or error if the name is taken.
    pub fn insert_sheet(&mut self, index: usize, name: &str) -> Result<&mut Sheet> {
        if self.sheet(name).is_some() {
            return Err(PosmapError::Other(format!("Sheet already exists: {name}")));
        }
        let index = index.min(self.sheets.len());
        self.sheets.insert(index, Sheet::new(name));
        Ok(&mut self.sheets[index])
    }

    #[cfg(test)]
    pub fn push_sheet(&mut self, sheet: Sheet) {
        self.sheets.push(sheet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Workbook {
        let mut wb = Workbook::new();
        let mut sheet = Sheet::new("AAPL (Apple)");
        sheet.set(1, 1, "Row");
        sheet.set(1, 2, "BrokerageLink");
        sheet.set(1, 3, "Joint WROS");
        sheet.set(5, 1, 12.5);
        sheet.set(6, 1, CellValue::Formula("SUM(B24:C24)".to_string()));
        sheet.set_with_format(24, 2, 3.0, "0");
        wb.push_sheet(sheet);
        wb.push_sheet(Sheet::new("Notes"));
        wb
    }

    #[test]
    fn test_xlsx_roundtrip_keeps_values_and_formulas() {
        let wb = sample();
        let back = Workbook::from_xlsx_bytes(&wb.to_xlsx_bytes().unwrap()).unwrap();
        assert_eq!(back.sheet_names(), vec!["AAPL (Apple)", "Notes"]);
        let sheet = back.sheet("AAPL (Apple)").unwrap();
        assert_eq!(sheet.get(1, 2), Some(&CellValue::Text("BrokerageLink".to_string())));
        assert_eq!(sheet.get(5, 1), Some(&CellValue::Number(12.5)));
        assert_eq!(sheet.get(24, 2), Some(&CellValue::Number(3.0)));
        assert_eq!(
            sheet.get(6, 1),
            Some(&CellValue::Formula("SUM(B24:C24)".to_string()))
        );
    }

    #[test]
    fn test_row_iterates_in_column_order() {
        let wb = sample();
        let sheet = wb.sheet("AAPL (Apple)").unwrap();
        let cols: Vec<u16> = sheet.row(1).map(|(c, _)| c).collect();
        assert_eq!(cols, vec![1, 2, 3]);
        assert_eq!(sheet.max_row(), 24);
    }

    #[test]
    fn test_insert_sheet_at_front() {
        let mut wb = sample();
        wb.insert_sheet(0, "RunReport").unwrap();
        assert_eq!(wb.sheet_names()[0], "RunReport");
        assert!(wb.insert_sheet(0, "RunReport").is_err());
    }

    #[test]
    fn test_append_row_keeps_spacers() {
        let mut sheet = Sheet::new("R");
        sheet.append_row(vec![Some("a".into())]);
        sheet.append_row(vec![]);
        sheet.append_row(vec![None, Some(2.0.into())]);
        assert_eq!(sheet.max_row(), 3);
        assert_eq!(sheet.get(3, 2), Some(&CellValue::Number(2.0)));
        assert_eq!(sheet.get(3, 1), None);
    }
}
