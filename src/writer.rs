use std::collections::{BTreeMap, HashMap};

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::aggregator::Aggregation;
use crate::fmt::{quantity_format, COST_FORMAT};
use crate::labels::{normalize, symbol_from_sheet_name};
use crate::workbook::{Sheet, Workbook};

pub const REPORT_SHEET: &str = "RunReport";
const HEADER_ROW: u32 = 1;
const FIRST_ACCOUNT_COL: u16 = 2;

/// Fixed rows that receive the totals on every instrument sheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowLayout {
    pub qty: u32,
    pub cost: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HeaderInventory {
    pub raw: Vec<String>,
    pub normalized: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CellWrite {
    pub qty_written: Decimal,
    pub cost_written: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WriteOutcome {
    /// Number of (sheet, header) columns written.
    pub updated: usize,
    /// Keyed by sheet name.
    pub headers_by_sheet: BTreeMap<String, HeaderInventory>,
    /// Keyed by sheet name: resolved headers with no column in row 1.
    pub missing_accounts: BTreeMap<String, Vec<String>>,
    /// Keyed by symbol, then header.
    pub writes_detail: BTreeMap<String, BTreeMap<String, CellWrite>>,
}

impl WriteOutcome {
    pub fn symbols_updated(&self) -> Vec<String> {
        self.writes_detail.keys().cloned().collect()
    }

    /// Distinct (symbol, header) pairs written. Sheets sharing a symbol
    /// count once.
    pub fn per_ticker_writes(&self) -> usize {
        self.writes_detail.values().map(BTreeMap::len).sum()
    }
}

/// Row-1 headers from column B onward, normalized key -> column.
/// A repeated header resolves to its rightmost column.
fn header_columns(sheet: &Sheet) -> (HashMap<String, u16>, HeaderInventory) {
    let mut columns = HashMap::new();
    let mut inventory = HeaderInventory::default();
    for (col, value) in sheet.row(HEADER_ROW) {
        let text = value.display();
        inventory.raw.push(text.clone());
        if col < FIRST_ACCOUNT_COL {
            continue;
        }
        let key = normalize(&text);
        if key.is_empty() {
            continue;
        }
        if !inventory.normalized.contains(&key) {
            inventory.normalized.push(key.clone());
        }
        columns.insert(key, col);
    }
    (columns, inventory)
}

/// Write every aggregate into its instrument sheet.
///
/// Only the quantity and cost rows of matched header columns change. A header
/// with no matching column is recorded as missing; columns are never added.
pub fn write(workbook: &mut Workbook, agg: &Aggregation, rows: RowLayout) -> WriteOutcome {
    let mut out = WriteOutcome::default();

    for sheet in workbook.sheets_mut() {
        if sheet.name() == REPORT_SHEET {
            continue;
        }
        let symbol = symbol_from_sheet_name(sheet.name());
        let Some(per_header) = agg.cells.get(&symbol) else {
            continue;
        };

        let (columns, inventory) = header_columns(sheet);
        let sheet_name = sheet.name().to_string();
        out.headers_by_sheet.insert(sheet_name.clone(), inventory);

        for (header, cell) in per_header {
            let Some(&col) = columns.get(&normalize(header)) else {
                warn!(sheet = %sheet_name, header = %header, "no column for account header");
                out.missing_accounts
                    .entry(sheet_name.clone())
                    .or_default()
                    .push(header.clone());
                continue;
            };

            let qty = cell.qty.normalize();
            sheet.set_with_format(rows.qty, col, qty.to_f64().unwrap_or_default(), quantity_format(qty));
            match cell.cost.and_then(|c| c.to_f64()) {
                Some(cost) => sheet.set_with_format(rows.cost, col, cost, COST_FORMAT),
                None => sheet.clear(rows.cost, col),
            }
            out.updated += 1;
            out.writes_detail.entry(symbol.clone()).or_default().insert(
                header.clone(),
                CellWrite {
                    qty_written: qty,
                    cost_written: cell.cost,
                },
            );
        }
    }

    debug!(
        updated = out.updated,
        sheets = out.headers_by_sheet.len(),
        "workbook written"
    );
    out
}
