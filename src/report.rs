//! Run report: one structured record per pipeline run, rendered both as JSON
//! and as a `RunReport` sheet at the front of the output workbook.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::aggregator::Aggregation;
use crate::error::{PosmapError, Result};
use crate::models::PositionRow;
use crate::workbook::{CellValue, Workbook};
use crate::writer::{CellWrite, HeaderInventory, WriteOutcome, REPORT_SHEET};

const TABLE_HEADER: [&str; 4] = ["Symbol", "Account Header", "Qty Written", "Cost Written"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub csv_rows_parsed: usize,
    pub symbols_updated_count: usize,
    pub per_ticker_writes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub timestamp: String,
    pub summary: Summary,
    pub csv_accounts_seen: Vec<String>,
    pub symbols_updated: Vec<String>,
    pub headers_by_sheet: BTreeMap<String, HeaderInventory>,
    pub missing_accounts: BTreeMap<String, Vec<String>>,
    pub writes_detail: BTreeMap<String, BTreeMap<String, CellWrite>>,
    pub unmapped_accounts: BTreeMap<String, usize>,
    pub source_sha256: String,
}

/// Object keys shown at the top of the report sheet.
#[derive(Debug, Clone, Copy)]
pub struct ReportKeys<'a> {
    pub source: &'a str,
    pub template: &'a str,
    pub output: &'a str,
}

pub fn report_timestamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn build_report(
    rows: &[PositionRow],
    agg: &Aggregation,
    written: &WriteOutcome,
    source_sha256: &str,
    now: DateTime<Utc>,
) -> RunReport {
    let csv_accounts_seen: BTreeSet<&str> = rows.iter().map(|r| r.account_label.as_str()).collect();
    let symbols_updated = written.symbols_updated();
    RunReport {
        timestamp: report_timestamp(now),
        summary: Summary {
            csv_rows_parsed: rows.len(),
            symbols_updated_count: symbols_updated.len(),
            per_ticker_writes: written.per_ticker_writes(),
        },
        csv_accounts_seen: csv_accounts_seen.into_iter().map(String::from).collect(),
        symbols_updated,
        headers_by_sheet: written.headers_by_sheet.clone(),
        missing_accounts: written.missing_accounts.clone(),
        writes_detail: written.writes_detail.clone(),
        unmapped_accounts: agg.unmapped.clone(),
        source_sha256: source_sha256.to_string(),
    }
}

impl RunReport {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}

fn text(s: impl Into<String>) -> Option<CellValue> {
    Some(CellValue::Text(s.into()))
}

fn number(n: f64) -> Option<CellValue> {
    Some(CellValue::Number(n))
}

fn decimal(d: rust_decimal::Decimal) -> Option<CellValue> {
    use rust_decimal::prelude::ToPrimitive;
    d.to_f64().map(CellValue::Number)
}

/// Replace the `RunReport` sheet with a fresh projection of `report`.
///
/// An existing sheet keeps its position and is emptied first; otherwise the
/// sheet is inserted at the front.
pub fn render_report_sheet(workbook: &mut Workbook, report: &RunReport, keys: ReportKeys<'_>) -> Result<()> {
    if workbook.sheet(REPORT_SHEET).is_none() {
        workbook.insert_sheet(0, REPORT_SHEET)?;
    }
    let sheet = workbook
        .sheet_mut(REPORT_SHEET)
        .ok_or_else(|| PosmapError::Other(format!("{REPORT_SHEET} sheet missing")))?;
    sheet.clear_all();

    let summary = vec![
        vec![text("RunReport generated (UTC)"), text(&report.timestamp)],
        vec![text("Source CSV"), text(keys.source)],
        vec![text("Template XLSX"), text(keys.template)],
        vec![text("Output Excel"), text(keys.output)],
        vec![text("Source SHA-256"), text(&report.source_sha256)],
        vec![text("CSV Rows Parsed"), number(report.summary.csv_rows_parsed as f64)],
        vec![text("Symbols Updated"), number(report.summary.symbols_updated_count as f64)],
        vec![text("Per-ticker Writes"), number(report.summary.per_ticker_writes as f64)],
        vec![],
    ];
    for row in summary {
        sheet.append_row(row);
    }
    // Everything above the write table stays visible while scrolling.
    sheet.set_freeze_panes(sheet.max_row() + 1, 1);

    sheet.append_row(TABLE_HEADER.iter().map(|h| text(*h)).collect());
    for symbol in &report.symbols_updated {
        for (header, write) in report.writes_detail.get(symbol).into_iter().flatten() {
            sheet.append_row(vec![
                text(symbol),
                text(header),
                decimal(write.qty_written),
                write.cost_written.and_then(decimal),
            ]);
        }
    }

    sheet.append_row(vec![]);
    sheet.append_row(vec![text("Sheet"), text("Headers (raw row 1) / normalized")]);
    for (name, inventory) in &report.headers_by_sheet {
        sheet.append_row(vec![text(name), text(inventory.raw.join(", "))]);
        sheet.append_row(vec![text(""), text(inventory.normalized.join(", "))]);
    }

    sheet.append_row(vec![]);
    sheet.append_row(vec![text("Sheet"), text("Missing account headers (not found in row 1)")]);
    for (name, missing) in &report.missing_accounts {
        sheet.append_row(vec![text(name), text(missing.join(", "))]);
    }

    sheet.append_row(vec![]);
    sheet.append_row(vec![text("Unmapped source account"), text("Rows")]);
    for (label, count) in &report.unmapped_accounts {
        sheet.append_row(vec![text(label), number(*count as f64)]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::models::AggregateCell;
    use crate::workbook::Sheet;

    fn fixture() -> (Vec<PositionRow>, Aggregation, WriteOutcome) {
        let rows = vec![
            PositionRow {
                account_label: "Fidelity 401K".to_string(),
                symbol: "AAPL".to_string(),
                quantity: dec!(10),
                cost: Some(dec!(1234.56)),
            },
            PositionRow {
                account_label: "Old IRA".to_string(),
                symbol: "AAPL".to_string(),
                quantity: dec!(1),
                cost: None,
            },
            PositionRow {
                account_label: "Fidelity 401K".to_string(),
                symbol: "MSFT".to_string(),
                quantity: dec!(2),
                cost: None,
            },
        ];
        let mut agg = Aggregation::default();
        agg.cells.entry("AAPL".to_string()).or_default().insert(
            "BrokerageLink".to_string(),
            AggregateCell {
                qty: dec!(10),
                cost: Some(dec!(1234.56)),
                rows: 1,
            },
        );
        agg.unmapped.insert("Old IRA".to_string(), 1);

        let mut written = WriteOutcome {
            updated: 1,
            ..WriteOutcome::default()
        };
        written.writes_detail.entry("AAPL".to_string()).or_default().insert(
            "BrokerageLink".to_string(),
            CellWrite {
                qty_written: dec!(10),
                cost_written: Some(dec!(1234.56)),
            },
        );
        written.headers_by_sheet.insert(
            "AAPL".to_string(),
            HeaderInventory {
                raw: vec!["Apple".to_string(), "BrokerageLink".to_string()],
                normalized: vec!["brokeragelink".to_string()],
            },
        );
        written
            .missing_accounts
            .insert("MSFT".to_string(), vec!["Joint WROS".to_string()]);
        (rows, agg, written)
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 5, 9).unwrap()
    }

    fn keys() -> ReportKeys<'static> {
        ReportKeys {
            source: "source/positions-2024-03-01.csv",
            template: "source/portfolio-template.xlsx",
            output: "output/portfolio-updated-20240301-140509.xlsx",
        }
    }

    #[test]
    fn test_build_report_counts() {
        let (rows, agg, written) = fixture();
        let report = build_report(&rows, &agg, &written, "abc123", now());
        assert_eq!(report.timestamp, "2024-03-01 14:05:09 UTC");
        assert_eq!(report.summary.csv_rows_parsed, 3);
        assert_eq!(report.summary.symbols_updated_count, 1);
        assert_eq!(report.summary.per_ticker_writes, 1);
        assert_eq!(report.csv_accounts_seen, vec!["Fidelity 401K", "Old IRA"]);
        assert_eq!(report.symbols_updated, vec!["AAPL"]);
        assert_eq!(report.unmapped_accounts["Old IRA"], 1);
    }

    #[test]
    fn test_report_json_shape() {
        let (rows, agg, written) = fixture();
        let report = build_report(&rows, &agg, &written, "abc123", now());
        let json: serde_json::Value = serde_json::from_slice(&report.to_json_bytes().unwrap()).unwrap();
        assert_eq!(json["summary"]["csv_rows_parsed"], 3);
        assert_eq!(json["writes_detail"]["AAPL"]["BrokerageLink"]["qty_written"], 10.0);
        assert_eq!(json["writes_detail"]["AAPL"]["BrokerageLink"]["cost_written"], 1234.56);
        assert_eq!(json["missing_accounts"]["MSFT"][0], "Joint WROS");
        assert_eq!(json["headers_by_sheet"]["AAPL"]["normalized"][0], "brokeragelink");
        assert_eq!(json["source_sha256"], "abc123");
    }

    #[test]
    fn test_render_inserts_sheet_first() {
        let (rows, agg, written) = fixture();
        let report = build_report(&rows, &agg, &written, "abc123", now());
        let mut wb = Workbook::new();
        wb.push_sheet(Sheet::new("AAPL"));
        render_report_sheet(&mut wb, &report, keys()).unwrap();

        assert_eq!(wb.sheet_names(), vec![REPORT_SHEET, "AAPL"]);
        let sheet = wb.sheet(REPORT_SHEET).unwrap();
        assert_eq!(sheet.get(1, 2), Some(&CellValue::from("2024-03-01 14:05:09 UTC")));
        assert_eq!(sheet.get(5, 2), Some(&CellValue::from("abc123")));
        assert_eq!(sheet.get(6, 2), Some(&CellValue::Number(3.0)));
        assert_eq!(sheet.get(10, 1), Some(&CellValue::from("Symbol")));
        assert_eq!(sheet.get(11, 2), Some(&CellValue::from("BrokerageLink")));
        assert_eq!(sheet.get(11, 4), Some(&CellValue::Number(1234.56)));
        assert_eq!(sheet.freeze_panes(), Some((10, 1)));
    }

    #[test]
    fn test_render_replaces_previous_contents() {
        let (rows, agg, written) = fixture();
        let report = build_report(&rows, &agg, &written, "abc123", now());
        let mut wb = Workbook::new();
        wb.push_sheet(Sheet::new("AAPL"));
        let mut stale = Sheet::new(REPORT_SHEET);
        stale.set(500, 9, "left over from last month");
        wb.push_sheet(stale);

        render_report_sheet(&mut wb, &report, keys()).unwrap();
        let once = wb.clone();
        render_report_sheet(&mut wb, &report, keys()).unwrap();

        assert_eq!(wb, once);
        assert_eq!(wb.sheet_names(), vec!["AAPL", REPORT_SHEET]);
        let sheet = wb.sheet(REPORT_SHEET).unwrap();
        assert_eq!(sheet.get(500, 9), None);
        let last = sheet.max_row();
        assert_eq!(sheet.get(last, 1), Some(&CellValue::from("Old IRA")));
        assert_eq!(sheet.get(last, 2), Some(&CellValue::Number(1.0)));
    }
}
