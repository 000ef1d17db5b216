use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{PosmapError, Result};
use crate::models::{CostMode, PositionRow};
use crate::numeric::{to_decimal_money, to_decimal_quantity};

pub const COL_ACCOUNT: &str = "Account Name";
pub const COL_SYMBOL: &str = "Symbol";
pub const COL_QUANTITY: &str = "Quantity";
pub const COL_COST_TOTAL: &str = "Cost Basis Total";
pub const COL_COST_AVG: &str = "Average Cost Basis";

const EXPECTED_COLUMNS: &[&str] = &[
    COL_ACCOUNT,
    COL_SYMBOL,
    COL_QUANTITY,
    COL_COST_TOTAL,
    COL_COST_AVG,
];

/// Guard for the discovery pass against runaway exports.
pub const MAX_DISTINCT_ACCOUNTS: usize = 2000;

pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

fn strip_bom(data: &[u8]) -> &[u8] {
    data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data)
}

struct ColumnIndex {
    account: usize,
    symbol: usize,
    quantity: Option<usize>,
    cost_total: Option<usize>,
    cost_avg: Option<usize>,
}

fn reader(data: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(strip_bom(data))
}

fn index_columns(headers: &csv::StringRecord) -> Result<ColumnIndex> {
    let find = |name: &str| headers.iter().position(|h| h.trim() == name);

    let missing: Vec<&str> = EXPECTED_COLUMNS
        .iter()
        .copied()
        .filter(|c| find(c).is_none())
        .collect();
    if !missing.is_empty() {
        warn!(?missing, "positions export is missing expected columns, proceeding with what exists");
    }

    let account = find(COL_ACCOUNT)
        .ok_or_else(|| PosmapError::NoHeaders(format!("no '{COL_ACCOUNT}' column")))?;
    let symbol = find(COL_SYMBOL)
        .ok_or_else(|| PosmapError::NoHeaders(format!("no '{COL_SYMBOL}' column")))?;

    Ok(ColumnIndex {
        account,
        symbol,
        quantity: find(COL_QUANTITY),
        cost_total: find(COL_COST_TOTAL),
        cost_avg: find(COL_COST_AVG),
    })
}

/// Parse a brokerage positions export by header name.
///
/// Rows without an account label or symbol (disclaimers, totals, blank
/// trailers) are skipped. Numeric fields go through the normalizer, so a bad
/// cell degrades to zero quantity or a missing cost rather than failing.
pub fn read_positions_csv(data: &[u8], cost_mode: CostMode) -> Result<Vec<PositionRow>> {
    let mut rdr = reader(data);
    let cols = index_columns(rdr.headers()?)?;
    let cost_col = match cost_mode {
        CostMode::TotalBasis => cols.cost_total,
        CostMode::AvgPerShare => cols.cost_avg,
    };

    let mut rows = Vec::new();
    for result in rdr.records() {
        let Ok(record) = result else { continue };
        let field = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or("");

        let account_label = field(Some(cols.account)).trim().to_string();
        let symbol = field(Some(cols.symbol)).trim().to_uppercase();
        if account_label.is_empty() || symbol.is_empty() {
            continue;
        }

        rows.push(PositionRow {
            account_label,
            symbol,
            quantity: to_decimal_quantity(field(cols.quantity)),
            cost: to_decimal_money(field(cost_col)),
        });
    }
    info!(rows = rows.len(), cost_mode = cost_mode.key(), "positions parsed");
    Ok(rows)
}

/// Distinct non-empty account labels in first-seen order.
pub fn read_distinct_accounts(data: &[u8]) -> Result<Vec<String>> {
    let mut rdr = reader(data);
    let cols = index_columns(rdr.headers()?)?;
    let mut accounts: Vec<String> = Vec::new();
    for result in rdr.records() {
        let Ok(record) = result else { continue };
        let label = record.get(cols.account).unwrap_or("").trim();
        if label.is_empty() || accounts.iter().any(|a| a == label) {
            continue;
        }
        accounts.push(label.to_string());
        if accounts.len() >= MAX_DISTINCT_ACCOUNTS {
            warn!(limit = MAX_DISTINCT_ACCOUNTS, "account list truncated");
            break;
        }
    }
    Ok(accounts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const EXPORT: &str = "\u{feff}Account Number,Account Name,Symbol,Description,Quantity,Last Price,Current Value,Cost Basis Total,Average Cost Basis
Z123,Fidelity 401K,aapl,APPLE INC,10,$190.00,\"$1,900.00\",\"$1,234.56\",$123.46
Z123,Fidelity 401K,MSFT,MICROSOFT,5.5,$400.00,\"$2,200.00\",--,--
Z456,Joint WROS,AAPL,APPLE INC,n/a,$190.00,$0.00,($500.00),-
,,,,,,,,
\"The data and information in this spreadsheet is provided to you solely for your use\"
";

    #[test]
    fn test_parse_total_basis() {
        let rows = read_positions_csv(EXPORT.as_bytes(), CostMode::TotalBasis).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].account_label, "Fidelity 401K");
        assert_eq!(rows[0].symbol, "AAPL");
        assert_eq!(rows[0].quantity, dec!(10));
        assert_eq!(rows[0].cost, Some(dec!(1234.56)));
        assert_eq!(rows[1].quantity, dec!(5.5));
        assert_eq!(rows[1].cost, None);
        assert_eq!(rows[2].quantity, dec!(0));
        assert_eq!(rows[2].cost, Some(dec!(-500.00)));
    }

    #[test]
    fn test_parse_avg_per_share() {
        let rows = read_positions_csv(EXPORT.as_bytes(), CostMode::AvgPerShare).unwrap();
        assert_eq!(rows[0].cost, Some(dec!(123.46)));
        assert_eq!(rows[2].cost, None);
    }

    #[test]
    fn test_missing_optional_columns_still_parse() {
        let csv = "Account Name,Symbol\nIRA,VTI\n";
        let rows = read_positions_csv(csv.as_bytes(), CostMode::TotalBasis).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quantity, dec!(0));
        assert_eq!(rows[0].cost, None);
    }

    #[test]
    fn test_missing_account_column_is_input_error() {
        let csv = "Symbol,Quantity\nVTI,3\n";
        let err = read_positions_csv(csv.as_bytes(), CostMode::TotalBasis).unwrap_err();
        assert!(err.is_input_shape());
    }

    #[test]
    fn test_distinct_accounts_first_seen_order() {
        let accounts = read_distinct_accounts(EXPORT.as_bytes()).unwrap();
        assert_eq!(accounts, vec!["Fidelity 401K", "Joint WROS"]);
    }

    #[test]
    fn test_checksum_is_stable() {
        assert_eq!(compute_checksum(b"abc"), compute_checksum(b"abc"));
        assert_eq!(compute_checksum(b"abc").len(), 64);
    }
}
