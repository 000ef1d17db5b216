use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use crate::models::{AggregateCell, PositionRow};
use crate::overrides::OverrideResolver;

/// Per-run sums, `cells[symbol][header]`, plus the labels nothing resolved.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct Aggregation {
    pub cells: BTreeMap<String, BTreeMap<String, AggregateCell>>,
    pub unmapped: BTreeMap<String, usize>,
}

impl Aggregation {
    pub fn get(&self, symbol: &str, header: &str) -> Option<&AggregateCell> {
        self.cells.get(symbol).and_then(|h| h.get(header))
    }

    pub fn unmapped_rows(&self) -> usize {
        self.unmapped.values().sum()
    }
}

/// Fold rows into per-(symbol, header) totals.
///
/// Only override lookups happen here. A label the resolver does not know is
/// counted under its original text and kept out of the sums.
pub fn aggregate(rows: &[PositionRow], resolver: &OverrideResolver) -> Aggregation {
    let mut agg = Aggregation::default();
    for row in rows {
        match resolver.lookup(&row.account_label) {
            Some(header) => agg
                .cells
                .entry(row.symbol.clone())
                .or_default()
                .entry(header.to_string())
                .or_default()
                .add(row),
            None => *agg.unmapped.entry(row.account_label.clone()).or_insert(0) += 1,
        }
    }
    debug!(
        rows = rows.len(),
        symbols = agg.cells.len(),
        unmapped_labels = agg.unmapped.len(),
        "aggregated"
    );
    agg
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use super::*;
    use crate::numeric::{to_decimal_money, to_decimal_quantity};
    use crate::overrides::testing::MemoryStore;

    fn resolver(pairs: &[(&str, &str)]) -> OverrideResolver {
        OverrideResolver::resolve_overrides("default", &BTreeMap::new(), &MemoryStore::with(pairs))
    }

    fn row(account: &str, symbol: &str, qty: Decimal, cost: Option<Decimal>) -> PositionRow {
        PositionRow {
            account_label: account.to_string(),
            symbol: symbol.to_string(),
            quantity: qty,
            cost,
        }
    }

    #[test]
    fn test_fidelity_401k_scenario() {
        let rows = vec![row(
            "Fidelity 401K",
            "AAPL",
            to_decimal_quantity("10"),
            to_decimal_money("$1,234.56"),
        )];
        let agg = aggregate(&rows, &resolver(&[("fidelity 401k", "BrokerageLink")]));
        let cell = agg.get("AAPL", "BrokerageLink").unwrap();
        assert_eq!(cell.qty, dec!(10));
        assert_eq!(cell.cost, Some(dec!(1234.56)));
        assert!(agg.unmapped.is_empty());
    }

    #[test]
    fn test_unresolved_label_is_counted_not_summed() {
        let rows = vec![
            row("Mystery Account", "MSFT", dec!(3), Some(dec!(900))),
            row("Joint", "MSFT", dec!(1), Some(dec!(300))),
        ];
        let agg = aggregate(&rows, &resolver(&[("joint", "Joint WROS")]));
        assert_eq!(agg.unmapped.get("Mystery Account"), Some(&1));
        assert_eq!(agg.unmapped_rows(), 1);
        assert_eq!(agg.cells["MSFT"].len(), 1);
        assert_eq!(agg.get("MSFT", "Joint WROS").unwrap().qty, dec!(1));
    }

    #[test]
    fn test_unmapped_buckets_by_original_label() {
        let rows = vec![
            row("Old IRA", "A", dec!(1), None),
            row("Old IRA", "B", dec!(1), None),
            row("old  ira", "C", dec!(1), None),
        ];
        let agg = aggregate(&rows, &resolver(&[]));
        assert_eq!(agg.unmapped.get("Old IRA"), Some(&2));
        assert_eq!(agg.unmapped.get("old  ira"), Some(&1));
        assert!(agg.cells.is_empty());
    }

    #[test]
    fn test_sums_across_labels_resolving_to_same_header() {
        let rows = vec![
            row("Fidelity 401K", "VTI", dec!(1.5), Some(dec!(100.25))),
            row("fidelity 401 k", "VTI", dec!(2.25), None),
            row("Brokerage 401k", "VTI", dec!(-0.75), Some(dec!(-20))),
        ];
        let r = resolver(&[("Fidelity 401K", "BrokerageLink"), ("brokerage 401k", "BrokerageLink")]);
        let cell = aggregate(&rows, &r).get("VTI", "BrokerageLink").cloned().unwrap();
        assert_eq!(cell.qty, dec!(3.00));
        assert_eq!(cell.cost, Some(dec!(80.25)));
        assert_eq!(cell.rows, 3);
    }

    #[test]
    fn test_missing_costs_stay_none() {
        let rows = vec![
            row("Joint", "T", dec!(1), to_decimal_money("-")),
            row("Joint", "T", dec!(1), to_decimal_money("")),
        ];
        let agg = aggregate(&rows, &resolver(&[("joint", "Joint WROS")]));
        assert_eq!(agg.get("T", "Joint WROS").unwrap().cost, None);
    }

    #[test]
    fn test_order_does_not_change_sums() {
        let rows = vec![
            row("A", "X", dec!(1.1), Some(dec!(10))),
            row("B", "X", dec!(2.2), None),
            row("A", "Y", dec!(3.3), Some(dec!(30))),
            row("A", "X", dec!(4.4), None),
            row("Z", "X", dec!(5), Some(dec!(1))),
            row("B", "X", dec!(0.05), Some(dec!(0.5))),
        ];
        let r = resolver(&[("a", "Alpha"), ("b", "Beta")]);
        let expected = aggregate(&rows, &r);

        // Every rotation and the reversal of every rotation.
        for shift in 0..rows.len() {
            let mut permuted = rows.clone();
            permuted.rotate_left(shift);
            assert_eq!(aggregate(&permuted, &r).cells, expected.cells);
            assert_eq!(aggregate(&permuted, &r).unmapped, expected.unmapped);
            permuted.reverse();
            assert_eq!(aggregate(&permuted, &r).cells, expected.cells);
        }
        assert_eq!(expected.get("X", "Alpha").unwrap().qty, dec!(5.5));
        assert_eq!(expected.get("X", "Beta").unwrap().cost, Some(dec!(0.5)));
    }
}
