use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One parsed line of a positions export, before aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionRow {
    pub account_label: String,
    pub symbol: String,
    pub quantity: Decimal,
    /// `None` when the cost column was blank, `-`, `nan` or unparseable.
    pub cost: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingOverride {
    pub dataset_id: String,
    pub source_label: String,
    pub target_header: String,
}

/// Running totals for one (symbol, header) pair within a single run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateCell {
    pub qty: Decimal,
    pub cost: Option<Decimal>,
    #[serde(skip)]
    pub rows: usize,
}

impl AggregateCell {
    pub fn add(&mut self, row: &PositionRow) {
        self.qty += row.quantity;
        self.cost = match (self.cost, row.cost) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        self.rows += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostMode {
    #[default]
    TotalBasis,
    AvgPerShare,
}

impl CostMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "total_basis" => Some(Self::TotalBasis),
            "avg_per_share" => Some(Self::AvgPerShare),
            _ => None,
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            Self::TotalBasis => "total_basis",
            Self::AvgPerShare => "avg_per_share",
        }
    }
}
