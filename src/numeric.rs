use std::str::FromStr;

use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;

/// A cell or field value as it arrives from a CSV record or a workbook cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RawValue<'a> {
    Text(&'a str),
    Float(f64),
    Int(i64),
}

impl<'a> From<&'a str> for RawValue<'a> {
    fn from(s: &'a str) -> Self {
        RawValue::Text(s)
    }
}

impl From<f64> for RawValue<'_> {
    fn from(v: f64) -> Self {
        RawValue::Float(v)
    }
}

impl From<i64> for RawValue<'_> {
    fn from(v: i64) -> Self {
        RawValue::Int(v)
    }
}

/// Money cells keep "no value" distinct from zero: blank, `-`, `nan` and
/// anything that will not parse come back as `None`.
pub fn to_decimal_money<'a>(raw: impl Into<RawValue<'a>>) -> Option<Decimal> {
    parse_decimal(raw.into())
}

/// Quantities default to zero when missing or unparseable. A position with an
/// unreadable quantity still contributes its cost.
pub fn to_decimal_quantity<'a>(raw: impl Into<RawValue<'a>>) -> Decimal {
    parse_decimal(raw.into()).unwrap_or(Decimal::ZERO)
}

fn parse_decimal(raw: RawValue<'_>) -> Option<Decimal> {
    match raw {
        RawValue::Int(i) => Some(Decimal::from(i)),
        RawValue::Float(f) => Decimal::from_f64(f).map(|d| d.normalize()),
        RawValue::Text(s) => parse_text(s),
    }
}

fn parse_text(raw: &str) -> Option<Decimal> {
    let s = raw.trim();
    if s.is_empty() || s == "-" || s.eq_ignore_ascii_case("nan") {
        return None;
    }

    let s = s.replace([',', '"', '$'], "");
    let s = s.trim();
    let (negate, body) = match s.strip_prefix('(').and_then(|v| v.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, s),
    };

    let cleaned: String = body
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+'))
        .collect();
    let cleaned = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if cleaned.is_empty() {
        return None;
    }

    let value = Decimal::from_str(cleaned).ok()?;
    Some(if negate { -value } else { value })
}
