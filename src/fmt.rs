use rust_decimal::{Decimal, RoundingStrategy};

/// Excel number format for quantity cells: no grouping, up to six decimals.
pub const QTY_FORMAT: &str = "0.######";
/// Whole quantities, so Excel does not render a dangling decimal point.
pub const QTY_FORMAT_WHOLE: &str = "0";
/// Excel number format for cost cells: currency, two decimals, sign-aware.
pub const COST_FORMAT: &str = "$#,##0.00;-$#,##0.00";

pub fn quantity_format(qty: Decimal) -> &'static str {
    if qty.fract().is_zero() {
        QTY_FORMAT_WHOLE
    } else {
        QTY_FORMAT
    }
}

/// Format a decimal as a dollar amount with thousands separators: $1,234.56
pub fn money(val: Decimal) -> String {
    let rounded = val.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    let negative = rounded.is_sign_negative() && !rounded.is_zero();
    let cents = format!("{:.2}", rounded.abs());
    let (int_part, dec_part) = cents.split_once('.').unwrap_or((cents.as_str(), "00"));

    let mut with_commas = String::new();
    for (i, c) in int_part.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            with_commas.push(',');
        }
        with_commas.push(c);
    }
    let with_commas: String = with_commas.chars().rev().collect();

    if negative {
        format!("-${with_commas}.{dec_part}")
    } else {
        format!("${with_commas}.{dec_part}")
    }
}

pub fn money_opt(val: Option<Decimal>) -> String {
    val.map(money).unwrap_or_default()
}

/// Quantity without trailing zeros: 10, 5.5, 0.000123
pub fn quantity(val: Decimal) -> String {
    val.normalize().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_money_formatting() {
        assert_eq!(money(dec!(1234.56)), "$1,234.56");
        assert_eq!(money(dec!(-500.00)), "-$500.00");
        assert_eq!(money(dec!(0)), "$0.00");
        assert_eq!(money(dec!(1000000.99)), "$1,000,000.99");
        assert_eq!(money(dec!(42.1)), "$42.10");
        assert_eq!(money(dec!(0.005)), "$0.01");
    }

    #[test]
    fn test_money_opt_blank_for_missing() {
        assert_eq!(money_opt(None), "");
        assert_eq!(money_opt(Some(dec!(1))), "$1.00");
    }

    #[test]
    fn test_quantity_formatting() {
        assert_eq!(quantity(dec!(10.000)), "10");
        assert_eq!(quantity(dec!(5.50)), "5.5");
        assert_eq!(quantity(dec!(0.000123)), "0.000123");
    }

    #[test]
    fn test_quantity_format_choice() {
        assert_eq!(quantity_format(dec!(10)), QTY_FORMAT_WHOLE);
        assert_eq!(quantity_format(dec!(10.25)), QTY_FORMAT);
    }
}
