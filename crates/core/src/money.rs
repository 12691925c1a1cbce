//! Conversion of vendor decimal amounts into integer minor units.

use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::Value;

/// Converts a decimal amount such as `"19.99"` or `19.99` to cents.
///
/// Rounds half away from zero on exact decimal values, so `"9.995"` becomes
/// `1000`. Returns `None` for anything that is not a finite decimal.
pub fn to_minor_units(value: &Value) -> Option<i64> {
    let decimal = match value {
        Value::String(raw) => parse_decimal(raw.trim())?,
        Value::Number(number) => parse_decimal(&number.to_string())?,
        _ => return None,
    };

    decimal
        .checked_mul(Decimal::ONE_HUNDRED)?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

fn parse_decimal(raw: &str) -> Option<Decimal> {
    // `Decimal::from_str` tolerates `_` digit separators.
    if raw.is_empty() || raw.contains('_') {
        return None;
    }
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .ok()
}
