//! Human-readable stablecoin amounts.
//!
//! Integer-only: no `f64` anywhere between "$2.00" and `2000000`.

use alloy::primitives::U256;

use crate::error::PriceError;

/// Parse a dollar price (`"$2"`, `"2.00"`, `"0.000001"`) into token base units.
/// Digits beyond `decimals` are truncated.
pub fn parse_price(price: &str, decimals: u32) -> Result<U256, PriceError> {
    let err = |reason: &str| PriceError {
        input: price.to_string(),
        reason: reason.to_string(),
    };

    let cleaned = price.trim().trim_start_matches('$').replace(',', "");
    if cleaned.is_empty() {
        return Err(err("no numeric content"));
    }
    if !cleaned.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(err("unexpected character"));
    }

    let (integer_part, fractional_part) = cleaned.split_once('.').unwrap_or((cleaned.as_str(), ""));
    if fractional_part.contains('.') {
        return Err(err("more than one decimal point"));
    }

    let decimals = decimals as usize;
    let mut fraction: String = fractional_part.chars().take(decimals).collect();
    while fraction.len() < decimals {
        fraction.push('0');
    }

    let digits = format!("{integer_part}{fraction}");
    let digits = digits.trim_start_matches('0');
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    digits.parse::<U256>().map_err(|_| err("overflow"))
}

/// Render base units as a decimal string, trimming trailing zeros but
/// keeping at least two fractional digits (`2000000` -> `"2.00"`).
pub fn format_price(units: U256, decimals: u32) -> String {
    let raw = units.to_string();
    let decimals = decimals as usize;
    if decimals == 0 {
        return raw;
    }

    let padded = format!("{raw:0>width$}", width = decimals + 1);
    let (integer, fraction) = padded.split_at(padded.len() - decimals);
    let mut fraction = fraction.trim_end_matches('0').to_string();
    while fraction.len() < 2.min(decimals) {
        fraction.push('0');
    }
    format!("{integer}.{fraction}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_dollar_price() {
        assert_eq!(parse_price("$2", 6).unwrap(), U256::from(2_000_000u64));
        assert_eq!(parse_price("$0.001", 6).unwrap(), U256::from(1_000u64));
    }

    #[test]
    fn test_parse_numeric_price() {
        assert_eq!(parse_price("2.00", 6).unwrap(), U256::from(2_000_000u64));
        assert_eq!(parse_price("$1,250.50", 6).unwrap(), U256::from(1_250_500_000u64));
    }

    #[test]
    fn test_parse_six_decimals() {
        assert_eq!(parse_price("0.000001", 6).unwrap(), U256::from(1u64));
    }

    #[test]
    fn test_parse_truncates_beyond_decimals() {
        // 7 decimal digits: truncated to 6.
        assert_eq!(parse_price("0.0000019", 6).unwrap(), U256::from(1u64));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_price("$", 6).is_err());
        assert!(parse_price("two dollars", 6).is_err());
        assert!(parse_price("1.2.3", 6).is_err());
    }

    #[test]
    fn test_format_price() {
        assert_eq!(format_price(U256::from(2_000_000u64), 6), "2.00");
        assert_eq!(format_price(U256::from(1_500u64), 6), "0.0015");
        assert_eq!(format_price(U256::from(123_456_789u64), 6), "123.456789");
        assert_eq!(format_price(U256::ZERO, 6), "0.00");
    }
}
