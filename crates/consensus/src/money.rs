//! Monetary units and decimal conversion.

use std::fmt;

pub type Amount = i64;

pub const COIN: Amount = 100_000_000;
pub const DECIMALS: usize = 8;

/// Upper bound of the issuance schedule (50 per block, halving every 840 000).
pub const MAX_MONEY: Amount = 84_000_000 * COIN;

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    Empty,
    InvalidDigit,
    TooPrecise,
    OutOfRange,
}

impl fmt::Display for AmountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AmountError::Empty => write!(f, "empty amount"),
            AmountError::InvalidDigit => write!(f, "invalid digit in amount"),
            AmountError::TooPrecise => write!(f, "amount has more than 8 decimal places"),
            AmountError::OutOfRange => write!(f, "amount out of range"),
        }
    }
}

impl std::error::Error for AmountError {}

/// Renders base units as a coin amount with exactly 8 decimals.
pub fn format_amount(value: Amount) -> String {
    let sign = if value < 0 { "-" } else { "" };
    let abs = value.unsigned_abs();
    let coin = COIN as u64;
    format!("{sign}{}.{:08}", abs / coin, abs % coin)
}

/// Parses a decimal coin string (`"25"`, `"1.5"`, `"0.00000001"`) into base units.
pub fn parse_amount(raw: &str) -> Result<Amount, AmountError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AmountError::Empty);
    }
    let (negative, digits) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let (whole, frac) = match digits.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (digits, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(AmountError::Empty);
    }
    if frac.len() > DECIMALS {
        return Err(AmountError::TooPrecise);
    }
    if !whole.bytes().chain(frac.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(AmountError::InvalidDigit);
    }
    let whole_value: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| AmountError::OutOfRange)?
    };
    let mut frac_value: i64 = 0;
    for (idx, byte) in frac.bytes().enumerate() {
        let digit = i64::from(byte - b'0');
        frac_value += digit * 10i64.pow((DECIMALS - 1 - idx) as u32);
    }
    let value = whole_value
        .checked_mul(COIN)
        .and_then(|value| value.checked_add(frac_value))
        .ok_or(AmountError::OutOfRange)?;
    Ok(if negative { -value } else { value })
}

/// Converts a JSON-RPC floating point coin value, rounding to 8 decimals.
pub fn amount_from_coins(value: f64) -> Result<Amount, AmountError> {
    if !value.is_finite() {
        return Err(AmountError::OutOfRange);
    }
    let scaled = (value * COIN as f64).round();
    if scaled.abs() > MAX_MONEY as f64 {
        return Err(AmountError::OutOfRange);
    }
    Ok(scaled as Amount)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_eight_decimals() {
        assert_eq!(format_amount(25 * COIN), "25.00000000");
        assert_eq!(format_amount(1), "0.00000001");
        assert_eq!(format_amount(-150_000_000), "-1.50000000");
    }

    #[test]
    fn parses_decimal_strings() {
        assert_eq!(parse_amount("25"), Ok(25 * COIN));
        assert_eq!(parse_amount("1.5"), Ok(150_000_000));
        assert_eq!(parse_amount(".5"), Ok(50_000_000));
        assert_eq!(parse_amount("0.00000001"), Ok(1));
        assert_eq!(parse_amount("0.000000001"), Err(AmountError::TooPrecise));
        assert_eq!(parse_amount("1e3"), Err(AmountError::InvalidDigit));
        assert_eq!(parse_amount(""), Err(AmountError::Empty));
    }

    #[test]
    fn rounds_rpc_floats() {
        assert_eq!(amount_from_coins(25.0), Ok(25 * COIN));
        assert_eq!(amount_from_coins(0.1 + 0.2), Ok(30_000_000));
        assert_eq!(amount_from_coins(0.00024414), Ok(24_414));
        assert!(amount_from_coins(f64::NAN).is_err());
    }
}
