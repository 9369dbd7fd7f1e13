use thiserror::Error;

/// Money is represented as integer minor units to keep amounts exact.
/// For CHF/EUR/USD/GBP, 1 unit = 100 cents, so 50.00 = 5000 cents.
pub type Cents = i64;

/// Largest amount a single deposit or withdrawal may move: 10 billion units.
pub const MAX_AMOUNT: Cents = 1_000_000_000_000;

/// Format cents as a decimal string.
/// Example: 5000 -> "50.00", -1234 -> "-12.34"
pub fn format_cents(cents: Cents) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs_cents = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs_cents / 100, abs_cents % 100)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseCentsError {
    #[error("invalid money format: {0:?}")]
    InvalidFormat(String),

    #[error("amount {0:?} has more than two decimal places")]
    TooPrecise(String),

    #[error("amount {0:?} is out of range")]
    Overflow(String),
}

/// Parse a decimal string into cents.
/// Example: "50.00" -> 5000, "12.5" -> 1250, "100" -> 10000
///
/// Unlike display formatting, parsing is strict: sub-cent precision is
/// rejected instead of silently truncated, since the value ends up on a
/// balance.
pub fn parse_cents(input: &str) -> Result<Cents, ParseCentsError> {
    let raw = input.trim();
    let (negative, body) = match raw.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };

    let invalid = || ParseCentsError::InvalidFormat(raw.to_string());
    let overflow = || ParseCentsError::Overflow(raw.to_string());

    let (units_str, decimal_str) = match body.split_once('.') {
        Some((units, decimals)) => (units, decimals),
        None => (body, ""),
    };

    if units_str.is_empty() && decimal_str.is_empty() {
        return Err(invalid());
    }
    if !units_str.chars().all(|c| c.is_ascii_digit())
        || !decimal_str.chars().all(|c| c.is_ascii_digit())
    {
        return Err(invalid());
    }
    if decimal_str.len() > 2 {
        return Err(ParseCentsError::TooPrecise(raw.to_string()));
    }

    let units: i64 = if units_str.is_empty() {
        0
    } else {
        units_str.parse().map_err(|_| overflow())?
    };
    let decimal_cents: i64 = match decimal_str.len() {
        0 => 0,
        // "12.5" means 50 cents
        1 => decimal_str.parse::<i64>().map_err(|_| invalid())? * 10,
        _ => decimal_str.parse().map_err(|_| invalid())?,
    };

    let cents = units
        .checked_mul(100)
        .and_then(|c| c.checked_add(decimal_cents))
        .ok_or_else(overflow)?;
    Ok(if negative { -cents } else { cents })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(5000), "50.00");
        assert_eq!(format_cents(1234), "12.34");
        assert_eq!(format_cents(1), "0.01");
        assert_eq!(format_cents(0), "0.00");
        assert_eq!(format_cents(-3000), "-30.00");
        assert_eq!(format_cents(-1), "-0.01");
    }

    #[test]
    fn test_parse_cents() {
        assert_eq!(parse_cents("50.00"), Ok(5000));
        assert_eq!(parse_cents("50"), Ok(5000));
        assert_eq!(parse_cents("12.5"), Ok(1250));
        assert_eq!(parse_cents(".50"), Ok(50));
        assert_eq!(parse_cents(" 0.01 "), Ok(1));
        assert_eq!(parse_cents("-30"), Ok(-3000));
    }

    #[test]
    fn test_parse_cents_rejects_sub_cent_precision() {
        assert_eq!(
            parse_cents("100.999"),
            Err(ParseCentsError::TooPrecise("100.999".to_string()))
        );
    }

    #[test]
    fn test_parse_cents_invalid() {
        assert!(matches!(parse_cents("abc"), Err(ParseCentsError::InvalidFormat(_))));
        assert!(matches!(parse_cents("12.34.56"), Err(ParseCentsError::InvalidFormat(_))));
        assert!(matches!(parse_cents("."), Err(ParseCentsError::InvalidFormat(_))));
        assert!(matches!(parse_cents("+5"), Err(ParseCentsError::InvalidFormat(_))));
        assert!(matches!(
            parse_cents("99999999999999999999"),
            Err(ParseCentsError::Overflow(_))
        ));
    }
}
