use serde::{Deserialize, Serialize};

/// Currencies a balance can be held in. There is no conversion between them:
/// every balance and ledger row is scoped to exactly one currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Chf,
    Eur,
    Usd,
    Gbp,
}

impl Currency {
    pub const ALL: [Currency; 4] = [Currency::Chf, Currency::Eur, Currency::Usd, Currency::Gbp];

    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Chf => "CHF",
            Currency::Eur => "EUR",
            Currency::Usd => "USD",
            Currency::Gbp => "GBP",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "CHF" => Some(Currency::Chf),
            "EUR" => Some(Currency::Eur),
            "USD" => Some(Currency::Usd),
            "GBP" => Some(Currency::Gbp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_roundtrip() {
        for currency in Currency::ALL {
            assert_eq!(Currency::from_str(currency.as_str()), Some(currency));
        }
    }

    #[test]
    fn test_currency_parsing_is_case_insensitive() {
        assert_eq!(Currency::from_str("chf"), Some(Currency::Chf));
        assert_eq!(Currency::from_str(" gbp "), Some(Currency::Gbp));
        assert_eq!(Currency::from_str("JPY"), None);
    }

    #[test]
    fn test_currency_serializes_as_iso_code() {
        let json = serde_json::to_string(&Currency::Eur).unwrap();
        assert_eq!(json, "\"EUR\"");
    }
}
