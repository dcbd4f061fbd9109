use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Derivatives venues a user can connect credentials for
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Okx,
    Bitget,
    Hyperliquid,
}

impl Exchange {
    pub fn name(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Okx => "okx",
            Exchange::Bitget => "bitget",
            Exchange::Hyperliquid => "hyperliquid",
        }
    }

    pub fn all() -> [Exchange; 5] {
        [
            Exchange::Binance,
            Exchange::Bybit,
            Exchange::Okx,
            Exchange::Bitget,
            Exchange::Hyperliquid,
        ]
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Exchange::all()
            .into_iter()
            .find(|e| e.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("Unknown exchange: {}", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_name_binance() {
        assert_eq!(Exchange::Binance.name(), "binance");
    }

    #[test]
    fn test_exchange_from_str_is_case_insensitive() {
        assert_eq!("BYBIT".parse::<Exchange>().unwrap(), Exchange::Bybit);
        assert_eq!(" okx ".parse::<Exchange>().unwrap(), Exchange::Okx);
        assert!("kraken".parse::<Exchange>().is_err());
    }

    #[test]
    fn test_exchange_equality() {
        assert_eq!(Exchange::Binance, Exchange::Binance);
        assert_ne!(Exchange::Binance, Exchange::Hyperliquid);
    }
}
