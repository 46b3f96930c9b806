//! Venue identities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of supported venues plus an `Unknown` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VenueId {
    Binance,
    Kraken,
    Bybit,
    Crypto,
    Kucoin,
    Okx,
    Unknown,
}

impl VenueId {
    /// Every real venue, in a stable order.
    pub const ALL: [VenueId; 6] = [
        VenueId::Binance,
        VenueId::Kraken,
        VenueId::Bybit,
        VenueId::Crypto,
        VenueId::Kucoin,
        VenueId::Okx,
    ];

    /// Stable string form used in logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            VenueId::Binance => "BINANCE",
            VenueId::Kraken => "KRAKEN",
            VenueId::Bybit => "BYBIT",
            VenueId::Crypto => "CRYPTO",
            VenueId::Kucoin => "KUCOIN",
            VenueId::Okx => "OKX",
            VenueId::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for VenueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VenueId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BINANCE" => Ok(VenueId::Binance),
            "KRAKEN" => Ok(VenueId::Kraken),
            "BYBIT" => Ok(VenueId::Bybit),
            "CRYPTO" => Ok(VenueId::Crypto),
            "KUCOIN" => Ok(VenueId::Kucoin),
            "OKX" => Ok(VenueId::Okx),
            other => Err(format!("unknown venue: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_roundtrip() {
        for venue in VenueId::ALL {
            assert_eq!(venue.as_str().parse::<VenueId>().unwrap(), venue);
        }
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("kraken".parse::<VenueId>().unwrap(), VenueId::Kraken);
        assert!("HUOBI".parse::<VenueId>().is_err());
    }
}
