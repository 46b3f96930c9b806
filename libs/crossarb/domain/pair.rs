//! Trading-pair registry: canonical pairs, per-pair metadata, venue symbols.

use crate::domain::venue::VenueId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Closed set of tradable pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradingPair {
    AdaUsdt,
    AlgoUsdt,
    AtomUsdt,
    AvaxUsdt,
    BchUsdt,
    BtcUsdt,
    DogeUsdt,
    DotUsdt,
    EosUsdt,
    EthUsdt,
    LinkUsdt,
    SolUsdt,
    XrpUsdt,
    XtzUsdt,
}

/// Static metadata for one pair.
///
/// `venue_symbols` is indexed in [`VenueId::ALL`] order. `price_precision` is
/// the number of price decimals the venue quotes, needed verbatim for the
/// Kraken checksum string.
pub struct PairSpec {
    pub symbol: &'static str,
    pub base: &'static str,
    pub quote: &'static str,
    pub price_precision: u32,
    venue_symbols: [&'static str; 6],
}

macro_rules! pair_spec {
    ($symbol:literal, $base:literal, $quote:literal, $precision:literal) => {
        PairSpec {
            symbol: $symbol,
            base: $base,
            quote: $quote,
            price_precision: $precision,
            venue_symbols: [
                concat!($base, "USDT"),       // Binance
                concat!($base, "/USD"),       // Kraken
                concat!($base, "USDT"),       // Bybit
                concat!($base, "USD-PERP"),   // Crypto.com
                concat!($base, "-USDT"),      // KuCoin
                concat!($base, "-USDT"),      // OKX
            ],
        }
    };
}

static PAIR_SPECS: [PairSpec; 14] = [
    pair_spec!("ADA/USDT", "ADA", "USDT", 6),
    pair_spec!("ALGO/USDT", "ALGO", "USDT", 5),
    pair_spec!("ATOM/USDT", "ATOM", "USDT", 4),
    pair_spec!("AVAX/USDT", "AVAX", "USDT", 2),
    pair_spec!("BCH/USDT", "BCH", "USDT", 2),
    pair_spec!("BTC/USDT", "BTC", "USDT", 1),
    pair_spec!("DOGE/USDT", "DOGE", "USDT", 7),
    pair_spec!("DOT/USDT", "DOT", "USDT", 4),
    pair_spec!("EOS/USDT", "EOS", "USDT", 4),
    pair_spec!("ETH/USDT", "ETH", "USDT", 2),
    pair_spec!("LINK/USDT", "LINK", "USDT", 5),
    pair_spec!("SOL/USDT", "SOL", "USDT", 2),
    pair_spec!("XRP/USDT", "XRP", "USDT", 5),
    pair_spec!("XTZ/USDT", "XTZ", "USDT", 4),
];

fn venue_index(venue: VenueId) -> Option<usize> {
    VenueId::ALL.iter().position(|v| *v == venue)
}

impl TradingPair {
    pub const ALL: [TradingPair; 14] = [
        TradingPair::AdaUsdt,
        TradingPair::AlgoUsdt,
        TradingPair::AtomUsdt,
        TradingPair::AvaxUsdt,
        TradingPair::BchUsdt,
        TradingPair::BtcUsdt,
        TradingPair::DogeUsdt,
        TradingPair::DotUsdt,
        TradingPair::EosUsdt,
        TradingPair::EthUsdt,
        TradingPair::LinkUsdt,
        TradingPair::SolUsdt,
        TradingPair::XrpUsdt,
        TradingPair::XtzUsdt,
    ];

    pub fn spec(&self) -> &'static PairSpec {
        // Variant order matches the PAIR_SPECS table order.
        &PAIR_SPECS[*self as usize]
    }

    /// Canonical display symbol, e.g. `BTC/USDT`.
    pub fn symbol(&self) -> &'static str {
        self.spec().symbol
    }

    pub fn base(&self) -> &'static str {
        self.spec().base
    }

    pub fn quote(&self) -> &'static str {
        self.spec().quote
    }

    /// Price decimals, as quoted by the venues (Kraken checksum formatting).
    pub fn price_precision(&self) -> u32 {
        self.spec().price_precision
    }

    /// The symbol this pair trades under on `venue`.
    pub fn venue_symbol(&self, venue: VenueId) -> Option<&'static str> {
        venue_index(venue).map(|i| self.spec().venue_symbols[i])
    }

    /// Reverse lookup from a venue's symbol string, case-insensitive.
    pub fn from_venue_symbol(venue: VenueId, symbol: &str) -> Option<TradingPair> {
        let index = venue_index(venue)?;
        TradingPair::ALL
            .iter()
            .copied()
            .find(|pair| pair.spec().venue_symbols[index].eq_ignore_ascii_case(symbol))
    }
}

impl fmt::Display for TradingPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for TradingPair {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TradingPair::ALL
            .iter()
            .copied()
            .find(|pair| {
                pair.symbol().eq_ignore_ascii_case(s)
                    || pair.symbol().replace('/', "_").eq_ignore_ascii_case(s)
            })
            .ok_or_else(|| format!("unknown trading pair: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn venue_symbols_follow_each_venues_convention() {
        let btc = TradingPair::BtcUsdt;
        assert_eq!(btc.venue_symbol(VenueId::Binance), Some("BTCUSDT"));
        assert_eq!(btc.venue_symbol(VenueId::Kraken), Some("BTC/USD"));
        assert_eq!(btc.venue_symbol(VenueId::Bybit), Some("BTCUSDT"));
        assert_eq!(btc.venue_symbol(VenueId::Crypto), Some("BTCUSD-PERP"));
        assert_eq!(btc.venue_symbol(VenueId::Kucoin), Some("BTC-USDT"));
        assert_eq!(btc.venue_symbol(VenueId::Okx), Some("BTC-USDT"));
        assert_eq!(btc.venue_symbol(VenueId::Unknown), None);
    }

    #[test]
    fn reverse_lookup_is_case_insensitive() {
        assert_eq!(
            TradingPair::from_venue_symbol(VenueId::Binance, "ethusdt"),
            Some(TradingPair::EthUsdt)
        );
        assert_eq!(
            TradingPair::from_venue_symbol(VenueId::Kraken, "SOL/USD"),
            Some(TradingPair::SolUsdt)
        );
        assert_eq!(TradingPair::from_venue_symbol(VenueId::Kraken, "SOLUSD"), None);
    }

    #[test]
    fn precision_matches_quote_convention() {
        assert_eq!(TradingPair::BtcUsdt.price_precision(), 1);
        assert_eq!(TradingPair::EthUsdt.price_precision(), 2);
        assert_eq!(TradingPair::DogeUsdt.price_precision(), 7);
    }

    #[test]
    fn parse_accepts_slash_and_underscore() {
        assert_eq!("BTC/USDT".parse::<TradingPair>().unwrap(), TradingPair::BtcUsdt);
        assert_eq!("btc_usdt".parse::<TradingPair>().unwrap(), TradingPair::BtcUsdt);
        assert!("FOO/BAR".parse::<TradingPair>().is_err());
    }
}
