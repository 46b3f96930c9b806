//! Runtime tunables, loadable from YAML with environment overrides.

use crate::domain::pair::TradingPair;
use crate::domain::venue::VenueId;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Venues to trade across
    pub venues: Vec<VenueId>,
    /// Pairs to subscribe and scan
    pub pairs: Vec<TradingPair>,
    /// Simulated order flow: no live REST orders
    pub test_mode: bool,

    /// Ladder depth cap per book side
    pub max_book_depth: usize,
    /// Spread worth logging, percent
    pub min_traceable_margin_pct: Decimal,
    /// Spread worth executing, percent
    pub min_execution_margin_pct: Decimal,

    /// Full rescan cadence independent of book callbacks
    pub strategy_scan_interval_ms: u64,
    /// Retained best-opportunity decay
    pub best_opportunity_reset_ms: u64,
    /// Two-leg execution deadline
    pub opportunity_timeout_ms: u64,
    /// Book considered stale when no update arrives for this long
    pub snapshot_validity_ms: u64,
    /// Validate the Kraken checksum every Nth update
    pub kraken_checksum_period: u64,

    /// Simulated fill confirmation delay (test mode)
    pub simulated_fill_delay_ms: u64,
    /// Simulated fill probability, percent (test mode)
    pub simulated_fill_probability: u8,

    /// Timer fired later than this gets a latency warning
    pub timer_fire_delay_warn_ms: u64,
    /// Timer callback slower than this gets a latency warning
    pub timer_callback_warn_ms: u64,
    /// Anomaly counter dump cadence
    pub counter_dump_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            venues: VenueId::ALL.to_vec(),
            pairs: vec![TradingPair::BtcUsdt],
            test_mode: true,
            max_book_depth: 100,
            min_traceable_margin_pct: dec!(0.01),
            min_execution_margin_pct: dec!(0.02),
            strategy_scan_interval_ms: 5_000,
            best_opportunity_reset_ms: 60_000,
            opportunity_timeout_ms: 3_000,
            snapshot_validity_ms: 30_000,
            kraken_checksum_period: 10,
            simulated_fill_delay_ms: 100,
            simulated_fill_probability: 80,
            timer_fire_delay_warn_ms: 10,
            timer_callback_warn_ms: 10,
            counter_dump_interval_ms: 60_000,
        }
    }
}

impl Settings {
    /// Load from the `ARBOT_CONFIG` YAML file if set, then apply environment
    /// overrides. `.env` is honored via dotenv.
    pub fn load() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        let mut settings = match std::env::var("ARBOT_CONFIG") {
            Ok(path) => Self::from_yaml_file(path)?,
            Err(_) => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_yaml::from_str(&text)?)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var("ARBOT_TEST_MODE") {
            self.test_mode = matches!(value.as_str(), "1" | "true" | "TRUE" | "yes");
        }
        if let Ok(value) = std::env::var("ARBOT_VENUES") {
            let venues: Vec<VenueId> = value
                .split(',')
                .filter_map(|v| v.trim().parse().ok())
                .collect();
            if !venues.is_empty() {
                self.venues = venues;
            }
        }
        if let Ok(value) = std::env::var("ARBOT_PAIRS") {
            let pairs: Vec<TradingPair> = value
                .split(',')
                .filter_map(|p| p.trim().parse().ok())
                .collect();
            if !pairs.is_empty() {
                self.pairs = pairs;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let settings = Settings::default();
        assert!(settings.test_mode);
        assert!(settings.min_execution_margin_pct > settings.min_traceable_margin_pct);
        assert_eq!(settings.venues.len(), 6);
    }

    #[test]
    fn yaml_roundtrip_with_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "venues: [BINANCE, KRAKEN]\npairs: [BTC_USDT, ETH_USDT]\nopportunity_timeout_ms: 1500\n"
        )
        .unwrap();

        let settings = Settings::from_yaml_file(file.path()).unwrap();
        assert_eq!(settings.venues, vec![VenueId::Binance, VenueId::Kraken]);
        assert_eq!(
            settings.pairs,
            vec![TradingPair::BtcUsdt, TradingPair::EthUsdt]
        );
        assert_eq!(settings.opportunity_timeout_ms, 1500);
        // Unspecified fields keep their defaults.
        assert_eq!(settings.kraken_checksum_period, 10);
    }
}
