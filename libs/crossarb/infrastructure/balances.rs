//! In-memory asset balances per venue.

use crate::domain::venue::VenueId;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

/// Trivial balance store, refreshed from venue REST responses.
#[derive(Default)]
pub struct BalanceBook {
    balances: RwLock<HashMap<(VenueId, String), Decimal>>,
}

impl BalanceBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn balance(&self, venue: VenueId, asset: &str) -> Decimal {
        self.balances
            .read()
            .get(&(venue, asset.to_ascii_uppercase()))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_balance(&self, venue: VenueId, asset: &str, amount: Decimal) {
        debug!(%venue, asset, %amount, "balance set");
        self.balances
            .write()
            .insert((venue, asset.to_ascii_uppercase()), amount);
    }

    /// Apply a delta (fill, fee); the result is clamped at zero.
    pub fn adjust(&self, venue: VenueId, asset: &str, delta: Decimal) -> Decimal {
        let mut balances = self.balances.write();
        let entry = balances
            .entry((venue, asset.to_ascii_uppercase()))
            .or_default();
        *entry = (*entry + delta).max(Decimal::ZERO);
        *entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn set_get_and_adjust() {
        let book = BalanceBook::new();
        assert_eq!(book.balance(VenueId::Binance, "USDT"), Decimal::ZERO);

        book.set_balance(VenueId::Binance, "usdt", dec!(100));
        assert_eq!(book.balance(VenueId::Binance, "USDT"), dec!(100));

        assert_eq!(book.adjust(VenueId::Binance, "USDT", dec!(-30)), dec!(70));
        // Clamped at zero.
        assert_eq!(book.adjust(VenueId::Binance, "USDT", dec!(-100)), dec!(0));
        // Per-venue isolation.
        assert_eq!(book.balance(VenueId::Kraken, "USDT"), Decimal::ZERO);
    }
}
