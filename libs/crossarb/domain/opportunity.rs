//! Cross-venue price dislocations.

use crate::domain::pair::TradingPair;
use crate::domain::venue::VenueId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::fmt;

/// A detected spread: buy on one venue, sell on another.
#[derive(Debug, Clone, Copy)]
pub struct Opportunity {
    pub buy_venue: VenueId,
    pub sell_venue: VenueId,
    pub pair: TradingPair,
    /// Executable amount: min of the two top-of-book quantities
    pub amount: Decimal,
    /// Best ask on the buy venue
    pub buy_price: Decimal,
    /// Best bid on the sell venue
    pub sell_price: Decimal,
    pub at: DateTime<Utc>,
}

impl Opportunity {
    pub fn new(
        buy_venue: VenueId,
        sell_venue: VenueId,
        pair: TradingPair,
        amount: Decimal,
        buy_price: Decimal,
        sell_price: Decimal,
    ) -> Self {
        Self {
            buy_venue,
            sell_venue,
            pair,
            amount,
            buy_price,
            sell_price,
            at: Utc::now(),
        }
    }

    /// Empty sentinel, used to clear a retained best.
    pub fn none(pair: TradingPair) -> Self {
        Self::new(
            VenueId::Unknown,
            VenueId::Unknown,
            pair,
            Decimal::ZERO,
            Decimal::ZERO,
            Decimal::ZERO,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.amount.is_zero()
    }

    /// Gross margin in percent: `(sell - buy) / buy * 100`.
    pub fn profit_pct(&self) -> Decimal {
        if self.buy_price.is_zero() {
            return Decimal::ZERO;
        }
        (self.sell_price - self.buy_price) / self.buy_price * dec!(100)
    }

    /// Absolute gross profit for the full amount.
    pub fn profit(&self) -> Decimal {
        (self.sell_price - self.buy_price) * self.amount
    }

    /// Executability gate: both prices positive, a positive amount, buy below
    /// sell, and the two prices within the 2x sanity band.
    pub fn is_feasible(&self) -> bool {
        self.buy_price > Decimal::ZERO
            && self.sell_price > Decimal::ZERO
            && self.amount > Decimal::ZERO
            && self.buy_price < self.sell_price
            && self.prices_within_band()
    }

    /// False when one price is at least twice the other; such a spread is a
    /// stale book or a bad feed, not a trade.
    pub fn prices_within_band(&self) -> bool {
        let (lo, hi) = if self.buy_price <= self.sell_price {
            (self.buy_price, self.sell_price)
        } else {
            (self.sell_price, self.buy_price)
        };
        hi < lo * dec!(2)
    }
}

impl fmt::Display for Opportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}->{} {} @ {}->{} ({:.4}%)",
            self.pair,
            self.buy_venue,
            self.sell_venue,
            self.amount,
            self.buy_price,
            self.sell_price,
            self.profit_pct()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opp(buy: &str, sell: &str, amount: &str) -> Opportunity {
        Opportunity::new(
            VenueId::Binance,
            VenueId::Kraken,
            TradingPair::BtcUsdt,
            amount.parse().unwrap(),
            buy.parse().unwrap(),
            sell.parse().unwrap(),
        )
    }

    #[test]
    fn profit_pct_positive_implies_sell_above_buy() {
        let o = opp("100", "101", "1");
        assert_eq!(o.profit_pct(), dec!(1));
        assert!(o.sell_price > o.buy_price);

        let inverted = opp("101", "100", "1");
        assert!(inverted.profit_pct() < Decimal::ZERO);
    }

    #[test]
    fn feasibility_requires_positive_spread_and_amount() {
        assert!(opp("100", "101", "1").is_feasible());
        assert!(!opp("100", "100", "1").is_feasible());
        assert!(!opp("101", "100", "1").is_feasible());
        assert!(!opp("100", "101", "0").is_feasible());
        assert!(!opp("0", "101", "1").is_feasible());
    }

    #[test]
    fn feasibility_rejects_two_x_price_band() {
        // Exactly 2x: rejected.
        assert!(!opp("100", "200", "1").is_feasible());
        assert!(!opp("200", "100", "1").prices_within_band());
        // Just inside the band: accepted.
        assert!(opp("100", "199.99", "1").is_feasible());
    }

    #[test]
    fn none_sentinel_is_empty() {
        let o = Opportunity::none(TradingPair::EthUsdt);
        assert!(o.is_empty());
        assert!(!o.is_feasible());
        assert_eq!(o.profit_pct(), Decimal::ZERO);
    }

    #[test]
    fn absolute_profit_scales_with_amount() {
        assert_eq!(opp("100", "101", "2.5").profit(), dec!(2.5));
    }
}
