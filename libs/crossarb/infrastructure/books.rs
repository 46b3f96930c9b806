//! Order-book manager: one book per (venue, pair), change fan-out.

use crate::domain::orderbook::{BestPrices, OrderBook, PriceLevel, UpdateOutcome};
use crate::domain::pair::TradingPair;
use crate::domain::venue::VenueId;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub type SharedBook = Arc<RwLock<OrderBook>>;

type ChangeCallback = Box<dyn Fn(VenueId, TradingPair) + Send + Sync>;

/// Holds every book, pre-initialized for all configured (venue, pair)
/// combinations. Each book carries its own lock; updates to different books
/// never contend. The registered change callback runs with no book lock
/// held.
pub struct OrderBookManager {
    books: HashMap<(VenueId, TradingPair), SharedBook>,
    max_depth: usize,
    on_change: RwLock<Option<ChangeCallback>>,
}

impl OrderBookManager {
    pub fn new(venues: &[VenueId], pairs: &[TradingPair], max_depth: usize) -> Arc<Self> {
        let mut books = HashMap::new();
        for &venue in venues {
            for &pair in pairs {
                books.insert(
                    (venue, pair),
                    Arc::new(RwLock::new(OrderBook::new(venue, pair))),
                );
            }
        }
        Arc::new(Self {
            books,
            max_depth,
            on_change: RwLock::new(None),
        })
    }

    /// Register the single change listener (the strategy). Replaces any
    /// previous one.
    pub fn set_change_callback<F>(&self, callback: F)
    where
        F: Fn(VenueId, TradingPair) + Send + Sync + 'static,
    {
        *self.on_change.write() = Some(Box::new(callback));
    }

    pub fn book(&self, venue: VenueId, pair: TradingPair) -> Option<SharedBook> {
        self.books.get(&(venue, pair)).cloned()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Apply a snapshot or delta; notify the listener on a top-of-book change.
    pub fn apply_update(
        &self,
        venue: VenueId,
        pair: TradingPair,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        is_snapshot: bool,
    ) -> UpdateOutcome {
        let Some(book) = self.books.get(&(venue, pair)) else {
            warn!(%venue, %pair, "update for unmanaged book");
            return UpdateOutcome::UnchangedBest;
        };
        let outcome = book.write().apply(bids, asks, is_snapshot, self.max_depth);
        if outcome == UpdateOutcome::BestChanged {
            self.notify(venue, pair);
        }
        outcome
    }

    /// Top-of-book replacement for ticker-only venues.
    pub fn apply_best_bid_ask(
        &self,
        venue: VenueId,
        pair: TradingPair,
        bid_price: Decimal,
        bid_qty: Decimal,
        ask_price: Decimal,
        ask_qty: Decimal,
    ) -> UpdateOutcome {
        let Some(book) = self.books.get(&(venue, pair)) else {
            warn!(%venue, %pair, "ticker for unmanaged book");
            return UpdateOutcome::UnchangedBest;
        };
        let outcome = book
            .write()
            .set_best_bid_ask(bid_price, bid_qty, ask_price, ask_qty);
        if outcome == UpdateOutcome::BestChanged {
            self.notify(venue, pair);
        }
        outcome
    }

    pub fn best_prices(&self, venue: VenueId, pair: TradingPair) -> Option<BestPrices> {
        self.books
            .get(&(venue, pair))
            .map(|book| book.read().best_prices())
    }

    fn notify(&self, venue: VenueId, pair: TradingPair) {
        if let Some(callback) = self.on_change.read().as_ref() {
            callback(venue, pair);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn level(price: Decimal, qty: Decimal) -> PriceLevel {
        PriceLevel::new(price, qty)
    }

    #[test]
    fn books_exist_for_every_combination() {
        let manager = OrderBookManager::new(
            &[VenueId::Binance, VenueId::Kraken],
            &[TradingPair::BtcUsdt, TradingPair::EthUsdt],
            100,
        );
        for venue in [VenueId::Binance, VenueId::Kraken] {
            for pair in [TradingPair::BtcUsdt, TradingPair::EthUsdt] {
                assert!(manager.book(venue, pair).is_some());
            }
        }
        assert!(manager.book(VenueId::Okx, TradingPair::BtcUsdt).is_none());
    }

    #[test]
    fn callback_fires_only_on_best_change() {
        let manager =
            OrderBookManager::new(&[VenueId::Binance], &[TradingPair::BtcUsdt], 100);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cb = Arc::clone(&calls);
        manager.set_change_callback(move |venue, pair| {
            assert_eq!(venue, VenueId::Binance);
            assert_eq!(pair, TradingPair::BtcUsdt);
            calls_cb.fetch_add(1, Ordering::SeqCst);
        });

        manager.apply_update(
            VenueId::Binance,
            TradingPair::BtcUsdt,
            &[level(dec!(100), dec!(1))],
            &[level(dec!(101), dec!(1))],
            true,
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Depth-only change below the top: no notification.
        manager.apply_update(
            VenueId::Binance,
            TradingPair::BtcUsdt,
            &[level(dec!(99), dec!(1))],
            &[],
            false,
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        manager.apply_update(
            VenueId::Binance,
            TradingPair::BtcUsdt,
            &[level(dec!(100.5), dec!(1))],
            &[],
            false,
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn best_prices_reads_through() {
        let manager =
            OrderBookManager::new(&[VenueId::Okx], &[TradingPair::SolUsdt], 100);
        manager.apply_best_bid_ask(
            VenueId::Okx,
            TradingPair::SolUsdt,
            dec!(150.1),
            dec!(2),
            dec!(150.2),
            dec!(3),
        );
        let best = manager.best_prices(VenueId::Okx, TradingPair::SolUsdt).unwrap();
        assert_eq!(best.best_bid, dec!(150.1));
        assert_eq!(best.best_ask_qty, dec!(3));
    }
}
