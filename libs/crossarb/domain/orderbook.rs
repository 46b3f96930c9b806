//! Per-venue, per-pair order book.
//!
//! Sorted `Vec` ladders (bids descending, asks ascending) with binary-search
//! updates. Snapshots replace the ladders; deltas insert, overwrite or remove
//! single levels. Every accepted mutation keeps both ladders sorted,
//! deduplicated and uncrossed.

use crate::domain::pair::TradingPair;
use crate::domain::venue::VenueId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// One resting level: price and quantity.
///
/// In a delta, quantity zero means "remove this level".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub qty: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, qty: Decimal) -> Self {
        Self { price, qty }
    }
}

/// Result of applying an update to a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Accepted, top-of-book unchanged on both sides
    UnchangedBest,
    /// Accepted, top-of-book price or quantity changed on either side
    BestChanged,
    /// Rejected: the update would cross the book
    Error,
}

/// Atomic copy of both tops and both worst levels.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestPrices {
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub best_bid_qty: Decimal,
    pub best_ask_qty: Decimal,
    pub worst_bid: Decimal,
    pub worst_ask: Decimal,
}

#[derive(Debug, Clone)]
pub struct OrderBook {
    venue: VenueId,
    pair: TradingPair,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    last_update: DateTime<Utc>,
    last_update_id: i64,
    has_snapshot: bool,
    subscribed: bool,
}

impl OrderBook {
    pub fn new(venue: VenueId, pair: TradingPair) -> Self {
        Self {
            venue,
            pair,
            bids: Vec::with_capacity(64),
            asks: Vec::with_capacity(64),
            last_update: Utc::now(),
            last_update_id: 0,
            has_snapshot: false,
            subscribed: false,
        }
    }

    pub fn venue(&self) -> VenueId {
        self.venue
    }

    pub fn pair(&self) -> TradingPair {
        self.pair
    }

    /// Apply a snapshot or an incremental update.
    ///
    /// Snapshots replace both ladders, sort them, and truncate the worst
    /// levels beyond `max_depth`. Deltas merge level by level; a delta that
    /// would leave both sides empty is dropped, and one that would cross the
    /// book is rejected with the book unchanged.
    pub fn apply(
        &mut self,
        bids: &[PriceLevel],
        asks: &[PriceLevel],
        is_snapshot: bool,
        max_depth: usize,
    ) -> UpdateOutcome {
        let old_top = (self.top(true), self.top(false));

        if is_snapshot {
            let mut new_bids: Vec<PriceLevel> =
                bids.iter().copied().filter(|l| l.qty > Decimal::ZERO).collect();
            let mut new_asks: Vec<PriceLevel> =
                asks.iter().copied().filter(|l| l.qty > Decimal::ZERO).collect();
            sort_side(&mut new_bids, true);
            sort_side(&mut new_asks, false);
            dedup_side(&mut new_bids);
            dedup_side(&mut new_asks);
            new_bids.truncate(max_depth);
            new_asks.truncate(max_depth);

            if is_crossed(&new_bids, &new_asks) {
                return UpdateOutcome::Error;
            }

            self.bids = new_bids;
            self.asks = new_asks;
            self.has_snapshot = true;
        } else {
            // Single-level deltas take the binary-search path; larger ones
            // are sorted once and merged linearly against the ladder.
            let mut new_bids = merge_delta(&self.bids, bids, true, max_depth);
            let mut new_asks = merge_delta(&self.asks, asks, false, max_depth);

            if new_bids.is_empty() && new_asks.is_empty() {
                return UpdateOutcome::UnchangedBest;
            }
            if is_crossed(&new_bids, &new_asks) {
                return UpdateOutcome::Error;
            }

            new_bids.truncate(max_depth);
            new_asks.truncate(max_depth);
            self.bids = new_bids;
            self.asks = new_asks;
        }

        self.last_update = Utc::now();
        if old_top == (self.top(true), self.top(false)) {
            UpdateOutcome::UnchangedBest
        } else {
            UpdateOutcome::BestChanged
        }
    }

    /// Replace the book with a single best level per side.
    ///
    /// Used for venues that stream only top-of-book; any deeper ladder from a
    /// previous snapshot is cleared so stale depth cannot leak into reads.
    pub fn set_best_bid_ask(
        &mut self,
        bid_price: Decimal,
        bid_qty: Decimal,
        ask_price: Decimal,
        ask_qty: Decimal,
    ) -> UpdateOutcome {
        let old_top = (self.top(true), self.top(false));

        let bids = if bid_qty > Decimal::ZERO {
            vec![PriceLevel::new(bid_price, bid_qty)]
        } else {
            Vec::new()
        };
        let asks = if ask_qty > Decimal::ZERO {
            vec![PriceLevel::new(ask_price, ask_qty)]
        } else {
            Vec::new()
        };
        if is_crossed(&bids, &asks) {
            return UpdateOutcome::Error;
        }
        self.bids = bids;
        self.asks = asks;
        self.last_update = Utc::now();

        if old_top == (self.top(true), self.top(false)) {
            UpdateOutcome::UnchangedBest
        } else {
            UpdateOutcome::BestChanged
        }
    }

    fn top(&self, is_bid: bool) -> Option<PriceLevel> {
        if is_bid {
            self.bids.first().copied()
        } else {
            self.asks.first().copied()
        }
    }

    pub fn best_bid(&self) -> Decimal {
        self.bids.first().map(|l| l.price).unwrap_or_default()
    }

    pub fn best_ask(&self) -> Decimal {
        self.asks.first().map(|l| l.price).unwrap_or_default()
    }

    pub fn best_bid_qty(&self) -> Decimal {
        self.bids.first().map(|l| l.qty).unwrap_or_default()
    }

    pub fn best_ask_qty(&self) -> Decimal {
        self.asks.first().map(|l| l.qty).unwrap_or_default()
    }

    pub fn worst_bid(&self) -> Decimal {
        self.bids.last().map(|l| l.price).unwrap_or_default()
    }

    pub fn worst_ask(&self) -> Decimal {
        self.asks.last().map(|l| l.price).unwrap_or_default()
    }

    /// Both tops and both worst levels in one read.
    pub fn best_prices(&self) -> BestPrices {
        BestPrices {
            best_bid: self.best_bid(),
            best_ask: self.best_ask(),
            best_bid_qty: self.best_bid_qty(),
            best_ask_qty: self.best_ask_qty(),
            worst_bid: self.worst_bid(),
            worst_ask: self.worst_ask(),
        }
    }

    pub fn snapshot_bids(&self) -> Vec<PriceLevel> {
        self.bids.clone()
    }

    pub fn snapshot_asks(&self) -> Vec<PriceLevel> {
        self.asks.clone()
    }

    pub fn bid_depth(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_depth(&self) -> usize {
        self.asks.len()
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    pub fn last_update_id(&self) -> i64 {
        self.last_update_id
    }

    pub fn set_last_update_id(&mut self, id: i64) {
        self.last_update_id = id;
    }

    pub fn has_snapshot(&self) -> bool {
        self.has_snapshot
    }

    pub fn set_has_snapshot(&mut self, value: bool) {
        self.has_snapshot = value;
    }

    pub fn subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn set_subscribed(&mut self, value: bool) {
        self.subscribed = value;
    }
}

/// Merge two already-sorted ladders of the same side into one, dropping
/// zero-quantity entries, preferring `updates` on equal prices, and stopping
/// once `max_depth` levels have accumulated.
pub fn merge_sorted(
    current: &[PriceLevel],
    updates: &[PriceLevel],
    is_bid: bool,
    max_depth: usize,
) -> Vec<PriceLevel> {
    let mut out = Vec::with_capacity(max_depth.min(current.len() + updates.len()));
    let mut i = 0;
    let mut j = 0;

    while out.len() < max_depth && (i < current.len() || j < updates.len()) {
        let take_update = match (current.get(i), updates.get(j)) {
            (Some(c), Some(u)) => {
                if c.price == u.price {
                    i += 1; // the update supersedes the current level
                    true
                } else if is_bid {
                    u.price > c.price
                } else {
                    u.price < c.price
                }
            }
            (None, Some(_)) => true,
            (Some(_), None) => false,
            (None, None) => break,
        };

        let level = if take_update {
            let l = updates[j];
            j += 1;
            l
        } else {
            let l = current[i];
            i += 1;
            l
        };
        if level.qty > Decimal::ZERO {
            out.push(level);
        }
    }
    out
}

/// Apply a delta to one side without committing it.
fn merge_delta(
    current: &[PriceLevel],
    delta: &[PriceLevel],
    is_bid: bool,
    max_depth: usize,
) -> Vec<PriceLevel> {
    if delta.len() <= 1 {
        let mut out = current.to_vec();
        for level in delta {
            merge_level(&mut out, *level, is_bid);
        }
        out
    } else {
        let mut sorted = delta.to_vec();
        sort_side(&mut sorted, is_bid);
        dedup_side(&mut sorted);
        merge_sorted(current, &sorted, is_bid, max_depth)
    }
}

fn sort_side(levels: &mut [PriceLevel], is_bid: bool) {
    if is_bid {
        levels.sort_unstable_by(|a, b| b.price.cmp(&a.price));
    } else {
        levels.sort_unstable_by(|a, b| a.price.cmp(&b.price));
    }
}

fn dedup_side(levels: &mut Vec<PriceLevel>) {
    levels.dedup_by(|a, b| a.price == b.price);
}

fn is_crossed(bids: &[PriceLevel], asks: &[PriceLevel]) -> bool {
    match (bids.first(), asks.first()) {
        (Some(bid), Some(ask)) => bid.price >= ask.price,
        _ => false,
    }
}

/// Binary-search insert/overwrite/remove of a single level.
fn merge_level(levels: &mut Vec<PriceLevel>, level: PriceLevel, is_bid: bool) {
    let search = levels.binary_search_by(|probe| {
        if is_bid {
            probe.price.cmp(&level.price).reverse()
        } else {
            probe.price.cmp(&level.price)
        }
    });

    match search {
        Ok(index) => {
            if level.qty > Decimal::ZERO {
                levels[index].qty = level.qty;
            } else {
                levels.remove(index);
            }
        }
        Err(index) => {
            if level.qty > Decimal::ZERO {
                levels.insert(index, level);
            }
        }
    }
}

pub fn is_sorted(levels: &[PriceLevel], is_bid: bool) -> bool {
    levels.windows(2).all(|w| {
        if is_bid {
            w[0].price > w[1].price
        } else {
            w[0].price < w[1].price
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn level(price: &str, qty: &str) -> PriceLevel {
        PriceLevel::new(price.parse().unwrap(), qty.parse().unwrap())
    }

    fn book() -> OrderBook {
        OrderBook::new(VenueId::Binance, TradingPair::BtcUsdt)
    }

    #[test]
    fn snapshot_sorts_both_sides() {
        let mut b = book();
        let outcome = b.apply(
            &[level("100", "1"), level("102", "2"), level("101", "3")],
            &[level("105", "1"), level("103", "2"), level("104", "3")],
            true,
            100,
        );
        assert_eq!(outcome, UpdateOutcome::BestChanged);
        assert!(b.has_snapshot());
        assert_eq!(b.best_bid(), dec!(102));
        assert_eq!(b.best_ask(), dec!(103));
        assert_eq!(b.worst_bid(), dec!(100));
        assert_eq!(b.worst_ask(), dec!(105));
        assert!(is_sorted(&b.snapshot_bids(), true));
        assert!(is_sorted(&b.snapshot_asks(), false));
    }

    #[test]
    fn snapshot_respects_max_depth() {
        let mut b = book();
        let bids: Vec<PriceLevel> = (1..=20)
            .map(|i| PriceLevel::new(Decimal::from(i), dec!(1)))
            .collect();
        b.apply(&bids, &[], true, 5);
        assert_eq!(b.bid_depth(), 5);
        // Worst levels are the ones evicted.
        assert_eq!(b.best_bid(), dec!(20));
        assert_eq!(b.worst_bid(), dec!(16));
    }

    #[test]
    fn delta_inserts_overwrites_and_removes() {
        let mut b = book();
        b.apply(
            &[level("100", "1"), level("99", "2")],
            &[level("101", "1")],
            true,
            100,
        );

        // Overwrite best bid quantity.
        let outcome = b.apply(&[level("100", "5")], &[], false, 100);
        assert_eq!(outcome, UpdateOutcome::BestChanged);
        assert_eq!(b.best_bid_qty(), dec!(5));

        // Insert below the top: best unchanged.
        let outcome = b.apply(&[level("98", "4")], &[], false, 100);
        assert_eq!(outcome, UpdateOutcome::UnchangedBest);
        assert_eq!(b.bid_depth(), 3);

        // Remove the top.
        let outcome = b.apply(&[level("100", "0")], &[], false, 100);
        assert_eq!(outcome, UpdateOutcome::BestChanged);
        assert_eq!(b.best_bid(), dec!(99));
    }

    #[test]
    fn delta_emptying_both_sides_is_rejected() {
        let mut b = book();
        b.apply(&[level("100", "1")], &[level("101", "1")], true, 100);

        let outcome = b.apply(&[level("100", "0")], &[level("101", "0")], false, 100);
        assert_eq!(outcome, UpdateOutcome::UnchangedBest);
        assert_eq!(b.best_bid(), dec!(100));
        assert_eq!(b.best_ask(), dec!(101));
    }

    #[test]
    fn crossing_delta_is_rejected_and_book_unchanged() {
        let mut b = book();
        b.apply(&[level("100", "1")], &[level("101", "1")], true, 100);

        let outcome = b.apply(&[], &[level("99", "1")], false, 100);
        assert_eq!(outcome, UpdateOutcome::Error);
        assert_eq!(b.best_bid(), dec!(100));
        assert_eq!(b.best_ask(), dec!(101));
        assert_eq!(b.ask_depth(), 1);
    }

    #[test]
    fn snapshot_then_no_deltas_is_the_snapshot() {
        let mut b = book();
        let bids = [level("100", "1"), level("99", "2")];
        let asks = [level("101", "3")];
        b.apply(&bids, &asks, true, 100);
        assert_eq!(b.snapshot_bids(), bids.to_vec());
        assert_eq!(b.snapshot_asks(), asks.to_vec());
    }

    #[test]
    fn disjoint_deltas_compose() {
        let snapshot_bids = [level("100", "1"), level("99", "2"), level("98", "3")];
        let snapshot_asks = [level("101", "1")];

        let d1_bids = [level("99", "7")];
        let d2_bids = [level("97", "4")];
        let merged: Vec<PriceLevel> = d1_bids.iter().chain(d2_bids.iter()).copied().collect();

        let mut sequential = book();
        sequential.apply(&snapshot_bids, &snapshot_asks, true, 100);
        sequential.apply(&d1_bids, &[], false, 100);
        sequential.apply(&d2_bids, &[], false, 100);

        let mut combined = book();
        combined.apply(&snapshot_bids, &snapshot_asks, true, 100);
        combined.apply(&merged, &[], false, 100);

        assert_eq!(sequential.snapshot_bids(), combined.snapshot_bids());
        assert_eq!(sequential.snapshot_asks(), combined.snapshot_asks());
    }

    #[test]
    fn set_best_bid_ask_clears_deeper_ladder() {
        let mut b = book();
        b.apply(
            &[level("100", "1"), level("99", "2")],
            &[level("101", "1"), level("102", "2")],
            true,
            100,
        );

        let outcome = b.set_best_bid_ask(dec!(100.5), dec!(3), dec!(100.7), dec!(4));
        assert_eq!(outcome, UpdateOutcome::BestChanged);
        assert_eq!(b.bid_depth(), 1);
        assert_eq!(b.ask_depth(), 1);
        assert_eq!(b.best_bid(), dec!(100.5));
        assert_eq!(b.best_ask_qty(), dec!(4));

        // Same values again: no top-of-book change.
        let outcome = b.set_best_bid_ask(dec!(100.5), dec!(3), dec!(100.7), dec!(4));
        assert_eq!(outcome, UpdateOutcome::UnchangedBest);
    }

    #[test]
    fn set_best_bid_ask_rejects_crossed_quotes() {
        let mut b = book();
        let outcome = b.set_best_bid_ask(dec!(101), dec!(1), dec!(100), dec!(1));
        assert_eq!(outcome, UpdateOutcome::Error);
        assert_eq!(b.bid_depth(), 0);
    }

    #[test]
    fn merge_sorted_prefers_updates_and_caps_depth() {
        let current = [level("101", "1"), level("103", "3")];
        let updates = [level("101", "5"), level("102", "2"), level("104", "0")];

        let merged = merge_sorted(&current, &updates, false, 10);
        assert_eq!(
            merged,
            vec![level("101", "5"), level("102", "2"), level("103", "3")]
        );

        let capped = merge_sorted(&current, &updates, false, 2);
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0], level("101", "5"));
    }

    #[test]
    fn merge_sorted_descending_bids() {
        let current = [level("100", "1"), level("98", "2")];
        let updates = [level("99", "3")];
        let merged = merge_sorted(&current, &updates, true, 10);
        assert_eq!(
            merged,
            vec![level("100", "1"), level("99", "3"), level("98", "2")]
        );
    }
}
