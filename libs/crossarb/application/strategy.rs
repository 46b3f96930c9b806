//! Cross-venue arbitrage scan.
//!
//! Registered as the book manager's change callback. Every change (and a
//! periodic rescan) walks all venue pairs in both directions, tracks the
//! best spread seen per direction, and forwards it to execution once it
//! clears the execution margin. A decay timer zeroes the retained bests so
//! a stale maximum cannot latch.

use crate::application::execution::ExecutionManager;
use crate::domain::opportunity::Opportunity;
use crate::domain::pair::TradingPair;
use crate::domain::venue::VenueId;
use crate::infrastructure::books::OrderBookManager;
use crate::infrastructure::config::Settings;
use crate::infrastructure::counters::{bump, AnomalyCounters};
use crate::infrastructure::timers::{TimerKind, TimerService};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct ArbStrategy {
    pair: TradingPair,
    venues: Vec<VenueId>,
    books: Arc<OrderBookManager>,
    execution: Arc<ExecutionManager>,
    counters: Arc<AnomalyCounters>,
    settings: Arc<Settings>,
    /// Best seen per direction: [i->j, j->i] across the venue walk
    best: Mutex<[Opportunity; 2]>,
}

impl ArbStrategy {
    pub fn new(
        pair: TradingPair,
        venues: Vec<VenueId>,
        books: Arc<OrderBookManager>,
        execution: Arc<ExecutionManager>,
        counters: Arc<AnomalyCounters>,
        settings: Arc<Settings>,
    ) -> Arc<Self> {
        Arc::new(Self {
            best: Mutex::new([Opportunity::none(pair), Opportunity::none(pair)]),
            pair,
            venues,
            books,
            execution,
            counters,
            settings,
        })
    }

    pub fn pair(&self) -> TradingPair {
        self.pair
    }

    /// Arm the periodic rescan and best-decay timers.
    pub fn arm_timers(self: &Arc<Self>, timers: &TimerService) {
        let scan = Arc::clone(self);
        timers.add(
            Duration::from_millis(self.settings.strategy_scan_interval_ms),
            TimerKind::StrategyScan,
            true,
            move |_| scan.scan(),
        );
        let decay = Arc::clone(self);
        timers.add(
            Duration::from_millis(self.settings.best_opportunity_reset_ms),
            TimerKind::BestOpportunityReset,
            true,
            move |_| decay.reset_best(),
        );
    }

    /// Book manager change callback.
    pub fn on_book_change(&self, _venue: VenueId, pair: TradingPair) {
        if pair == self.pair {
            self.scan();
        }
    }

    /// Walk every unordered venue pair in both directions.
    pub fn scan(&self) {
        for i in 0..self.venues.len() {
            for j in (i + 1)..self.venues.len() {
                if let Some(opp) = self.evaluate(self.venues[i], self.venues[j]) {
                    self.consider(0, opp);
                }
                if let Some(opp) = self.evaluate(self.venues[j], self.venues[i]) {
                    self.consider(1, opp);
                }
            }
        }
    }

    /// Price one direction off the current tops; `None` when there is no
    /// tradable spread.
    fn evaluate(&self, buy_venue: VenueId, sell_venue: VenueId) -> Option<Opportunity> {
        let buy_book = self.books.best_prices(buy_venue, self.pair)?;
        let sell_book = self.books.best_prices(sell_venue, self.pair)?;

        let buy_price = buy_book.best_ask;
        let sell_price = sell_book.best_bid;
        let amount = buy_book.best_ask_qty.min(sell_book.best_bid_qty);
        let opp = Opportunity::new(
            buy_venue,
            sell_venue,
            self.pair,
            amount,
            buy_price,
            sell_price,
        );

        if buy_price > Decimal::ZERO && sell_price > Decimal::ZERO && !opp.prices_within_band() {
            bump(&self.counters.price_band_anomaly);
            debug!(
                %buy_venue, %sell_venue, pair = %self.pair,
                %buy_price, %sell_price,
                "price dislocation outside sanity band"
            );
            return None;
        }
        if opp.is_feasible() {
            Some(opp)
        } else {
            None
        }
    }

    /// Retain the best opportunity per direction; escalate past the
    /// execution margin.
    fn consider(&self, direction: usize, opp: Opportunity) {
        if opp.profit_pct() <= self.settings.min_traceable_margin_pct {
            return;
        }

        let execute = {
            let mut best = self.best.lock();
            let slot = &mut best[direction];
            if slot.is_empty() || opp.profit_pct() > slot.profit_pct() {
                info!(direction, %opp, "new best opportunity");
                *slot = opp;
            } else {
                debug!(direction, %opp, best = %*slot, "best seen opportunity is better");
            }
            (slot.profit_pct() > self.settings.min_execution_margin_pct).then_some(*slot)
        };

        if let Some(best) = execute {
            info!(%best, "executable opportunity");
            self.execution.handle_opportunity(best);
        }
    }

    /// Decay-timer callback: forget retained bests.
    pub fn reset_best(&self) {
        let mut best = self.best.lock();
        for slot in best.iter_mut() {
            if !slot.is_empty() {
                info!(pair = %self.pair, old = %*slot, "resetting best seen opportunity");
                *slot = Opportunity::none(self.pair);
            }
        }
    }

    /// Current retained bests (diagnostics).
    pub fn best_seen(&self) -> [Opportunity; 2] {
        *self.best.lock()
    }
}
