//! Orders and accepted opportunities: the execution state machines' data.

use crate::domain::opportunity::Opportunity;
use crate::domain::pair::TradingPair;
use crate::domain::venue::VenueId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        })
    }
}

/// Order lifecycle states.
///
/// The derived ordering is load-bearing: the execution manager compares
/// states with `<`/`>=` against `Executed`, and `Cancelled`/`Timeout` count
/// as "past executed" terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OrderState {
    None,
    New,
    PartiallyExecuted,
    Executed,
    Cancelled,
    Timeout,
}

impl fmt::Display for OrderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrderState::None => "NONE",
            OrderState::New => "NEW",
            OrderState::PartiallyExecuted => "PART_EXECUTED",
            OrderState::Executed => "EXECUTED",
            OrderState::Cancelled => "CANCELLED",
            OrderState::Timeout => "TIMEOUT",
        })
    }
}

/// One recorded state transition, with the latency from request to apply.
#[derive(Debug, Clone, Copy)]
pub struct OrderHistoryEntry {
    pub requested_at: DateTime<Utc>,
    pub state: OrderState,
    pub delay_micros: i64,
}

impl OrderHistoryEntry {
    pub fn new(requested_at: DateTime<Utc>, state: OrderState) -> Self {
        let delay_micros = (Utc::now() - requested_at).num_microseconds().unwrap_or(0);
        Self {
            requested_at,
            state,
            delay_micros,
        }
    }
}

/// One leg of a two-leg execution.
#[derive(Debug, Clone)]
pub struct Order {
    pub id: u64,
    pub venue: VenueId,
    pub pair: TradingPair,
    pub side: Side,
    pub price: Decimal,
    pub qty: Decimal,
    pub executed_qty: Decimal,
    pub executed_price: Decimal,
    /// Id assigned by the venue once the order is accepted
    pub venue_order_id: Option<String>,
    pub state: OrderState,
    pub history: Vec<OrderHistoryEntry>,
}

impl Order {
    pub fn new(
        id: u64,
        venue: VenueId,
        pair: TradingPair,
        side: Side,
        price: Decimal,
        qty: Decimal,
    ) -> Self {
        let mut order = Self {
            id,
            venue,
            pair,
            side,
            price,
            qty,
            executed_qty: Decimal::ZERO,
            executed_price: Decimal::ZERO,
            venue_order_id: None,
            state: OrderState::None,
            history: Vec::new(),
        };
        order.set_state(OrderState::New, Utc::now());
        order
    }

    /// Apply a state transition and append it to the history.
    pub fn set_state(&mut self, state: OrderState, requested_at: DateTime<Utc>) {
        self.state = state;
        self.history.push(OrderHistoryEntry::new(requested_at, state));
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Order {} {} {} {} {}@{}",
            self.id, self.venue, self.pair, self.side, self.qty, self.price
        )
    }
}

/// Accepted-opportunity lifecycle states.
///
/// Ordering is load-bearing: `>= ExecutedAsPlanned` means the timeout timer
/// has nothing left to guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OpportunityState {
    Accepted,
    Executing,
    PartiallyExecuted,
    Cancelling,
    Cancelled,
    ExecutedAsPlanned,
    ExecutionTimeout,
}

impl fmt::Display for OpportunityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OpportunityState::Accepted => "ACCEPTED",
            OpportunityState::Executing => "EXECUTING",
            OpportunityState::PartiallyExecuted => "PART_EXECUTED",
            OpportunityState::Cancelling => "CANCELLING",
            OpportunityState::Cancelled => "CANCELLED",
            OpportunityState::ExecutedAsPlanned => "EXEC_AS_PLANNED",
            OpportunityState::ExecutionTimeout => "EXEC_TIMEOUT",
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct OpportunityHistoryEntry {
    pub requested_at: DateTime<Utc>,
    pub state: OpportunityState,
    pub buy_state: OrderState,
    pub sell_state: OrderState,
    pub delay_micros: i64,
}

impl OpportunityHistoryEntry {
    pub fn new(
        requested_at: DateTime<Utc>,
        state: OpportunityState,
        buy_state: OrderState,
        sell_state: OrderState,
    ) -> Self {
        let delay_micros = (Utc::now() - requested_at).num_microseconds().unwrap_or(0);
        Self {
            requested_at,
            state,
            buy_state,
            sell_state,
            delay_micros,
        }
    }
}

/// An opportunity the execution manager committed to, with its two legs.
#[derive(Debug, Clone)]
pub struct AcceptedOpportunity {
    pub id: u64,
    pub opportunity: Opportunity,
    /// Zero until the PLACE action assigns the legs
    pub buy_order_id: u64,
    pub sell_order_id: u64,
    pub state: OpportunityState,
    pub timeout_timer_id: Option<u64>,
    pub history: Vec<OpportunityHistoryEntry>,
}

impl AcceptedOpportunity {
    pub fn new(id: u64, opportunity: Opportunity) -> Self {
        Self {
            id,
            opportunity,
            buy_order_id: 0,
            sell_order_id: 0,
            state: OpportunityState::Accepted,
            timeout_timer_id: None,
            history: Vec::new(),
        }
    }

    /// Apply a state transition, recording both leg states alongside.
    pub fn set_state(
        &mut self,
        state: OpportunityState,
        buy_state: OrderState,
        sell_state: OrderState,
    ) {
        self.state = state;
        self.history.push(OpportunityHistoryEntry::new(
            Utc::now(),
            state,
            buy_state,
            sell_state,
        ));
    }
}

impl fmt::Display for AcceptedOpportunity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AccOpp {}: {} buy:{} sell:{} {}",
            self.id, self.state, self.buy_order_id, self.sell_order_id, self.opportunity
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn order_state_ordering_matches_lattice() {
        assert!(OrderState::New < OrderState::PartiallyExecuted);
        assert!(OrderState::PartiallyExecuted < OrderState::Executed);
        // Terminal cancellation states compare past Executed.
        assert!(OrderState::Cancelled >= OrderState::Executed);
        assert!(OrderState::Timeout >= OrderState::Executed);
    }

    #[test]
    fn new_order_starts_in_new_with_history() {
        let order = Order::new(
            1,
            VenueId::Binance,
            TradingPair::BtcUsdt,
            Side::Buy,
            dec!(100),
            dec!(1),
        );
        assert_eq!(order.state, OrderState::New);
        assert_eq!(order.history.len(), 1);
        assert_eq!(order.history[0].state, OrderState::New);
    }

    #[test]
    fn state_transitions_accumulate_history() {
        let mut order = Order::new(
            1,
            VenueId::Kraken,
            TradingPair::EthUsdt,
            Side::Sell,
            dec!(100),
            dec!(1),
        );
        order.set_state(OrderState::Executed, Utc::now());
        order.set_state(OrderState::Cancelled, Utc::now());
        let states: Vec<OrderState> = order.history.iter().map(|h| h.state).collect();
        assert_eq!(
            states,
            vec![OrderState::New, OrderState::Executed, OrderState::Cancelled]
        );
    }

    #[test]
    fn opportunity_state_ordering() {
        assert!(OpportunityState::Accepted < OpportunityState::ExecutedAsPlanned);
        assert!(OpportunityState::ExecutionTimeout >= OpportunityState::ExecutedAsPlanned);
    }
}
