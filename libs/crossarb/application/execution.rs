//! Two-leg execution: paired buy/sell orders with timeout and cancellation
//! coordination.
//!
//! One coarse mutex guards orders, accepted opportunities, the order-to-
//! opportunity map and the id counters. Venue calls and timer operations run
//! outside that mutex. Order placement is optimistic: a leg transitions to
//! `Executed` when the gateway accepts it, and later venue events (or the
//! simulated fill timer in test mode) confirm or override that state.

use crate::domain::opportunity::Opportunity;
use crate::domain::order::{
    AcceptedOpportunity, Order, OrderState, OpportunityState, Side,
};
use crate::domain::venue::VenueId;
use crate::error::VenueError;
use crate::infrastructure::config::Settings;
use crate::infrastructure::counters::{bump, AnomalyCounters};
use crate::infrastructure::registry::VenueRegistry;
use crate::infrastructure::timers::{TimerKind, TimerService};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Where leg orders go when executed or cancelled.
///
/// The live implementation enqueues venue REST calls; tests substitute their
/// own to script acceptance and rejection per leg.
pub trait ExecutionGateway: Send + Sync {
    /// Submit the order; `Ok` means the venue (or queue) accepted it.
    fn place(&self, order: &Order) -> Result<(), VenueError>;

    /// Request cancellation of a previously placed order.
    fn cancel(&self, order: &Order) -> Result<(), VenueError>;
}

/// Accepts every order without side effects; simulation runs and tests.
pub struct NullGateway;

impl ExecutionGateway for NullGateway {
    fn place(&self, _order: &Order) -> Result<(), VenueError> {
        Ok(())
    }

    fn cancel(&self, _order: &Order) -> Result<(), VenueError> {
        Ok(())
    }
}

enum GatewayCommand {
    Place(Order),
    Cancel(Order),
    Shutdown,
}

/// Asynchronous feedback from the gateway worker or a venue order stream,
/// applied by the execution manager's update worker.
#[derive(Debug, Clone)]
pub enum OrderUpdate {
    /// Venue accepted the placement and assigned its own id
    Accepted { order_id: u64, venue_order_id: String },
    /// Venue rejected the placement; the optimistic leg state is corrected
    Rejected { order_id: u64 },
    /// Venue confirmed the cancellation
    Cancelled { order_id: u64 },
    /// Cancellation never reached the venue
    CancelFailed { order_id: u64 },
    /// Any other transition reported by a venue order stream (fills,
    /// partial fills, venue-side cancels)
    StateChanged { order_id: u64, state: OrderState },
}

/// Channel pair carrying [`OrderUpdate`] events back to the manager.
pub fn order_update_channel() -> (
    crossbeam_channel::Sender<OrderUpdate>,
    crossbeam_channel::Receiver<OrderUpdate>,
) {
    crossbeam_channel::unbounded()
}

/// Live gateway: a worker thread owning its own runtime drains the command
/// queue and performs the venue REST calls.
///
/// Outcomes are reported through the update channel; the worker also keeps
/// its own order-id map so a cancel queued right behind a placement can use
/// the venue id before the manager has stored it.
pub struct VenueGateway {
    tx: crossbeam_channel::Sender<GatewayCommand>,
}

impl VenueGateway {
    pub fn spawn(
        registry: Arc<VenueRegistry>,
        updates: crossbeam_channel::Sender<OrderUpdate>,
    ) -> Arc<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<GatewayCommand>();
        std::thread::Builder::new()
            .name("order-gateway".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("gateway runtime");
                let mut venue_ids: HashMap<u64, String> = HashMap::new();
                while let Ok(command) = rx.recv() {
                    match command {
                        GatewayCommand::Place(order) => {
                            let Some(client) = registry.client(order.venue) else {
                                error!(%order, "no client for venue");
                                let _ = updates.send(OrderUpdate::Rejected { order_id: order.id });
                                continue;
                            };
                            match runtime.block_on(client.place_order(
                                order.pair,
                                order.side,
                                order.price,
                                order.qty,
                            )) {
                                Ok(venue_order_id) => {
                                    info!(%order, %venue_order_id, "order placed");
                                    venue_ids.insert(order.id, venue_order_id.clone());
                                    let _ = updates.send(OrderUpdate::Accepted {
                                        order_id: order.id,
                                        venue_order_id,
                                    });
                                }
                                Err(e) => {
                                    warn!(%order, "order placement failed: {e}");
                                    let _ = updates.send(OrderUpdate::Rejected { order_id: order.id });
                                }
                            }
                        }
                        GatewayCommand::Cancel(order) => {
                            let Some(client) = registry.client(order.venue) else {
                                error!(%order, "no client for venue");
                                let _ = updates.send(OrderUpdate::CancelFailed { order_id: order.id });
                                continue;
                            };
                            let venue_order_id = order
                                .venue_order_id
                                .clone()
                                .or_else(|| venue_ids.get(&order.id).cloned());
                            let Some(venue_order_id) = venue_order_id else {
                                warn!(%order, "cancel without venue order id");
                                let _ = updates.send(OrderUpdate::CancelFailed { order_id: order.id });
                                continue;
                            };
                            match runtime.block_on(client.cancel_order(&venue_order_id)) {
                                Ok(()) => {
                                    info!(%order, "order cancelled");
                                    let _ = updates.send(OrderUpdate::Cancelled { order_id: order.id });
                                }
                                Err(e) => {
                                    warn!(%order, "order cancel failed: {e}");
                                    let _ = updates.send(OrderUpdate::CancelFailed { order_id: order.id });
                                }
                            }
                        }
                        GatewayCommand::Shutdown => break,
                    }
                }
                debug!("order gateway exiting");
            })
            .expect("spawn gateway thread");
        Arc::new(Self { tx })
    }
}

impl Drop for VenueGateway {
    fn drop(&mut self) {
        let _ = self.tx.send(GatewayCommand::Shutdown);
    }
}

impl ExecutionGateway for VenueGateway {
    fn place(&self, order: &Order) -> Result<(), VenueError> {
        self.tx
            .send(GatewayCommand::Place(order.clone()))
            .map_err(|e| VenueError::Transport {
                venue: order.venue,
                detail: e.to_string(),
            })
    }

    fn cancel(&self, order: &Order) -> Result<(), VenueError> {
        self.tx
            .send(GatewayCommand::Cancel(order.clone()))
            .map_err(|e| VenueError::Transport {
                venue: order.venue,
                detail: e.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    None,
    Place,
    Cancel,
}

#[derive(Default)]
struct ExecState {
    orders: HashMap<u64, Order>,
    opportunities: HashMap<u64, AcceptedOpportunity>,
    order_to_opportunity: HashMap<u64, u64>,
    next_order_id: u64,
    next_opportunity_id: u64,
}

pub struct ExecutionManager {
    state: Mutex<ExecState>,
    timers: Arc<TimerService>,
    settings: Arc<Settings>,
    counters: Arc<AnomalyCounters>,
    gateway: Arc<dyn ExecutionGateway>,
}

impl ExecutionManager {
    pub fn new(
        timers: Arc<TimerService>,
        settings: Arc<Settings>,
        counters: Arc<AnomalyCounters>,
        gateway: Arc<dyn ExecutionGateway>,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ExecState {
                next_order_id: 1,
                next_opportunity_id: 1,
                ..ExecState::default()
            }),
            timers,
            settings,
            counters,
            gateway,
        })
    }

    /// Accept an opportunity: feasibility gate, timeout timer, PLACE.
    pub fn handle_opportunity(self: &Arc<Self>, opportunity: Opportunity) {
        if !opportunity.is_feasible() {
            error!(%opportunity, "opportunity is not feasible");
            return;
        }

        let opp_id = {
            let mut state = self.state.lock();
            let id = state.next_opportunity_id;
            state.next_opportunity_id += 1;
            let mut accepted = AcceptedOpportunity::new(id, opportunity);
            accepted.set_state(OpportunityState::Accepted, OrderState::None, OrderState::None);
            state.opportunities.insert(id, accepted);
            id
        };
        info!(opp = opp_id, %opportunity, "opportunity accepted");

        let manager = Arc::clone(self);
        let timer_id = self.timers.add(
            Duration::from_millis(self.settings.opportunity_timeout_ms),
            TimerKind::OpportunityTimeout,
            false,
            move |_| manager.handle_opportunity_timeout(opp_id),
        );
        {
            let mut state = self.state.lock();
            if let Some(opp) = state.opportunities.get_mut(&opp_id) {
                opp.timeout_timer_id = Some(timer_id);
            }
        }

        self.perform_action(Action::Place, opp_id);
    }

    fn perform_action(self: &Arc<Self>, action: Action, opp_id: u64) {
        match action {
            Action::Place => self.place_legs(opp_id),
            Action::Cancel => self.cancel_legs(opp_id),
            Action::None => {}
        }
    }

    /// Create both legs atomically, then execute each.
    fn place_legs(self: &Arc<Self>, opp_id: u64) {
        let (buy_id, sell_id) = {
            let mut state = self.state.lock();
            let Some(opp) = state.opportunities.get(&opp_id) else {
                error!(opp = opp_id, "place: opportunity not found");
                return;
            };
            if opp.buy_order_id != 0 || opp.sell_order_id != 0 {
                error!(opp = opp_id, "place: opportunity already has orders");
                return;
            }
            let details = opp.opportunity;

            let buy_id = state.next_order_id;
            state.next_order_id += 1;
            state.orders.insert(
                buy_id,
                Order::new(
                    buy_id,
                    details.buy_venue,
                    details.pair,
                    Side::Buy,
                    details.buy_price,
                    details.amount,
                ),
            );
            state.order_to_opportunity.insert(buy_id, opp_id);

            let sell_id = state.next_order_id;
            state.next_order_id += 1;
            state.orders.insert(
                sell_id,
                Order::new(
                    sell_id,
                    details.sell_venue,
                    details.pair,
                    Side::Sell,
                    details.sell_price,
                    details.amount,
                ),
            );
            state.order_to_opportunity.insert(sell_id, opp_id);

            let opp = state.opportunities.get_mut(&opp_id).expect("just read");
            opp.buy_order_id = buy_id;
            opp.sell_order_id = sell_id;
            (buy_id, sell_id)
        };
        info!(opp = opp_id, buy = buy_id, sell = sell_id, "legs placed");

        self.execute_leg(buy_id);
        self.execute_leg(sell_id);
    }

    /// Submit one leg. Acceptance transitions the leg to `Executed` (venue
    /// accepted); rejection leaves it `New` for the timeout path to reap.
    fn execute_leg(self: &Arc<Self>, order_id: u64) {
        let requested_at = Utc::now();
        let snapshot = {
            let state = self.state.lock();
            let Some(order) = state.orders.get(&order_id) else {
                error!(order = order_id, "execute: order not found");
                return;
            };
            order.clone()
        };

        match self.gateway.place(&snapshot) {
            Ok(()) => {
                let mut state = self.state.lock();
                if let Some(order) = state.orders.get_mut(&order_id) {
                    order.set_state(OrderState::Executed, requested_at);
                }
            }
            Err(e) => {
                bump(&self.counters.order_rejected);
                warn!(order = order_id, "leg placement rejected: {e}");
                return;
            }
        }

        // Simulated flow: the venue confirmation arrives a beat later, most
        // of the time.
        if self.settings.test_mode {
            let probability = self.settings.simulated_fill_probability.min(100);
            if rand::thread_rng().gen_range(0..100) < probability {
                let manager = Arc::clone(self);
                self.timers.add(
                    Duration::from_millis(self.settings.simulated_fill_delay_ms),
                    TimerKind::SimulatedFill,
                    false,
                    move |_| {
                        manager.handle_order_state_change(order_id, OrderState::Executed);
                    },
                );
            }
        }
    }

    /// Cancel every leg that has not executed; executed legs are logged and
    /// left alone.
    fn cancel_legs(self: &Arc<Self>, opp_id: u64) {
        let legs = {
            let state = self.state.lock();
            let Some(opp) = state.opportunities.get(&opp_id) else {
                error!(opp = opp_id, "cancel: opportunity not found");
                return;
            };
            if opp.buy_order_id == 0 || opp.sell_order_id == 0 {
                error!(opp = opp_id, "cancel: opportunity has no orders");
                return;
            }
            [opp.buy_order_id, opp.sell_order_id]
        };

        for order_id in legs {
            let requested_at = Utc::now();
            let snapshot = {
                let state = self.state.lock();
                match state.orders.get(&order_id) {
                    Some(order) => order.clone(),
                    None => {
                        error!(order = order_id, "cancel: order not found");
                        continue;
                    }
                }
            };
            if snapshot.state >= OrderState::Executed {
                // Includes already-cancelled legs: nothing left to undo.
                if snapshot.state == OrderState::Executed {
                    error!(order = order_id, "leg already executed, not cancelling");
                }
                continue;
            }

            match self.gateway.cancel(&snapshot) {
                Ok(()) => {
                    let mut state = self.state.lock();
                    if let Some(order) = state.orders.get_mut(&order_id) {
                        order.set_state(OrderState::Cancelled, requested_at);
                    }
                    info!(order = order_id, opp = opp_id, "leg cancelled");
                }
                Err(e) => warn!(order = order_id, "leg cancel failed: {e}"),
            }
        }
    }

    /// Drain live order updates on a dedicated thread until the channel's
    /// senders are gone.
    pub fn spawn_order_update_worker(
        self: &Arc<Self>,
        updates: crossbeam_channel::Receiver<OrderUpdate>,
    ) -> std::thread::JoinHandle<()> {
        let manager = Arc::clone(self);
        std::thread::Builder::new()
            .name("order-updates".into())
            .spawn(move || {
                while let Ok(update) = updates.recv() {
                    manager.apply_order_update(update);
                }
                debug!("order update worker exiting");
            })
            .expect("spawn order update thread")
    }

    /// Apply one gateway or venue-stream event. This is the live counterpart
    /// of the simulated fill timer: acceptance pins the venue order id on the
    /// leg, rejection corrects the optimistic `Executed` state, and stream
    /// transitions feed the decision table directly.
    pub fn apply_order_update(self: &Arc<Self>, update: OrderUpdate) {
        match update {
            OrderUpdate::Accepted {
                order_id,
                venue_order_id,
            } => {
                let mut state = self.state.lock();
                match state.orders.get_mut(&order_id) {
                    Some(order) => order.venue_order_id = Some(venue_order_id),
                    None => error!(order = order_id, "acceptance for unknown order"),
                }
            }
            OrderUpdate::Rejected { order_id } => {
                bump(&self.counters.order_rejected);
                self.handle_order_state_change(order_id, OrderState::Cancelled);
            }
            OrderUpdate::Cancelled { order_id } => {
                debug!(order = order_id, "venue confirmed cancel");
            }
            OrderUpdate::CancelFailed { order_id } => {
                warn!(order = order_id, "cancel did not reach the venue");
            }
            OrderUpdate::StateChanged { order_id, state } => {
                self.handle_order_state_change(order_id, state);
            }
        }
    }

    /// Venue (or simulated) order event: apply the leg state, then walk the
    /// two-leg decision table.
    pub fn handle_order_state_change(self: &Arc<Self>, order_id: u64, new_state: OrderState) {
        let mut action = Action::None;
        let mut stop_timer: Option<u64> = None;
        let mut profit = None;

        let opp_id = {
            let mut state = self.state.lock();
            let Some(order) = state.orders.get_mut(&order_id) else {
                error!(order = order_id, ?new_state, "state change for unknown order");
                return;
            };
            order.set_state(new_state, Utc::now());

            let Some(&opp_id) = state.order_to_opportunity.get(&order_id) else {
                error!(order = order_id, "order not mapped to opportunity");
                return;
            };
            let (buy_id, sell_id) = {
                let Some(opp) = state.opportunities.get(&opp_id) else {
                    error!(opp = opp_id, "opportunity not found");
                    return;
                };
                (opp.buy_order_id, opp.sell_order_id)
            };
            let buy = state.orders.get(&buy_id).map(|o| o.state);
            let sell = state.orders.get(&sell_id).map(|o| o.state);
            let (Some(buy), Some(sell)) = (buy, sell) else {
                error!(opp = opp_id, "legs missing");
                return;
            };

            let opp = state.opportunities.get_mut(&opp_id).expect("just read");

            use OrderState::*;
            if buy == New && sell == New {
                // Impossible after placement; treat as a failed pair.
                error!(opp = opp_id, "state change while both legs NEW");
                opp.set_state(OpportunityState::Cancelled, buy, sell);
            } else if buy == Executed && sell == Executed {
                opp.set_state(OpportunityState::ExecutedAsPlanned, buy, sell);
                stop_timer = opp.timeout_timer_id;
            } else if (buy == PartiallyExecuted || sell == PartiallyExecuted)
                && (buy <= Executed || sell <= Executed)
            {
                opp.set_state(OpportunityState::PartiallyExecuted, buy, sell);
            } else if buy == Cancelled || sell == Cancelled {
                if buy < Executed || sell < Executed {
                    // The timeout timer stays armed: it is the only thing
                    // left to reap the pair if the follow-up cancel fails.
                    opp.set_state(OpportunityState::Cancelling, buy, sell);
                    action = Action::Cancel;
                } else {
                    opp.set_state(OpportunityState::Cancelled, buy, sell);
                    stop_timer = opp.timeout_timer_id;
                }
            } else if buy == Timeout || sell == Timeout {
                if buy < Executed || sell < Executed {
                    action = Action::Cancel;
                } else {
                    // The other leg is at or past Executed.
                    opp.set_state(OpportunityState::PartiallyExecuted, buy, sell);
                }
            } else {
                bump(&self.counters.unhandled_transition);
                error!(opp = opp_id, ?buy, ?sell, "unhandled leg state combination");
            }

            if opp.state >= OpportunityState::ExecutedAsPlanned {
                stop_timer = stop_timer.or(opp.timeout_timer_id);
                opp.timeout_timer_id = Option::None;
                if opp.state == OpportunityState::ExecutedAsPlanned {
                    profit = Some(opp.opportunity.profit());
                }
            }
            opp_id
        };

        if let Some(timer_id) = stop_timer {
            self.timers.stop(timer_id);
        }
        if let Some(profit) = profit {
            info!(opp = opp_id, profit = %profit.round_dp(4), "PROFIT");
        } else {
            debug!(opp = opp_id, ?action, "selected action");
        }
        if action != Action::None {
            self.perform_action(action, opp_id);
        }
    }

    /// Opportunity deadline: cancel whatever has not completed.
    pub fn handle_opportunity_timeout(self: &Arc<Self>, opp_id: u64) {
        let mut action = Action::None;
        {
            let mut state = self.state.lock();
            let (buy_id, sell_id) = {
                let Some(opp) = state.opportunities.get(&opp_id) else {
                    error!(opp = opp_id, "timeout for unknown opportunity");
                    return;
                };
                (opp.buy_order_id, opp.sell_order_id)
            };
            let buy = state.orders.get(&buy_id).map(|o| o.state);
            let sell = state.orders.get(&sell_id).map(|o| o.state);
            let (Some(buy), Some(sell)) = (buy, sell) else {
                error!(opp = opp_id, "timeout without orders");
                return;
            };

            use OrderState::*;
            let scenario = if buy == New && sell == New {
                action = Action::Cancel;
                1
            } else if buy >= Executed && sell >= Executed {
                2
            } else {
                action = Action::Cancel;
                3
            };
            if scenario == 3 {
                let opp = state.opportunities.get_mut(&opp_id).expect("just read");
                opp.set_state(OpportunityState::ExecutionTimeout, buy, sell);
            }
            info!(opp = opp_id, scenario, ?buy, ?sell, "opportunity timeout");
        }

        if action != Action::None {
            self.perform_action(action, opp_id);
        }
    }

    // -- copy-out accessors -------------------------------------------------

    pub fn order(&self, order_id: u64) -> Option<Order> {
        self.state.lock().orders.get(&order_id).cloned()
    }

    pub fn opportunity(&self, opp_id: u64) -> Option<AcceptedOpportunity> {
        self.state.lock().opportunities.get(&opp_id).cloned()
    }

    pub fn opportunity_by_order(&self, order_id: u64) -> Option<AcceptedOpportunity> {
        let state = self.state.lock();
        let opp_id = state.order_to_opportunity.get(&order_id)?;
        state.opportunities.get(opp_id).cloned()
    }

    pub fn accepted_opportunities(&self) -> Vec<AcceptedOpportunity> {
        let mut opportunities: Vec<AcceptedOpportunity> =
            self.state.lock().opportunities.values().cloned().collect();
        opportunities.sort_by_key(|o| o.id);
        opportunities
    }

    pub fn orders(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.state.lock().orders.values().cloned().collect();
        orders.sort_by_key(|o| o.id);
        orders
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::pair::TradingPair;
    use rust_decimal_macros::dec;

    fn opportunity() -> Opportunity {
        Opportunity::new(
            VenueId::Binance,
            VenueId::Kraken,
            TradingPair::BtcUsdt,
            dec!(1),
            dec!(100),
            dec!(101),
        )
    }

    fn manager(gateway: Arc<dyn ExecutionGateway>) -> Arc<ExecutionManager> {
        let mut settings = Settings::default();
        settings.opportunity_timeout_ms = 30;
        // Fills far in the future keep the scripted tests deterministic.
        settings.simulated_fill_delay_ms = 600_000;
        ExecutionManager::new(
            TimerService::new(),
            Arc::new(settings),
            AnomalyCounters::new(),
            gateway,
        )
    }

    #[test]
    fn infeasible_opportunity_is_rejected() {
        let m = manager(Arc::new(NullGateway));
        let infeasible = Opportunity::new(
            VenueId::Binance,
            VenueId::Kraken,
            TradingPair::BtcUsdt,
            dec!(1),
            dec!(101),
            dec!(100),
        );
        m.handle_opportunity(infeasible);
        assert!(m.accepted_opportunities().is_empty());
    }

    #[test]
    fn place_creates_two_mapped_legs() {
        let m = manager(Arc::new(NullGateway));
        m.handle_opportunity(opportunity());

        let opps = m.accepted_opportunities();
        assert_eq!(opps.len(), 1);
        let opp = &opps[0];
        assert_ne!(opp.buy_order_id, 0);
        assert_ne!(opp.sell_order_id, 0);
        assert_eq!(opp.sell_order_id, opp.buy_order_id + 1);

        let buy = m.order(opp.buy_order_id).unwrap();
        let sell = m.order(opp.sell_order_id).unwrap();
        assert_eq!(buy.side, Side::Buy);
        assert_eq!(buy.venue, VenueId::Binance);
        assert_eq!(sell.side, Side::Sell);
        assert_eq!(sell.venue, VenueId::Kraken);
        // Optimistic acceptance.
        assert_eq!(buy.state, OrderState::Executed);
        assert_eq!(sell.state, OrderState::Executed);

        assert_eq!(m.opportunity_by_order(opp.buy_order_id).unwrap().id, opp.id);
    }

    #[test]
    fn both_legs_executed_completes_as_planned() {
        let m = manager(Arc::new(NullGateway));
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();

        m.handle_order_state_change(opp.buy_order_id, OrderState::Executed);
        m.handle_order_state_change(opp.sell_order_id, OrderState::Executed);

        let opp = m.opportunity(opp.id).unwrap();
        assert_eq!(opp.state, OpportunityState::ExecutedAsPlanned);
        assert!(opp.timeout_timer_id.is_none());
        // Timeout later is a no-op (scenario 2).
        std::thread::sleep(Duration::from_millis(40));
        m.timers.tick();
        let opp = m.opportunity(opp.id).unwrap();
        assert_eq!(opp.state, OpportunityState::ExecutedAsPlanned);
    }

    /// Gateway that refuses one venue's placements, stranding that leg NEW.
    struct RejectVenue(VenueId);

    impl ExecutionGateway for RejectVenue {
        fn place(&self, order: &Order) -> Result<(), VenueError> {
            if order.venue == self.0 {
                Err(VenueError::OrderRejected {
                    venue: order.venue,
                    reason: "scripted rejection".into(),
                })
            } else {
                Ok(())
            }
        }

        fn cancel(&self, _order: &Order) -> Result<(), VenueError> {
            Ok(())
        }
    }

    /// Gateway that refuses everything: both legs stay NEW.
    struct RejectAll;

    impl ExecutionGateway for RejectAll {
        fn place(&self, order: &Order) -> Result<(), VenueError> {
            Err(VenueError::OrderRejected {
                venue: order.venue,
                reason: "scripted rejection".into(),
            })
        }

        fn cancel(&self, _order: &Order) -> Result<(), VenueError> {
            Ok(())
        }
    }

    #[test]
    fn timeout_with_one_stuck_leg_cancels_it_only() {
        let m = manager(Arc::new(RejectVenue(VenueId::Kraken)));
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();

        let buy = m.order(opp.buy_order_id).unwrap();
        let sell = m.order(opp.sell_order_id).unwrap();
        assert_eq!(buy.state, OrderState::Executed);
        assert_eq!(sell.state, OrderState::New);

        std::thread::sleep(Duration::from_millis(40));
        assert!(m.timers.tick() >= 1);

        let opp = m.opportunity(opp.id).unwrap();
        assert_eq!(opp.state, OpportunityState::ExecutionTimeout);
        let buy = m.order(opp.buy_order_id).unwrap();
        let sell = m.order(opp.sell_order_id).unwrap();
        // The stuck leg is cancelled; the executed one is left alone.
        assert_eq!(sell.state, OrderState::Cancelled);
        assert_eq!(buy.state, OrderState::Executed);
    }

    #[test]
    fn timeout_with_both_legs_new_cancels_both() {
        let m = manager(Arc::new(RejectAll));
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();
        assert_eq!(m.order(opp.buy_order_id).unwrap().state, OrderState::New);

        std::thread::sleep(Duration::from_millis(40));
        m.timers.tick();

        let buy = m.order(opp.buy_order_id).unwrap();
        let sell = m.order(opp.sell_order_id).unwrap();
        assert_eq!(buy.state, OrderState::Cancelled);
        assert_eq!(sell.state, OrderState::Cancelled);
        // Scenario 1 cancels without declaring an execution timeout.
        let opp = m.opportunity(opp.id).unwrap();
        assert_ne!(opp.state, OpportunityState::ExecutionTimeout);
    }

    #[test]
    fn cancelled_leg_with_unexecuted_peer_triggers_cancelling() {
        let m = manager(Arc::new(RejectVenue(VenueId::Kraken)));
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();
        // buy Executed, sell New; a cancel event lands on the buy leg.
        m.handle_order_state_change(opp.buy_order_id, OrderState::Cancelled);

        let opp = m.opportunity(opp.id).unwrap();
        assert_eq!(opp.state, OpportunityState::Cancelling);
        // The peer leg was cancelled by the follow-up action.
        assert_eq!(
            m.order(opp.sell_order_id).unwrap().state,
            OrderState::Cancelled
        );
        // Cancelling is not terminal: the timeout timer stays armed.
        assert!(opp.timeout_timer_id.is_some());
        assert!(!m.timers.is_empty());
    }

    /// Gateway where one venue's placements fail and every cancel fails.
    struct RejectVenueAndCancels(VenueId);

    impl ExecutionGateway for RejectVenueAndCancels {
        fn place(&self, order: &Order) -> Result<(), VenueError> {
            if order.venue == self.0 {
                Err(VenueError::OrderRejected {
                    venue: order.venue,
                    reason: "scripted rejection".into(),
                })
            } else {
                Ok(())
            }
        }

        fn cancel(&self, order: &Order) -> Result<(), VenueError> {
            Err(VenueError::OrderRejected {
                venue: order.venue,
                reason: "scripted cancel failure".into(),
            })
        }
    }

    #[test]
    fn failed_follow_up_cancel_is_reaped_by_timeout() {
        let m = manager(Arc::new(RejectVenueAndCancels(VenueId::Kraken)));
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();
        // buy Executed, sell stuck New; the buy leg gets cancelled, and the
        // follow-up cancel of the sell leg fails.
        m.handle_order_state_change(opp.buy_order_id, OrderState::Cancelled);

        let mid = m.opportunity(opp.id).unwrap();
        assert_eq!(mid.state, OpportunityState::Cancelling);
        assert_eq!(m.order(opp.sell_order_id).unwrap().state, OrderState::New);

        // The still-armed timeout timer is what resolves the stuck pair.
        std::thread::sleep(Duration::from_millis(40));
        assert!(m.timers.tick() >= 1);
        let done = m.opportunity(opp.id).unwrap();
        assert_eq!(done.state, OpportunityState::ExecutionTimeout);
    }

    #[test]
    fn timeout_leg_with_peer_at_or_past_executed_resolves_partially_executed() {
        let m = manager(Arc::new(NullGateway));
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();

        // buy reports Timeout while the sell leg sits at Executed.
        m.handle_order_state_change(opp.buy_order_id, OrderState::Timeout);
        let mid = m.opportunity(opp.id).unwrap();
        assert_eq!(mid.state, OpportunityState::PartiallyExecuted);

        // Both legs timed out: the peer is past Executed, same resolution.
        m.handle_order_state_change(opp.sell_order_id, OrderState::Timeout);
        let done = m.opportunity(opp.id).unwrap();
        assert_eq!(done.state, OpportunityState::PartiallyExecuted);
        assert_eq!(
            m.counters
                .unhandled_transition
                .load(std::sync::atomic::Ordering::Relaxed),
            0
        );
    }

    #[test]
    fn gateway_acceptance_pins_venue_order_id() {
        let m = manager(Arc::new(NullGateway));
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();
        assert!(m.order(opp.buy_order_id).unwrap().venue_order_id.is_none());

        m.apply_order_update(OrderUpdate::Accepted {
            order_id: opp.buy_order_id,
            venue_order_id: "EX-42".into(),
        });
        assert_eq!(
            m.order(opp.buy_order_id).unwrap().venue_order_id.as_deref(),
            Some("EX-42")
        );
    }

    #[test]
    fn rejected_placement_is_corrected_to_cancelled() {
        let m = manager(Arc::new(NullGateway));
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();

        // The venue turned the sell leg down after the optimistic accept.
        m.apply_order_update(OrderUpdate::Rejected {
            order_id: opp.sell_order_id,
        });

        assert_eq!(
            m.order(opp.sell_order_id).unwrap().state,
            OrderState::Cancelled
        );
        // buy Executed, sell Cancelled: terminal Cancelled, timer stopped.
        let opp = m.opportunity(opp.id).unwrap();
        assert_eq!(opp.state, OpportunityState::Cancelled);
        assert!(
            m.counters
                .order_rejected
                .load(std::sync::atomic::Ordering::Relaxed)
                > 0
        );
    }

    #[test]
    fn update_worker_drains_stream_transitions() {
        let m = manager(Arc::new(NullGateway));
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();

        let (tx, rx) = order_update_channel();
        let worker = m.spawn_order_update_worker(rx);
        tx.send(OrderUpdate::StateChanged {
            order_id: opp.buy_order_id,
            state: OrderState::Executed,
        })
        .unwrap();
        tx.send(OrderUpdate::StateChanged {
            order_id: opp.sell_order_id,
            state: OrderState::Executed,
        })
        .unwrap();
        drop(tx);
        worker.join().unwrap();

        let opp = m.opportunity(opp.id).unwrap();
        assert_eq!(opp.state, OpportunityState::ExecutedAsPlanned);
    }

    #[test]
    fn partial_fill_marks_opportunity_partially_executed() {
        let m = manager(Arc::new(NullGateway));
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();

        m.handle_order_state_change(opp.buy_order_id, OrderState::PartiallyExecuted);
        let opp = m.opportunity(opp.id).unwrap();
        assert_eq!(opp.state, OpportunityState::PartiallyExecuted);
    }

    #[test]
    fn simulated_fills_complete_the_pair() {
        let mut settings = Settings::default();
        settings.opportunity_timeout_ms = 60_000;
        settings.simulated_fill_delay_ms = 10;
        settings.simulated_fill_probability = 100;
        let m = ExecutionManager::new(
            TimerService::new(),
            Arc::new(settings),
            AnomalyCounters::new(),
            Arc::new(NullGateway),
        );
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        m.timers.tick();

        let opp = m.opportunity(opp.id).unwrap();
        assert_eq!(opp.state, OpportunityState::ExecutedAsPlanned);
    }

    #[test]
    fn history_records_every_transition() {
        let m = manager(Arc::new(NullGateway));
        m.handle_opportunity(opportunity());
        let opp = m.accepted_opportunities().pop().unwrap();
        m.handle_order_state_change(opp.buy_order_id, OrderState::Executed);
        m.handle_order_state_change(opp.sell_order_id, OrderState::Executed);

        let opp = m.opportunity(opp.id).unwrap();
        let states: Vec<OpportunityState> = opp.history.iter().map(|h| h.state).collect();
        assert_eq!(states.first(), Some(&OpportunityState::Accepted));
        assert_eq!(states.last(), Some(&OpportunityState::ExecutedAsPlanned));

        let buy = m.order(opp.buy_order_id).unwrap();
        assert!(buy.history.len() >= 2);
        assert_eq!(buy.history.first().unwrap().state, OrderState::New);
    }
}
