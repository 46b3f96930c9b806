//! # CrossArb
//!
//! Cross-exchange market-data aggregation and two-leg arbitrage execution.
//!
//! The crate is split the usual way:
//! - [`domain`]: venues, trading pairs, order books, opportunities, orders
//! - [`infrastructure`]: timers, book manager, venue clients, REST, config
//! - [`application`]: the arbitrage strategy and the execution manager

pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use application::execution::{
    order_update_channel, ExecutionGateway, ExecutionManager, NullGateway, OrderUpdate,
    VenueGateway,
};
pub use application::strategy::ArbStrategy;
pub use domain::opportunity::Opportunity;
pub use domain::order::{AcceptedOpportunity, Order, OrderState, OpportunityState, Side};
pub use domain::orderbook::{OrderBook, PriceLevel, UpdateOutcome};
pub use domain::pair::TradingPair;
pub use domain::venue::VenueId;
pub use error::{ExecutionError, VenueError};
pub use infrastructure::balances::BalanceBook;
pub use infrastructure::books::OrderBookManager;
pub use infrastructure::config::Settings;
pub use infrastructure::counters::AnomalyCounters;
pub use infrastructure::registry::VenueRegistry;
pub use infrastructure::timers::{TimerId, TimerKind, TimerService};
pub use infrastructure::venue::{create_venue_client, VenueClient, VenueDeps};
