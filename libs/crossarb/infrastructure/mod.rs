//! Infrastructure: timers, shared book state, venue clients, configuration.

pub mod balances;
pub mod books;
pub mod config;
pub mod counters;
pub mod logging;
pub mod registry;
pub mod timers;
pub mod venue;
