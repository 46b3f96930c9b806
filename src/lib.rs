//! Root library for the cross-exchange arbitrage bot.
//!
//! Re-exports the workspace crates and carries the shared bin plumbing.

pub mod bin_common;

pub use crossarb;
pub use feedsock;
