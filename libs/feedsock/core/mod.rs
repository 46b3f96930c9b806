pub mod client;
pub mod state;

pub use client::{FeedSender, FeedSession, SessionConfig};
pub use state::{ConnectionState, SessionMetrics};
