//! # FeedSock
//!
//! WebSocket session machinery for exchange market-data feeds.
//!
//! A [`FeedSession`] owns one connection to a venue: it dials the endpoint,
//! replays the configured subscription frames after every (re)connect, answers
//! application-level pings, schedules outbound heartbeats, and drains a FIFO
//! write queue through a single writer so producers on any thread can send
//! frames without interleaving partial writes.
//!
//! Incoming frames are handed to a [`FrameHandler`] running on a dedicated OS
//! thread, in receive order.

pub mod core;
pub mod traits;

// Re-export commonly used types
pub use crate::core::{FeedSender, FeedSession, SessionConfig, SessionMetrics};
pub use crate::traits::{
    Endpoint, EndpointProvider, ExponentialBackoff, FeedError, FixedDelay, FrameHandler,
    JsonPassivePing, NeverReconnect, PassivePingDetector, ReconnectionStrategy, Result,
    SessionEvent, StaticEndpoint, TextPassivePing, WsMessage,
};
