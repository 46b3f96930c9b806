//! Core traits and types for the FeedSock session library.
//!
//! - **FrameHandler**: consume parsed frames and session events
//! - **EndpointProvider**: resolve the connection URL (possibly per attempt)
//! - **ReconnectionStrategy**: control reconnection behavior
//! - **PassivePingDetector**: detect and answer application-level pings

pub mod endpoint;
pub mod error;
pub mod handler;
pub mod passive_ping;
pub mod reconnect;

pub use endpoint::{Endpoint, EndpointProvider, StaticEndpoint};
pub use error::{FeedError, Result};
pub use handler::{FrameHandler, SessionEvent, WsMessage};
pub use passive_ping::{JsonPassivePing, PassivePingDetector, TextPassivePing};
pub use reconnect::{ExponentialBackoff, FixedDelay, NeverReconnect, ReconnectionStrategy};
