//! Error taxonomy shared across the crate.

use crate::domain::pair::TradingPair;
use crate::domain::venue::VenueId;
use thiserror::Error;

/// Errors surfaced by venue clients (transport, protocol, REST).
#[derive(Debug, Error)]
pub enum VenueError {
    /// Operation invoked before `connect()` completed
    #[error("{0} not connected")]
    NotConnected(VenueId),

    /// Request blocked by the venue cooldown window
    #[error("{venue} in cooldown for {remaining_secs}s")]
    Cooldown {
        venue: VenueId,
        remaining_secs: u64,
    },

    /// JSON missing required fields or wrong shape
    #[error("malformed message from {venue}: {detail}")]
    Protocol { venue: VenueId, detail: String },

    /// Venue symbol does not map to a known pair
    #[error("unknown symbol {symbol} on {venue}")]
    UnknownSymbol { venue: VenueId, symbol: String },

    /// Update id not ahead of the last applied one
    #[error("sequence regression on {venue} {pair}: {update_id} <= {last_update_id}")]
    SequenceRegression {
        venue: VenueId,
        pair: TradingPair,
        update_id: i64,
        last_update_id: i64,
    },

    /// Book integrity check failed
    #[error("checksum mismatch on {venue} {pair}: received {received}, computed {computed}")]
    ChecksumMismatch {
        venue: VenueId,
        pair: TradingPair,
        received: u32,
        computed: u32,
    },

    /// HTTP 429/418/403 class response
    #[error("{venue} rate limited (HTTP {status})")]
    RateLimited { venue: VenueId, status: u16 },

    /// WebSocket or HTTP transport failure
    #[error("transport failure on {venue}: {detail}")]
    Transport { venue: VenueId, detail: String },

    /// Update would cross the book (best bid >= best ask)
    #[error("crossed book on {venue} {pair}")]
    BookCrossed { venue: VenueId, pair: TradingPair },

    /// Venue rejected an order request
    #[error("{venue} rejected order: {reason}")]
    OrderRejected { venue: VenueId, reason: String },

    /// Non-success HTTP status with no more specific classification
    #[error("{venue} HTTP {status}: {body}")]
    Http {
        venue: VenueId,
        status: u16,
        body: String,
    },
}

/// Errors surfaced by the execution manager.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("order {0} not found")]
    UnknownOrder(u64),

    #[error("opportunity {0} not found")]
    UnknownOpportunity(u64),

    #[error("order {0} not mapped to an opportunity")]
    Unmapped(u64),

    #[error("opportunity is not feasible")]
    NotFeasible,

    /// Leg-state combination outside the decision table
    #[error("unhandled state transition for opportunity {0}")]
    UnhandledTransition(u64),
}
