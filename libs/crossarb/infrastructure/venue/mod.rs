//! Venue clients: one adapter per exchange over shared WebSocket + REST
//! machinery.
//!
//! Each adapter owns a [`feedsock::FeedSession`] for market data and a
//! [`RestClient`] for orders/snapshots. Frame parsing runs on the session's
//! handler thread; REST calls are async and subject to the venue cooldown.

pub mod binance;
pub mod bybit;
pub mod crypto;
pub mod http;
pub mod kraken;
pub mod kucoin;
pub mod okx;

pub use http::{cooldown_minutes, HmacSha256Signer, NoopSigner, RateLimitHeader, RestClient, Signer};

use crate::domain::order::Side;
use crate::domain::orderbook::PriceLevel;
use crate::domain::pair::TradingPair;
use crate::domain::venue::VenueId;
use crate::error::VenueError;
use crate::infrastructure::books::OrderBookManager;
use crate::infrastructure::config::Settings;
use crate::infrastructure::counters::{bump, AnomalyCounters};
use crate::infrastructure::timers::{TimerKind, TimerService};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{info, warn};

/// Shared collaborators injected into every venue client.
#[derive(Clone)]
pub struct VenueDeps {
    pub books: Arc<OrderBookManager>,
    pub timers: Arc<TimerService>,
    pub counters: Arc<AnomalyCounters>,
    pub settings: Arc<Settings>,
}

/// Feed reconciliation state per (venue, pair).
#[derive(Debug, Clone, Copy, Default)]
pub struct SymbolState {
    pub subscribed: bool,
    pub has_snapshot: bool,
    pub last_update_id: i64,
    pub first_update_processed: bool,
}

pub type SharedSymbolStates = Arc<Mutex<HashMap<TradingPair, SymbolState>>>;

pub fn new_symbol_states(pairs: &[TradingPair]) -> SharedSymbolStates {
    Arc::new(Mutex::new(
        pairs.iter().map(|&p| (p, SymbolState::default())).collect(),
    ))
}

/// The per-venue capability set.
#[async_trait]
pub trait VenueClient: Send + Sync {
    fn venue(&self) -> VenueId;

    /// TLS WebSocket handshake plus receive/write pumps.
    async fn connect(&self) -> Result<(), VenueError>;

    /// Close the socket and stop the session threads; book state survives.
    async fn disconnect(&self);

    /// Send the venue-specific subscribe frame(s) for all configured pairs.
    fn subscribe_order_book(&self) -> Result<(), VenueError>;

    /// Unsubscribe-then-subscribe the listed pairs.
    fn resubscribe(&self, pairs: &[TradingPair]) -> Result<(), VenueError>;

    /// REST depth bootstrap where the venue provides one; no-op elsewhere.
    async fn fetch_order_book_snapshot(&self, pair: TradingPair) -> Result<(), VenueError>;

    async fn place_order(
        &self,
        pair: TradingPair,
        side: Side,
        price: Decimal,
        qty: Decimal,
    ) -> Result<String, VenueError>;

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError>;

    async fn fetch_balance(&self, asset: &str) -> Result<Decimal, VenueError>;

    fn is_connected(&self) -> bool;

    fn in_cooldown(&self) -> bool;
}

/// Build the adapter for `venue`.
pub fn create_venue_client(
    venue: VenueId,
    deps: VenueDeps,
    pairs: Vec<TradingPair>,
    test_mode: bool,
) -> Arc<dyn VenueClient> {
    let client: Arc<dyn VenueClient> = match venue {
        VenueId::Binance => Arc::new(binance::BinanceClient::new(deps.clone(), pairs.clone(), test_mode)),
        VenueId::Kraken => Arc::new(kraken::KrakenClient::new(deps.clone(), pairs.clone(), test_mode)),
        VenueId::Bybit => Arc::new(bybit::BybitClient::new(deps.clone(), pairs.clone(), test_mode)),
        VenueId::Crypto => Arc::new(crypto::CryptoClient::new(deps.clone(), pairs.clone(), test_mode)),
        VenueId::Kucoin => Arc::new(kucoin::KucoinClient::new(deps.clone(), pairs.clone(), test_mode)),
        VenueId::Okx => Arc::new(okx::OkxClient::new(deps.clone(), pairs.clone(), test_mode)),
        VenueId::Unknown => panic!("cannot create a client for VenueId::Unknown"),
    };
    arm_snapshot_validity_timer(&client, &deps, pairs);
    client
}

/// Periodic staleness watchdog: a subscribed book with a snapshot that has
/// not moved within the validity window is resubscribed.
fn arm_snapshot_validity_timer(
    client: &Arc<dyn VenueClient>,
    deps: &VenueDeps,
    pairs: Vec<TradingPair>,
) {
    let weak: Weak<dyn VenueClient> = Arc::downgrade(client);
    let books = Arc::clone(&deps.books);
    let counters = Arc::clone(&deps.counters);
    let validity = Duration::from_millis(deps.settings.snapshot_validity_ms);
    let venue = client.venue();

    deps.timers.add(
        validity,
        TimerKind::SnapshotValidity,
        true,
        move |_| {
            let Some(client) = weak.upgrade() else {
                return;
            };
            if !client.is_connected() {
                return;
            }
            let mut stale = Vec::new();
            for &pair in &pairs {
                let Some(book) = books.book(venue, pair) else {
                    continue;
                };
                let (has_snapshot, last_update) = {
                    let book = book.read();
                    (book.has_snapshot(), book.last_update())
                };
                let age = Utc::now() - last_update;
                if has_snapshot && age.num_milliseconds() > validity.as_millis() as i64 {
                    stale.push(pair);
                }
            }
            if !stale.is_empty() {
                warn!(%venue, ?stale, "stale books, resubscribing");
                bump(&counters.stale_snapshot);
                if let Err(e) = client.resubscribe(&stale) {
                    warn!(%venue, "resubscribe after staleness failed: {e}");
                }
            }
        },
    );
    info!(%venue, "snapshot validity watchdog armed");
}

// ---------------------------------------------------------------------------
// Decimal and frame parsing helpers shared by the adapters
// ---------------------------------------------------------------------------

/// Parse a decimal from a string, accepting scientific notation ("5.3e-05").
pub fn decimal_from_str(s: &str) -> Option<Decimal> {
    if s.contains(['e', 'E']) {
        Decimal::from_scientific(s).ok()
    } else {
        Decimal::from_str(s).ok()
    }
}

/// Parse a decimal from a JSON string or number without a float round-trip.
pub fn decimal_from_json(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => decimal_from_str(s),
        serde_json::Value::Number(n) => decimal_from_str(&n.to_string()),
        _ => None,
    }
}

/// Parse `[["price","qty",...], ...]` ladders (Binance, Bybit, KuCoin, OKX).
pub fn levels_from_pairs(value: &serde_json::Value) -> Option<Vec<PriceLevel>> {
    let rows = value.as_array()?;
    let mut levels = Vec::with_capacity(rows.len());
    for row in rows {
        let row = row.as_array()?;
        let price = decimal_from_json(row.first()?)?;
        let qty = decimal_from_json(row.get(1)?)?;
        levels.push(PriceLevel::new(price, qty));
    }
    Some(levels)
}

/// 8-decimal fixed formatting for order prices and quantities.
pub fn format_fixed8(value: Decimal) -> String {
    let mut v = value;
    v.rescale(8);
    v.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn decimal_parsing_handles_scientific_notation() {
        assert_eq!(decimal_from_str("93888.1"), Some(dec!(93888.1)));
        assert_eq!(decimal_from_str("5.325e-05"), Some(dec!(0.00005325)));
        assert_eq!(decimal_from_str("junk"), None);
    }

    #[test]
    fn decimal_from_json_accepts_strings_and_numbers() {
        assert_eq!(decimal_from_json(&json!("0.001")), Some(dec!(0.001)));
        assert_eq!(decimal_from_json(&json!(42)), Some(dec!(42)));
        assert_eq!(decimal_from_json(&json!(null)), None);
    }

    #[test]
    fn levels_from_pairs_parses_ladders() {
        let value = json!([["100.5", "1.25"], ["100.6", "0"]]);
        let levels = levels_from_pairs(&value).unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].price, dec!(100.5));
        assert_eq!(levels[1].qty, Decimal::ZERO);
        assert!(levels_from_pairs(&json!("nope")).is_none());
    }

    #[test]
    fn fixed8_formatting() {
        assert_eq!(format_fixed8(dec!(1.5)), "1.50000000");
        assert_eq!(format_fixed8(dec!(0.00005325)), "0.00005325");
    }
}
