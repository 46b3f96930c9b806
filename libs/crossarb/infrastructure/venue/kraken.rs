//! Kraken adapter: book channel v2 with CRC32 integrity checking.
//!
//! The snapshot arrives inline as the first book message after subscribing;
//! there is no REST bootstrap. Each book message carries a `checksum` over
//! the top ten levels of both sides, validated every Nth update; a mismatch
//! marks the book dirty and resubscribes the pair.

use super::http::{RateLimitHeader, RestClient};
use super::{decimal_from_json, format_fixed8, new_symbol_states, SharedSymbolStates, VenueClient, VenueDeps};
use crate::domain::order::Side;
use crate::domain::orderbook::PriceLevel;
use crate::domain::pair::TradingPair;
use crate::domain::venue::VenueId;
use crate::error::VenueError;
use crate::infrastructure::counters::bump;
use async_trait::async_trait;
use chrono::Utc;
use feedsock::{FeedSender, FeedSession, FrameHandler, SessionConfig, SessionEvent, StaticEndpoint, WsMessage};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

const WS_URL: &str = "wss://ws.kraken.com/ws/v2";
const REST_URL: &str = "https://api.kraken.com";

pub struct KrakenClient {
    deps: VenueDeps,
    pairs: Vec<TradingPair>,
    rest: Arc<RestClient>,
    states: SharedSymbolStates,
    session: Mutex<Option<FeedSession>>,
    sender: Mutex<Option<FeedSender>>,
    resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    test_mode: bool,
}

impl KrakenClient {
    pub fn new(deps: VenueDeps, pairs: Vec<TradingPair>, test_mode: bool) -> Self {
        let rest = Arc::new(RestClient::new(
            VenueId::Kraken,
            REST_URL,
            Arc::new(super::http::NoopSigner),
            Some(RateLimitHeader::Remaining {
                header: "cf-ratelimit-remaining",
                limit: 60,
            }),
        ));
        Self {
            states: new_symbol_states(&pairs),
            deps,
            pairs,
            rest,
            session: Mutex::new(None),
            sender: Mutex::new(None),
            resub_frames: Arc::new(Mutex::new(Vec::new())),
            test_mode,
        }
    }

    fn send_frame(&self, frame: WsMessage) -> Result<(), VenueError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(VenueError::NotConnected(VenueId::Kraken));
        };
        sender.send(frame).map_err(|e| VenueError::Transport {
            venue: VenueId::Kraken,
            detail: e.to_string(),
        })
    }
}

fn book_frame(pairs: &[TradingPair], subscribe: bool) -> WsMessage {
    let symbols: Vec<&str> = pairs
        .iter()
        .filter_map(|p| p.venue_symbol(VenueId::Kraken))
        .collect();
    WsMessage::Text(
        json!({
            "method": if subscribe { "subscribe" } else { "unsubscribe" },
            "params": {"channel": "book", "symbol": symbols}
        })
        .to_string(),
    )
}

#[async_trait]
impl VenueClient for KrakenClient {
    fn venue(&self) -> VenueId {
        VenueId::Kraken
    }

    async fn connect(&self) -> Result<(), VenueError> {
        let config = SessionConfig::new(
            VenueId::Kraken.as_str(),
            Arc::new(StaticEndpoint::new(WS_URL)),
        );
        let deps = self.deps.clone();
        let states = Arc::clone(&self.states);
        let resub = Arc::clone(&self.resub_frames);
        let session = FeedSession::open(config, move |sender| {
            KrakenHandler::new(sender, deps, states, resub)
        })
        .await
        .map_err(|e| VenueError::Transport {
            venue: VenueId::Kraken,
            detail: e.to_string(),
        })?;

        *self.sender.lock() = Some(session.sender());
        *self.session.lock() = Some(session);
        info!(venue = %VenueId::Kraken, "connected");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.sender.lock() = None;
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.shutdown().await;
        }
    }

    fn subscribe_order_book(&self) -> Result<(), VenueError> {
        let frame = book_frame(&self.pairs, true);
        *self.resub_frames.lock() = vec![frame.clone()];
        self.send_frame(frame)
    }

    fn resubscribe(&self, pairs: &[TradingPair]) -> Result<(), VenueError> {
        // Unsubscribe only what is currently subscribed, then subscribe all.
        let subscribed: Vec<TradingPair> = {
            let states = self.states.lock();
            pairs
                .iter()
                .copied()
                .filter(|p| states.get(p).map(|s| s.subscribed).unwrap_or(false))
                .collect()
        };
        if !subscribed.is_empty() {
            self.send_frame(book_frame(&subscribed, false))?;
        }
        let mut states = self.states.lock();
        for pair in pairs {
            if let Some(state) = states.get_mut(pair) {
                state.has_snapshot = false;
            }
        }
        drop(states);
        self.send_frame(book_frame(pairs, true))
    }

    async fn fetch_order_book_snapshot(&self, _pair: TradingPair) -> Result<(), VenueError> {
        // The snapshot arrives inline on the book subscription.
        if !self.is_connected() {
            return Err(VenueError::NotConnected(VenueId::Kraken));
        }
        Ok(())
    }

    async fn place_order(
        &self,
        pair: TradingPair,
        side: Side,
        price: Decimal,
        qty: Decimal,
    ) -> Result<String, VenueError> {
        if self.test_mode {
            return Ok(format!(
                "SIM-KRAKEN-{}",
                Utc::now().timestamp_nanos_opt().unwrap_or(0)
            ));
        }
        if !self.is_connected() {
            return Err(VenueError::NotConnected(VenueId::Kraken));
        }
        let symbol = pair
            .venue_symbol(VenueId::Kraken)
            .ok_or(VenueError::UnknownSymbol {
                venue: VenueId::Kraken,
                symbol: pair.symbol().into(),
            })?;
        let form = [
            ("pair", symbol.to_string()),
            (
                "type",
                match side {
                    Side::Buy => "buy".to_string(),
                    Side::Sell => "sell".to_string(),
                },
            ),
            ("ordertype", "limit".to_string()),
            ("volume", format_fixed8(qty)),
            ("price", format_fixed8(price)),
        ];
        let response = self.rest.post_form("/0/private/AddOrder", &form, true).await?;
        response
            .pointer("/result/txid/0")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| VenueError::OrderRejected {
                venue: VenueId::Kraken,
                reason: response.to_string(),
            })
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError> {
        if self.test_mode {
            return Ok(());
        }
        let form = [("txid", venue_order_id.to_string())];
        self.rest
            .post_form("/0/private/CancelOrder", &form, true)
            .await?;
        Ok(())
    }

    async fn fetch_balance(&self, asset: &str) -> Result<Decimal, VenueError> {
        if self.test_mode {
            return Ok(Decimal::ZERO);
        }
        let response = self.rest.post_form("/0/private/Balance", &[], true).await?;
        Ok(response
            .pointer(&format!("/result/{asset}"))
            .and_then(decimal_from_json)
            .unwrap_or_default())
    }

    fn is_connected(&self) -> bool {
        self.session
            .lock()
            .as_ref()
            .map(|s| s.is_connected())
            .unwrap_or(false)
    }

    fn in_cooldown(&self) -> bool {
        self.rest.is_in_cooldown()
    }
}

// ---------------------------------------------------------------------------
// Checksum
//
// Rules: format the price at the pair's precision and the quantity at 8
// decimals, drop the decimal point, strip leading zeros; concatenate the top
// ten asks (ascending) then the top ten bids (descending); CRC32, seed 0.
// ---------------------------------------------------------------------------

pub fn format_checksum_price(price: Decimal, precision: u32) -> String {
    strip_decimal(price, precision)
}

pub fn format_checksum_qty(qty: Decimal) -> String {
    strip_decimal(qty, 8)
}

fn strip_decimal(value: Decimal, precision: u32) -> String {
    let mut scaled = value;
    scaled.rescale(precision);
    let s: String = scaled.to_string().chars().filter(|c| *c != '.').collect();
    let trimmed = s.trim_start_matches('0');
    trimmed.to_string()
}

/// Concatenated price/qty fragments for the top ten levels of one side.
pub fn checksum_fragment(levels: &[PriceLevel], precision: u32) -> String {
    let mut out = String::new();
    for level in levels.iter().take(10) {
        out.push_str(&format_checksum_price(level.price, precision));
        out.push_str(&format_checksum_qty(level.qty));
    }
    out
}

/// CRC32 over asks-then-bids fragments.
pub fn compute_book_checksum(asks: &[PriceLevel], bids: &[PriceLevel], precision: u32) -> u32 {
    let input = format!(
        "{}{}",
        checksum_fragment(asks, precision),
        checksum_fragment(bids, precision)
    );
    crc32fast::hash(input.as_bytes())
}

// ---------------------------------------------------------------------------
// Frame handler
// ---------------------------------------------------------------------------

struct KrakenHandler {
    sender: FeedSender,
    deps: VenueDeps,
    states: SharedSymbolStates,
    resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    update_count: u64,
}

impl KrakenHandler {
    fn new(
        sender: FeedSender,
        deps: VenueDeps,
        states: SharedSymbolStates,
        resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    ) -> Self {
        Self {
            sender,
            deps,
            states,
            resub_frames,
            update_count: 0,
        }
    }

    fn process(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                bump(&self.deps.counters.malformed_message);
                return;
            }
        };

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            if method == "subscribe" || method == "unsubscribe" {
                self.process_subscription_ack(method, &value);
            }
            return;
        }

        match value.get("channel").and_then(Value::as_str) {
            Some("book") => self.process_book(&value),
            Some("heartbeat") => debug!(venue = %VenueId::Kraken, "heartbeat"),
            Some("status") => debug!(venue = %VenueId::Kraken, "status frame"),
            Some(_) | None => {
                bump(&self.deps.counters.unknown_message);
            }
        }
    }

    fn process_subscription_ack(&mut self, method: &str, value: &Value) {
        let success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
        if !success {
            bump(&self.deps.counters.error_frame);
            warn!(venue = %VenueId::Kraken, %value, "subscription failed");
            return;
        }
        let Some(symbol) = value.pointer("/result/symbol").and_then(Value::as_str) else {
            return;
        };
        let Some(pair) = TradingPair::from_venue_symbol(VenueId::Kraken, symbol) else {
            bump(&self.deps.counters.unknown_symbol);
            return;
        };
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&pair) {
            state.subscribed = method == "subscribe";
        }
        debug!(venue = %VenueId::Kraken, %pair, method, "subscription acknowledged");
    }

    fn process_book(&mut self, value: &Value) {
        let is_snapshot = match value.get("type").and_then(Value::as_str) {
            Some("snapshot") => true,
            Some("update") => false,
            _ => {
                bump(&self.deps.counters.malformed_message);
                return;
            }
        };
        let Some(data) = value.pointer("/data/0") else {
            bump(&self.deps.counters.malformed_message);
            return;
        };
        let Some(symbol) = data.get("symbol").and_then(Value::as_str) else {
            bump(&self.deps.counters.malformed_message);
            return;
        };
        let Some(pair) = TradingPair::from_venue_symbol(VenueId::Kraken, symbol) else {
            bump(&self.deps.counters.unknown_symbol);
            return;
        };
        let (Some(bids), Some(asks)) = (
            parse_levels(data.get("bids")),
            parse_levels(data.get("asks")),
        ) else {
            bump(&self.deps.counters.malformed_message);
            return;
        };

        if !is_snapshot {
            let states = self.states.lock();
            let has_snapshot = states.get(&pair).map(|s| s.has_snapshot).unwrap_or(false);
            if !has_snapshot {
                debug!(venue = %VenueId::Kraken, %pair, "update before snapshot dropped");
                return;
            }
        }

        self.deps
            .books
            .apply_update(VenueId::Kraken, pair, &bids, &asks, is_snapshot);
        if is_snapshot {
            let mut states = self.states.lock();
            if let Some(state) = states.get_mut(&pair) {
                state.has_snapshot = true;
            }
            debug!(venue = %VenueId::Kraken, %pair, "book snapshot accepted");
        }

        // Checksum validation is sampled: it walks twenty levels per call.
        self.update_count += 1;
        let period = self.deps.settings.kraken_checksum_period.max(1);
        if self.update_count % period != 1 && period != 1 {
            return;
        }
        let Some(received) = data.get("checksum").and_then(Value::as_u64) else {
            return;
        };
        self.validate_checksum(pair, received as u32);
    }

    fn validate_checksum(&mut self, pair: TradingPair, received: u32) {
        let Some(book) = self.deps.books.book(VenueId::Kraken, pair) else {
            return;
        };
        let (bids, asks) = {
            let book = book.read();
            (book.snapshot_bids(), book.snapshot_asks())
        };
        let computed = compute_book_checksum(&asks, &bids, pair.price_precision());
        if computed == received {
            return;
        }

        bump(&self.deps.counters.checksum_mismatch);
        warn!(
            venue = %VenueId::Kraken,
            %pair,
            received,
            computed,
            "book checksum mismatch, resubscribing"
        );
        // Mark the book dirty and resubscribe the pair on this socket.
        book.write().set_has_snapshot(false);
        {
            let mut states = self.states.lock();
            if let Some(state) = states.get_mut(&pair) {
                state.has_snapshot = false;
            }
        }
        let pairs = [pair];
        let _ = self.sender.send(book_frame(&pairs, false));
        let _ = self.sender.send(book_frame(&pairs, true));
        bump(&self.deps.counters.checksum_resubscribe);
    }
}

fn parse_levels(value: Option<&Value>) -> Option<Vec<PriceLevel>> {
    let rows = value?.as_array()?;
    let mut levels = Vec::with_capacity(rows.len());
    for row in rows {
        let price = decimal_from_json(row.get("price")?)?;
        let qty = decimal_from_json(row.get("qty")?)?;
        levels.push(PriceLevel::new(price, qty));
    }
    Some(levels)
}

impl FrameHandler for KrakenHandler {
    fn on_frame(&mut self, frame: WsMessage) {
        if let Some(text) = frame.as_text() {
            let text = text.to_string();
            self.process(&text);
        }
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                for frame in self.resub_frames.lock().clone() {
                    let _ = self.sender.send(frame);
                }
            }
            SessionEvent::Disconnected => {
                let mut states = self.states.lock();
                for state in states.values_mut() {
                    state.subscribed = false;
                    state.has_snapshot = false;
                }
            }
            SessionEvent::Reconnecting(_) => {}
        }
    }
}
