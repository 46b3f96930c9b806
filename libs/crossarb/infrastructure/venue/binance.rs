//! Binance adapter: full-depth book via diff stream plus REST snapshot.
//!
//! Subscribes `<symbol>@depth@100ms`, bootstraps each book with
//! `GET /api/v3/depth`, and reconciles deltas against `lastUpdateId`:
//! a delta is applied only when a snapshot exists and its `u` advances the
//! sequence.

use super::http::{RateLimitHeader, RestClient};
use super::{
    decimal_from_json, format_fixed8, levels_from_pairs, new_symbol_states, SharedSymbolStates,
    VenueClient, VenueDeps,
};
use crate::domain::order::Side;
use crate::domain::orderbook::UpdateOutcome;
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
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, info, warn};

const WS_URL: &str = "wss://stream.binance.com/ws/stream";
const REST_URL: &str = "https://api.binance.com";

pub struct BinanceClient {
    deps: VenueDeps,
    pairs: Vec<TradingPair>,
    rest: Arc<RestClient>,
    states: SharedSymbolStates,
    session: Mutex<Option<FeedSession>>,
    sender: Mutex<Option<FeedSender>>,
    snapshot_tx: Mutex<Option<UnboundedSender<TradingPair>>>,
    resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    test_mode: bool,
}

impl BinanceClient {
    pub fn new(deps: VenueDeps, pairs: Vec<TradingPair>, test_mode: bool) -> Self {
        let rest = Arc::new(RestClient::new(
            VenueId::Binance,
            REST_URL,
            Arc::new(super::http::NoopSigner),
            Some(RateLimitHeader::Used {
                header: "x-mbx-used-weight-1m",
                limit: 6000,
            }),
        ));
        Self {
            states: new_symbol_states(&pairs),
            deps,
            pairs,
            rest,
            session: Mutex::new(None),
            sender: Mutex::new(None),
            snapshot_tx: Mutex::new(None),
            resub_frames: Arc::new(Mutex::new(Vec::new())),
            test_mode,
        }
    }

    fn subscribe_frame(&self, pairs: &[TradingPair]) -> WsMessage {
        let params: Vec<String> = pairs
            .iter()
            .filter_map(|p| p.venue_symbol(VenueId::Binance))
            .map(|s| format!("{}@depth@100ms", s.to_ascii_lowercase()))
            .collect();
        WsMessage::Text(
            json!({"method": "SUBSCRIBE", "params": params, "id": 1}).to_string(),
        )
    }

    fn unsubscribe_frame(&self, pairs: &[TradingPair]) -> WsMessage {
        let params: Vec<String> = pairs
            .iter()
            .filter_map(|p| p.venue_symbol(VenueId::Binance))
            .map(|s| format!("{}@depth@100ms", s.to_ascii_lowercase()))
            .collect();
        WsMessage::Text(
            json!({"method": "UNSUBSCRIBE", "params": params, "id": 2}).to_string(),
        )
    }

    fn send_frame(&self, frame: WsMessage) -> Result<(), VenueError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(VenueError::NotConnected(VenueId::Binance));
        };
        sender.send(frame).map_err(|e| VenueError::Transport {
            venue: VenueId::Binance,
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl VenueClient for BinanceClient {
    fn venue(&self) -> VenueId {
        VenueId::Binance
    }

    async fn connect(&self) -> Result<(), VenueError> {
        let (snapshot_tx, mut snapshot_rx) = unbounded_channel::<TradingPair>();
        {
            // Snapshot worker: serializes REST depth bootstraps.
            let rest = Arc::clone(&self.rest);
            let deps = self.deps.clone();
            let states = Arc::clone(&self.states);
            tokio::spawn(async move {
                while let Some(pair) = snapshot_rx.recv().await {
                    if let Err(e) =
                        fetch_depth_snapshot(&rest, &deps, &states, pair).await
                    {
                        warn!(venue = %VenueId::Binance, %pair, "snapshot fetch failed: {e}");
                    }
                }
            });
        }

        let config = SessionConfig::new(
            VenueId::Binance.as_str(),
            Arc::new(StaticEndpoint::new(WS_URL)),
        );
        let handler_deps = self.deps.clone();
        let handler_states = Arc::clone(&self.states);
        let handler_pairs = self.pairs.clone();
        let handler_resub = Arc::clone(&self.resub_frames);
        let handler_snapshot_tx = snapshot_tx.clone();
        let session = FeedSession::open(config, move |sender| BinanceHandler {
            _sender: sender,
            deps: handler_deps,
            states: handler_states,
            pairs: handler_pairs,
            resub_frames: handler_resub,
            snapshot_tx: handler_snapshot_tx,
        })
        .await
        .map_err(|e| VenueError::Transport {
            venue: VenueId::Binance,
            detail: e.to_string(),
        })?;

        *self.sender.lock() = Some(session.sender());
        *self.session.lock() = Some(session);
        *self.snapshot_tx.lock() = Some(snapshot_tx);
        info!(venue = %VenueId::Binance, "connected");
        Ok(())
    }

    async fn disconnect(&self) {
        *self.sender.lock() = None;
        *self.snapshot_tx.lock() = None;
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.shutdown().await;
        }
    }

    fn subscribe_order_book(&self) -> Result<(), VenueError> {
        // The REST depth bootstrap is requested separately; after a
        // reconnect the handler queues it itself.
        let frame = self.subscribe_frame(&self.pairs);
        *self.resub_frames.lock() = vec![frame.clone()];
        self.send_frame(frame)
    }

    fn resubscribe(&self, pairs: &[TradingPair]) -> Result<(), VenueError> {
        self.send_frame(self.unsubscribe_frame(pairs))?;
        self.send_frame(self.subscribe_frame(pairs))?;
        let mut states = self.states.lock();
        for pair in pairs {
            if let Some(state) = states.get_mut(pair) {
                state.has_snapshot = false;
                state.first_update_processed = false;
            }
        }
        drop(states);
        if let Some(tx) = self.snapshot_tx.lock().as_ref() {
            for &pair in pairs {
                let _ = tx.send(pair);
            }
        }
        Ok(())
    }

    async fn fetch_order_book_snapshot(&self, pair: TradingPair) -> Result<(), VenueError> {
        fetch_depth_snapshot(&self.rest, &self.deps, &self.states, pair).await
    }

    async fn place_order(
        &self,
        pair: TradingPair,
        side: Side,
        price: Decimal,
        qty: Decimal,
    ) -> Result<String, VenueError> {
        if self.test_mode {
            return Ok(format!("SIM-BINANCE-{}", Utc::now().timestamp_nanos_opt().unwrap_or(0)));
        }
        if !self.is_connected() {
            return Err(VenueError::NotConnected(VenueId::Binance));
        }
        let symbol = pair
            .venue_symbol(VenueId::Binance)
            .ok_or(VenueError::UnknownSymbol {
                venue: VenueId::Binance,
                symbol: pair.symbol().into(),
            })?;
        let form = [
            ("symbol", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "LIMIT".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("quantity", format_fixed8(qty)),
            ("price", format_fixed8(price)),
            ("timestamp", Utc::now().timestamp_millis().to_string()),
        ];
        let response = self.rest.post_form("/api/v3/order", &form, true).await?;
        response
            .get("orderId")
            .map(|id| id.to_string().trim_matches('"').to_string())
            .ok_or_else(|| VenueError::OrderRejected {
                venue: VenueId::Binance,
                reason: response.to_string(),
            })
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError> {
        if self.test_mode {
            return Ok(());
        }
        let params = [
            ("orderId", venue_order_id.to_string()),
            ("timestamp", Utc::now().timestamp_millis().to_string()),
        ];
        self.rest.delete_json("/api/v3/order", &params, true).await?;
        Ok(())
    }

    async fn fetch_balance(&self, asset: &str) -> Result<Decimal, VenueError> {
        if self.test_mode {
            return Ok(Decimal::ZERO);
        }
        let params = [("timestamp", Utc::now().timestamp_millis().to_string())];
        let response = self.rest.get_json("/api/v3/account", &params, true).await?;
        let balances = response
            .get("balances")
            .and_then(Value::as_array)
            .ok_or_else(|| VenueError::Protocol {
                venue: VenueId::Binance,
                detail: "account response missing balances".into(),
            })?;
        for entry in balances {
            if entry.get("asset").and_then(Value::as_str) == Some(asset) {
                return decimal_from_json(entry.get("free").unwrap_or(&Value::Null)).ok_or(
                    VenueError::Protocol {
                        venue: VenueId::Binance,
                        detail: "unparsable balance".into(),
                    },
                );
            }
        }
        Ok(Decimal::ZERO)
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

/// REST depth bootstrap: replaces the book and pins the update-id fence.
async fn fetch_depth_snapshot(
    rest: &RestClient,
    deps: &VenueDeps,
    states: &SharedSymbolStates,
    pair: TradingPair,
) -> Result<(), VenueError> {
    let symbol = pair
        .venue_symbol(VenueId::Binance)
        .ok_or(VenueError::UnknownSymbol {
            venue: VenueId::Binance,
            symbol: pair.symbol().into(),
        })?;
    let params = [
        ("symbol", symbol.to_string()),
        ("limit", "100".to_string()),
    ];
    let response = rest.get_json("/api/v3/depth", &params, false).await?;

    let last_update_id = response
        .get("lastUpdateId")
        .and_then(Value::as_i64)
        .ok_or_else(|| VenueError::Protocol {
            venue: VenueId::Binance,
            detail: "depth response missing lastUpdateId".into(),
        })?;
    let bids = levels_from_pairs(response.get("bids").unwrap_or(&Value::Null)).ok_or_else(|| {
        VenueError::Protocol {
            venue: VenueId::Binance,
            detail: "depth response missing bids".into(),
        }
    })?;
    let asks = levels_from_pairs(response.get("asks").unwrap_or(&Value::Null)).ok_or_else(|| {
        VenueError::Protocol {
            venue: VenueId::Binance,
            detail: "depth response missing asks".into(),
        }
    })?;

    deps.books
        .apply_update(VenueId::Binance, pair, &bids, &asks, true);
    if let Some(book) = deps.books.book(VenueId::Binance, pair) {
        book.write().set_last_update_id(last_update_id);
    }
    let mut states = states.lock();
    if let Some(state) = states.get_mut(&pair) {
        state.has_snapshot = true;
        state.last_update_id = last_update_id;
        state.first_update_processed = false;
    }
    info!(venue = %VenueId::Binance, %pair, last_update_id, "depth snapshot applied");
    Ok(())
}

struct BinanceHandler {
    _sender: FeedSender,
    deps: VenueDeps,
    states: SharedSymbolStates,
    pairs: Vec<TradingPair>,
    resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    snapshot_tx: UnboundedSender<TradingPair>,
}

impl BinanceHandler {
    fn process(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                bump(&self.deps.counters.malformed_message);
                return;
            }
        };

        // Subscription ack: {"result":null,"id":1}
        if let Some(result) = value.get("result") {
            if result.is_null() {
                debug!(venue = %VenueId::Binance, "subscription acknowledged");
                let mut states = self.states.lock();
                for state in states.values_mut() {
                    state.subscribed = true;
                }
                return;
            }
        }

        if value.get("error").is_some() {
            bump(&self.deps.counters.error_frame);
            warn!(venue = %VenueId::Binance, %value, "error frame");
            return;
        }

        match value.get("e").and_then(Value::as_str) {
            Some("depthUpdate") => self.process_depth_update(&value),
            Some(_) | None => {
                bump(&self.deps.counters.unknown_message);
                debug!(venue = %VenueId::Binance, "unknown message shape");
            }
        }
    }

    fn process_depth_update(&mut self, value: &Value) {
        let Some(symbol) = value.get("s").and_then(Value::as_str) else {
            bump(&self.deps.counters.malformed_message);
            return;
        };
        let Some(pair) = TradingPair::from_venue_symbol(VenueId::Binance, symbol) else {
            bump(&self.deps.counters.unknown_symbol);
            return;
        };

        let update_id = value.get("u").and_then(Value::as_i64).unwrap_or(0);
        {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(&pair) else {
                return;
            };
            if !state.has_snapshot {
                debug!(venue = %VenueId::Binance, %pair, "delta before snapshot dropped");
                return;
            }
            if update_id <= state.last_update_id {
                bump(&self.deps.counters.dropped_sequence);
                return;
            }
            state.last_update_id = update_id;
            state.first_update_processed = true;
        }

        let bids = levels_from_pairs(value.get("b").unwrap_or(&Value::Null)).unwrap_or_default();
        let asks = levels_from_pairs(value.get("a").unwrap_or(&Value::Null)).unwrap_or_default();
        let outcome = self
            .deps
            .books
            .apply_update(VenueId::Binance, pair, &bids, &asks, false);
        match outcome {
            UpdateOutcome::Error => {
                bump(&self.deps.counters.crossed_book);
                bump(&self.deps.counters.rejected_update);
            }
            _ => {
                if let Some(book) = self.deps.books.book(VenueId::Binance, pair) {
                    book.write().set_last_update_id(update_id);
                }
            }
        }
    }
}

impl FrameHandler for BinanceHandler {
    fn on_frame(&mut self, frame: WsMessage) {
        if let Some(text) = frame.as_text() {
            let text = text.to_string();
            self.process(&text);
        }
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                // Replay subscriptions issued before the reconnect and
                // re-bootstrap the books.
                let frames = self.resub_frames.lock().clone();
                if frames.is_empty() {
                    return;
                }
                for frame in frames {
                    let _ = self._sender.send(frame);
                }
                for &pair in &self.pairs {
                    let _ = self.snapshot_tx.send(pair);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::books::OrderBookManager;
    use crate::infrastructure::config::Settings;
    use crate::infrastructure::counters::AnomalyCounters;
    use crate::infrastructure::timers::TimerService;
    use rust_decimal_macros::dec;
    use std::sync::atomic::Ordering;

    fn handler() -> BinanceHandler {
        let deps = VenueDeps {
            books: OrderBookManager::new(&[VenueId::Binance], &[TradingPair::BtcUsdt], 100),
            timers: TimerService::new(),
            counters: AnomalyCounters::new(),
            settings: Arc::new(Settings::default()),
        };
        let (sender, _outbound) = FeedSender::detached();
        let (snapshot_tx, _snapshot_rx) = unbounded_channel();
        let h = BinanceHandler {
            _sender: sender,
            deps,
            states: new_symbol_states(&[TradingPair::BtcUsdt]),
            pairs: vec![TradingPair::BtcUsdt],
            resub_frames: Arc::new(Mutex::new(Vec::new())),
            snapshot_tx,
        };
        // Seed the snapshot state the way the REST bootstrap would.
        h.deps.books.apply_update(
            VenueId::Binance,
            TradingPair::BtcUsdt,
            &[crate::domain::orderbook::PriceLevel::new(dec!(500), dec!(1))],
            &[crate::domain::orderbook::PriceLevel::new(dec!(501), dec!(1))],
            true,
        );
        h.states.lock().get_mut(&TradingPair::BtcUsdt).unwrap().has_snapshot = true;
        h.states.lock().get_mut(&TradingPair::BtcUsdt).unwrap().last_update_id = 100;
        h
    }

    #[test]
    fn ack_marks_pairs_subscribed() {
        let mut h = handler();
        h.process(r#"{"result":null,"id":1}"#);
        assert!(h.states.lock()[&TradingPair::BtcUsdt].subscribed);
    }

    #[test]
    fn stale_update_id_is_dropped() {
        let mut h = handler();
        h.process(
            r#"{"e":"depthUpdate","s":"BTCUSDT","U":99,"u":100,"b":[["499.0","9"]],"a":[]}"#,
        );
        assert_eq!(h.deps.counters.dropped_sequence.load(Ordering::Relaxed), 1);
        let book = h.deps.books.book(VenueId::Binance, TradingPair::BtcUsdt).unwrap();
        assert_eq!(book.read().best_bid(), dec!(500));
    }

    #[test]
    fn advancing_update_removes_zero_qty_level() {
        let mut h = handler();
        h.process(
            r#"{"e":"depthUpdate","s":"BTCUSDT","U":101,"u":101,"b":[["500.0","0"],["499.5","2"]],"a":[]}"#,
        );
        let book = h.deps.books.book(VenueId::Binance, TradingPair::BtcUsdt).unwrap();
        let book = book.read();
        assert_eq!(book.best_bid(), dec!(499.5));
        assert_eq!(book.last_update_id(), 101);
        assert_eq!(h.states.lock()[&TradingPair::BtcUsdt].last_update_id, 101);
    }

    #[test]
    fn unknown_symbol_is_counted() {
        let mut h = handler();
        h.process(r#"{"e":"depthUpdate","s":"FOOBAR","u":200,"b":[],"a":[]}"#);
        assert_eq!(h.deps.counters.unknown_symbol.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn disconnect_resets_feed_state() {
        let mut h = handler();
        h.states.lock().get_mut(&TradingPair::BtcUsdt).unwrap().subscribed = true;
        h.on_event(SessionEvent::Disconnected);
        let states = h.states.lock();
        assert!(!states[&TradingPair::BtcUsdt].subscribed);
        assert!(!states[&TradingPair::BtcUsdt].has_snapshot);
    }
}
