//! KuCoin adapter: bullet-public bootstrap, tokenized WebSocket URL, REST
//! depth snapshot plus level2 deltas.
//!
//! Every (re)connect re-runs `POST /api/v1/bullet-public`: the token is
//! per-connection, and the server also dictates the ping cadence, which the
//! session turns into its outbound heartbeat.

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
use feedsock::{
    Endpoint, EndpointProvider, FeedError, FeedSender, FeedSession, FrameHandler, SessionConfig,
    SessionEvent, WsMessage,
};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tracing::{debug, info, warn};

const REST_URL: &str = "https://api.kucoin.com";

/// Resolves the WebSocket endpoint through the bullet bootstrap.
struct KucoinBootstrap {
    rest: Arc<RestClient>,
}

#[async_trait]
impl EndpointProvider for KucoinBootstrap {
    async fn endpoint(&self) -> feedsock::Result<Endpoint> {
        let response = self
            .rest
            .post_empty("/api/v1/bullet-public")
            .await
            .map_err(|e| FeedError::Endpoint(e.to_string()))?;

        let token = response
            .pointer("/data/token")
            .and_then(Value::as_str)
            .ok_or_else(|| FeedError::Endpoint("bullet response missing token".into()))?;
        let server = response
            .pointer("/data/instanceServers/0")
            .ok_or_else(|| FeedError::Endpoint("bullet response missing instanceServers".into()))?;
        let ws_url = server
            .get("endpoint")
            .and_then(Value::as_str)
            .ok_or_else(|| FeedError::Endpoint("bullet response missing endpoint".into()))?;
        let ping_interval = server
            .get("pingInterval")
            .and_then(Value::as_u64)
            .ok_or_else(|| FeedError::Endpoint("bullet response missing pingInterval".into()))?;
        // pingTimeout is informational; the server drops us if we stop pinging.
        let _ping_timeout = server.get("pingTimeout").and_then(Value::as_u64);

        if !ws_url.starts_with("wss://") {
            return Err(FeedError::Endpoint(format!("unexpected endpoint: {ws_url}")));
        }

        Ok(Endpoint::new(format!("{ws_url}?token={token}")).with_heartbeat(
            Duration::from_millis(ping_interval),
            WsMessage::Text(json!({"id": "keepalive", "type": "ping"}).to_string()),
        ))
    }
}

pub struct KucoinClient {
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

impl KucoinClient {
    pub fn new(deps: VenueDeps, pairs: Vec<TradingPair>, test_mode: bool) -> Self {
        let rest = Arc::new(RestClient::new(
            VenueId::Kucoin,
            REST_URL,
            Arc::new(super::http::NoopSigner),
            Some(RateLimitHeader::Remaining {
                header: "gw-ratelimit-remaining",
                limit: 500,
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

    fn send_frame(&self, frame: WsMessage) -> Result<(), VenueError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(VenueError::NotConnected(VenueId::Kucoin));
        };
        sender.send(frame).map_err(|e| VenueError::Transport {
            venue: VenueId::Kucoin,
            detail: e.to_string(),
        })
    }
}

fn topic_frame(pair: TradingPair, subscribe: bool) -> Option<(String, WsMessage)> {
    let symbol = pair.venue_symbol(VenueId::Kucoin)?;
    let id = format!("{}-{}", if subscribe { "sub" } else { "unsub" }, symbol);
    let frame = WsMessage::Text(
        json!({
            "id": id,
            "type": if subscribe { "subscribe" } else { "unsubscribe" },
            "topic": format!("/market/level2:{symbol}"),
            "privateChannel": false,
            "response": true
        })
        .to_string(),
    );
    Some((id, frame))
}

#[async_trait]
impl VenueClient for KucoinClient {
    fn venue(&self) -> VenueId {
        VenueId::Kucoin
    }

    async fn connect(&self) -> Result<(), VenueError> {
        let (snapshot_tx, mut snapshot_rx) = unbounded_channel::<TradingPair>();
        {
            let rest = Arc::clone(&self.rest);
            let deps = self.deps.clone();
            let states = Arc::clone(&self.states);
            tokio::spawn(async move {
                while let Some(pair) = snapshot_rx.recv().await {
                    if let Err(e) = fetch_level2_snapshot(&rest, &deps, &states, pair).await {
                        warn!(venue = %VenueId::Kucoin, %pair, "snapshot fetch failed: {e}");
                    }
                }
            });
        }

        let ack_map: HashMap<String, TradingPair> = self
            .pairs
            .iter()
            .filter_map(|&p| topic_frame(p, true).map(|(id, _)| (id, p)))
            .collect();

        let config = SessionConfig::new(
            VenueId::Kucoin.as_str(),
            Arc::new(KucoinBootstrap {
                rest: Arc::clone(&self.rest),
            }),
        );
        let deps = self.deps.clone();
        let states = Arc::clone(&self.states);
        let resub = Arc::clone(&self.resub_frames);
        let pairs = self.pairs.clone();
        let handler_snapshot_tx = snapshot_tx.clone();
        let session = FeedSession::open(config, move |sender| KucoinHandler {
            sender,
            deps,
            states,
            pairs,
            ack_map,
            resub_frames: resub,
            snapshot_tx: handler_snapshot_tx,
        })
        .await
        .map_err(|e| VenueError::Transport {
            venue: VenueId::Kucoin,
            detail: e.to_string(),
        })?;

        *self.sender.lock() = Some(session.sender());
        *self.session.lock() = Some(session);
        *self.snapshot_tx.lock() = Some(snapshot_tx);
        info!(venue = %VenueId::Kucoin, "connected");
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
        let frames: Vec<WsMessage> = self
            .pairs
            .iter()
            .filter_map(|&p| topic_frame(p, true).map(|(_, f)| f))
            .collect();
        *self.resub_frames.lock() = frames.clone();
        for frame in frames {
            self.send_frame(frame)?;
        }
        Ok(())
    }

    fn resubscribe(&self, pairs: &[TradingPair]) -> Result<(), VenueError> {
        for &pair in pairs {
            if let Some((_, frame)) = topic_frame(pair, false) {
                self.send_frame(frame)?;
            }
            if let Some((_, frame)) = topic_frame(pair, true) {
                self.send_frame(frame)?;
            }
        }
        let mut states = self.states.lock();
        for pair in pairs {
            if let Some(state) = states.get_mut(pair) {
                state.has_snapshot = false;
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
        fetch_level2_snapshot(&self.rest, &self.deps, &self.states, pair).await
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
                "SIM-KUCOIN-{}",
                Utc::now().timestamp_nanos_opt().unwrap_or(0)
            ));
        }
        if !self.is_connected() {
            return Err(VenueError::NotConnected(VenueId::Kucoin));
        }
        let symbol = pair
            .venue_symbol(VenueId::Kucoin)
            .ok_or(VenueError::UnknownSymbol {
                venue: VenueId::Kucoin,
                symbol: pair.symbol().into(),
            })?;
        let form = [
            ("clientOid", Utc::now().timestamp_nanos_opt().unwrap_or(0).to_string()),
            ("symbol", symbol.to_string()),
            (
                "side",
                match side {
                    Side::Buy => "buy".to_string(),
                    Side::Sell => "sell".to_string(),
                },
            ),
            ("type", "limit".to_string()),
            ("price", format_fixed8(price)),
            ("size", format_fixed8(qty)),
        ];
        let response = self.rest.post_form("/api/v1/orders", &form, true).await?;
        response
            .pointer("/data/orderId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| VenueError::OrderRejected {
                venue: VenueId::Kucoin,
                reason: response.to_string(),
            })
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError> {
        if self.test_mode {
            return Ok(());
        }
        self.rest
            .delete_json(&format!("/api/v1/orders/{venue_order_id}"), &[], true)
            .await?;
        Ok(())
    }

    async fn fetch_balance(&self, asset: &str) -> Result<Decimal, VenueError> {
        if self.test_mode {
            return Ok(Decimal::ZERO);
        }
        let params = [("currency", asset.to_string())];
        let response = self.rest.get_json("/api/v1/accounts", &params, true).await?;
        let accounts = response
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| VenueError::Protocol {
                venue: VenueId::Kucoin,
                detail: "accounts response missing data".into(),
            })?;
        Ok(accounts
            .iter()
            .filter_map(|a| a.get("available").and_then(decimal_from_json))
            .fold(Decimal::ZERO, |acc, v| acc + v))
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

/// REST depth bootstrap; deltas below the returned sequence are dropped.
async fn fetch_level2_snapshot(
    rest: &RestClient,
    deps: &VenueDeps,
    states: &SharedSymbolStates,
    pair: TradingPair,
) -> Result<(), VenueError> {
    let symbol = pair
        .venue_symbol(VenueId::Kucoin)
        .ok_or(VenueError::UnknownSymbol {
            venue: VenueId::Kucoin,
            symbol: pair.symbol().into(),
        })?;
    let params = [("symbol", symbol.to_string())];
    let response = rest
        .get_json("/api/v1/market/orderbook/level2_100", &params, false)
        .await?;

    let sequence = response
        .pointer("/data/sequence")
        .and_then(|v| match v {
            Value::String(s) => s.parse::<i64>().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        })
        .ok_or_else(|| VenueError::Protocol {
            venue: VenueId::Kucoin,
            detail: "level2 response missing sequence".into(),
        })?;
    let bids = response
        .pointer("/data/bids")
        .and_then(levels_from_pairs)
        .ok_or_else(|| VenueError::Protocol {
            venue: VenueId::Kucoin,
            detail: "level2 response missing bids".into(),
        })?;
    let asks = response
        .pointer("/data/asks")
        .and_then(levels_from_pairs)
        .ok_or_else(|| VenueError::Protocol {
            venue: VenueId::Kucoin,
            detail: "level2 response missing asks".into(),
        })?;

    deps.books
        .apply_update(VenueId::Kucoin, pair, &bids, &asks, true);
    if let Some(book) = deps.books.book(VenueId::Kucoin, pair) {
        book.write().set_last_update_id(sequence);
    }
    let mut states = states.lock();
    if let Some(state) = states.get_mut(&pair) {
        state.has_snapshot = true;
        state.last_update_id = sequence;
        state.first_update_processed = false;
    }
    info!(venue = %VenueId::Kucoin, %pair, sequence, "level2 snapshot applied");
    Ok(())
}

struct KucoinHandler {
    sender: FeedSender,
    deps: VenueDeps,
    states: SharedSymbolStates,
    pairs: Vec<TradingPair>,
    ack_map: HashMap<String, TradingPair>,
    resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    snapshot_tx: UnboundedSender<TradingPair>,
}

impl KucoinHandler {
    fn process(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                bump(&self.deps.counters.malformed_message);
                return;
            }
        };

        match value.get("type").and_then(Value::as_str) {
            Some("welcome") => debug!(venue = %VenueId::Kucoin, "welcome"),
            Some("pong") => debug!(venue = %VenueId::Kucoin, "pong"),
            Some("ack") => {
                let Some(id) = value.get("id").and_then(Value::as_str) else {
                    return;
                };
                if let Some(&pair) = self.ack_map.get(id) {
                    let mut states = self.states.lock();
                    if let Some(state) = states.get_mut(&pair) {
                        state.subscribed = true;
                    }
                    debug!(venue = %VenueId::Kucoin, %pair, "subscription acknowledged");
                }
            }
            Some("error") => {
                bump(&self.deps.counters.error_frame);
                warn!(venue = %VenueId::Kucoin, %value, "error frame");
            }
            Some("message") => self.process_l2_update(&value),
            Some(_) | None => {
                bump(&self.deps.counters.unknown_message);
            }
        }
    }

    fn process_l2_update(&mut self, value: &Value) {
        let Some(symbol) = value.pointer("/data/symbol").and_then(Value::as_str) else {
            bump(&self.deps.counters.malformed_message);
            return;
        };
        let Some(pair) = TradingPair::from_venue_symbol(VenueId::Kucoin, symbol) else {
            bump(&self.deps.counters.unknown_symbol);
            return;
        };

        let sequence_end = value
            .pointer("/data/sequenceEnd")
            .and_then(Value::as_i64)
            .unwrap_or(0);
        {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(&pair) else {
                return;
            };
            if !state.has_snapshot {
                debug!(venue = %VenueId::Kucoin, %pair, "delta before snapshot dropped");
                return;
            }
            if sequence_end <= state.last_update_id {
                bump(&self.deps.counters.dropped_sequence);
                return;
            }
            state.last_update_id = sequence_end;
            state.first_update_processed = true;
        }

        let bids = value
            .pointer("/data/changes/bids")
            .and_then(levels_from_pairs)
            .unwrap_or_default();
        let asks = value
            .pointer("/data/changes/asks")
            .and_then(levels_from_pairs)
            .unwrap_or_default();
        let outcome = self
            .deps
            .books
            .apply_update(VenueId::Kucoin, pair, &bids, &asks, false);
        match outcome {
            UpdateOutcome::Error => {
                bump(&self.deps.counters.crossed_book);
                bump(&self.deps.counters.rejected_update);
            }
            _ => {
                if let Some(book) = self.deps.books.book(VenueId::Kucoin, pair) {
                    book.write().set_last_update_id(sequence_end);
                }
            }
        }
    }
}

impl FrameHandler for KucoinHandler {
    fn on_frame(&mut self, frame: WsMessage) {
        if let Some(text) = frame.as_text() {
            let text = text.to_string();
            self.process(&text);
        }
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected => {
                let frames = self.resub_frames.lock().clone();
                if frames.is_empty() {
                    return;
                }
                for frame in frames {
                    let _ = self.sender.send(frame);
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
