//! Crypto.com adapter: per-instrument ticker channel, heartbeat echo.
//!
//! The venue sends `public/heartbeat` frames that must be answered with
//! `public/respond-heartbeat` echoing the same id, or it closes the socket.

use super::http::RestClient;
use super::{decimal_from_json, format_fixed8, new_symbol_states, SharedSymbolStates, VenueClient, VenueDeps};
use crate::domain::order::Side;
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
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const WS_URL: &str = "wss://stream.crypto.com/exchange/v1/market";
const REST_URL: &str = "https://api.crypto.com/exchange/v1";

pub struct CryptoClient {
    deps: VenueDeps,
    pairs: Vec<TradingPair>,
    rest: Arc<RestClient>,
    states: SharedSymbolStates,
    session: Mutex<Option<FeedSession>>,
    sender: Mutex<Option<FeedSender>>,
    resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    /// Request id to pair, for matching subscription acks
    ack_map: HashMap<i64, TradingPair>,
    test_mode: bool,
}

impl CryptoClient {
    pub fn new(deps: VenueDeps, pairs: Vec<TradingPair>, test_mode: bool) -> Self {
        // Crypto.com reports quota only in response bodies; no header policy.
        let rest = Arc::new(RestClient::new(
            VenueId::Crypto,
            REST_URL,
            Arc::new(super::http::NoopSigner),
            None,
        ));
        let ack_map = pairs
            .iter()
            .enumerate()
            .map(|(i, &p)| ((i + 1) as i64, p))
            .collect();
        Self {
            states: new_symbol_states(&pairs),
            deps,
            pairs,
            rest,
            session: Mutex::new(None),
            sender: Mutex::new(None),
            resub_frames: Arc::new(Mutex::new(Vec::new())),
            ack_map,
            test_mode,
        }
    }

    fn subscribe_frames(&self, pairs: &[TradingPair], subscribe: bool) -> Vec<WsMessage> {
        let method = if subscribe { "subscribe" } else { "unsubscribe" };
        pairs
            .iter()
            .filter_map(|&pair| {
                let symbol = pair.venue_symbol(VenueId::Crypto)?;
                let id = self
                    .ack_map
                    .iter()
                    .find(|(_, &p)| p == pair)
                    .map(|(&id, _)| id)?;
                Some(WsMessage::Text(
                    json!({
                        "id": id,
                        "method": method,
                        "params": {"channels": format!("ticker.{symbol}")}
                    })
                    .to_string(),
                ))
            })
            .collect()
    }

    fn send_frame(&self, frame: WsMessage) -> Result<(), VenueError> {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(VenueError::NotConnected(VenueId::Crypto));
        };
        sender.send(frame).map_err(|e| VenueError::Transport {
            venue: VenueId::Crypto,
            detail: e.to_string(),
        })
    }
}

#[async_trait]
impl VenueClient for CryptoClient {
    fn venue(&self) -> VenueId {
        VenueId::Crypto
    }

    async fn connect(&self) -> Result<(), VenueError> {
        let config = SessionConfig::new(
            VenueId::Crypto.as_str(),
            Arc::new(StaticEndpoint::new(WS_URL)),
        );
        let deps = self.deps.clone();
        let states = Arc::clone(&self.states);
        let resub = Arc::clone(&self.resub_frames);
        let ack_map = self.ack_map.clone();
        let session = FeedSession::open(config, move |sender| CryptoHandler {
            sender,
            deps,
            states,
            resub_frames: resub,
            ack_map,
        })
        .await
        .map_err(|e| VenueError::Transport {
            venue: VenueId::Crypto,
            detail: e.to_string(),
        })?;

        *self.sender.lock() = Some(session.sender());
        *self.session.lock() = Some(session);
        info!(venue = %VenueId::Crypto, "connected");
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
        let frames = self.subscribe_frames(&self.pairs, true);
        *self.resub_frames.lock() = frames.clone();
        for frame in frames {
            self.send_frame(frame)?;
        }
        Ok(())
    }

    fn resubscribe(&self, pairs: &[TradingPair]) -> Result<(), VenueError> {
        for frame in self.subscribe_frames(pairs, false) {
            self.send_frame(frame)?;
        }
        for frame in self.subscribe_frames(pairs, true) {
            self.send_frame(frame)?;
        }
        Ok(())
    }

    async fn fetch_order_book_snapshot(&self, _pair: TradingPair) -> Result<(), VenueError> {
        // Ticker channel delivers the quote directly.
        if !self.is_connected() {
            return Err(VenueError::NotConnected(VenueId::Crypto));
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
                "SIM-CRYPTO-{}",
                Utc::now().timestamp_nanos_opt().unwrap_or(0)
            ));
        }
        if !self.is_connected() {
            return Err(VenueError::NotConnected(VenueId::Crypto));
        }
        let symbol = pair
            .venue_symbol(VenueId::Crypto)
            .ok_or(VenueError::UnknownSymbol {
                venue: VenueId::Crypto,
                symbol: pair.symbol().into(),
            })?;
        let form = [
            ("instrument_name", symbol.to_string()),
            ("side", side.to_string()),
            ("type", "LIMIT".to_string()),
            ("time_in_force", "GOOD_TILL_CANCEL".to_string()),
            ("quantity", format_fixed8(qty)),
            ("price", format_fixed8(price)),
        ];
        let response = self
            .rest
            .post_form("/private/create-order", &form, true)
            .await?;
        response
            .pointer("/result/order_id")
            .map(|id| id.to_string().trim_matches('"').to_string())
            .ok_or_else(|| VenueError::OrderRejected {
                venue: VenueId::Crypto,
                reason: response.to_string(),
            })
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError> {
        if self.test_mode {
            return Ok(());
        }
        let form = [("order_id", venue_order_id.to_string())];
        self.rest
            .post_form("/private/cancel-order", &form, true)
            .await?;
        Ok(())
    }

    async fn fetch_balance(&self, asset: &str) -> Result<Decimal, VenueError> {
        if self.test_mode {
            return Ok(Decimal::ZERO);
        }
        let response = self
            .rest
            .post_form("/private/user-balance", &[], true)
            .await?;
        let accounts = response
            .pointer("/result/data/0/position_balances")
            .and_then(Value::as_array)
            .ok_or_else(|| VenueError::Protocol {
                venue: VenueId::Crypto,
                detail: "balance response missing positions".into(),
            })?;
        for account in accounts {
            if account.get("instrument_name").and_then(Value::as_str) == Some(asset) {
                return Ok(account
                    .get("quantity")
                    .and_then(decimal_from_json)
                    .unwrap_or_default());
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

struct CryptoHandler {
    sender: FeedSender,
    deps: VenueDeps,
    states: SharedSymbolStates,
    resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    ack_map: HashMap<i64, TradingPair>,
}

impl CryptoHandler {
    fn process(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                bump(&self.deps.counters.malformed_message);
                return;
            }
        };

        match value.get("method").and_then(Value::as_str) {
            Some("public/heartbeat") => {
                // Echo the id back or the venue drops the connection.
                let id = value.get("id").cloned().unwrap_or(Value::Null);
                let _ = self.sender.send(WsMessage::Text(
                    json!({"id": id, "method": "public/respond-heartbeat"}).to_string(),
                ));
                debug!(venue = %VenueId::Crypto, "heartbeat answered");
            }
            Some("subscribe") => {
                if let Some(code) = value.get("code").and_then(Value::as_i64) {
                    if code != 0 {
                        bump(&self.deps.counters.error_frame);
                        warn!(venue = %VenueId::Crypto, code, "subscribe rejected");
                        return;
                    }
                }
                if value.get("result").is_some() {
                    self.process_ticker(&value);
                } else if let Some(id) = value.get("id").and_then(Value::as_i64) {
                    if let Some(&pair) = self.ack_map.get(&id) {
                        let mut states = self.states.lock();
                        if let Some(state) = states.get_mut(&pair) {
                            state.subscribed = true;
                        }
                        debug!(venue = %VenueId::Crypto, %pair, "subscription acknowledged");
                    }
                }
            }
            Some(_) | None => {
                bump(&self.deps.counters.unknown_message);
            }
        }
    }

    fn process_ticker(&mut self, value: &Value) {
        let Some(symbol) = value
            .pointer("/result/instrument_name")
            .and_then(Value::as_str)
        else {
            bump(&self.deps.counters.malformed_message);
            return;
        };
        let Some(pair) = TradingPair::from_venue_symbol(VenueId::Crypto, symbol) else {
            bump(&self.deps.counters.unknown_symbol);
            return;
        };
        let Some(tick) = value.pointer("/result/data/0") else {
            bump(&self.deps.counters.malformed_message);
            return;
        };

        // b/k carry the best bid/ask, bs/ks their sizes.
        let bid = tick.get("b").and_then(decimal_from_json).unwrap_or_default();
        let bid_qty = tick.get("bs").and_then(decimal_from_json).unwrap_or_default();
        let ask = tick.get("k").and_then(decimal_from_json).unwrap_or_default();
        let ask_qty = tick.get("ks").and_then(decimal_from_json).unwrap_or_default();
        self.deps
            .books
            .apply_best_bid_ask(VenueId::Crypto, pair, bid, bid_qty, ask, ask_qty);
    }
}

impl FrameHandler for CryptoHandler {
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
    use tokio::sync::mpsc::UnboundedReceiver;

    fn handler() -> (CryptoHandler, UnboundedReceiver<WsMessage>) {
        let deps = VenueDeps {
            books: OrderBookManager::new(&[VenueId::Crypto], &[TradingPair::BtcUsdt], 100),
            timers: TimerService::new(),
            counters: AnomalyCounters::new(),
            settings: Arc::new(Settings::default()),
        };
        let (sender, outbound) = FeedSender::detached();
        let h = CryptoHandler {
            sender,
            deps,
            states: new_symbol_states(&[TradingPair::BtcUsdt]),
            resub_frames: Arc::new(Mutex::new(Vec::new())),
            ack_map: [(1i64, TradingPair::BtcUsdt)].into_iter().collect(),
        };
        (h, outbound)
    }

    #[test]
    fn heartbeat_is_echoed_with_same_id() {
        let (mut h, mut outbound) = handler();
        h.process(r#"{"id":1717,"method":"public/heartbeat","code":0}"#);

        let frame = outbound.try_recv().expect("pong sent");
        let value: Value = serde_json::from_str(frame.as_text().unwrap()).unwrap();
        assert_eq!(value["method"], "public/respond-heartbeat");
        assert_eq!(value["id"], 1717);
    }

    #[test]
    fn ticker_updates_top_of_book() {
        let (mut h, _outbound) = handler();
        h.process(
            r#"{"id":-1,"method":"subscribe","code":0,"result":{
                "channel":"ticker","instrument_name":"BTCUSD-PERP",
                "data":[{"b":"97100.5","bs":"0.4","k":"97101.0","ks":"1.2"}]}}"#,
        );
        let book = h.deps.books.book(VenueId::Crypto, TradingPair::BtcUsdt).unwrap();
        let book = book.read();
        assert_eq!(book.best_bid(), dec!(97100.5));
        assert_eq!(book.best_ask_qty(), dec!(1.2));
    }

    #[test]
    fn plain_ack_marks_pair_subscribed() {
        let (mut h, _outbound) = handler();
        h.process(r#"{"id":1,"method":"subscribe","code":0}"#);
        assert!(h.states.lock()[&TradingPair::BtcUsdt].subscribed);
    }
}
