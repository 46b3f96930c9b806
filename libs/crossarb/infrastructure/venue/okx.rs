//! OKX adapter: best-bid-offer tick-by-tick channel.
//!
//! `bbo-tbt` pushes the top level of each side with a `seqId`; regressions
//! are dropped and the book holds exactly one level per side.

use super::http::RestClient;
use super::{decimal_from_json, format_fixed8, levels_from_pairs, new_symbol_states, SharedSymbolStates, VenueClient, VenueDeps};
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

const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const REST_URL: &str = "https://www.okx.com";

pub struct OkxClient {
    deps: VenueDeps,
    pairs: Vec<TradingPair>,
    rest: Arc<RestClient>,
    states: SharedSymbolStates,
    session: Mutex<Option<FeedSession>>,
    sender: Mutex<Option<FeedSender>>,
    resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    test_mode: bool,
}

impl OkxClient {
    pub fn new(deps: VenueDeps, pairs: Vec<TradingPair>, test_mode: bool) -> Self {
        let rest = Arc::new(RestClient::new(
            VenueId::Okx,
            REST_URL,
            Arc::new(super::http::NoopSigner),
            None,
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
            return Err(VenueError::NotConnected(VenueId::Okx));
        };
        sender.send(frame).map_err(|e| VenueError::Transport {
            venue: VenueId::Okx,
            detail: e.to_string(),
        })
    }
}

fn bbo_frame(pairs: &[TradingPair], subscribe: bool) -> WsMessage {
    let args: Vec<Value> = pairs
        .iter()
        .filter_map(|p| p.venue_symbol(VenueId::Okx))
        .map(|s| json!({"channel": "bbo-tbt", "instId": s}))
        .collect();
    WsMessage::Text(
        json!({
            "id": "1",
            "op": if subscribe { "subscribe" } else { "unsubscribe" },
            "args": args
        })
        .to_string(),
    )
}

#[async_trait]
impl VenueClient for OkxClient {
    fn venue(&self) -> VenueId {
        VenueId::Okx
    }

    async fn connect(&self) -> Result<(), VenueError> {
        let config = SessionConfig::new(
            VenueId::Okx.as_str(),
            Arc::new(StaticEndpoint::new(WS_URL)),
        );
        let deps = self.deps.clone();
        let states = Arc::clone(&self.states);
        let resub = Arc::clone(&self.resub_frames);
        let session = FeedSession::open(config, move |sender| OkxHandler {
            sender,
            deps,
            states,
            resub_frames: resub,
            quotes: HashMap::new(),
        })
        .await
        .map_err(|e| VenueError::Transport {
            venue: VenueId::Okx,
            detail: e.to_string(),
        })?;

        *self.sender.lock() = Some(session.sender());
        *self.session.lock() = Some(session);
        info!(venue = %VenueId::Okx, "connected");
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
        let frame = bbo_frame(&self.pairs, true);
        *self.resub_frames.lock() = vec![frame.clone()];
        self.send_frame(frame)
    }

    fn resubscribe(&self, pairs: &[TradingPair]) -> Result<(), VenueError> {
        self.send_frame(bbo_frame(pairs, false))?;
        self.send_frame(bbo_frame(pairs, true))
    }

    async fn fetch_order_book_snapshot(&self, _pair: TradingPair) -> Result<(), VenueError> {
        // BBO frames are self-contained.
        if !self.is_connected() {
            return Err(VenueError::NotConnected(VenueId::Okx));
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
                "SIM-OKX-{}",
                Utc::now().timestamp_nanos_opt().unwrap_or(0)
            ));
        }
        if !self.is_connected() {
            return Err(VenueError::NotConnected(VenueId::Okx));
        }
        let symbol = pair
            .venue_symbol(VenueId::Okx)
            .ok_or(VenueError::UnknownSymbol {
                venue: VenueId::Okx,
                symbol: pair.symbol().into(),
            })?;
        let form = [
            ("instId", symbol.to_string()),
            ("tdMode", "cash".to_string()),
            (
                "side",
                match side {
                    Side::Buy => "buy".to_string(),
                    Side::Sell => "sell".to_string(),
                },
            ),
            ("ordType", "limit".to_string()),
            ("px", format_fixed8(price)),
            ("sz", format_fixed8(qty)),
        ];
        let response = self.rest.post_form("/api/v5/trade/order", &form, true).await?;
        response
            .pointer("/data/0/ordId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| VenueError::OrderRejected {
                venue: VenueId::Okx,
                reason: response.to_string(),
            })
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError> {
        if self.test_mode {
            return Ok(());
        }
        let form = [("ordId", venue_order_id.to_string())];
        self.rest
            .post_form("/api/v5/trade/cancel-order", &form, true)
            .await?;
        Ok(())
    }

    async fn fetch_balance(&self, asset: &str) -> Result<Decimal, VenueError> {
        if self.test_mode {
            return Ok(Decimal::ZERO);
        }
        let params = [("ccy", asset.to_string())];
        let response = self.rest.get_json("/api/v5/account/balance", &params, true).await?;
        Ok(response
            .pointer("/data/0/details/0/availBal")
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

#[derive(Default, Clone, Copy)]
struct Quote {
    bid_price: Decimal,
    bid_qty: Decimal,
    ask_price: Decimal,
    ask_qty: Decimal,
}

struct OkxHandler {
    sender: FeedSender,
    deps: VenueDeps,
    states: SharedSymbolStates,
    resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    quotes: HashMap<TradingPair, Quote>,
}

impl OkxHandler {
    fn process(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                bump(&self.deps.counters.malformed_message);
                return;
            }
        };

        match value.get("event").and_then(Value::as_str) {
            Some("subscribe") => {
                if let Some(symbol) = value.pointer("/arg/instId").and_then(Value::as_str) {
                    if let Some(pair) = TradingPair::from_venue_symbol(VenueId::Okx, symbol) {
                        let mut states = self.states.lock();
                        if let Some(state) = states.get_mut(&pair) {
                            state.subscribed = true;
                        }
                        debug!(venue = %VenueId::Okx, %pair, "subscription acknowledged");
                    }
                }
                return;
            }
            Some("unsubscribe") => return,
            Some("error") => {
                bump(&self.deps.counters.error_frame);
                warn!(venue = %VenueId::Okx, %value, "error frame");
                return;
            }
            Some(_) => {
                bump(&self.deps.counters.unknown_message);
                return;
            }
            None => {}
        }

        if value.pointer("/arg/channel").and_then(Value::as_str) == Some("bbo-tbt") {
            self.process_bbo(&value);
        } else {
            bump(&self.deps.counters.unknown_message);
        }
    }

    fn process_bbo(&mut self, value: &Value) {
        let Some(symbol) = value.pointer("/arg/instId").and_then(Value::as_str) else {
            bump(&self.deps.counters.malformed_message);
            return;
        };
        let Some(pair) = TradingPair::from_venue_symbol(VenueId::Okx, symbol) else {
            bump(&self.deps.counters.unknown_symbol);
            return;
        };
        let Some(data) = value.pointer("/data/0") else {
            bump(&self.deps.counters.malformed_message);
            return;
        };

        let seq_id = data.get("seqId").and_then(Value::as_i64).unwrap_or(0);
        {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(&pair) else {
                return;
            };
            if seq_id <= state.last_update_id {
                bump(&self.deps.counters.dropped_sequence);
                return;
            }
            state.last_update_id = seq_id;
            state.has_snapshot = true;
        }

        let quote = self.quotes.entry(pair).or_default();
        if let Some(bids) = data.get("bids").and_then(levels_from_pairs) {
            if let Some(level) = bids.first() {
                quote.bid_price = level.price;
                quote.bid_qty = level.qty;
            }
        }
        if let Some(asks) = data.get("asks").and_then(levels_from_pairs) {
            if let Some(level) = asks.first() {
                quote.ask_price = level.price;
                quote.ask_qty = level.qty;
            }
        }
        let quote = *quote;
        self.deps.books.apply_best_bid_ask(
            VenueId::Okx,
            pair,
            quote.bid_price,
            quote.bid_qty,
            quote.ask_price,
            quote.ask_qty,
        );
    }
}

impl FrameHandler for OkxHandler {
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
                self.quotes.clear();
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

    fn handler() -> OkxHandler {
        let deps = VenueDeps {
            books: OrderBookManager::new(&[VenueId::Okx], &[TradingPair::BtcUsdt], 100),
            timers: TimerService::new(),
            counters: AnomalyCounters::new(),
            settings: Arc::new(Settings::default()),
        };
        let (sender, _outbound) = FeedSender::detached();
        OkxHandler {
            sender,
            deps,
            states: new_symbol_states(&[TradingPair::BtcUsdt]),
            resub_frames: Arc::new(Mutex::new(Vec::new())),
            quotes: HashMap::new(),
        }
    }

    #[test]
    fn bbo_updates_top_of_book_with_seq_gate() {
        let mut h = handler();
        h.process(
            r#"{"arg":{"channel":"bbo-tbt","instId":"BTC-USDT"},
                "data":[{"asks":[["97101.0","1.2","0","4"]],"bids":[["97100.5","0.4","0","2"]],
                "ts":"1717","seqId":10}]}"#,
        );
        let book = h.deps.books.book(VenueId::Okx, TradingPair::BtcUsdt).unwrap();
        assert_eq!(book.read().best_ask(), dec!(97101.0));

        // Same seqId again: dropped.
        h.process(
            r#"{"arg":{"channel":"bbo-tbt","instId":"BTC-USDT"},
                "data":[{"asks":[["90000.0","1","0","1"]],"bids":[["89999.0","1","0","1"]],
                "ts":"1718","seqId":10}]}"#,
        );
        assert_eq!(h.deps.counters.dropped_sequence.load(Ordering::Relaxed), 1);
        assert_eq!(book.read().best_ask(), dec!(97101.0));
    }

    #[test]
    fn subscribe_ack_marks_pair() {
        let mut h = handler();
        h.process(r#"{"event":"subscribe","arg":{"channel":"bbo-tbt","instId":"BTC-USDT"}}"#);
        assert!(h.states.lock()[&TradingPair::BtcUsdt].subscribed);
    }
}
