//! Bybit adapter: depth-1 stream treated as top-of-book.
//!
//! Subscriptions go out as `orderbook.1.<SYMBOL>` args, at most ten per
//! frame. Delta frames may carry only the side that moved, so the handler
//! keeps the last seen quote per pair and re-publishes the merged pair.

use super::http::{RateLimitHeader, RestClient};
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

const WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";
const REST_URL: &str = "https://api.bybit.com";
/// Venue cap on topics per subscribe frame.
const MAX_ARGS_PER_FRAME: usize = 10;

pub struct BybitClient {
    deps: VenueDeps,
    pairs: Vec<TradingPair>,
    rest: Arc<RestClient>,
    states: SharedSymbolStates,
    session: Mutex<Option<FeedSession>>,
    sender: Mutex<Option<FeedSender>>,
    resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    test_mode: bool,
}

impl BybitClient {
    pub fn new(deps: VenueDeps, pairs: Vec<TradingPair>, test_mode: bool) -> Self {
        let rest = Arc::new(RestClient::new(
            VenueId::Bybit,
            REST_URL,
            Arc::new(super::http::NoopSigner),
            Some(RateLimitHeader::Remaining {
                header: "x-bapi-limit-status",
                limit: 120,
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
            return Err(VenueError::NotConnected(VenueId::Bybit));
        };
        sender.send(frame).map_err(|e| VenueError::Transport {
            venue: VenueId::Bybit,
            detail: e.to_string(),
        })
    }
}

/// Batched subscribe/unsubscribe frames honoring the per-frame arg cap.
fn book_frames(pairs: &[TradingPair], subscribe: bool) -> Vec<WsMessage> {
    let args: Vec<String> = pairs
        .iter()
        .filter_map(|p| p.venue_symbol(VenueId::Bybit))
        .map(|s| format!("orderbook.1.{s}"))
        .collect();
    args.chunks(MAX_ARGS_PER_FRAME)
        .map(|chunk| {
            WsMessage::Text(
                json!({
                    "op": if subscribe { "subscribe" } else { "unsubscribe" },
                    "args": chunk
                })
                .to_string(),
            )
        })
        .collect()
}

#[async_trait]
impl VenueClient for BybitClient {
    fn venue(&self) -> VenueId {
        VenueId::Bybit
    }

    async fn connect(&self) -> Result<(), VenueError> {
        let config = SessionConfig::new(
            VenueId::Bybit.as_str(),
            Arc::new(StaticEndpoint::new(WS_URL)),
        );
        let deps = self.deps.clone();
        let states = Arc::clone(&self.states);
        let resub = Arc::clone(&self.resub_frames);
        let session = FeedSession::open(config, move |sender| BybitHandler {
            sender,
            deps,
            states,
            resub_frames: resub,
            quotes: HashMap::new(),
        })
        .await
        .map_err(|e| VenueError::Transport {
            venue: VenueId::Bybit,
            detail: e.to_string(),
        })?;

        *self.sender.lock() = Some(session.sender());
        *self.session.lock() = Some(session);
        info!(venue = %VenueId::Bybit, "connected");
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
        let frames = book_frames(&self.pairs, true);
        *self.resub_frames.lock() = frames.clone();
        for frame in frames {
            self.send_frame(frame)?;
        }
        Ok(())
    }

    fn resubscribe(&self, pairs: &[TradingPair]) -> Result<(), VenueError> {
        for frame in book_frames(pairs, false) {
            self.send_frame(frame)?;
        }
        for frame in book_frames(pairs, true) {
            self.send_frame(frame)?;
        }
        Ok(())
    }

    async fn fetch_order_book_snapshot(&self, _pair: TradingPair) -> Result<(), VenueError> {
        // Depth-1 snapshot arrives inline after subscribing.
        if !self.is_connected() {
            return Err(VenueError::NotConnected(VenueId::Bybit));
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
                "SIM-BYBIT-{}",
                Utc::now().timestamp_nanos_opt().unwrap_or(0)
            ));
        }
        if !self.is_connected() {
            return Err(VenueError::NotConnected(VenueId::Bybit));
        }
        let symbol = pair
            .venue_symbol(VenueId::Bybit)
            .ok_or(VenueError::UnknownSymbol {
                venue: VenueId::Bybit,
                symbol: pair.symbol().into(),
            })?;
        let form = [
            ("category", "spot".to_string()),
            ("symbol", symbol.to_string()),
            (
                "side",
                match side {
                    Side::Buy => "Buy".to_string(),
                    Side::Sell => "Sell".to_string(),
                },
            ),
            ("orderType", "Limit".to_string()),
            ("timeInForce", "GTC".to_string()),
            ("qty", format_fixed8(qty)),
            ("price", format_fixed8(price)),
        ];
        let response = self.rest.post_form("/v5/order/create", &form, true).await?;
        response
            .pointer("/result/orderId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| VenueError::OrderRejected {
                venue: VenueId::Bybit,
                reason: response.to_string(),
            })
    }

    async fn cancel_order(&self, venue_order_id: &str) -> Result<(), VenueError> {
        if self.test_mode {
            return Ok(());
        }
        let form = [
            ("category", "spot".to_string()),
            ("orderId", venue_order_id.to_string()),
        ];
        self.rest.post_form("/v5/order/cancel", &form, true).await?;
        Ok(())
    }

    async fn fetch_balance(&self, asset: &str) -> Result<Decimal, VenueError> {
        if self.test_mode {
            return Ok(Decimal::ZERO);
        }
        let params = [("accountType", "UNIFIED".to_string())];
        let response = self
            .rest
            .get_json("/v5/account/wallet-balance", &params, true)
            .await?;
        let coins = response
            .pointer("/result/list/0/coin")
            .and_then(Value::as_array)
            .ok_or_else(|| VenueError::Protocol {
                venue: VenueId::Bybit,
                detail: "wallet balance missing coin list".into(),
            })?;
        for coin in coins {
            if coin.get("coin").and_then(Value::as_str) == Some(asset) {
                return Ok(coin
                    .get("walletBalance")
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

#[derive(Default, Clone, Copy)]
struct Quote {
    bid_price: Decimal,
    bid_qty: Decimal,
    ask_price: Decimal,
    ask_qty: Decimal,
}

struct BybitHandler {
    sender: FeedSender,
    deps: VenueDeps,
    states: SharedSymbolStates,
    resub_frames: Arc<Mutex<Vec<WsMessage>>>,
    /// Last seen quote per pair; deltas may carry one side only
    quotes: HashMap<TradingPair, Quote>,
}

impl BybitHandler {
    fn process(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                bump(&self.deps.counters.malformed_message);
                return;
            }
        };

        if let Some(op) = value.get("op").and_then(Value::as_str) {
            let success = value.get("success").and_then(Value::as_bool).unwrap_or(false);
            if op == "subscribe" && success {
                let mut states = self.states.lock();
                for state in states.values_mut() {
                    state.subscribed = true;
                }
                debug!(venue = %VenueId::Bybit, "subscription acknowledged");
            } else if !success {
                bump(&self.deps.counters.error_frame);
                warn!(venue = %VenueId::Bybit, %value, "op failed");
            }
            return;
        }

        let Some(topic) = value.get("topic").and_then(Value::as_str) else {
            bump(&self.deps.counters.unknown_message);
            return;
        };
        let Some(symbol) = topic.strip_prefix("orderbook.1.") else {
            bump(&self.deps.counters.unknown_message);
            return;
        };
        let Some(pair) = TradingPair::from_venue_symbol(VenueId::Bybit, symbol) else {
            bump(&self.deps.counters.unknown_symbol);
            return;
        };
        let is_snapshot = value.get("type").and_then(Value::as_str) == Some("snapshot");
        let Some(data) = value.get("data") else {
            bump(&self.deps.counters.malformed_message);
            return;
        };

        let update_id = data.get("u").and_then(Value::as_i64).unwrap_or(0);
        {
            let mut states = self.states.lock();
            let Some(state) = states.get_mut(&pair) else {
                return;
            };
            if !is_snapshot && update_id <= state.last_update_id {
                bump(&self.deps.counters.dropped_sequence);
                return;
            }
            state.last_update_id = update_id;
            if is_snapshot {
                state.has_snapshot = true;
            }
        }

        let quote = self.quotes.entry(pair).or_default();
        if is_snapshot {
            *quote = Quote::default();
        }
        if let Some(bids) = data.get("b").and_then(levels_from_pairs) {
            if let Some(level) = bids.first() {
                quote.bid_price = level.price;
                quote.bid_qty = level.qty;
            }
        }
        if let Some(asks) = data.get("a").and_then(levels_from_pairs) {
            if let Some(level) = asks.first() {
                quote.ask_price = level.price;
                quote.ask_qty = level.qty;
            }
        }
        let quote = *quote;
        self.deps.books.apply_best_bid_ask(
            VenueId::Bybit,
            pair,
            quote.bid_price,
            quote.bid_qty,
            quote.ask_price,
            quote.ask_qty,
        );
    }
}

impl FrameHandler for BybitHandler {
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

    fn handler() -> BybitHandler {
        let deps = VenueDeps {
            books: OrderBookManager::new(&[VenueId::Bybit], &[TradingPair::BtcUsdt], 100),
            timers: TimerService::new(),
            counters: AnomalyCounters::new(),
            settings: Arc::new(Settings::default()),
        };
        let (sender, _outbound) = FeedSender::detached();
        BybitHandler {
            sender,
            deps,
            states: new_symbol_states(&[TradingPair::BtcUsdt]),
            resub_frames: Arc::new(Mutex::new(Vec::new())),
            quotes: HashMap::new(),
        }
    }

    #[test]
    fn subscribe_frames_batch_at_ten_args() {
        let frames = book_frames(&TradingPair::ALL, true);
        assert_eq!(frames.len(), 2);
        let first: Value = serde_json::from_str(frames[0].as_text().unwrap()).unwrap();
        assert_eq!(first["args"].as_array().unwrap().len(), 10);
        let second: Value = serde_json::from_str(frames[1].as_text().unwrap()).unwrap();
        assert_eq!(second["args"].as_array().unwrap().len(), 4);
    }

    #[test]
    fn snapshot_then_one_sided_delta_keeps_other_side() {
        let mut h = handler();
        h.process(
            r#"{"topic":"orderbook.1.BTCUSDT","type":"snapshot",
                "data":{"s":"BTCUSDT","b":[["100.0","1"]],"a":[["100.5","2"]],"u":1,"seq":1}}"#,
        );
        h.process(
            r#"{"topic":"orderbook.1.BTCUSDT","type":"delta",
                "data":{"s":"BTCUSDT","b":[["100.2","3"]],"a":[],"u":2,"seq":2}}"#,
        );
        let book = h.deps.books.book(VenueId::Bybit, TradingPair::BtcUsdt).unwrap();
        let book = book.read();
        assert_eq!(book.best_bid(), dec!(100.2));
        assert_eq!(book.best_bid_qty(), dec!(3));
        assert_eq!(book.best_ask(), dec!(100.5));
    }

    #[test]
    fn sequence_regression_is_dropped() {
        let mut h = handler();
        h.process(
            r#"{"topic":"orderbook.1.BTCUSDT","type":"snapshot",
                "data":{"s":"BTCUSDT","b":[["100.0","1"]],"a":[["100.5","2"]],"u":5,"seq":5}}"#,
        );
        h.process(
            r#"{"topic":"orderbook.1.BTCUSDT","type":"delta",
                "data":{"s":"BTCUSDT","b":[["99.0","1"]],"a":[],"u":5,"seq":5}}"#,
        );
        assert_eq!(h.deps.counters.dropped_sequence.load(Ordering::Relaxed), 1);
        let book = h.deps.books.book(VenueId::Bybit, TradingPair::BtcUsdt).unwrap();
        assert_eq!(book.read().best_bid(), dec!(100.0));
    }
}
