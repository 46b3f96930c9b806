use crate::core::state::{
    AtomicConnectionState, AtomicSessionMetrics, ConnectionState, SessionMetrics,
};
use crate::traits::*;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Inbound queue entries delivered to the handler thread.
enum HandlerInput {
    Frame(WsMessage),
    Event(SessionEvent),
}

/// Session configuration.
///
/// Subscription frames are replayed on every (re)connect; the venue adapter
/// owns the frame contents, the session owns the replay discipline.
pub struct SessionConfig {
    pub endpoint: Arc<dyn EndpointProvider>,
    pub subscriptions: Vec<WsMessage>,
    pub passive_ping: Option<Arc<dyn PassivePingDetector>>,
    pub reconnect: Arc<dyn ReconnectionStrategy>,
    /// Short tag used in log lines (venue name)
    pub label: String,
}

impl SessionConfig {
    pub fn new(label: impl Into<String>, endpoint: Arc<dyn EndpointProvider>) -> Self {
        Self {
            endpoint,
            subscriptions: Vec::new(),
            passive_ping: None,
            reconnect: Arc::new(ExponentialBackoff::new(
                Duration::from_millis(500),
                Duration::from_secs(30),
                None,
            )),
            label: label.into(),
        }
    }

    pub fn subscription(mut self, frame: WsMessage) -> Self {
        self.subscriptions.push(frame);
        self
    }

    pub fn subscriptions(mut self, frames: Vec<WsMessage>) -> Self {
        self.subscriptions.extend(frames);
        self
    }

    pub fn passive_ping(mut self, detector: Arc<dyn PassivePingDetector>) -> Self {
        self.passive_ping = Some(detector);
        self
    }

    pub fn reconnect(mut self, strategy: Arc<dyn ReconnectionStrategy>) -> Self {
        self.reconnect = strategy;
        self
    }
}

/// Cheap clonable producer handle onto the session's FIFO write queue.
///
/// Frames from any thread are serialized through the single session writer,
/// so no partial write can interleave with another producer's frame.
#[derive(Clone)]
pub struct FeedSender {
    tx: UnboundedSender<WsMessage>,
}

impl FeedSender {
    pub fn send(&self, frame: WsMessage) -> Result<()> {
        self.tx
            .send(frame)
            .map_err(|e| FeedError::ChannelSend(e.to_string()))
    }

    /// A sender paired with a raw receiver instead of a session. Lets adapter
    /// tests observe the frames a handler would have written to the socket.
    pub fn detached() -> (FeedSender, UnboundedReceiver<WsMessage>) {
        let (tx, rx) = unbounded_channel();
        (FeedSender { tx }, rx)
    }
}

/// One WebSocket session to a venue.
///
/// Owns a tokio task for socket I/O and a dedicated OS thread running the
/// [`FrameHandler`] in receive order: async transport, synchronous
/// per-venue processing.
pub struct FeedSession {
    sender: FeedSender,
    state: Arc<AtomicConnectionState>,
    metrics: Arc<AtomicSessionMetrics>,
    running: Arc<AtomicBool>,
    close: Arc<Notify>,
    io_handle: Option<tokio::task::JoinHandle<()>>,
    handler_handle: Option<std::thread::JoinHandle<()>>,
}

impl FeedSession {
    /// Open a session.
    ///
    /// `make_handler` receives the session's [`FeedSender`] so the handler can
    /// respond to venue messages (heartbeat echoes, resubscriptions) on the
    /// same socket.
    pub async fn open<H, F>(config: SessionConfig, make_handler: F) -> Result<FeedSession>
    where
        H: FrameHandler,
        F: FnOnce(FeedSender) -> H,
    {
        let state = Arc::new(AtomicConnectionState::new(ConnectionState::Disconnected));
        let metrics = Arc::new(AtomicSessionMetrics::default());
        let running = Arc::new(AtomicBool::new(true));
        let close = Arc::new(Notify::new());

        let (out_tx, out_rx) = unbounded_channel();
        let (in_tx, in_rx) = crossbeam_channel::unbounded::<HandlerInput>();
        let sender = FeedSender { tx: out_tx };

        let mut handler = make_handler(sender.clone());
        let handler_label = config.label.clone();
        let handler_handle = std::thread::Builder::new()
            .name(format!("feed-{}", handler_label))
            .spawn(move || {
                // Exits when the I/O task drops its end of the channel.
                while let Ok(input) = in_rx.recv() {
                    match input {
                        HandlerInput::Frame(frame) => handler.on_frame(frame),
                        HandlerInput::Event(event) => handler.on_event(event),
                    }
                }
                debug!(session = %handler_label, "handler thread exiting");
            })
            .map_err(|e| FeedError::NotRunning(e.to_string()))?;

        let io_handle = {
            let state = Arc::clone(&state);
            let metrics = Arc::clone(&metrics);
            let running = Arc::clone(&running);
            let close = Arc::clone(&close);
            tokio::spawn(async move {
                run_session(config, state, metrics, running, close, out_rx, in_tx).await;
            })
        };

        Ok(FeedSession {
            sender,
            state,
            metrics,
            running,
            close,
            io_handle: Some(io_handle),
            handler_handle: Some(handler_handle),
        })
    }

    /// Queue a frame for sending. FIFO order is preserved per session.
    pub fn send(&self, frame: WsMessage) -> Result<()> {
        self.sender.send(frame)
    }

    /// Clonable handle onto the write queue.
    pub fn sender(&self) -> FeedSender {
        self.sender.clone()
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn metrics(&self) -> SessionMetrics {
        SessionMetrics {
            frames_sent: self.metrics.frames_sent(),
            frames_received: self.metrics.frames_received(),
            reconnect_count: self.metrics.reconnects(),
            connection_state: self.state.get(),
        }
    }

    /// Stop the session: close the socket, end the I/O task, drain and join
    /// the handler thread.
    pub async fn shutdown(mut self) {
        self.running.store(false, Ordering::Release);
        self.state.set(ConnectionState::ShuttingDown);
        // notify_one leaves a permit, so the close wins even if the I/O task
        // is not parked in its select yet.
        self.close.notify_one();

        if let Some(handle) = self.io_handle.take() {
            let _ = handle.await;
        }
        // The I/O task dropped the inbound channel; the handler thread drains
        // what is queued and exits.
        if let Some(handle) = self.handler_handle.take() {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
        info!("session shut down");
    }
}

/// Outer connect/reconnect loop.
async fn run_session(
    config: SessionConfig,
    state: Arc<AtomicConnectionState>,
    metrics: Arc<AtomicSessionMetrics>,
    running: Arc<AtomicBool>,
    close: Arc<Notify>,
    mut out_rx: UnboundedReceiver<WsMessage>,
    in_tx: crossbeam_channel::Sender<HandlerInput>,
) {
    let mut attempt = 0usize;

    loop {
        if !running.load(Ordering::Acquire) {
            break;
        }

        state.set(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });
        if attempt > 0 {
            let _ = in_tx.send(HandlerInput::Event(SessionEvent::Reconnecting(attempt)));
        }

        match config.endpoint.endpoint().await {
            Ok(endpoint) => match connect_async(&endpoint.url).await {
                Ok((ws_stream, _)) => {
                    info!(session = %config.label, url = %endpoint.url, "connected");
                    state.set(ConnectionState::Connected);
                    attempt = 0;

                    let result = run_connection(
                        ws_stream,
                        &endpoint,
                        &config,
                        &metrics,
                        &running,
                        &close,
                        &mut out_rx,
                        &in_tx,
                    )
                    .await;
                    if let Err(e) = result {
                        error!(session = %config.label, "connection error: {e}");
                    }

                    state.set(ConnectionState::Disconnected);
                    let _ = in_tx.send(HandlerInput::Event(SessionEvent::Disconnected));
                }
                Err(e) => {
                    error!(session = %config.label, "failed to connect: {e}");
                    state.set(ConnectionState::Disconnected);
                }
            },
            Err(e) => {
                error!(session = %config.label, "endpoint resolution failed: {e}");
                state.set(ConnectionState::Disconnected);
            }
        }

        if !running.load(Ordering::Acquire) {
            break;
        }

        match config.reconnect.next_delay(attempt) {
            Some(delay) => {
                info!(
                    session = %config.label,
                    "reconnecting in {delay:?} (attempt {})",
                    attempt + 1
                );
                // Sleep in slices so shutdown is not delayed by a long backoff.
                let mut elapsed = Duration::ZERO;
                while elapsed < delay {
                    if !running.load(Ordering::Acquire) {
                        return;
                    }
                    let step = Duration::from_millis(100).min(delay - elapsed);
                    tokio::time::sleep(step).await;
                    elapsed += step;
                }
                attempt += 1;
                metrics.increment_reconnects();
            }
            None => {
                warn!(session = %config.label, "reconnection strategy exhausted, stopping");
                break;
            }
        }
    }

    debug!(session = %config.label, "I/O task exiting");
}

/// One established connection: subscription replay, heartbeat, read/write loop.
async fn run_connection(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    endpoint: &Endpoint,
    config: &SessionConfig,
    metrics: &AtomicSessionMetrics,
    running: &AtomicBool,
    close: &Notify,
    out_rx: &mut UnboundedReceiver<WsMessage>,
    in_tx: &crossbeam_channel::Sender<HandlerInput>,
) -> Result<()> {
    let (mut write, mut read) = ws_stream.split();

    for sub in &config.subscriptions {
        write
            .send(to_tungstenite(sub))
            .await
            .map_err(|e| FeedError::WebSocket(format!("failed to send subscription: {e}")))?;
        metrics.increment_sent();
    }
    let _ = in_tx.send(HandlerInput::Event(SessionEvent::Connected));

    let heartbeat = endpoint.heartbeat.clone();
    let mut ticker = tokio::time::interval(
        heartbeat
            .as_ref()
            .map(|(interval, _)| *interval)
            .unwrap_or(Duration::from_secs(3600)),
    );
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        if !running.load(Ordering::Acquire) {
            let _ = write.close().await;
            return Ok(());
        }

        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Ping(payload))) => {
                        write
                            .send(Message::Pong(payload))
                            .await
                            .map_err(|e| FeedError::WebSocket(e.to_string()))?;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        return Err(FeedError::ConnectionClosed(format!("{frame:?}")));
                    }
                    Some(Ok(msg)) => {
                        metrics.increment_received();
                        if let Some(frame) = from_tungstenite(msg) {
                            if let Some(detector) = &config.passive_ping {
                                if detector.is_ping(&frame) {
                                    let pong = detector.pong_response(&frame);
                                    write
                                        .send(to_tungstenite(&pong))
                                        .await
                                        .map_err(|e| FeedError::WebSocket(e.to_string()))?;
                                    metrics.increment_sent();
                                    continue;
                                }
                            }
                            // Channel closure only happens during shutdown.
                            let _ = in_tx.send(HandlerInput::Frame(frame));
                        }
                    }
                    Some(Err(e)) => return Err(FeedError::WebSocket(e.to_string())),
                    None => return Err(FeedError::ConnectionClosed("stream ended".into())),
                }
            }

            outbound = out_rx.recv() => {
                match outbound {
                    Some(frame) => {
                        write
                            .send(to_tungstenite(&frame))
                            .await
                            .map_err(|e| FeedError::WebSocket(e.to_string()))?;
                        metrics.increment_sent();
                    }
                    None => {
                        let _ = write.close().await;
                        return Ok(());
                    }
                }
            }

            _ = close.notified() => {
                let _ = write.close().await;
                return Ok(());
            }

            _ = ticker.tick(), if heartbeat.is_some() => {
                if let Some((_, frame)) = &heartbeat {
                    write
                        .send(to_tungstenite(frame))
                        .await
                        .map_err(|e| FeedError::WebSocket(format!("failed to send heartbeat: {e}")))?;
                    metrics.increment_sent();
                }
            }
        }
    }
}

fn to_tungstenite(frame: &WsMessage) -> Message {
    match frame {
        WsMessage::Text(text) => Message::Text(text.clone()),
        WsMessage::Binary(data) => Message::Binary(data.clone()),
    }
}

fn from_tungstenite(msg: Message) -> Option<WsMessage> {
    match msg {
        Message::Text(text) => Some(WsMessage::Text(text)),
        Message::Binary(data) => Some(WsMessage::Binary(data)),
        _ => None,
    }
}
