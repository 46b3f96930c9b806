/// A WebSocket data frame, text or binary.
#[derive(Debug, Clone)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WsMessage {
    /// Get the message as text, if it is text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            WsMessage::Text(s) => Some(s),
            WsMessage::Binary(_) => None,
        }
    }

    /// Get the message as binary, if it is binary
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            WsMessage::Text(_) => None,
            WsMessage::Binary(b) => Some(b),
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, WsMessage::Text(_))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, WsMessage::Binary(_))
    }
}

/// Lifecycle notifications delivered to the handler in-band with frames.
///
/// `Connected` arrives after the transport handshake and after the configured
/// subscription frames have been queued for replay, so a handler that needs to
/// issue per-connection requests (REST snapshots, late subscriptions) can do
/// so here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Transport established, subscriptions replayed
    Connected,
    /// Transport lost; a reconnect may follow
    Disconnected,
    /// Reconnect attempt starting (attempt number, 1-based)
    Reconnecting(usize),
}

/// Consumer of a session's inbound frames.
///
/// The handler runs on its own dedicated OS thread and receives frames in the
/// exact order they were read from the socket. Returning from `on_frame` is
/// the only form of backpressure; the inbound queue is unbounded.
pub trait FrameHandler: Send + 'static {
    /// Handle one inbound data frame.
    fn on_frame(&mut self, frame: WsMessage);

    /// Handle a session lifecycle event. Default: ignore.
    fn on_event(&mut self, _event: SessionEvent) {}
}
