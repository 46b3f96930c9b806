use crate::traits::handler::WsMessage;

/// Detects application-level pings sent as ordinary data frames.
///
/// Several venues keep the connection alive with JSON or text pings rather
/// than WebSocket PING frames. A detected ping is answered immediately by the
/// session writer and never reaches the frame handler.
pub trait PassivePingDetector: Send + Sync {
    /// Check whether an inbound frame is a ping.
    fn is_ping(&self, frame: &WsMessage) -> bool;

    /// The frame to send back when `is_ping` returned true.
    fn pong_response(&self, frame: &WsMessage) -> WsMessage;
}

/// Exact-text ping with a fixed response ("PING" / "PONG" style).
pub struct TextPassivePing {
    ping_text: String,
    pong_text: String,
}

impl TextPassivePing {
    pub fn new(ping_text: impl Into<String>, pong_text: impl Into<String>) -> Self {
        Self {
            ping_text: ping_text.into(),
            pong_text: pong_text.into(),
        }
    }
}

impl PassivePingDetector for TextPassivePing {
    fn is_ping(&self, frame: &WsMessage) -> bool {
        frame
            .as_text()
            .map(|text| text == self.ping_text)
            .unwrap_or(false)
    }

    fn pong_response(&self, _frame: &WsMessage) -> WsMessage {
        WsMessage::Text(self.pong_text.clone())
    }
}

/// JSON-field ping detector with a fixed response.
///
/// Detects frames where `field` equals `ping_value`, e.g. `{"type":"ping"}`.
pub struct JsonPassivePing {
    field: String,
    ping_value: String,
    pong_response: String,
}

impl JsonPassivePing {
    pub fn new(
        field: impl Into<String>,
        ping_value: impl Into<String>,
        pong_response: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            ping_value: ping_value.into(),
            pong_response: pong_response.into(),
        }
    }
}

impl PassivePingDetector for JsonPassivePing {
    fn is_ping(&self, frame: &WsMessage) -> bool {
        if let Some(text) = frame.as_text() {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(text) {
                if let Some(value) = json.get(&self.field) {
                    return value.as_str() == Some(&self.ping_value);
                }
            }
        }
        false
    }

    fn pong_response(&self, _frame: &WsMessage) -> WsMessage {
        WsMessage::Text(self.pong_response.clone())
    }
}
