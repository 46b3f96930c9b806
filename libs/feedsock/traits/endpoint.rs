use crate::traits::error::Result;
use crate::traits::handler::WsMessage;
use async_trait::async_trait;
use std::time::Duration;

/// A resolved connection target.
///
/// The optional heartbeat is part of the endpoint because some venues hand
/// out the keep-alive interval together with the connection URL (KuCoin's
/// bullet bootstrap); static venues just attach a fixed one.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// Full `wss://` URL, including any token query parameters
    pub url: String,
    /// Outbound keep-alive: (interval, frame to send)
    pub heartbeat: Option<(Duration, WsMessage)>,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            heartbeat: None,
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration, frame: WsMessage) -> Self {
        self.heartbeat = Some((interval, frame));
        self
    }
}

/// Resolves the endpoint before every connection attempt.
///
/// Implementations may perform I/O: a venue that issues per-connection tokens
/// re-runs its bootstrap request on every reconnect.
#[async_trait]
pub trait EndpointProvider: Send + Sync {
    async fn endpoint(&self) -> Result<Endpoint>;
}

/// Fixed URL endpoint, optionally with a fixed heartbeat.
pub struct StaticEndpoint {
    endpoint: Endpoint,
}

impl StaticEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            endpoint: Endpoint::new(url),
        }
    }

    pub fn with_heartbeat(mut self, interval: Duration, frame: WsMessage) -> Self {
        self.endpoint = self.endpoint.with_heartbeat(interval, frame);
        self
    }
}

#[async_trait]
impl EndpointProvider for StaticEndpoint {
    async fn endpoint(&self) -> Result<Endpoint> {
        Ok(self.endpoint.clone())
    }
}
