use thiserror::Error;

/// Main error type for feedsock
#[derive(Error, Debug)]
pub enum FeedError {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection closed unexpectedly
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Endpoint resolution failed (bootstrap request, URL parse)
    #[error("Endpoint error: {0}")]
    Endpoint(String),

    /// Channel send error
    #[error("Channel send error: {0}")]
    ChannelSend(String),

    /// Session is not running
    #[error("Session not running: {0}")]
    NotRunning(String),

    /// Reconnection failed
    #[error("Reconnection failed after {attempts} attempts: {reason}")]
    ReconnectionFailed { attempts: usize, reason: String },
}

/// Result type for feedsock operations
pub type Result<T> = std::result::Result<T, FeedError>;
