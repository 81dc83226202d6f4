// =============================================================================
// Error taxonomy for the reconciliation engine
// =============================================================================
//
// Most variants are handled internally (reconnect, drop, log). Only two ever
// reach embedders: `LedgerConflict` from ledger calls, and `Auth`, which
// flips the session's health flag and halts reconnection.
// =============================================================================

/// All errors produced by this crate.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Transport-level failure; the session reconnects.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed frame or response body; logged and dropped.
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// The venue rejected the login. Fatal: the session goes unhealthy and
    /// does not reconnect.
    #[error("login rejected by venue (code {code}): {msg}")]
    Auth { code: String, msg: String },

    /// A channel subscription was rejected; treated as transient.
    #[error("subscribe rejected for channel {channel} (code {code})")]
    Subscribe { channel: String, code: String },

    /// A bounded event queue was saturated; the newest event is dropped.
    #[error("queue full, dropped event {key}")]
    QueueFull { key: String },

    /// A fill arrived for a client order id the ledger does not know.
    #[error("fill for unknown client order id {cloid}")]
    LedgerConflict { cloid: String },

    /// The venue rejected a REST request.
    #[error("exchange rejected request (code {code}): {msg}")]
    Exchange { code: String, msg: String },

    /// A connect / ack / pong deadline elapsed; treated as a transport error.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// SQLite failure.
    #[error("storage error: {0}")]
    Store(#[from] rusqlite::Error),

    /// WebSocket protocol or I/O failure.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// HTTP transport failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    /// Auth failures halt the session instead of scheduling a reconnect.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;
