// ===============================
// src/errors.rs
// ===============================
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Everything the session core can fail with. Transport and venue errors
/// are recoverable by retry or re-sync; `Invariant` and `Config` are not
/// and abort the process through the fatal channel.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    /// Venue answered with a non-zero business code.
    #[error("venue {code}: {msg}")]
    Venue { code: String, msg: String },

    #[error("unknown instrument {0}")]
    UnknownInstrument(String),

    /// A required mirror or ledger record is not live yet.
    #[error("not ready")]
    NotReady,

    /// Order rejected locally, before any network call.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Local state can no longer be trusted.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("config: {0}")]
    Config(String),
}

impl CoreError {
    pub fn venue(code: impl Into<String>, msg: impl Into<String>) -> Self {
        CoreError::Venue { code: code.into(), msg: msg.into() }
    }

    /// Fatal errors abort the process rather than retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CoreError::Invariant(_) | CoreError::Config(_))
    }
}
