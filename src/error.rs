use thiserror::Error;

/// Errors surfaced by the signaling server and the call endpoint
#[derive(Debug, Error)]
pub enum Error {
    /// Camera/microphone could not be acquired
    #[error("media access failed: {0}")]
    MediaAccess(String),

    /// Remote description rejected or offer/answer creation failed
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// Operation not legal in the current negotiator state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Negotiator already closed
    #[error("session closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("display name must not be empty")]
    InvalidName,

    #[error("webrtc: {0}")]
    Transport(#[from] webrtc::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
