use thiserror::Error;

use crate::common::types::ServerId;

/// A convenient Result alias returning [`VoiceError`].
pub type Result<T> = std::result::Result<T, VoiceError>;

/// Every failure the voice core can produce.
///
/// The session runner is the only place these are mapped to lifecycle
/// decisions (resume / reconnect / fatal); see [`crate::gateway::close`].
#[derive(Debug, Error)]
pub enum VoiceError {
    #[error("operation invalid while {0}")]
    InvalidState(&'static str),

    #[error("control payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("media transport not initialized")]
    NotInitialized,

    #[error("a handshake is already pending for server {0}")]
    AlreadyPending(ServerId),

    #[error("argument out of range: {0}")]
    ArgumentOutOfRange(&'static str),

    #[error("another caller is already transmitting on this session")]
    AlreadyTransmitting,

    /// The voice gateway closed the connection with one of its 4xxx codes.
    #[error("voice gateway closed with code {0}")]
    GatewayClosed(u16),

    #[error("voice gateway protocol violation: {0}")]
    ProtocolViolation(String),

    /// Transport-level WebSocket closure (1xxx codes, including the
    /// synthetic 1006 for a stream that ended without a close frame).
    #[error("websocket closed with code {0}")]
    WebSocketClosed(u16),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("websocket transport error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("payload codec error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("udp send failed (os error {code:?})")]
    UdpSendFailed { code: Option<i32> },

    #[error("ip discovery failed: {0}")]
    IpDiscoveryFailed(&'static str),

    #[error("no supported encryption mode among {0:?}")]
    NoSupportedEncryptionMode(Vec<String>),

    #[error("opus error: {0}")]
    Opus(audiopus::Error),

    #[error("aead sealing failed")]
    Crypto,

    #[error("heartbeat ack overdue")]
    HeartbeatTimeout,

    #[error("operation cancelled")]
    Cancelled,
}

// audiopus::Error predates the std Error blanket conventions, so no #[from].
impl From<audiopus::Error> for VoiceError {
    fn from(e: audiopus::Error) -> Self {
        Self::Opus(e)
    }
}

impl VoiceError {
    pub(crate) fn udp_send(e: &std::io::Error) -> Self {
        Self::UdpSendFailed { code: e.raw_os_error() }
    }
}
