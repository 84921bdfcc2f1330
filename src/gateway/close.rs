//! Close-code and error classification.
//!
//! The session runner consults this table — and only this table — to turn a
//! failure into a lifecycle decision.

use crate::common::VoiceError;

/// What the runner should do about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Normal closure or cancellation; the session winds down successfully.
    CleanExit,
    /// Replay missed events under the existing session id and token.
    Resume,
    /// Abandon the session and identify afresh.
    Reconnect,
    /// Unrecoverable; the session returns to Offline.
    Fatal,
}

pub fn classify(err: &VoiceError) -> ErrorAction {
    match err {
        VoiceError::Cancelled => ErrorAction::CleanExit,
        VoiceError::GatewayClosed(code) => classify_gateway_close(*code),
        VoiceError::WebSocketClosed(code) => classify_transport_close(*code),
        // Ack starvation is recoverable: drop to Disconnected and resume.
        VoiceError::HeartbeatTimeout => ErrorAction::Resume,
        // Local non-critical errors, HTTP/WebSocket exceptions, and anything
        // unclassified default to Resume.
        _ => ErrorAction::Resume,
    }
}

/// Voice gateway 4xxx close codes.
fn classify_gateway_close(code: u16) -> ErrorAction {
    match code {
        // 4004 authentication failed, 4014 disconnected (kicked / channel
        // deleted): the session is dead and must not be retried.
        4004 | 4014 => ErrorAction::Fatal,
        // 4003 not authenticated, 4006 session no longer valid, 4009 session
        // timeout, 4011 server not found, 4015 voice server crashed: needs a
        // fresh identify.
        4003 | 4006 | 4009 | 4011 | 4015 => ErrorAction::Reconnect,
        // 4001 unknown opcode, 4002 bad payload, 4005 already authenticated,
        // 4008 rate limited, 4012 unknown protocol, 4016 unknown encryption
        // mode: the session state survives, resume.
        4001 | 4002 | 4005 | 4008 | 4012 | 4016 => ErrorAction::Resume,
        _ => ErrorAction::Resume,
    }
}

/// Transport-level 1xxx close codes.
fn classify_transport_close(code: u16) -> ErrorAction {
    match code {
        1000 => ErrorAction::CleanExit,
        // 1001 endpoint going away, 1011 internal server error: the endpoint
        // itself is gone, start a new session.
        1001 | 1011 => ErrorAction::Reconnect,
        _ => ErrorAction::Resume,
    }
}
