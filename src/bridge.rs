//! Collaborator seams: the main gateway and the REST user API.
//!
//! The voice core never talks to the platform's main gateway or REST
//! surface directly; the embedding framework implements these traits and
//! forwards the relevant events into [`crate::rendezvous`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::{ChannelId, Result, ServerId, SessionId, UserId};

/// A user's voice membership changed. The core only acts on snapshots whose
/// `user_id` is the bot's own.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceStateSnapshot {
    pub server_id: ServerId,
    pub user_id: UserId,
    pub session_id: SessionId,
}

/// The voice server assignment for one server namespace.
///
/// A `None` endpoint means the assigned server went away and the current
/// connection attempt cannot proceed.
#[derive(Debug, Clone, Deserialize)]
pub struct VoiceServerSnapshot {
    pub server_id: ServerId,
    pub endpoint: Option<String>,
    pub token: String,
}

/// The fused state/server pair, emitted exactly once per pending request.
#[derive(Debug, Clone)]
pub struct HandshakePair {
    pub state: VoiceStateSnapshot,
    pub server: VoiceServerSnapshot,
}

/// Outbound "update voice state" command submitted through the main gateway.
#[derive(Debug, Clone, Serialize)]
pub struct VoiceStateCommand {
    pub server_id: ServerId,
    /// `None` leaves voice entirely.
    pub channel_id: Option<ChannelId>,
    pub self_mute: bool,
    pub self_deaf: bool,
}

/// Message-bus view of the platform's main gateway.
#[async_trait]
pub trait MainGateway: Send + Sync {
    async fn update_voice_state(&self, command: VoiceStateCommand) -> Result<()>;
}

/// Narrow REST surface: just enough to learn our own user id.
#[async_trait]
pub trait UserApi: Send + Sync {
    async fn get_current_user(&self) -> Result<UserId>;
}
