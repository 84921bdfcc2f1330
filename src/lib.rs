//! Voice client core for chat-platform bots.
//!
//! Joins a server-side voice channel, keeps a control-plane session alive
//! over a secure WebSocket, discovers the external address over UDP, and
//! streams encrypted Opus frames at a fixed cadence.
//!
//! The embedding framework supplies the main-gateway and REST collaborators
//! (see [`bridge`]) and forwards their voice events into the session:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # async fn example(
//! #     gateway: Arc<dyn voicelink::MainGateway>,
//! #     users: Arc<dyn voicelink::UserApi>,
//! #     pcm: tokio::io::DuplexStream,
//! # ) -> voicelink::Result<()> {
//! use tokio_util::sync::CancellationToken;
//! use voicelink::{VoiceConfig, VoiceSession};
//!
//! let session = VoiceSession::new(gateway, users, VoiceConfig::default());
//! session.start(100, 200, false, false).await?;
//! session.transmit_audio(pcm, CancellationToken::new()).await?;
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod audio;
pub mod bridge;
pub mod common;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod rendezvous;
pub mod session;
pub mod udp;

pub use bridge::{
    HandshakePair, MainGateway, UserApi, VoiceServerSnapshot, VoiceStateCommand,
    VoiceStateSnapshot,
};
pub use common::{Result, VoiceError};
pub use config::{AudioOptimization, VoiceConfig};
pub use gateway::{InboundEvent, SpeakingFlags};
pub use session::{ConnectionStatus, VoiceSession};
