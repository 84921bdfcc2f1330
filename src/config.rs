use serde::{Deserialize, Serialize};

use crate::audio::constants::VALID_FRAME_DURATIONS_MS;
use crate::common::{Result, VoiceError};

/// Which profile to hand the Opus encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioOptimization {
    /// Optimise for speech.
    Voip,
    /// Optimise for music and general audio.
    Audio,
    /// Optimise for latency at some quality cost.
    LowDelay,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct VoiceConfig {
    /// Milliseconds shaved off the announced heartbeat interval so beats go
    /// out slightly early. `None` means an eighth of the interval. The
    /// effective margin is always clamped to `[0, interval / 2]`.
    #[serde(default)]
    pub heartbeat_safety_margin_ms: Option<u64>,

    #[serde(default = "default_audio_optimization")]
    pub audio_optimization: AudioOptimization,

    /// Duration of one PCM sample fed to the encoder. Must be a frame
    /// duration Opus accepts at 48 kHz.
    #[serde(default = "default_sample_duration_ms")]
    pub sample_duration_ms: u32,

    /// Require heartbeat acks to echo the nonce we last sent. Off by
    /// default: the peer is known to echo zero.
    #[serde(default)]
    pub strict_heartbeat_nonce: bool,
}

fn default_audio_optimization() -> AudioOptimization {
    AudioOptimization::Audio
}

fn default_sample_duration_ms() -> u32 {
    40
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            heartbeat_safety_margin_ms: None,
            audio_optimization: default_audio_optimization(),
            sample_duration_ms: default_sample_duration_ms(),
            strict_heartbeat_nonce: false,
        }
    }
}

impl VoiceConfig {
    pub fn validate(&self) -> Result<()> {
        if !VALID_FRAME_DURATIONS_MS.contains(&self.sample_duration_ms) {
            return Err(VoiceError::ArgumentOutOfRange("sample_duration_ms"));
        }
        Ok(())
    }
}
