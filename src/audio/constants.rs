/// Sample rate of audio sent to the voice server.
pub const SAMPLE_RATE: u32 = 48_000;

/// Channel count; the media path is stereo end to end.
pub const CHANNELS: usize = 2;

/// Bitrate ceiling the platform accepts.
pub const DEFAULT_BITRATE: i32 = 128_000;

/// Packet-loss percentage the encoder plans for.
pub const EXPECTED_PACKET_LOSS_PERC: u8 = 15;

/// Opus silence frame, sent a few times after speech so the peer's jitter
/// buffer flushes instead of interpolating.
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// How many silence frames terminate a transmission.
pub const SILENCE_FRAME_COUNT: usize = 5;

/// Frame durations Opus accepts at 48 kHz, in milliseconds.
pub const VALID_FRAME_DURATIONS_MS: [u32; 5] = [5, 10, 20, 40, 60];

/// Upper bound for one encoded Opus packet.
pub const MAX_OPUS_PACKET: usize = 4000;
