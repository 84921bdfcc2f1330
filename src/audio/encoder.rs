//! Opus encoder — wraps `audiopus` for encoding raw PCM into the packets
//! fed to the media transport.

use audiopus::coder::Encoder as OpusCoder;
use audiopus::{Application, Bitrate, Channels, SampleRate, Signal};

use super::constants::{CHANNELS, DEFAULT_BITRATE, EXPECTED_PACKET_LOSS_PERC, SAMPLE_RATE};
use crate::common::Result;
use crate::config::AudioOptimization;

pub struct OpusEncoder {
    encoder: OpusCoder,
}

impl OpusEncoder {
    /// Creates an encoder at 48 kHz stereo with the platform's fixed
    /// parameters: in-band FEC on, 15 % expected loss, 128 kbps.
    pub fn new(optimization: AudioOptimization) -> Result<Self> {
        let application = match optimization {
            AudioOptimization::Voip => Application::Voip,
            AudioOptimization::Audio => Application::Audio,
            AudioOptimization::LowDelay => Application::LowDelay,
        };
        let signal = match optimization {
            AudioOptimization::Voip => Signal::Voice,
            AudioOptimization::Audio => Signal::Music,
            AudioOptimization::LowDelay => Signal::Auto,
        };

        let mut encoder = OpusCoder::new(SampleRate::Hz48000, Channels::Stereo, application)?;
        encoder.set_signal(signal)?;
        encoder.set_packet_loss_perc(EXPECTED_PACKET_LOSS_PERC.into())?;
        encoder.set_inband_fec(true)?;
        encoder.set_bitrate(Bitrate::BitsPerSecond(DEFAULT_BITRATE))?;
        Ok(Self { encoder })
    }

    /// Encodes one frame of interleaved stereo PCM; returns the number of
    /// bytes written into `output`.
    pub fn encode(&mut self, input: &[i16], output: &mut [u8]) -> Result<usize> {
        let size = self.encoder.encode(input, output)?;
        Ok(size)
    }

    pub fn set_bitrate(&mut self, bits_per_second: i32) -> Result<()> {
        self.encoder
            .set_bitrate(Bitrate::BitsPerSecond(bits_per_second))?;
        Ok(())
    }

    /// Drops all codec state (call between unrelated streams).
    pub fn reset(&mut self) -> Result<()> {
        self.encoder.reset_state()?;
        Ok(())
    }
}

/// Bytes of interleaved stereo PCM16 covering `duration_ms`.
pub fn sample_size_bytes(duration_ms: u32) -> usize {
    duration_ms as usize * CHANNELS * (SAMPLE_RATE as usize / 1000) * 2
}

/// Samples per channel represented by a PCM16 buffer of `bytes` bytes.
pub fn frame_size_samples(bytes: usize) -> usize {
    bytes / CHANNELS / 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_math() {
        // 20 ms stereo at 48 kHz: 960 samples/channel, 2 ch, 2 bytes each.
        assert_eq!(sample_size_bytes(20), 3840);
        assert_eq!(sample_size_bytes(40), 7680);
        assert_eq!(frame_size_samples(3840), 960);
        assert_eq!(frame_size_samples(7680), 1920);
    }

    #[test]
    fn sample_math_round_trips() {
        for duration in [5u32, 10, 20, 40, 60] {
            let bytes = sample_size_bytes(duration);
            let samples = frame_size_samples(bytes);
            assert_eq!(samples as u32, duration * (SAMPLE_RATE / 1000));
        }
    }

    #[test]
    fn encodes_a_valid_frame() {
        let mut encoder = OpusEncoder::new(AudioOptimization::Audio).unwrap();
        // 40 ms of silence: 1920 samples/channel interleaved.
        let pcm = vec![0i16; frame_size_samples(sample_size_bytes(40)) * CHANNELS];
        let mut out = vec![0u8; super::super::constants::MAX_OPUS_PACKET];
        let n = encoder.encode(&pcm, &mut out).unwrap();
        assert!(n > 0);
        assert!(n <= pcm.len() * 2);
    }

    #[test]
    fn encoder_accepts_every_optimization() {
        for optimization in [
            AudioOptimization::Voip,
            AudioOptimization::Audio,
            AudioOptimization::LowDelay,
        ] {
            assert!(OpusEncoder::new(optimization).is_ok());
        }
    }

    #[test]
    fn reset_and_bitrate_do_not_error() {
        let mut encoder = OpusEncoder::new(AudioOptimization::Voip).unwrap();
        encoder.set_bitrate(96_000).unwrap();
        encoder.reset().unwrap();
    }
}
