//! Packet encryption modes and per-mode nonce construction.

use xsalsa20poly1305::aead::{Aead, KeyInit};
use xsalsa20poly1305::{Nonce, XSalsa20Poly1305};

use crate::common::{Result, VoiceError};

pub const SECRET_KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
/// Poly1305 authentication tag appended by the AEAD.
pub const TAG_LEN: usize = 16;

/// The XSalsa20-Poly1305 family the voice server offers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMode {
    /// Nonce is the RTP header zero-padded to 24 bytes.
    XSalsa20Poly1305,
    /// Random 24-byte nonce appended to the packet.
    XSalsa20Poly1305Suffix,
    /// 4-byte big-endian counter (the RTP timestamp) appended to the packet.
    XSalsa20Poly1305Lite,
}

impl EncryptionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::XSalsa20Poly1305 => "xsalsa20_poly1305",
            Self::XSalsa20Poly1305Suffix => "xsalsa20_poly1305_suffix",
            Self::XSalsa20Poly1305Lite => "xsalsa20_poly1305_lite",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "xsalsa20_poly1305" => Some(Self::XSalsa20Poly1305),
            "xsalsa20_poly1305_suffix" => Some(Self::XSalsa20Poly1305Suffix),
            "xsalsa20_poly1305_lite" => Some(Self::XSalsa20Poly1305Lite),
            _ => None,
        }
    }

    /// Picks the first peer-advertised mode this client recognises.
    pub fn negotiate(offered: &[String]) -> Result<Self> {
        offered
            .iter()
            .find_map(|name| Self::parse(name))
            .ok_or_else(|| VoiceError::NoSupportedEncryptionMode(offered.to_vec()))
    }

    /// Bytes this mode appends after the ciphertext.
    pub fn trailer_len(self) -> usize {
        match self {
            Self::XSalsa20Poly1305 => 0,
            Self::XSalsa20Poly1305Suffix => NONCE_LEN,
            Self::XSalsa20Poly1305Lite => 4,
        }
    }
}

/// Seals Opus frames into RTP packets under a fixed key and mode.
pub struct PacketCrypter {
    cipher: XSalsa20Poly1305,
    mode: EncryptionMode,
}

impl PacketCrypter {
    pub fn new(secret_key: [u8; SECRET_KEY_LEN], mode: EncryptionMode) -> Self {
        Self {
            cipher: XSalsa20Poly1305::new(&secret_key.into()),
            mode,
        }
    }

    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Appends `ciphertext || trailer` to `packet`, whose first 12 bytes
    /// must already hold the RTP header. `timestamp` is the header's RTP
    /// timestamp, reused as the lite-mode counter.
    pub fn seal(&self, packet: &mut Vec<u8>, opus: &[u8], timestamp: u32) -> Result<()> {
        match self.mode {
            EncryptionMode::XSalsa20Poly1305 => {
                let mut nonce = [0u8; NONCE_LEN];
                nonce[..12].copy_from_slice(&packet[..12]);
                let sealed = self
                    .cipher
                    .encrypt(Nonce::from_slice(&nonce), opus)
                    .map_err(|_| VoiceError::Crypto)?;
                packet.extend_from_slice(&sealed);
            }
            EncryptionMode::XSalsa20Poly1305Suffix => {
                let nonce: [u8; NONCE_LEN] = rand::random();
                let sealed = self
                    .cipher
                    .encrypt(Nonce::from_slice(&nonce), opus)
                    .map_err(|_| VoiceError::Crypto)?;
                packet.extend_from_slice(&sealed);
                packet.extend_from_slice(&nonce);
            }
            EncryptionMode::XSalsa20Poly1305Lite => {
                let counter = timestamp.to_be_bytes();
                let mut nonce = [0u8; NONCE_LEN];
                nonce[..4].copy_from_slice(&counter);
                let sealed = self
                    .cipher
                    .encrypt(Nonce::from_slice(&nonce), opus)
                    .map_err(|_| VoiceError::Crypto)?;
                packet.extend_from_slice(&sealed);
                packet.extend_from_slice(&counter);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> Vec<u8> {
        let mut packet = vec![0u8; 12];
        packet[0] = 0x80;
        packet[1] = 0x78;
        packet
    }

    #[test]
    fn negotiates_first_recognised_mode() {
        let offered = vec![
            "aead_aes256_gcm".to_string(),
            "xsalsa20_poly1305_lite".to_string(),
            "xsalsa20_poly1305".to_string(),
        ];
        assert_eq!(
            EncryptionMode::negotiate(&offered).unwrap(),
            EncryptionMode::XSalsa20Poly1305Lite
        );
    }

    #[test]
    fn no_recognised_mode_errors() {
        let offered = vec!["aead_aes256_gcm_rtpsize".to_string()];
        assert!(matches!(
            EncryptionMode::negotiate(&offered),
            Err(VoiceError::NoSupportedEncryptionMode(_))
        ));
    }

    #[test]
    fn mode_names_round_trip() {
        for mode in [
            EncryptionMode::XSalsa20Poly1305,
            EncryptionMode::XSalsa20Poly1305Suffix,
            EncryptionMode::XSalsa20Poly1305Lite,
        ] {
            assert_eq!(EncryptionMode::parse(mode.as_str()), Some(mode));
        }
    }

    #[test]
    fn base_mode_packet_length() {
        let crypter = PacketCrypter::new([7u8; 32], EncryptionMode::XSalsa20Poly1305);
        let mut packet = header();
        crypter.seal(&mut packet, &[1, 2, 3, 4], 960).unwrap();
        assert_eq!(packet.len(), 12 + 4 + TAG_LEN);
    }

    #[test]
    fn suffix_mode_appends_nonce() {
        let crypter = PacketCrypter::new([7u8; 32], EncryptionMode::XSalsa20Poly1305Suffix);
        let mut packet = header();
        crypter.seal(&mut packet, &[1, 2, 3, 4], 960).unwrap();
        assert_eq!(packet.len(), 12 + 4 + TAG_LEN + NONCE_LEN);
    }

    #[test]
    fn lite_mode_appends_timestamp_counter() {
        let crypter = PacketCrypter::new([7u8; 32], EncryptionMode::XSalsa20Poly1305Lite);
        let mut packet = header();
        crypter.seal(&mut packet, &[1, 2, 3, 4], 0x01020304).unwrap();
        assert_eq!(packet.len(), 12 + 4 + TAG_LEN + 4);
        assert_eq!(&packet[packet.len() - 4..], &[0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn different_keys_differ() {
        let a = PacketCrypter::new([1u8; 32], EncryptionMode::XSalsa20Poly1305);
        let b = PacketCrypter::new([2u8; 32], EncryptionMode::XSalsa20Poly1305);
        let mut pa = header();
        let mut pb = header();
        a.seal(&mut pa, &[9; 8], 0).unwrap();
        b.seal(&mut pb, &[9; 8], 0).unwrap();
        assert_ne!(pa, pb);
    }
}
