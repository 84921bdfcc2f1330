//! External-address discovery packets.
//!
//! Both directions are exactly 74 bytes:
//! `u16 type | u16 length=70 | u32 ssrc | 64-byte address | u16 port`,
//! all integers big-endian. The request leaves address and port zeroed; the
//! response carries our public address NUL-padded.

use crate::common::{Result, VoiceError};

pub const PACKET_LEN: usize = 74;

const TYPE_REQUEST: u16 = 1;
const TYPE_RESPONSE: u16 = 2;
const FIELD_LEN: u16 = 70;

const ADDRESS_OFFSET: usize = 8;
const ADDRESS_LEN: usize = 64;
const PORT_OFFSET: usize = 72;

#[derive(Debug, Clone, Copy)]
pub struct IpDiscoveryRequest {
    pub ssrc: u32,
}

impl IpDiscoveryRequest {
    pub fn new(ssrc: u32) -> Self {
        Self { ssrc }
    }

    pub fn pack(&self) -> [u8; PACKET_LEN] {
        let mut packet = [0u8; PACKET_LEN];
        packet[0..2].copy_from_slice(&TYPE_REQUEST.to_be_bytes());
        packet[2..4].copy_from_slice(&FIELD_LEN.to_be_bytes());
        packet[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        packet
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpDiscoveryResponse {
    pub ssrc: u32,
    pub address: String,
    pub port: u16,
}

impl IpDiscoveryResponse {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() != PACKET_LEN {
            return Err(VoiceError::IpDiscoveryFailed("response is not 74 bytes"));
        }
        let kind = u16::from_be_bytes([buf[0], buf[1]]);
        if kind != TYPE_RESPONSE {
            return Err(VoiceError::IpDiscoveryFailed("packet is not a response"));
        }
        let length = u16::from_be_bytes([buf[2], buf[3]]);
        if length != FIELD_LEN {
            return Err(VoiceError::IpDiscoveryFailed("bad length field"));
        }
        let ssrc = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let address = std::str::from_utf8(&buf[ADDRESS_OFFSET..ADDRESS_OFFSET + ADDRESS_LEN])
            .map_err(|_| VoiceError::IpDiscoveryFailed("address is not utf-8"))?
            .trim_end_matches('\0')
            .to_string();
        let port = u16::from_be_bytes([buf[PORT_OFFSET], buf[PORT_OFFSET + 1]]);
        Ok(Self { ssrc, address, port })
    }

    /// Packs a response; the server side of the exchange, used by tests.
    pub fn pack(&self) -> [u8; PACKET_LEN] {
        let mut packet = [0u8; PACKET_LEN];
        packet[0..2].copy_from_slice(&TYPE_RESPONSE.to_be_bytes());
        packet[2..4].copy_from_slice(&FIELD_LEN.to_be_bytes());
        packet[4..8].copy_from_slice(&self.ssrc.to_be_bytes());
        let bytes = self.address.as_bytes();
        let n = bytes.len().min(ADDRESS_LEN);
        packet[ADDRESS_OFFSET..ADDRESS_OFFSET + n].copy_from_slice(&bytes[..n]);
        packet[PORT_OFFSET..].copy_from_slice(&self.port.to_be_bytes());
        packet
    }
}
