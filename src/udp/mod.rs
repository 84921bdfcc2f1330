//! Media-plane transport: UDP socket, address discovery, RTP framing.

pub mod discovery;
pub mod encryption;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, trace};

use self::discovery::{IpDiscoveryRequest, IpDiscoveryResponse, PACKET_LEN};
use self::encryption::{EncryptionMode, PacketCrypter, SECRET_KEY_LEN};
use crate::audio::encoder::frame_size_samples;
use crate::common::{Result, VoiceError};
use crate::gateway::payload::Ready;

pub use self::encryption::{NONCE_LEN, TAG_LEN};

/// RTP version 2, no padding/extension/CSRC.
const RTP_VERSION_FLAGS: u8 = 0x80;
/// Dynamic payload type used for Opus voice traffic.
const RTP_PAYLOAD_TYPE: u8 = 0x78;
pub const RTP_HEADER_LEN: usize = 12;

const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(1000);

/// NAT mappings are observed to need traffic at least this often.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Owns the UDP socket and the RTP counters for one voice session.
///
/// Call order: [`select_encryption_mode`], [`connect`], [`initialize`],
/// then [`send_frame`] at the caller's cadence.
///
/// [`select_encryption_mode`]: MediaTransport::select_encryption_mode
/// [`connect`]: MediaTransport::connect
/// [`initialize`]: MediaTransport::initialize
/// [`send_frame`]: MediaTransport::send_frame
pub struct MediaTransport {
    socket: Option<UdpSocket>,
    mode: Option<EncryptionMode>,
    crypter: Option<PacketCrypter>,
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    packet_buf: Vec<u8>,
    keepalive_counter: u64,
    last_keepalive: Option<Instant>,
}

impl Default for MediaTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MediaTransport {
    pub fn new() -> Self {
        Self {
            socket: None,
            mode: None,
            crypter: None,
            ssrc: 0,
            sequence: 0,
            timestamp: 0,
            packet_buf: Vec::new(),
            keepalive_counter: 0,
            last_keepalive: None,
        }
    }

    /// Picks the first peer-advertised mode we support and latches it.
    pub fn select_encryption_mode(&mut self, offered: &[String]) -> Result<&'static str> {
        let mode = EncryptionMode::negotiate(offered)?;
        self.mode = Some(mode);
        Ok(mode.as_str())
    }

    /// Opens the socket towards the media server and runs the two-packet
    /// address discovery exchange. Latches the SSRC and seeds the RTP
    /// counters on success.
    pub async fn connect(&mut self, ready: &Ready) -> Result<IpDiscoveryResponse> {
        let addr: SocketAddr = format!("{}:{}", ready.ip, ready.port)
            .parse()
            .map_err(|_| VoiceError::IpDiscoveryFailed("invalid media server address"))?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;

        let request = IpDiscoveryRequest::new(ready.ssrc).pack();
        socket
            .send(&request)
            .await
            .map_err(|e| VoiceError::udp_send(&e))?;

        let mut buf = [0u8; PACKET_LEN];
        let n = tokio::time::timeout(DISCOVERY_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| VoiceError::IpDiscoveryFailed("timed out waiting for response"))??;
        let response = IpDiscoveryResponse::parse(&buf[..n])?;
        debug!(
            "discovered external address {}:{} for ssrc {}",
            response.address, response.port, ready.ssrc
        );

        self.socket = Some(socket);
        self.ssrc = ready.ssrc;
        self.sequence = rand::random::<u16>();
        self.timestamp = rand::random::<u16>() as u32;
        Ok(response)
    }

    /// Creates the AEAD state. Must run after [`Self::connect`] and before
    /// the first [`Self::send_frame`].
    pub fn initialize(&mut self, secret_key: [u8; SECRET_KEY_LEN]) -> Result<()> {
        let mode = self
            .mode
            .ok_or(VoiceError::InvalidState("no encryption mode selected"))?;
        self.crypter = Some(PacketCrypter::new(secret_key, mode));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.crypter.is_some() && self.socket.is_some()
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Builds and emits one RTP packet carrying `opus`. `pcm16_len` is the
    /// byte length of the PCM the frame was encoded from; it drives the
    /// timestamp advance.
    pub async fn send_frame(&mut self, opus: &[u8], pcm16_len: usize) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(VoiceError::NotInitialized)?;
        let crypter = self.crypter.as_ref().ok_or(VoiceError::NotInitialized)?;

        self.packet_buf.clear();
        self.packet_buf
            .reserve(RTP_HEADER_LEN + opus.len() + TAG_LEN + NONCE_LEN);
        self.packet_buf.push(RTP_VERSION_FLAGS);
        self.packet_buf.push(RTP_PAYLOAD_TYPE);
        self.packet_buf.extend_from_slice(&self.sequence.to_be_bytes());
        self.packet_buf.extend_from_slice(&self.timestamp.to_be_bytes());
        self.packet_buf.extend_from_slice(&self.ssrc.to_be_bytes());

        crypter.seal(&mut self.packet_buf, opus, self.timestamp)?;

        socket
            .send(&self.packet_buf)
            .await
            .map_err(|e| VoiceError::udp_send(&e))?;
        trace!(
            "sent rtp frame seq={} ts={} len={}",
            self.sequence,
            self.timestamp,
            self.packet_buf.len()
        );

        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self
            .timestamp
            .wrapping_add(frame_size_samples(pcm16_len) as u32);

        self.keepalive_if_due().await
    }

    /// Sends the periodic NAT keepalive datagram when one is due. Driven
    /// opportunistically from the send path.
    pub async fn keepalive_if_due(&mut self) -> Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        let due = self
            .last_keepalive
            .map_or(true, |at| at.elapsed() >= KEEPALIVE_INTERVAL);
        if !due {
            return Ok(());
        }
        self.keepalive_counter = self.keepalive_counter.wrapping_add(1);
        socket
            .send(&self.keepalive_counter.to_le_bytes())
            .await
            .map_err(|e| VoiceError::udp_send(&e))?;
        self.last_keepalive = Some(Instant::now());
        Ok(())
    }

    /// Drops the AEAD state and counters; the socket is released with it.
    pub fn disconnect(&mut self) {
        self.socket = None;
        self.crypter = None;
        self.mode = None;
        self.ssrc = 0;
        self.sequence = 0;
        self.timestamp = 0;
        self.keepalive_counter = 0;
        self.last_keepalive = None;
        self.packet_buf = Vec::new();
    }

    #[cfg(test)]
    pub(crate) fn set_counters(&mut self, sequence: u16, timestamp: u32) {
        self.sequence = sequence;
        self.timestamp = timestamp;
    }

    #[cfg(test)]
    pub(crate) fn counters(&self) -> (u16, u32) {
        (self.sequence, self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fake_media_server() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn ready_for(addr: SocketAddr, ssrc: u32) -> Ready {
        Ready {
            ssrc,
            ip: addr.ip().to_string(),
            port: addr.port(),
            modes: vec!["xsalsa20_poly1305".to_string()],
        }
    }

    async fn connected_transport(server: &UdpSocket, addr: SocketAddr) -> MediaTransport {
        let mut transport = MediaTransport::new();
        transport
            .select_encryption_mode(&["xsalsa20_poly1305".to_string()])
            .unwrap();

        let connect = transport.connect(&ready_for(addr, 42));
        let serve = async {
            let mut buf = [0u8; PACKET_LEN];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, PACKET_LEN);
            let response = IpDiscoveryResponse {
                ssrc: 42,
                address: "203.0.113.9".into(),
                port: 4242,
            };
            server.send_to(&response.pack(), peer).await.unwrap();
        };
        let (result, ()) = tokio::join!(connect, serve);
        let discovered = result.unwrap();
        assert_eq!(discovered.address, "203.0.113.9");
        assert_eq!(discovered.port, 4242);
        transport
    }

    #[tokio::test]
    async fn discovery_handshake_latches_ssrc() {
        let (server, addr) = fake_media_server().await;
        let transport = connected_transport(&server, addr).await;
        assert_eq!(transport.ssrc(), 42);
    }

    #[tokio::test]
    async fn discovery_times_out_when_peer_stays_silent() {
        // Keep the peer socket open but mute, so the exchange can only
        // end via the local timeout.
        let (_server, addr) = fake_media_server().await;
        let mut transport = MediaTransport::new();
        transport
            .select_encryption_mode(&["xsalsa20_poly1305".to_string()])
            .unwrap();
        let started = std::time::Instant::now();
        let err = transport.connect(&ready_for(addr, 1)).await.unwrap_err();
        assert!(matches!(err, VoiceError::IpDiscoveryFailed(_)));
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn send_before_initialize_fails() {
        let (server, addr) = fake_media_server().await;
        let mut transport = connected_transport(&server, addr).await;
        let err = transport.send_frame(&[1, 2, 3], 7680).await.unwrap_err();
        assert!(matches!(err, VoiceError::NotInitialized));
    }

    #[tokio::test]
    async fn frames_carry_advancing_counters() {
        let (server, addr) = fake_media_server().await;
        let mut transport = connected_transport(&server, addr).await;
        transport.initialize([3u8; 32]).unwrap();
        transport.set_counters(100, 5000);

        // 40 ms of stereo pcm16 at 48 kHz = 7680 bytes = 1920 samples.
        transport.send_frame(&[9; 50], 7680).await.unwrap();
        transport.send_frame(&[9; 50], 7680).await.unwrap();

        let mut buf = [0u8; 1500];
        // First datagram is the initial keepalive piggybacked on send_frame.
        let mut packets = Vec::new();
        for _ in 0..3 {
            let (n, _) = server.recv_from(&mut buf).await.unwrap();
            packets.push(buf[..n].to_vec());
        }
        let rtp: Vec<_> = packets.iter().filter(|p| p.len() > 12).collect();
        assert_eq!(rtp.len(), 2);

        let first = &rtp[0];
        assert_eq!(first[0], 0x80);
        assert_eq!(first[1], 0x78);
        assert_eq!(u16::from_be_bytes([first[2], first[3]]), 100);
        assert_eq!(
            u32::from_be_bytes([first[4], first[5], first[6], first[7]]),
            5000
        );
        assert_eq!(
            u32::from_be_bytes([first[8], first[9], first[10], first[11]]),
            42
        );
        assert_eq!(first.len(), 12 + 50 + TAG_LEN);

        let second = &rtp[1];
        assert_eq!(u16::from_be_bytes([second[2], second[3]]), 101);
        assert_eq!(
            u32::from_be_bytes([second[4], second[5], second[6], second[7]]),
            5000 + 1920
        );
    }

    #[tokio::test]
    async fn sequence_wraps_at_u16_max() {
        let (server, addr) = fake_media_server().await;
        let mut transport = connected_transport(&server, addr).await;
        transport.initialize([3u8; 32]).unwrap();
        transport.set_counters(u16::MAX, 0);

        transport.send_frame(&[1], 7680).await.unwrap();
        assert_eq!(transport.counters().0, 0);
        transport.send_frame(&[1], 7680).await.unwrap();
        assert_eq!(transport.counters().0, 1);
    }

    #[tokio::test]
    async fn disconnect_resets_state() {
        let (server, addr) = fake_media_server().await;
        let mut transport = connected_transport(&server, addr).await;
        transport.initialize([3u8; 32]).unwrap();
        assert!(transport.is_initialized());
        transport.disconnect();
        assert!(!transport.is_initialized());
        assert_eq!(transport.ssrc(), 0);
    }
}
