//! Typed control-plane payloads and the `{op, d}` wire envelope.
//!
//! Outbound and inbound payloads are separate tagged unions; the opcode ↔
//! variant mapping lives here and nowhere else, so the framing boundary is
//! the only place raw JSON is touched.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::common::{Result, ServerId, SessionId, UserId, VoiceError};

/// Wire envelope for every control-plane message.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
}

/// Voice gateway opcodes (protocol v4).
pub mod opcode {
    pub const IDENTIFY: u8 = 0;
    pub const SELECT_PROTOCOL: u8 = 1;
    pub const READY: u8 = 2;
    pub const HEARTBEAT: u8 = 3;
    pub const SESSION_DESCRIPTION: u8 = 4;
    pub const SPEAKING: u8 = 5;
    pub const HEARTBEAT_ACK: u8 = 6;
    pub const RESUME: u8 = 7;
    pub const HELLO: u8 = 8;
    pub const RESUMED: u8 = 9;
    pub const CLIENT_DISCONNECT: u8 = 13;
    pub const CODEC_DESCRIPTION: u8 = 14;
}

/// Snowflake ids travel as strings on the wire but as `u64` in the API.
pub(crate) mod string_id {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Text(String),
        }
        match Raw::deserialize(d)? {
            Raw::Num(n) => Ok(n),
            Raw::Text(t) => t.parse().map_err(de::Error::custom),
        }
    }
}

/// Speaking state bitflags (op 5 `speaking` field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SpeakingFlags(pub u32);

impl SpeakingFlags {
    pub const NONE: Self = Self(0);
    pub const MICROPHONE: Self = Self(1 << 0);
    pub const SOUNDSHARE: Self = Self(1 << 1);
    pub const PRIORITY: Self = Self(1 << 2);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    #[serde(with = "string_id")]
    pub server_id: ServerId,
    #[serde(with = "string_id")]
    pub user_id: UserId,
    pub session_id: SessionId,
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProtocolData {
    pub address: String,
    pub port: u16,
    pub mode: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SelectProtocol {
    pub protocol: String,
    pub data: ProtocolData,
}

impl SelectProtocol {
    pub fn udp(address: String, port: u16, mode: String) -> Self {
        Self {
            protocol: "udp".to_string(),
            data: ProtocolData { address, port, mode },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Resume {
    #[serde(with = "string_id")]
    pub server_id: ServerId,
    pub session_id: SessionId,
    pub token: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Speaking {
    pub speaking: SpeakingFlags,
    pub delay: u32,
    pub ssrc: u32,
}

/// Everything the client can put on the wire.
#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Identify(Identify),
    SelectProtocol(SelectProtocol),
    /// The nonce is echoed back in the ack (op 6).
    Heartbeat { nonce: u64 },
    Speaking(Speaking),
    Resume(Resume),
}

impl OutboundPayload {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::Identify(_) => opcode::IDENTIFY,
            Self::SelectProtocol(_) => opcode::SELECT_PROTOCOL,
            Self::Heartbeat { .. } => opcode::HEARTBEAT,
            Self::Speaking(_) => opcode::SPEAKING,
            Self::Resume(_) => opcode::RESUME,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope> {
        let d = match self {
            Self::Identify(p) => serde_json::to_value(p)?,
            Self::SelectProtocol(p) => serde_json::to_value(p)?,
            // Op 3 carries the bare nonce, not an object.
            Self::Heartbeat { nonce } => Value::from(*nonce),
            Self::Speaking(p) => serde_json::to_value(p)?,
            Self::Resume(p) => serde_json::to_value(p)?,
        };
        Ok(Envelope {
            op: self.opcode(),
            d,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    pub heartbeat_interval: f64,
}

impl Hello {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ready {
    pub ssrc: u32,
    pub ip: String,
    pub port: u16,
    pub modes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionDescription {
    #[serde(default)]
    pub mode: Option<String>,
    pub secret_key: Vec<u8>,
}

impl SessionDescription {
    /// The 32-byte AEAD key, rejecting malformed announcements.
    pub fn secret_key(&self) -> Result<[u8; 32]> {
        self.secret_key
            .as_slice()
            .try_into()
            .map_err(|_| VoiceError::ProtocolViolation("secret_key is not 32 bytes".into()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpeakingEvent {
    pub speaking: SpeakingFlags,
    pub ssrc: u32,
    #[serde(default, deserialize_with = "opt_string_id")]
    pub user_id: Option<UserId>,
}

fn opt_string_id<'de, D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Option<UserId>, D::Error> {
    #[derive(Deserialize)]
    struct Wrap(#[serde(with = "string_id")] u64);
    Ok(Option::<Wrap>::deserialize(d)?.map(|w| w.0))
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientDisconnect {
    #[serde(with = "string_id")]
    pub user_id: UserId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CodecDescription {
    #[serde(default)]
    pub audio_codec: Option<String>,
    #[serde(default)]
    pub video_codec: Option<String>,
}

/// Everything the server can put on the wire.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    Hello(Hello),
    Ready(Ready),
    SessionDescription(SessionDescription),
    HeartbeatAck { nonce: u64 },
    Resumed,
    Speaking(SpeakingEvent),
    ClientDisconnect(ClientDisconnect),
    CodecDescription(CodecDescription),
    /// Opcode this client does not understand; logged and skipped upstream.
    Unknown { op: u8 },
}

impl InboundEvent {
    /// Decodes one complete text message. Decoding errors are returned
    /// verbatim as [`VoiceError::Json`].
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let event = match envelope.op {
            opcode::HELLO => Self::Hello(serde_json::from_value(envelope.d)?),
            opcode::READY => Self::Ready(serde_json::from_value(envelope.d)?),
            opcode::SESSION_DESCRIPTION => {
                Self::SessionDescription(serde_json::from_value(envelope.d)?)
            }
            // The ack body is the echoed nonce; some peers send zero.
            opcode::HEARTBEAT_ACK => Self::HeartbeatAck {
                nonce: serde_json::from_value(envelope.d).unwrap_or(0),
            },
            opcode::RESUMED => Self::Resumed,
            opcode::SPEAKING => Self::Speaking(serde_json::from_value(envelope.d)?),
            opcode::CLIENT_DISCONNECT => {
                Self::ClientDisconnect(serde_json::from_value(envelope.d)?)
            }
            opcode::CODEC_DESCRIPTION => {
                Self::CodecDescription(serde_json::from_value(envelope.d)?)
            }
            op => Self::Unknown { op },
        };
        Ok(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_ids_travel_as_strings() {
        let payload = OutboundPayload::Identify(Identify {
            server_id: 100,
            user_id: 7,
            session_id: "abc".into(),
            token: "tkn".into(),
        });
        let envelope = payload.to_envelope().unwrap();
        assert_eq!(envelope.op, opcode::IDENTIFY);
        assert_eq!(envelope.d["server_id"], "100");
        assert_eq!(envelope.d["user_id"], "7");
        assert_eq!(envelope.d["token"], "tkn");
    }

    #[test]
    fn heartbeat_body_is_bare_nonce() {
        let envelope = OutboundPayload::Heartbeat { nonce: 12345 }
            .to_envelope()
            .unwrap();
        assert_eq!(envelope.op, opcode::HEARTBEAT);
        assert_eq!(envelope.d, Value::from(12345u64));
    }

    #[test]
    fn decodes_ready() {
        let text = r#"{"op":2,"d":{"ssrc":42,"ip":"1.2.3.4","port":5000,"modes":["xsalsa20_poly1305"]}}"#;
        match InboundEvent::decode(text).unwrap() {
            InboundEvent::Ready(r) => {
                assert_eq!(r.ssrc, 42);
                assert_eq!(r.ip, "1.2.3.4");
                assert_eq!(r.port, 5000);
                assert_eq!(r.modes, vec!["xsalsa20_poly1305"]);
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn decodes_hello_with_fractional_interval() {
        let text = r#"{"op":8,"d":{"heartbeat_interval":41250.5}}"#;
        match InboundEvent::decode(text).unwrap() {
            InboundEvent::Hello(h) => {
                assert_eq!(h.interval(), std::time::Duration::from_millis(41250));
            }
            other => panic!("expected Hello, got {other:?}"),
        }
    }

    #[test]
    fn session_description_key_must_be_32_bytes() {
        let text = r#"{"op":4,"d":{"mode":"xsalsa20_poly1305","secret_key":[1,2,3]}}"#;
        let event = InboundEvent::decode(text).unwrap();
        match event {
            InboundEvent::SessionDescription(sd) => {
                assert!(matches!(
                    sd.secret_key(),
                    Err(VoiceError::ProtocolViolation(_))
                ));
            }
            other => panic!("expected SessionDescription, got {other:?}"),
        }
    }

    #[test]
    fn zero_nonce_ack_decodes() {
        let event = InboundEvent::decode(r#"{"op":6,"d":0}"#).unwrap();
        assert!(matches!(event, InboundEvent::HeartbeatAck { nonce: 0 }));
    }

    #[test]
    fn unknown_opcode_is_preserved() {
        let event = InboundEvent::decode(r#"{"op":18,"d":{}}"#).unwrap();
        assert!(matches!(event, InboundEvent::Unknown { op: 18 }));
    }

    #[test]
    fn client_disconnect_parses_string_id() {
        let event = InboundEvent::decode(r#"{"op":13,"d":{"user_id":"55"}}"#).unwrap();
        match event {
            InboundEvent::ClientDisconnect(cd) => assert_eq!(cd.user_id, 55),
            other => panic!("expected ClientDisconnect, got {other:?}"),
        }
    }

    #[test]
    fn speaking_flags() {
        let flags = SpeakingFlags::MICROPHONE;
        assert!(flags.contains(SpeakingFlags::MICROPHONE));
        assert!(!flags.contains(SpeakingFlags::PRIORITY));
        assert_eq!(serde_json::to_value(flags).unwrap(), Value::from(1u32));
    }
}
