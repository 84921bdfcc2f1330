//! Control-plane WebSocket transport.
//!
//! Owns both halves of the socket exclusively; other tasks reach it through
//! `&self` methods, never through a shared socket field. Sends are
//! serialised by a mutex, receives are single-consumer by discipline.

use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::payload::{InboundEvent, OutboundPayload};
use crate::common::{Result, VoiceError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Hard cap on one encoded control payload.
pub const MAX_PAYLOAD_BYTES: usize = 4096;

/// Synthetic close code for a stream that ended without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Bound on waiting for the send lock; a sender stuck longer than this is
/// wedged behind a dead socket.
const SEND_LOCK_TIMEOUT: Duration = Duration::from_secs(1);

struct SendHalf {
    sink: SplitSink<WsStream, Message>,
    /// Reused across sends; shrunk back to nominal capacity if a payload
    /// ever grows it past the cap.
    buf: Vec<u8>,
}

pub struct ControlTransport {
    send: Mutex<SendHalf>,
    recv: Mutex<SplitStream<WsStream>>,
}

impl ControlTransport {
    pub async fn connect(uri: &str) -> Result<Self> {
        debug!("connecting control transport to {}", uri);
        let (stream, _) = connect_async(uri).await?;
        let (sink, stream) = stream.split();
        Ok(Self {
            send: Mutex::new(SendHalf {
                sink,
                buf: Vec::with_capacity(MAX_PAYLOAD_BYTES),
            }),
            recv: Mutex::new(stream),
        })
    }

    pub async fn send(&self, payload: &OutboundPayload) -> Result<()> {
        let envelope = payload.to_envelope()?;

        let mut guard = tokio::time::timeout(SEND_LOCK_TIMEOUT, self.send.lock())
            .await
            .map_err(|_| VoiceError::Timeout("control send lock"))?;
        let half = &mut *guard;

        encode_bounded(&mut half.buf, &envelope)?;
        let text = std::str::from_utf8(&half.buf)
            .map_err(|_| VoiceError::ProtocolViolation("encoded payload is not utf-8".into()))?;
        let message = Message::text(text.to_owned());
        half.sink.send(message).await?;
        Ok(())
    }

    /// Receives the next decoded control payload.
    ///
    /// Closure is reported as an error carrying the close code:
    /// [`VoiceError::GatewayClosed`] for the voice gateway's 4xxx codes,
    /// [`VoiceError::WebSocketClosed`] for transport-level codes.
    pub async fn recv(&self) -> Result<InboundEvent> {
        let mut stream = self.recv.lock().await;
        loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => return InboundEvent::decode(text.as_str()),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match &frame {
                        Some(f) => (u16::from(f.code), f.reason.to_string()),
                        None => (1000, String::new()),
                    };
                    debug!("control transport closed: code={} reason='{}'", code, reason);
                    return Err(close_error(code));
                }
                Some(Ok(_)) => continue, // binary / ping / pong — not control payloads
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Err(VoiceError::WebSocketClosed(1000));
                }
                Some(Err(e)) => {
                    warn!("control transport read error: {}", e);
                    return Err(e.into());
                }
                None => return Err(VoiceError::WebSocketClosed(ABNORMAL_CLOSURE)),
            }
        }
    }

    /// Closes the socket. `reconnect_intended` uses 1012 (service restart)
    /// so the server keeps session state for a resume; otherwise 1000.
    pub async fn disconnect(&self, reconnect_intended: bool) -> Result<()> {
        let frame = if reconnect_intended {
            CloseFrame {
                code: CloseCode::Restart,
                reason: "resuming".into(),
            }
        } else {
            CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }
        };
        let mut guard = self.send.lock().await;
        match guard.sink.send(Message::Close(Some(frame))).await {
            Ok(()) => Ok(()),
            // Already gone — nothing left to close.
            Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Serialises `envelope` into the reusable buffer, enforcing the payload
/// cap. A rejected payload also resets the buffer to nominal capacity so an
/// oversized attempt cannot pin memory.
fn encode_bounded(buf: &mut Vec<u8>, envelope: &super::payload::Envelope) -> Result<()> {
    buf.clear();
    serde_json::to_writer(&mut *buf, envelope)?;
    let size = buf.len();
    if size > MAX_PAYLOAD_BYTES {
        *buf = Vec::with_capacity(MAX_PAYLOAD_BYTES);
        return Err(VoiceError::PayloadTooLarge {
            size,
            limit: MAX_PAYLOAD_BYTES,
        });
    }
    if buf.capacity() > MAX_PAYLOAD_BYTES {
        buf.shrink_to(MAX_PAYLOAD_BYTES);
    }
    Ok(())
}

fn close_error(code: u16) -> VoiceError {
    if (4000..5000).contains(&code) {
        VoiceError::GatewayClosed(code)
    } else {
        VoiceError::WebSocketClosed(code)
    }
}

/// A send failure that just means the peer closed first; callers treat it
/// as a clean exit rather than a fault.
pub fn is_normal_closure(err: &VoiceError) -> bool {
    matches!(
        err,
        VoiceError::WebSocketClosed(1000)
            | VoiceError::WebSocket(WsError::ConnectionClosed | WsError::AlreadyClosed)
    )
}
