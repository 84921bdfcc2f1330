//! Voice session: drives the control and media transports through the
//! connection lifecycle and exposes the transmit API.
//!
//! Three long-running tasks per active session: the runner (lifecycle and
//! reconnect policy), the sender (outbound queue + heartbeats) and the
//! receiver (inbound dispatch). A fourth, transient task is the caller's
//! own `transmit_audio`.

mod backoff;
pub mod heartbeat;
pub mod queue;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::backoff::Backoff;
use self::heartbeat::HeartbeatState;
use self::queue::{OutboundQueue, SendPriority};
use crate::audio::constants::{MAX_OPUS_PACKET, SILENCE_FRAME, SILENCE_FRAME_COUNT};
use crate::audio::{sample_size_bytes, OpusEncoder};
use crate::bridge::{HandshakePair, MainGateway, UserApi, VoiceStateCommand};
use crate::common::{ChannelId, Result, ServerId, VoiceError};
use crate::gateway::close::{classify, ErrorAction};
use crate::gateway::payload::{Identify, Resume, Speaking, SpeakingFlags};
use crate::gateway::transport::is_normal_closure;
use crate::gateway::{ControlTransport, InboundEvent, OutboundPayload};
use crate::rendezvous::{HandshakeRendezvous, DEFAULT_TIMEOUT as HANDSHAKE_TIMEOUT};
use crate::udp::MediaTransport;
use crate::VoiceConfig;

/// Voice gateway protocol version baked into the wss URI.
const GATEWAY_VERSION: u8 = 4;

const SESSION_DESCRIPTION_TIMEOUT: Duration = Duration::from_secs(2);

/// Sender idle tick when the queue is empty and no heartbeat is near.
const SENDER_IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Grace period for a surviving task to drain after its peer failed.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Bound on joining the runner from `stop`.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Offline,
    Connecting,
    Connected,
    Disconnected,
}

/// State shared by the runner, sender, receiver and transmit tasks.
struct SharedState {
    status: parking_lot::Mutex<ConnectionStatus>,
    heartbeat: HeartbeatState,
    outbound: OutboundQueue,
    transmitting: AtomicBool,
    ssrc: AtomicU32,
    events_tx: mpsc::UnboundedSender<InboundEvent>,
    strict_nonce: bool,
    media: tokio::sync::Mutex<MediaTransport>,
    encoder: tokio::sync::Mutex<Option<OpusEncoder>>,
}

impl SharedState {
    fn set_status(&self, status: ConnectionStatus) {
        let mut current = self.status.lock();
        if *current != status {
            debug!("voice session status {:?} -> {:?}", *current, status);
            *current = status;
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.lock()
    }
}

/// One established control connection and its two worker tasks.
struct Connection {
    control: Arc<ControlTransport>,
    conn_cancel: CancellationToken,
    /// Each worker reports its final result here exactly once.
    exits: mpsc::Receiver<Result<()>>,
}

struct Active {
    server_id: ServerId,
    cancel: CancellationToken,
    runner: JoinHandle<Result<()>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ConnectKind {
    Identify,
    Resume,
}

pub struct VoiceSession {
    config: VoiceConfig,
    main_gateway: Arc<dyn MainGateway>,
    rendezvous: Arc<HandshakeRendezvous>,
    shared: Arc<SharedState>,
    active: tokio::sync::Mutex<Option<Active>>,
    events_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<InboundEvent>>>,
}

impl VoiceSession {
    pub fn new(
        main_gateway: Arc<dyn MainGateway>,
        user_api: Arc<dyn UserApi>,
        config: VoiceConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(SharedState {
            status: parking_lot::Mutex::new(ConnectionStatus::Offline),
            heartbeat: HeartbeatState::new(),
            outbound: OutboundQueue::new(),
            transmitting: AtomicBool::new(false),
            ssrc: AtomicU32::new(0),
            events_tx,
            strict_nonce: config.strict_heartbeat_nonce,
            media: tokio::sync::Mutex::new(MediaTransport::new()),
            encoder: tokio::sync::Mutex::new(None),
        });
        Self {
            config,
            main_gateway,
            rendezvous: Arc::new(HandshakeRendezvous::new(user_api)),
            shared,
            active: tokio::sync::Mutex::new(None),
            events_rx: parking_lot::Mutex::new(Some(events_rx)),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Send→ack delay of the most recent completed heartbeat.
    pub fn latency(&self) -> Option<Duration> {
        self.shared.heartbeat.latency()
    }

    /// Inbound payloads the lifecycle does not consume itself (speaking
    /// updates, client disconnects, codec descriptions). Can be taken once.
    pub fn events(&self) -> Option<mpsc::UnboundedReceiver<InboundEvent>> {
        self.events_rx.lock().take()
    }

    /// Feed a main-gateway "voice state update" event in.
    pub async fn submit_voice_state(&self, snapshot: crate::bridge::VoiceStateSnapshot) {
        self.rendezvous.submit_state(snapshot).await;
    }

    /// Feed a main-gateway "voice server update" event in.
    pub fn submit_voice_server(&self, snapshot: crate::bridge::VoiceServerSnapshot) {
        self.rendezvous.submit_server(snapshot);
    }

    /// Joins `channel_id` on `server_id` and drives the session to
    /// Connected. Rejects unless the session is Offline. Returns the first
    /// fatal error observed before Connected.
    pub async fn start(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
        self_mute: bool,
        self_deaf: bool,
    ) -> Result<()> {
        self.config.validate()?;
        {
            let mut status = self.shared.status.lock();
            if *status != ConnectionStatus::Offline {
                return Err(VoiceError::InvalidState("session is not offline"));
            }
            *status = ConnectionStatus::Connecting;
        }

        let cancel = CancellationToken::new();
        match self
            .connect_flow(server_id, channel_id, self_mute, self_deaf, &cancel)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                // Roll the world back: leave voice, drop transports, Offline.
                let _ = self
                    .main_gateway
                    .update_voice_state(leave_command(server_id))
                    .await;
                self.shared.media.lock().await.disconnect();
                *self.shared.encoder.lock().await = None;
                self.shared.outbound.clear();
                self.shared.set_status(ConnectionStatus::Offline);
                Err(e)
            }
        }
    }

    async fn connect_flow(
        &self,
        server_id: ServerId,
        channel_id: ChannelId,
        self_mute: bool,
        self_deaf: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.main_gateway
            .update_voice_state(VoiceStateCommand {
                server_id,
                channel_id: Some(channel_id),
                self_mute,
                self_deaf,
            })
            .await?;

        let pair = self
            .rendezvous
            .wait_for(server_id, HANDSHAKE_TIMEOUT, cancel)
            .await?;
        let endpoint = pair
            .server
            .endpoint
            .clone()
            .ok_or_else(|| VoiceError::ProtocolViolation("voice server has no endpoint".into()))?;
        let uri = gateway_uri(&endpoint);

        *self.shared.encoder.lock().await =
            Some(OpusEncoder::new(self.config.audio_optimization)?);

        let connection = establish(
            &self.shared,
            &self.config,
            &pair,
            &uri,
            ConnectKind::Identify,
            cancel,
        )
        .await?;

        let runner = tokio::spawn(run_lifecycle(
            self.shared.clone(),
            self.config.clone(),
            self.main_gateway.clone(),
            pair,
            uri,
            cancel.clone(),
            connection,
        ));
        *self.active.lock().await = Some(Active {
            server_id,
            cancel: cancel.clone(),
            runner,
        });
        Ok(())
    }

    /// Tears the session down and returns the runner's verdict.
    pub async fn stop(&self) -> Result<()> {
        let Some(active) = self.active.lock().await.take() else {
            return Err(VoiceError::InvalidState("session is offline"));
        };
        active.cancel.cancel();

        let mut runner = active.runner;
        match tokio::time::timeout(STOP_JOIN_TIMEOUT, &mut runner).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(VoiceError::ProtocolViolation(format!(
                "session runner aborted: {join_err}"
            ))),
            Err(_) => {
                warn!("session runner did not stop in time; aborting");
                runner.abort();
                // The runner could not clean up, so do it here.
                self.shared.media.lock().await.disconnect();
                *self.shared.encoder.lock().await = None;
                self.shared.outbound.clear();
                let _ = self
                    .main_gateway
                    .update_voice_state(leave_command(active.server_id))
                    .await;
                self.shared.set_status(ConnectionStatus::Offline);
                Ok(())
            }
        }
    }

    /// Streams interleaved little-endian PCM16 from `pcm` until a short
    /// read. One concurrent caller per session; a second caller observes
    /// [`VoiceError::AlreadyTransmitting`]. Honours the session's token and
    /// the caller's `cancel`.
    pub async fn transmit_audio<S>(&self, mut pcm: S, cancel: CancellationToken) -> Result<()>
    where
        S: AsyncRead + Unpin + Send,
    {
        if self.status() != ConnectionStatus::Connected {
            return Err(VoiceError::InvalidState("session is not connected"));
        }
        let _guard = TransmitGuard::acquire(&self.shared.transmitting)?;

        let session_cancel = {
            let active = self.active.lock().await;
            let Some(active) = active.as_ref() else {
                return Err(VoiceError::InvalidState("session is not connected"));
            };
            active.cancel.clone()
        };

        let ssrc = self.shared.ssrc.load(Ordering::Relaxed);
        self.shared.outbound.push(
            OutboundPayload::Speaking(Speaking {
                speaking: SpeakingFlags::MICROPHONE,
                delay: 0,
                ssrc,
            }),
            SendPriority::Normal,
        );

        let result = self.pump_pcm(&mut pcm, &cancel, &session_cancel).await;

        if result.is_ok() {
            if let Err(e) = self.send_silence_tail().await {
                warn!("could not flush silence frames: {}", e);
            }
        }
        self.shared.outbound.push(
            OutboundPayload::Speaking(Speaking {
                speaking: SpeakingFlags::NONE,
                delay: 0,
                ssrc,
            }),
            SendPriority::Normal,
        );
        result
    }

    async fn pump_pcm<S>(
        &self,
        pcm: &mut S,
        cancel: &CancellationToken,
        session_cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin + Send,
    {
        let sample_bytes = sample_size_bytes(self.config.sample_duration_ms);
        let pace = pacing_sleep(self.config.sample_duration_ms);

        let mut byte_buf = vec![0u8; sample_bytes];
        let mut frame = vec![0i16; sample_bytes / 2];
        let mut opus_buf = vec![0u8; MAX_OPUS_PACKET];

        loop {
            let filled = tokio::select! {
                _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
                _ = session_cancel.cancelled() => return Err(VoiceError::Cancelled),
                filled = read_full(pcm, &mut byte_buf) => filled?,
            };
            if filled < sample_bytes {
                // Short read: the stream is over.
                return Ok(());
            }

            for (dst, chunk) in frame.iter_mut().zip(byte_buf.chunks_exact(2)) {
                *dst = i16::from_le_bytes([chunk[0], chunk[1]]);
            }

            let written = {
                let mut encoder = self.shared.encoder.lock().await;
                let encoder = encoder
                    .as_mut()
                    .ok_or(VoiceError::InvalidState("encoder not available"))?;
                encoder.encode(&frame, &mut opus_buf)?
            };

            // Sleep for three quarters of the frame; the remaining quarter
            // absorbs the encode + send path so the aggregate cadence stays
            // at one frame per sample duration.
            tokio::select! {
                _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
                _ = session_cancel.cancelled() => return Err(VoiceError::Cancelled),
                _ = tokio::time::sleep(pace) => {}
            }

            self.shared
                .media
                .lock()
                .await
                .send_frame(&opus_buf[..written], sample_bytes)
                .await?;
        }
    }

    /// A few silence frames after the last packet let the peer's jitter
    /// buffer settle instead of interpolating the gap.
    async fn send_silence_tail(&self) -> Result<()> {
        let sample_bytes = sample_size_bytes(self.config.sample_duration_ms);
        let pace = pacing_sleep(self.config.sample_duration_ms);
        for _ in 0..SILENCE_FRAME_COUNT {
            tokio::time::sleep(pace).await;
            self.shared
                .media
                .lock()
                .await
                .send_frame(&SILENCE_FRAME, sample_bytes)
                .await?;
        }
        Ok(())
    }
}

fn gateway_uri(endpoint: &str) -> String {
    // Announced endpoints carry no scheme; keep one if a caller supplied it.
    if endpoint.contains("://") {
        format!("{}?v={}", endpoint, GATEWAY_VERSION)
    } else {
        format!("wss://{}?v={}", endpoint, GATEWAY_VERSION)
    }
}

fn leave_command(server_id: ServerId) -> VoiceStateCommand {
    VoiceStateCommand {
        server_id,
        channel_id: None,
        self_mute: false,
        self_deaf: false,
    }
}

fn pacing_sleep(sample_duration_ms: u32) -> Duration {
    Duration::from_millis(sample_duration_ms as u64) * 3 / 4
}

async fn read_full<S: AsyncRead + Unpin>(pcm: &mut S, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = pcm.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(VoiceError::Cancelled),
        result = fut => result,
    }
}

/// Opens a control connection, performs the Hello/Identify (or Resume)
/// handshake, wires the sender and receiver tasks, and flips the status to
/// Connected.
async fn establish(
    shared: &Arc<SharedState>,
    config: &VoiceConfig,
    pair: &HandshakePair,
    uri: &str,
    kind: ConnectKind,
    cancel: &CancellationToken,
) -> Result<Connection> {
    let control = Arc::new(with_cancel(cancel, ControlTransport::connect(uri)).await?);

    // The server speaks first, and it must say Hello.
    let hello = match with_cancel(cancel, control.recv()).await? {
        InboundEvent::Hello(hello) => hello,
        other => {
            return Err(VoiceError::ProtocolViolation(format!(
                "expected hello, got {other:?}"
            )))
        }
    };
    shared.heartbeat.configure(
        hello.interval(),
        config.heartbeat_safety_margin_ms.map(Duration::from_millis),
    );

    let conn_cancel = cancel.child_token();
    let (exit_tx, exits) = mpsc::channel::<Result<()>>(2);

    {
        let control = control.clone();
        let shared = shared.clone();
        let conn_cancel = conn_cancel.clone();
        let exit_tx = exit_tx.clone();
        tokio::spawn(async move {
            let result = sender_task(control, shared, conn_cancel).await;
            let _ = exit_tx.send(result).await;
        });
    }

    if let Err(e) = handshake_flow(shared, pair, &control, kind, cancel).await {
        // The sender is already live; reap it before reporting.
        conn_cancel.cancel();
        return Err(e);
    }

    {
        let control = control.clone();
        let shared = shared.clone();
        let conn_cancel = conn_cancel.clone();
        tokio::spawn(async move {
            let result = receiver_task(control, shared, conn_cancel).await;
            let _ = exit_tx.send(result).await;
        });
    }

    shared.set_status(ConnectionStatus::Connected);
    Ok(Connection {
        control,
        conn_cancel,
        exits,
    })
}

/// Runs the post-Hello half of the handshake on a fresh connection.
async fn handshake_flow(
    shared: &Arc<SharedState>,
    pair: &HandshakePair,
    control: &Arc<ControlTransport>,
    kind: ConnectKind,
    cancel: &CancellationToken,
) -> Result<()> {
    match kind {
        ConnectKind::Identify => {
            shared.outbound.push(
                OutboundPayload::Identify(Identify {
                    server_id: pair.state.server_id,
                    user_id: pair.state.user_id,
                    session_id: pair.state.session_id.clone(),
                    token: pair.server.token.clone(),
                }),
                SendPriority::Urgent,
            );

            let ready = loop {
                match with_cancel(cancel, control.recv()).await? {
                    InboundEvent::Ready(ready) => break ready,
                    InboundEvent::HeartbeatAck { nonce } => shared.heartbeat.record_ack(nonce),
                    InboundEvent::Unknown { op } => debug!("ignoring op {} before ready", op),
                    other => {
                        let _ = shared.events_tx.send(other);
                    }
                }
            };

            let description = {
                let mut media = shared.media.lock().await;
                let mode = media.select_encryption_mode(&ready.modes)?.to_string();
                let external = media.connect(&ready).await?;
                shared.ssrc.store(ready.ssrc, Ordering::Relaxed);

                shared.outbound.push(
                    OutboundPayload::SelectProtocol(
                        crate::gateway::payload::SelectProtocol::udp(
                            external.address,
                            external.port,
                            mode,
                        ),
                    ),
                    SendPriority::Urgent,
                );

                let description = with_cancel(cancel, async {
                    tokio::time::timeout(SESSION_DESCRIPTION_TIMEOUT, async {
                        loop {
                            match control.recv().await? {
                                InboundEvent::SessionDescription(sd) => return Ok(sd),
                                InboundEvent::HeartbeatAck { nonce } => {
                                    shared.heartbeat.record_ack(nonce)
                                }
                                InboundEvent::Unknown { op } => {
                                    debug!("ignoring op {} before session description", op)
                                }
                                other => {
                                    let _ = shared.events_tx.send(other);
                                }
                            }
                        }
                    })
                    .await
                    .map_err(|_| VoiceError::Timeout("session description"))?
                })
                .await?;
                media.initialize(description.secret_key()?)?;
                description
            };
            debug!(
                "voice handshake complete (mode {:?}, ssrc {})",
                description.mode,
                ready.ssrc
            );
        }
        ConnectKind::Resume => {
            shared.outbound.push(
                OutboundPayload::Resume(Resume {
                    server_id: pair.state.server_id,
                    session_id: pair.state.session_id.clone(),
                    token: pair.server.token.clone(),
                }),
                SendPriority::Urgent,
            );

            loop {
                match with_cancel(cancel, control.recv()).await? {
                    InboundEvent::Resumed => break,
                    InboundEvent::HeartbeatAck { nonce } => shared.heartbeat.record_ack(nonce),
                    InboundEvent::Unknown { op } => debug!("ignoring op {} during resume", op),
                    other => {
                        // Replayed events arrive before the Resumed marker.
                        let _ = shared.events_tx.send(other);
                    }
                }
            }
            info!("voice session resumed for server {}", pair.state.server_id);
        }
    }
    Ok(())
}

/// Pushes queued payloads and heartbeats onto the wire. Exits cleanly on
/// cancellation or normal closure, with an error otherwise.
async fn sender_task(
    control: Arc<ControlTransport>,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        if shared.heartbeat.is_due() {
            if !shared.heartbeat.ack_is_current() {
                return Err(VoiceError::HeartbeatTimeout);
            }
            let nonce: u64 = rand::random();
            match control
                .send(&OutboundPayload::Heartbeat { nonce })
                .await
            {
                Ok(()) => shared.heartbeat.record_send(nonce),
                Err(e) if is_normal_closure(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        if let Some(payload) = shared.outbound.pop() {
            match control.send(&payload).await {
                Ok(()) => {}
                Err(e) if is_normal_closure(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
            continue;
        }

        let idle = SENDER_IDLE_SLEEP.min(shared.heartbeat.time_until_due());
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = shared.outbound.notified() => {}
            _ = tokio::time::sleep(idle) => {}
        }
    }
}

/// Drains inbound payloads: acks feed the heartbeat state, everything else
/// lands on the received-events queue.
async fn receiver_task(
    control: Arc<ControlTransport>,
    shared: Arc<SharedState>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = control.recv() => received,
        };
        match received {
            Ok(InboundEvent::HeartbeatAck { nonce }) => {
                shared.heartbeat.record_ack(nonce);
                if shared.strict_nonce && !shared.heartbeat.nonce_ok() {
                    return Err(VoiceError::ProtocolViolation(
                        "heartbeat ack nonce mismatch".into(),
                    ));
                }
            }
            Ok(InboundEvent::Unknown { op }) => debug!("ignoring unknown op {}", op),
            Ok(event) => {
                let _ = shared.events_tx.send(event);
            }
            Err(VoiceError::WebSocketClosed(1000)) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Waits for the first task exit (or cancellation), then reaps the
/// connection.
async fn wait_for_failure(conn: &mut Connection, cancel: &CancellationToken) -> VoiceError {
    let failure = tokio::select! {
        _ = cancel.cancelled() => VoiceError::Cancelled,
        exit = conn.exits.recv() => match exit {
            Some(Ok(())) => VoiceError::WebSocketClosed(1000),
            Some(Err(e)) => e,
            None => VoiceError::ProtocolViolation("session tasks vanished".into()),
        },
    };
    conn.conn_cancel.cancel();
    // Bounded wait for the surviving half to drain.
    let _ = tokio::time::timeout(TASK_DRAIN_TIMEOUT, conn.exits.recv()).await;
    failure
}

/// The runner: reacts to task failures per the reconnect policy until the
/// session ends.
async fn run_lifecycle(
    shared: Arc<SharedState>,
    config: VoiceConfig,
    main_gateway: Arc<dyn MainGateway>,
    pair: HandshakePair,
    uri: String,
    cancel: CancellationToken,
    mut conn: Connection,
) -> Result<()> {
    let mut backoff = Backoff::new();

    loop {
        let mut failure = wait_for_failure(&mut conn, &cancel).await;
        let mut action = classify(&failure);

        loop {
            match action {
                ErrorAction::CleanExit => {
                    shutdown(&shared, &main_gateway, &pair, &conn.control, false).await;
                    return Ok(());
                }
                ErrorAction::Fatal => {
                    error!("voice session failed fatally: {}", failure);
                    shutdown(&shared, &main_gateway, &pair, &conn.control, false).await;
                    return Err(failure);
                }
                ErrorAction::Resume | ErrorAction::Reconnect => {
                    if backoff.is_exhausted() {
                        warn!("voice session out of reconnect attempts: {}", failure);
                        shutdown(&shared, &main_gateway, &pair, &conn.control, false).await;
                        return Err(failure);
                    }
                    shared.set_status(ConnectionStatus::Disconnected);
                    let _ = conn.control.disconnect(true).await;
                    shared.outbound.clear();

                    let delay = backoff.next();
                    debug!(
                        "voice session {} in {:?} after: {}",
                        if action == ErrorAction::Resume {
                            "resuming"
                        } else {
                            "reconnecting"
                        },
                        delay,
                        failure
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            shutdown(&shared, &main_gateway, &pair, &conn.control, false).await;
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    shared.set_status(ConnectionStatus::Connecting);
                    let kind = if action == ErrorAction::Resume {
                        ConnectKind::Resume
                    } else {
                        ConnectKind::Identify
                    };
                    match establish(&shared, &config, &pair, &uri, kind, &cancel).await {
                        Ok(next) => {
                            conn = next;
                            backoff.reset();
                            break;
                        }
                        Err(e) => {
                            action = classify(&e);
                            failure = e;
                        }
                    }
                }
            }
        }
    }
}

/// Terminal cleanup: close transports, leave the voice channel, Offline.
async fn shutdown(
    shared: &SharedState,
    main_gateway: &Arc<dyn MainGateway>,
    pair: &HandshakePair,
    control: &ControlTransport,
    reconnect_intended: bool,
) {
    let _ = control.disconnect(reconnect_intended).await;
    shared.media.lock().await.disconnect();
    *shared.encoder.lock().await = None;
    shared.outbound.clear();
    shared.ssrc.store(0, Ordering::Relaxed);
    let _ = main_gateway
        .update_voice_state(leave_command(pair.state.server_id))
        .await;
    shared.set_status(ConnectionStatus::Offline);
}

/// Scoped single-writer marker for `transmit_audio`.
struct TransmitGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> TransmitGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(VoiceError::AlreadyTransmitting);
        }
        Ok(Self { flag })
    }
}

impl Drop for TransmitGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{UserApi, VoiceStateCommand};
    use async_trait::async_trait;

    struct NullGateway;

    #[async_trait]
    impl MainGateway for NullGateway {
        async fn update_voice_state(&self, _command: VoiceStateCommand) -> Result<()> {
            Ok(())
        }
    }

    struct NullUsers;

    #[async_trait]
    impl UserApi for NullUsers {
        async fn get_current_user(&self) -> Result<crate::common::UserId> {
            Ok(1)
        }
    }

    fn session() -> VoiceSession {
        VoiceSession::new(
            Arc::new(NullGateway),
            Arc::new(NullUsers),
            VoiceConfig::default(),
        )
    }

    #[test]
    fn transmit_guard_is_exclusive() {
        let flag = AtomicBool::new(false);
        let first = TransmitGuard::acquire(&flag).unwrap();
        assert!(matches!(
            TransmitGuard::acquire(&flag),
            Err(VoiceError::AlreadyTransmitting)
        ));
        drop(first);
        assert!(TransmitGuard::acquire(&flag).is_ok());
    }

    #[test]
    fn gateway_uri_carries_version() {
        assert_eq!(gateway_uri("v.example"), "wss://v.example?v=4");
        assert_eq!(
            gateway_uri("ws://127.0.0.1:9000"),
            "ws://127.0.0.1:9000?v=4"
        );
    }

    #[test]
    fn pacing_is_three_quarters_of_the_frame() {
        assert_eq!(pacing_sleep(40), Duration::from_millis(30));
        assert_eq!(pacing_sleep(20), Duration::from_millis(15));
    }

    #[tokio::test]
    async fn new_session_is_offline() {
        let session = session();
        assert_eq!(session.status(), ConnectionStatus::Offline);
        assert!(session.latency().is_none());
    }

    #[tokio::test]
    async fn stop_while_offline_is_invalid() {
        let session = session();
        assert!(matches!(
            session.stop().await,
            Err(VoiceError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn transmit_requires_connected() {
        let session = session();
        let err = session
            .transmit_audio(tokio::io::empty(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, VoiceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn start_rejects_invalid_sample_duration() {
        let config = VoiceConfig {
            sample_duration_ms: 13,
            ..VoiceConfig::default()
        };
        let session =
            VoiceSession::new(Arc::new(NullGateway), Arc::new(NullUsers), config);
        let err = session.start(1, 2, false, false).await.unwrap_err();
        assert!(matches!(err, VoiceError::ArgumentOutOfRange(_)));
        assert_eq!(session.status(), ConnectionStatus::Offline);
    }

    #[tokio::test]
    async fn events_can_be_taken_once() {
        let session = session();
        assert!(session.events().is_some());
        assert!(session.events().is_none());
    }
}
