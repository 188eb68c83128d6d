//! Transport session: connection lifecycle, config handshake, reconnection.
//!
//! The session is a single actor task owning the connection state machine.
//! Commands arrive on an mpsc channel, inbound transport messages are pumped
//! into the same channel by a per-connection reader task, and timers are a
//! single pending deadline — so no two state transitions ever execute
//! concurrently. The state table is race-free by construction, not by
//! locking.
//!
//! ## States
//!
//! ```text
//! Disconnected ─connect()─▸ Connecting ─open─▸ AwaitingConfigAck ─ack─▸ Ready
//!       ▴                       │  ▴                   │(3 timeouts)      │
//!       │                  timeout/error         degraded Ready ◂────────┤
//!       │                       ▾  │                               close/error
//!   disconnect()           Reconnecting ◂──────────────────────────────┘
//!                               │ attempts exhausted
//!                               ▾
//!                            Failed
//! ```
//!
//! One deliberate quirk preserved from the service contract: if the config
//! handshake never confirms within its retry budget, the session still
//! proceeds to `Ready` (degraded mode, surfaced as
//! [`SessionEvent::ConfigUnconfirmed`]). Availability wins over
//! guaranteed-applied config.

pub mod backoff;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::StreamscribeError;
use crate::frame::AudioFrame;
use crate::protocol::{self, InboundEvent, OutboundControl, SessionConfig, Transcription};
use backoff::ReconnectPolicy;
use transport::{MessageSink, MessageStream, Transport, WireMessage};

// ── Tunables ──────────────────────────────────────────────────────

/// How long a connection attempt may take before it is abandoned.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Settle delay between transport open and the first config send.
const SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Config acknowledgement wait per attempt: base × attempt number.
const ACK_TIMEOUT_BASE: Duration = Duration::from_secs(2);

/// Config handshake attempts before degrading to unconfirmed Ready.
const MAX_HANDSHAKE_ATTEMPTS: u32 = 3;

/// Frames whose peak amplitude is at or below this are dropped at the
/// transport boundary without transmitting. Bandwidth conservation only —
/// independent of the conditioner's own gating.
const NEAR_ZERO_PEAK: i16 = 64;

/// Outbound buffer high-water mark; control sends wait briefly above it.
const OUTBOUND_HIGH_WATER: usize = 64 * 1024;

/// Brief backpressure wait before a control send when above high water.
const BACKPRESSURE_WAIT: Duration = Duration::from_millis(50);

/// Command channel depth. Frames arrive at ~16/s, so this is ample.
const COMMAND_BUFFER: usize = 256;

// ── Connection state ──────────────────────────────────────────────

/// State of the service connection. Exactly one instance per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    /// Transport open, config handshake not yet resolved.
    AwaitingConfigAck,
    /// Streaming; frames are transmitted.
    Ready,
    /// Backoff delay pending before the next connection attempt.
    Reconnecting,
    /// Reconnect budget exhausted. Terminal until a fresh `connect()`.
    Failed,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::AwaitingConfigAck => "AwaitingConfigAck",
            Self::Ready => "Ready",
            Self::Reconnecting => "Reconnecting",
            Self::Failed => "Failed",
        }
    }
}

// ── Endpoint ──────────────────────────────────────────────────────

/// Service endpoint: a base URL the session identifier is appended to.
///
/// Environment-level concerns (host, port, protocol upgrade) belong to the
/// caller; the session only needs a connectable base.
#[derive(Debug, Clone)]
pub struct Endpoint {
    base_url: String,
}

impl Endpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    /// Full connection URL for the given session identifier.
    pub fn url_for(&self, session_id: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), session_id)
    }
}

// ── Events surfaced to the facade ─────────────────────────────────

/// Events the session emits toward the facade/caller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Every state transition, in order.
    StateChanged(ConnectionState),
    /// Service accepted the connection and assigned a correlation id.
    Connected { session_id: String },
    /// The service confirmed the current config snapshot.
    ConfigAcknowledged,
    /// Handshake retry budget spent without confirmation; session proceeds
    /// in degraded mode.
    ConfigUnconfirmed,
    Transcription(Transcription),
    /// Error reported by the service inside the protocol.
    ServiceError { message: String },
    /// Reconnect attempts exhausted; terminal until a fresh connect.
    Failed { message: String },
}

// ── Commands ──────────────────────────────────────────────────────

enum Command {
    Connect,
    Disconnect,
    Reconnect,
    Frame(AudioFrame),
    UpdateConfig(SessionConfig),
    UpdateKeywords(Vec<String>),
    PumpInbound { generation: u64, msg: WireMessage },
    PumpClosed { generation: u64, reason: Option<String> },
}

// ── Public handle ─────────────────────────────────────────────────

/// Handle to a running transport session actor. Clones address the same
/// actor.
///
/// Dropping every handle shuts the actor down once in-flight commands
/// drain.
#[derive(Clone)]
pub struct TransportSession {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl TransportSession {
    /// Spawn the session actor.
    ///
    /// `session_id` is the caller-chosen or previously-assigned identifier
    /// appended to the endpoint path; the service may replace it via the
    /// `connected` event and the replacement is threaded through reconnects.
    pub fn spawn(
        endpoint: Endpoint,
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        session_id: impl Into<String>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(COMMAND_BUFFER);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        let actor = SessionActor {
            endpoint,
            config,
            transport,
            state: ConnectionState::Disconnected,
            state_tx,
            event_tx,
            cmd_tx: cmd_tx.clone(),
            policy: ReconnectPolicy::default(),
            session_id: session_id.into(),
            sink: None,
            generation: 0,
            timer: None,
            handshake: None,
            pending_config: None,
            frames_sent: 0,
            bytes_sent: 0,
        };
        tokio::spawn(actor.run(cmd_rx));

        (Self { cmd_tx, state_rx }, event_rx)
    }

    pub async fn connect(&self) {
        self.send(Command::Connect).await;
    }

    /// Idempotent: cancels all pending timers and in-flight retries,
    /// releases the transport, resets reconnect policy.
    pub async fn disconnect(&self) {
        self.send(Command::Disconnect).await;
    }

    /// Request a full reconnect. No-op while a reconnect timer is pending.
    pub async fn reconnect(&self) {
        self.send(Command::Reconnect).await;
    }

    /// Submit a frame for transmission. Dropped unless the session is
    /// `Ready`; never queued across a reconnect boundary.
    pub async fn send_frame(&self, frame: AudioFrame) {
        self.send(Command::Frame(frame)).await;
    }

    /// Replace the config snapshot. Transmits the entire snapshot; if a
    /// handshake is already in flight the update is queued behind it.
    pub async fn update_config(&self, config: SessionConfig) {
        self.send(Command::UpdateConfig(config)).await;
    }

    /// Send the keyword list. Independent of config — never triggers a
    /// reconnect or config re-send.
    pub async fn update_keywords(&self, keywords: Vec<String>) {
        self.send(Command::UpdateKeywords(keywords)).await;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    async fn send(&self, cmd: Command) {
        if self.cmd_tx.send(cmd).await.is_err() {
            tracing::debug!("Session actor has shut down; command ignored");
        }
    }
}

// ── Actor ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    ConnectTimeout,
    Settle,
    AckTimeout,
    ReconnectDelay,
}

/// An in-flight config handshake. `initial` distinguishes the handshake
/// that gates `AwaitingConfigAck → Ready` from later config updates.
struct Handshake {
    attempt: u32,
    initial: bool,
}

type ConnectResult =
    crate::error::Result<(Box<dyn MessageSink>, Box<dyn MessageStream>)>;

struct SessionActor {
    endpoint: Endpoint,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    state: ConnectionState,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: mpsc::Sender<SessionEvent>,
    cmd_tx: mpsc::Sender<Command>,
    policy: ReconnectPolicy,
    /// Correlation identifier threaded through reconnects. Replaced when
    /// the service's `connected` event assigns one.
    session_id: String,
    sink: Option<Box<dyn MessageSink>>,
    /// Connection generation; pump messages from stale generations are
    /// ignored after a reconnect or disconnect.
    generation: u64,
    /// The single pending timer. At most one exists at any time.
    timer: Option<(TimerKind, Instant)>,
    handshake: Option<Handshake>,
    /// Config update queued behind an in-flight handshake (latest wins).
    pending_config: Option<SessionConfig>,
    frames_sent: u64,
    bytes_sent: u64,
}

impl SessionActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut connecting: Option<BoxFuture<'static, ConnectResult>> = None;

        loop {
            let deadline = self.timer.map(|(_, at)| at);

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Connect => match self.state {
                            ConnectionState::Disconnected | ConnectionState::Failed => {
                                self.policy.reset();
                                self.start_connect(&mut connecting);
                            }
                            // A fresh connect supersedes the pending backoff
                            // delay.
                            ConnectionState::Reconnecting => {
                                self.clear_timer();
                                self.policy.reset();
                                self.start_connect(&mut connecting);
                            }
                            _ => tracing::debug!(
                                state = self.state.as_str(),
                                "connect() ignored: session already active"
                            ),
                        },
                        Command::Disconnect => {
                            connecting = None;
                            self.handle_disconnect().await;
                        }
                        Command::Reconnect => match self.state {
                            ConnectionState::Ready | ConnectionState::AwaitingConfigAck => {
                                self.drop_connection().await;
                                self.schedule_reconnect();
                            }
                            // A pending reconnect timer makes this a no-op.
                            _ => tracing::debug!(
                                state = self.state.as_str(),
                                "reconnect request ignored"
                            ),
                        },
                        Command::Frame(frame) => self.handle_frame(frame).await,
                        Command::UpdateConfig(config) => self.handle_update_config(config).await,
                        Command::UpdateKeywords(keywords) => {
                            self.handle_keywords(keywords).await;
                        }
                        Command::PumpInbound { generation, msg } => {
                            if generation == self.generation {
                                self.handle_inbound(msg).await;
                            }
                        }
                        Command::PumpClosed { generation, reason } => {
                            if generation == self.generation {
                                self.on_transport_lost(reason).await;
                            }
                        }
                    }
                }

                result = async {
                    match connecting.as_mut() {
                        Some(fut) => fut.await,
                        None => std::future::pending().await,
                    }
                }, if connecting.is_some() => {
                    connecting = None;
                    match result {
                        Ok((sink, stream)) => self.on_transport_open(sink, stream),
                        Err(e) => self.on_connect_failed(&e.to_string()),
                    }
                }

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                    if deadline.is_some() =>
                {
                    let Some((kind, _)) = self.timer.take() else { continue };
                    match kind {
                        TimerKind::ConnectTimeout => {
                            connecting = None;
                            self.on_connect_failed("connect timeout");
                        }
                        TimerKind::Settle => self.begin_handshake(true).await,
                        TimerKind::AckTimeout => self.on_ack_timeout().await,
                        TimerKind::ReconnectDelay => {
                            if self.state == ConnectionState::Reconnecting {
                                self.start_connect(&mut connecting);
                            }
                        }
                    }
                }
            }
        }

        tracing::debug!(session_id = %self.session_id, "Session actor terminated");
    }

    // ── Connection lifecycle ──────────────────────────────────────

    fn start_connect(&mut self, connecting: &mut Option<BoxFuture<'static, ConnectResult>>) {
        let transport = Arc::clone(&self.transport);
        let url = self.endpoint.url_for(&self.session_id);
        tracing::info!(session_id = %self.session_id, url = %url, "Opening transport");

        self.set_state(ConnectionState::Connecting);
        self.arm(TimerKind::ConnectTimeout, CONNECT_TIMEOUT);
        *connecting = Some(Box::pin(async move { transport.connect(&url).await }));
    }

    fn on_transport_open(&mut self, sink: Box<dyn MessageSink>, stream: Box<dyn MessageStream>) {
        self.clear_timer();
        self.sink = Some(sink);
        self.generation += 1;
        self.spawn_pump(stream);

        self.set_state(ConnectionState::AwaitingConfigAck);
        // Short settle before the config handshake; some service builds drop
        // control frames sent in the same instant the socket opens.
        self.arm(TimerKind::Settle, SETTLE_DELAY);
    }

    fn spawn_pump(&self, mut stream: Box<dyn MessageStream>) {
        let generation = self.generation;
        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            loop {
                match stream.next().await {
                    Some(Ok(msg)) => {
                        if cmd_tx
                            .send(Command::PumpInbound { generation, msg })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = cmd_tx
                            .send(Command::PumpClosed {
                                generation,
                                reason: Some(e.to_string()),
                            })
                            .await;
                        return;
                    }
                    None => {
                        let _ = cmd_tx
                            .send(Command::PumpClosed {
                                generation,
                                reason: None,
                            })
                            .await;
                        return;
                    }
                }
            }
        });
    }

    fn on_connect_failed(&mut self, message: &str) {
        tracing::warn!(session_id = %self.session_id, error = %message, "Transport open failed");
        self.clear_timer();
        if self.state == ConnectionState::Connecting {
            self.schedule_reconnect();
        }
    }

    async fn on_transport_lost(&mut self, reason: Option<String>) {
        tracing::warn!(
            session_id = %self.session_id,
            reason = reason.as_deref().unwrap_or("closed by peer"),
            state = self.state.as_str(),
            "Transport lost"
        );
        self.drop_connection().await;
        if matches!(
            self.state,
            ConnectionState::Ready | ConnectionState::AwaitingConfigAck | ConnectionState::Connecting
        ) {
            self.schedule_reconnect();
        }
    }

    /// Release the connection and cancel anything tied to it. The handshake
    /// (if any) is abandoned; a queued config update folds into the snapshot
    /// so the next handshake transmits it.
    async fn drop_connection(&mut self) {
        self.clear_timer();
        if let Some(config) = self.pending_config.take() {
            self.config = config;
        }
        self.handshake = None;
        self.generation += 1;
        if let Some(mut sink) = self.sink.take() {
            sink.close().await;
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.policy.exhausted() {
            let message = StreamscribeError::ReconnectExhausted {
                attempts: self.policy.max_attempts,
            }
            .to_string();
            tracing::error!(session_id = %self.session_id, %message, "Giving up");
            self.set_state(ConnectionState::Failed);
            self.emit(SessionEvent::Failed { message });
            return;
        }

        self.policy.attempt += 1;
        let delay = self.policy.delay(self.policy.attempt);
        tracing::info!(
            session_id = %self.session_id,
            attempt = self.policy.attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.set_state(ConnectionState::Reconnecting);
        self.arm(TimerKind::ReconnectDelay, delay);
    }

    async fn handle_disconnect(&mut self) {
        self.drop_connection().await;
        self.pending_config = None;
        self.policy.reset();
        self.set_state(ConnectionState::Disconnected);
    }

    // ── Config handshake ──────────────────────────────────────────

    /// Start a handshake and send the first (or a retry) config snapshot.
    async fn begin_handshake(&mut self, initial: bool) {
        self.handshake = Some(Handshake {
            attempt: 0,
            initial,
        });
        self.send_handshake_config().await;
    }

    async fn send_handshake_config(&mut self) {
        let Some(handshake) = self.handshake.as_mut() else {
            return;
        };
        handshake.attempt += 1;
        let attempt = handshake.attempt;

        let msg = OutboundControl::Config {
            config: self.config.clone(),
        };
        tracing::info!(
            session_id = %self.session_id,
            attempt,
            "Sending config snapshot"
        );
        if self.send_control(msg).await {
            self.arm(TimerKind::AckTimeout, ACK_TIMEOUT_BASE * attempt);
        }
    }

    async fn on_ack_timeout(&mut self) {
        let Some(handshake) = self.handshake.as_ref() else {
            return;
        };
        if handshake.attempt < MAX_HANDSHAKE_ATTEMPTS {
            tracing::warn!(
                session_id = %self.session_id,
                attempt = handshake.attempt,
                "Config ack timed out; retrying handshake"
            );
            self.send_handshake_config().await;
        } else {
            tracing::warn!(
                session_id = %self.session_id,
                attempts = handshake.attempt,
                "Config never confirmed; proceeding in degraded mode"
            );
            self.resolve_handshake(false).await;
        }
    }

    /// Resolve the in-flight handshake (ack received or budget spent), then
    /// flush a queued config update if one arrived meanwhile.
    async fn resolve_handshake(&mut self, acked: bool) {
        let Some(handshake) = self.handshake.take() else {
            return;
        };
        self.clear_timer();

        if acked {
            self.emit(SessionEvent::ConfigAcknowledged);
        } else if handshake.initial {
            self.emit(SessionEvent::ConfigUnconfirmed);
        }

        if handshake.initial {
            self.policy.reset();
            self.set_state(ConnectionState::Ready);
        }

        if let Some(config) = self.pending_config.take() {
            self.config = config;
            self.begin_handshake(false).await;
        }
    }

    async fn handle_update_config(&mut self, config: SessionConfig) {
        if self.handshake.is_some() {
            // One handshake in flight at a time; latest update wins the queue.
            self.pending_config = Some(config);
            return;
        }
        self.config = config;
        if self.state == ConnectionState::Ready {
            self.begin_handshake(false).await;
        }
        // Otherwise the snapshot rides along with the next connect handshake.
    }

    // ── Outbound data ─────────────────────────────────────────────

    async fn handle_frame(&mut self, frame: AudioFrame) {
        if self.state != ConnectionState::Ready {
            tracing::trace!(state = self.state.as_str(), "Dropping frame: not ready");
            return;
        }
        if frame.peak() <= NEAR_ZERO_PEAK {
            tracing::trace!("Dropping near-silent frame at transport boundary");
            return;
        }

        let bytes = frame.to_le_bytes();
        let len = bytes.len();
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        match sink.send(WireMessage::Binary(bytes)).await {
            Ok(()) => {
                self.frames_sent += 1;
                self.bytes_sent += len as u64;
                if self.frames_sent == 1 || self.frames_sent % 50 == 0 {
                    tracing::debug!(
                        session_id = %self.session_id,
                        frames = self.frames_sent,
                        total_bytes = self.bytes_sent,
                        "Outbound audio progress"
                    );
                }
            }
            Err(e) => self.on_transport_lost(Some(e.to_string())).await,
        }
    }

    async fn handle_keywords(&mut self, keywords: Vec<String>) {
        let keywords = protocol::normalize_keywords(keywords);
        if self.sink.is_none() {
            tracing::debug!("Keyword update dropped: no open transport");
            return;
        }
        let sent = self.send_control(OutboundControl::Keywords { keywords }).await;
        if sent {
            tracing::info!(session_id = %self.session_id, "Keyword list sent");
        }
    }

    /// Serialize and send a control message, waiting briefly first if the
    /// outbound buffer is above the high-water mark. Returns whether the
    /// send succeeded; failures tear the connection down.
    async fn send_control(&mut self, msg: OutboundControl) -> bool {
        let json = match msg.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "Control message serialization failed");
                return false;
            }
        };
        let Some(sink) = self.sink.as_mut() else {
            return false;
        };
        if sink.buffered_bytes() > OUTBOUND_HIGH_WATER {
            tokio::time::sleep(BACKPRESSURE_WAIT).await;
        }
        let Some(sink) = self.sink.as_mut() else {
            return false;
        };
        match sink.send(WireMessage::Text(json)).await {
            Ok(()) => true,
            Err(e) => {
                self.on_transport_lost(Some(e.to_string())).await;
                false
            }
        }
    }

    // ── Inbound dispatch ──────────────────────────────────────────

    async fn handle_inbound(&mut self, msg: WireMessage) {
        let text = match msg {
            WireMessage::Text(t) => t,
            WireMessage::Binary(b) => {
                tracing::debug!(len = b.len(), "Ignoring unexpected inbound binary frame");
                return;
            }
        };
        let Some(event) = protocol::parse_inbound(&text) else {
            return;
        };

        match event {
            InboundEvent::Connected { session_id } => {
                tracing::info!(session_id = %session_id, "Service assigned session identifier");
                self.session_id = session_id.clone();
                self.emit(SessionEvent::Connected { session_id });
            }
            InboundEvent::ConfigAcknowledged {} => {
                if self.handshake.is_some() {
                    self.resolve_handshake(true).await;
                } else {
                    tracing::debug!("Unsolicited config ack ignored");
                }
            }
            InboundEvent::Transcription(t) => {
                self.emit(SessionEvent::Transcription(t));
            }
            InboundEvent::ErrorReported { message } => {
                tracing::warn!(session_id = %self.session_id, %message, "Service reported error");
                self.emit(SessionEvent::ServiceError { message });
            }
        }
    }

    // ── Plumbing ──────────────────────────────────────────────────

    fn set_state(&mut self, next: ConnectionState) {
        if self.state == next {
            return;
        }
        tracing::info!(
            session_id = %self.session_id,
            from = self.state.as_str(),
            to = next.as_str(),
            "Session state change"
        );
        self.state = next;
        self.state_tx.send_replace(next);
        self.emit(SessionEvent::StateChanged(next));
    }

    fn emit(&self, event: SessionEvent) {
        if self.event_tx.try_send(event).is_err() {
            tracing::debug!("Session event dropped: receiver full or gone");
        }
    }

    fn arm(&mut self, kind: TimerKind, after: Duration) {
        self.timer = Some((kind, Instant::now() + after));
    }

    fn clear_timer(&mut self) {
        self.timer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::transport::mock::{MockControl, MockLink, MockTransport};
    use super::*;
    use crate::frame::FRAME_SAMPLES;
    use tokio::sync::mpsc::Receiver;
    use tokio::time::{timeout, Duration};

    fn loud_frame() -> AudioFrame {
        AudioFrame::new(vec![4000; FRAME_SAMPLES]).unwrap()
    }

    fn near_zero_frame() -> AudioFrame {
        AudioFrame::new(vec![10; FRAME_SAMPLES]).unwrap()
    }

    fn spawn_session() -> (TransportSession, Receiver<SessionEvent>, MockControl) {
        let (transport, control) = MockTransport::new();
        let (session, events) = TransportSession::spawn(
            Endpoint::new("ws://svc.example/stream"),
            SessionConfig::default(),
            Arc::new(transport),
            "local-0001",
        );
        (session, events, control)
    }

    async fn next_event(events: &mut Receiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("event channel closed")
    }

    /// Drive the session to Ready: connect, settle, config, ack.
    async fn to_ready(
        session: &TransportSession,
        events: &mut Receiver<SessionEvent>,
        control: &mut MockControl,
    ) -> MockLink {
        session.connect().await;
        let mut link = control.next_link().await;

        assert_eq!(
            next_event(events).await,
            SessionEvent::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            next_event(events).await,
            SessionEvent::StateChanged(ConnectionState::AwaitingConfigAck)
        );

        // Settle elapses (paused clock auto-advances) and config goes out.
        let config_msg = link.outbound.recv().await.unwrap();
        assert!(matches!(config_msg, WireMessage::Text(ref t) if t.contains("\"event\":\"config\"")));

        link.inbound
            .send(WireMessage::Text(r#"{"event":"config_updated"}"#.into()))
            .unwrap();
        assert_eq!(next_event(events).await, SessionEvent::ConfigAcknowledged);
        assert_eq!(
            next_event(events).await,
            SessionEvent::StateChanged(ConnectionState::Ready)
        );
        link
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_state_sequence() {
        let (session, mut events, mut control) = spawn_session();
        assert_eq!(session.state(), ConnectionState::Disconnected);
        let _link = to_ready(&session, &mut events, &mut control).await;
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn endpoint_url_appends_session_id() {
        let endpoint = Endpoint::new("wss://svc.example/api/stream/");
        assert_eq!(
            endpoint.url_for("abc-1"),
            "wss://svc.example/api/stream/abc-1"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn connected_event_persists_service_session_id() {
        let (session, mut events, mut control) = spawn_session();
        let link = to_ready(&session, &mut events, &mut control).await;

        link.inbound
            .send(WireMessage::Text(
                r#"{"event":"connected","sessionId":"svc-77"}"#.into(),
            ))
            .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::Connected {
                session_id: "svc-77".into()
            }
        );

        // The next reconnect must target the service-assigned id.
        drop(link);
        let _ = next_event(&mut events).await; // Reconnecting
        let _ = next_event(&mut events).await; // Connecting
        let _link2 = control.next_link().await;
        assert!(control.last_url().unwrap().ends_with("/svc-77"));
    }

    #[tokio::test(start_paused = true)]
    async fn frames_dropped_unless_ready() {
        let (session, mut events, mut control) = spawn_session();

        // Not connected at all: frame vanishes.
        session.send_frame(loud_frame()).await;

        let mut link = to_ready(&session, &mut events, &mut control).await;

        session.send_frame(loud_frame()).await;
        let msg = link.outbound.recv().await.unwrap();
        assert!(matches!(msg, WireMessage::Binary(ref b) if b.len() == FRAME_SAMPLES * 2));
    }

    #[tokio::test(start_paused = true)]
    async fn near_zero_frames_filtered_at_transport() {
        let (session, mut events, mut control) = spawn_session();
        let mut link = to_ready(&session, &mut events, &mut control).await;

        session.send_frame(near_zero_frame()).await;
        // A distinctive loud frame follows; it must be the next thing out.
        let marker = AudioFrame::new(vec![12345; FRAME_SAMPLES]).unwrap();
        let marker_bytes = marker.to_le_bytes();
        session.send_frame(marker).await;

        let msg = link.outbound.recv().await.unwrap();
        assert_eq!(msg, WireMessage::Binary(marker_bytes));
    }

    #[tokio::test(start_paused = true)]
    async fn unclean_close_schedules_backoff_reconnect() {
        let (session, mut events, mut control) = spawn_session();
        let link = to_ready(&session, &mut events, &mut control).await;

        let lost_at = Instant::now();
        drop(link); // peer vanishes

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Reconnecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Connecting)
        );
        // First retry fires at the base delay (attempt 1).
        assert!(Instant::now() - lost_at >= Duration::from_secs(1));

        let _link2 = control.next_link().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_cancels_pending_backoff_delay() {
        let (session, mut events, mut control) = spawn_session();
        control.fail_next_connects(1);

        session.connect().await;
        loop {
            if next_event(&mut events).await
                == SessionEvent::StateChanged(ConnectionState::Reconnecting)
            {
                break;
            }
        }

        // An explicit connect() mid-backoff dials immediately instead of
        // waiting out the delay.
        let asked_at = Instant::now();
        session.connect().await;
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Connecting)
        );
        let _link = control.next_link().await;
        assert!(
            Instant::now() - asked_at < Duration::from_millis(100),
            "backoff delay was not superseded"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_exhaustion_reaches_failed() {
        let (session, mut events, mut control) = spawn_session();
        control.fail_next_connects(u32::MAX);

        session.connect().await;
        let mut failed = false;
        for _ in 0..64 {
            match next_event(&mut events).await {
                SessionEvent::Failed { message } => {
                    assert!(message.contains("exhausted"));
                    failed = true;
                    break;
                }
                SessionEvent::StateChanged(_) => {}
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(failed);
        assert_eq!(session.state(), ConnectionState::Failed);

        // Terminal until a fresh connect() resets the policy.
        control.fail_next_connects(0);
        session.connect().await;
        let _link = control.next_link().await;
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_degrades_to_ready_after_retries() {
        let (session, mut events, mut control) = spawn_session();
        session.connect().await;
        let mut link = control.next_link().await;

        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::AwaitingConfigAck)
        );

        // Three full config snapshots, never acknowledged.
        for _ in 0..3 {
            let msg = link.outbound.recv().await.unwrap();
            assert!(matches!(msg, WireMessage::Text(ref t) if t.contains("\"event\":\"config\"")));
        }

        assert_eq!(next_event(&mut events).await, SessionEvent::ConfigUnconfirmed);
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Ready)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn config_update_waits_for_inflight_handshake() {
        let (session, mut events, mut control) = spawn_session();
        let mut link = to_ready(&session, &mut events, &mut control).await;

        let first = SessionConfig {
            language: "ko".into(),
            ..SessionConfig::default()
        };
        let second = SessionConfig {
            language: "ja".into(),
            ..SessionConfig::default()
        };

        session.update_config(first).await;
        let msg1 = link.outbound.recv().await.unwrap();
        assert!(matches!(msg1, WireMessage::Text(ref t) if t.contains("\"language\":\"ko\"")));

        // Second update while the first handshake is unresolved: queued.
        session.update_config(second).await;
        session.send_frame(loud_frame()).await;
        let between = link.outbound.recv().await.unwrap();
        assert!(
            matches!(between, WireMessage::Binary(_)),
            "queued config must not interleave before the ack"
        );

        link.inbound
            .send(WireMessage::Text(r#"{"event":"config_updated"}"#.into()))
            .unwrap();
        assert_eq!(next_event(&mut events).await, SessionEvent::ConfigAcknowledged);

        let msg2 = link.outbound.recv().await.unwrap();
        assert!(matches!(msg2, WireMessage::Text(ref t) if t.contains("\"language\":\"ja\"")));
    }

    #[tokio::test(start_paused = true)]
    async fn keywords_sent_independently() {
        let (session, mut events, mut control) = spawn_session();
        let mut link = to_ready(&session, &mut events, &mut control).await;

        session
            .update_keywords(vec!["rust".into(), "audio".into(), "rust".into()])
            .await;

        let msg = link.outbound.recv().await.unwrap();
        match msg {
            WireMessage::Text(t) => {
                assert!(t.contains("\"event\":\"keywords\""));
                assert!(t.contains(r#"["rust","audio"]"#));
            }
            other => panic!("expected keywords text frame, got {other:?}"),
        }
        // No config re-send, no state change.
        assert_eq!(session.state(), ConnectionState::Ready);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn transcription_events_delivered_in_order() {
        let (session, mut events, mut control) = spawn_session();
        let link = to_ready(&session, &mut events, &mut control).await;

        for text in ["one", "two", "three"] {
            link.inbound
                .send(WireMessage::Text(format!(
                    r#"{{"event":"transcription","text":"{text}"}}"#
                )))
                .unwrap();
        }
        for expected in ["one", "two", "three"] {
            match next_event(&mut events).await {
                SessionEvent::Transcription(t) => assert_eq!(t.text, expected),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_inbound_is_not_fatal() {
        let (session, mut events, mut control) = spawn_session();
        let link = to_ready(&session, &mut events, &mut control).await;

        link.inbound
            .send(WireMessage::Text("garbage{{{".into()))
            .unwrap();
        link.inbound
            .send(WireMessage::Text(r#"{"event":"mystery"}"#.into()))
            .unwrap();
        link.inbound
            .send(WireMessage::Text(
                r#"{"event":"transcription","text":"still alive"}"#.into(),
            ))
            .unwrap();

        match next_event(&mut events).await {
            SessionEvent::Transcription(t) => assert_eq!(t.text, "still alive"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn service_error_surfaced_without_reconnect() {
        let (session, mut events, mut control) = spawn_session();
        let link = to_ready(&session, &mut events, &mut control).await;

        link.inbound
            .send(WireMessage::Text(
                r#"{"event":"error","message":"quota exceeded"}"#.into(),
            ))
            .unwrap();
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::ServiceError {
                message: "quota exceeded".into()
            }
        );
        assert_eq!(session.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_idempotent() {
        let (session, mut events, mut control) = spawn_session();
        let _link = to_ready(&session, &mut events, &mut control).await;

        session.disconnect().await;
        assert_eq!(
            next_event(&mut events).await,
            SessionEvent::StateChanged(ConnectionState::Disconnected)
        );

        session.disconnect().await;
        tokio::task::yield_now().await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err(), "second disconnect must be silent");

        // No reconnect timer survived: give the clock room, expect nothing.
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(session.state(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());
    }
}
