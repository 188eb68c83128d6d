//! Streaming client facade: capture, conditioning, auto-stop, and
//! transport wired into one handle.
//!
//! The facade owns two kinds of background work:
//! - an event forwarder translating transport session events into
//!   [`ClientEvent`]s and keeping the stats current, alive for the whole
//!   client lifetime;
//! - a capture pipeline per capture run, feeding conditioned frames into
//!   the session until stopped (explicitly or by silence auto-stop).

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use crate::autostop::{AutoStopSignal, SilenceAutoStop};
use crate::capture::{CaptureHandle, CaptureManager, SourceSelection};
use crate::conditioner::{Denoiser, FrameConditioner, GateMode, HeuristicLevel};
use crate::error::{Result, StreamscribeError};
use crate::protocol::{SessionConfig, Transcription};
use crate::session::transport::{Transport, WsTransport};
use crate::session::{ConnectionState, Endpoint, SessionEvent, TransportSession};
use crate::stats::SessionStats;

/// Everything needed to start a client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base service URL; the session identifier is appended to it.
    pub endpoint: String,
    pub session: SessionConfig,
    pub sources: SourceSelection,
    pub gate_mode: GateMode,
    pub auto_stop_enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            session: SessionConfig::default(),
            sources: SourceSelection::default(),
            gate_mode: GateMode::Heuristic(HeuristicLevel::Medium),
            auto_stop_enabled: false,
        }
    }
}

/// Events surfaced to the embedding application.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    StateChanged(ConnectionState),
    Connected { session_id: String },
    ConfigAcknowledged,
    /// Config handshake never confirmed; streaming continues regardless.
    ConfigUnconfirmed,
    Transcription(Transcription),
    ServiceError { message: String },
    /// Reconnects exhausted; a fresh `connect()` is required.
    Failed { message: String },
    CaptureStarted,
    CaptureStopped,
    /// A capture source was downgraded while opening.
    CaptureWarning { message: String },
    /// Capture ended because of sustained silence.
    AutoStopped,
}

/// Handle to a live streaming transcription client.
pub struct StreamingClient {
    session: TransportSession,
    event_rx: Arc<Mutex<mpsc::Receiver<ClientEvent>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    conditioner: Arc<Mutex<FrameConditioner>>,
    stats: Arc<StdMutex<SessionStats>>,
    auto_stop_enabled: Arc<watch::Sender<bool>>,
    capture_stop: Mutex<Option<mpsc::Sender<()>>>,
    sources: SourceSelection,
    session_id: String,
}

impl StreamingClient {
    /// Start a client with no noise-suppression model.
    pub fn start(config: ClientConfig) -> Self {
        Self::start_with(config, FrameConditionerSetup::Plain, Arc::new(WsTransport))
    }

    /// Start a client with a noise-suppression model for
    /// [`GateMode::Model`].
    pub fn start_with_denoiser(config: ClientConfig, denoiser: Box<dyn Denoiser>) -> Self {
        Self::start_with(
            config,
            FrameConditionerSetup::Denoiser(denoiser),
            Arc::new(WsTransport),
        )
    }

    fn start_with(
        config: ClientConfig,
        setup: FrameConditionerSetup,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let session_id = Uuid::new_v4().to_string();
        tracing::info!(session_id = %session_id, endpoint = %config.endpoint, "Starting streaming client");

        let (session, session_events) = TransportSession::spawn(
            Endpoint::new(config.endpoint),
            config.session,
            transport,
            session_id.clone(),
        );

        let conditioner = match setup {
            FrameConditionerSetup::Plain => FrameConditioner::new(config.gate_mode),
            FrameConditionerSetup::Denoiser(denoiser) => {
                FrameConditioner::with_denoiser(config.gate_mode, denoiser)
            }
        };

        let (event_tx, event_rx) = mpsc::channel(256);
        let stats = Arc::new(StdMutex::new(SessionStats::default()));
        let (auto_stop_tx, _) = watch::channel(config.auto_stop_enabled);

        tokio::spawn(Self::event_forwarder(
            session_events,
            event_tx.clone(),
            Arc::clone(&stats),
        ));

        Self {
            session,
            event_rx: Arc::new(Mutex::new(event_rx)),
            event_tx,
            conditioner: Arc::new(Mutex::new(conditioner)),
            stats,
            auto_stop_enabled: Arc::new(auto_stop_tx),
            capture_stop: Mutex::new(None),
            sources: config.sources,
            session_id,
        }
    }

    /// Locally-generated session identifier (the service may assign its
    /// own; see [`ClientEvent::Connected`]).
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn connect(&self) {
        self.session.connect().await;
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.session.state_stream()
    }

    /// Receive the next client event.
    pub async fn recv_event(&self) -> Option<ClientEvent> {
        self.event_rx.lock().await.recv().await
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Replace the session config; the full snapshot is (re)sent to the
    /// service.
    pub async fn update_config(&self, config: SessionConfig) {
        self.session.update_config(config).await;
    }

    /// Send the recognition keyword list.
    pub async fn update_keywords(&self, keywords: Vec<String>) {
        self.session.update_keywords(keywords).await;
    }

    pub async fn set_gate_mode(&self, mode: GateMode) {
        self.conditioner.lock().await.set_mode(mode);
    }

    pub fn set_auto_stop(&self, enabled: bool) {
        self.auto_stop_enabled.send_replace(enabled);
    }

    /// Open the configured sources and start feeding frames. Idempotent:
    /// returns `Ok` if capture is already running.
    pub async fn start_capture(&self) -> Result<()> {
        let mut slot = self.capture_stop.lock().await;
        // A sender whose pipeline already exited (auto-stop) is stale.
        if slot.as_ref().is_some_and(|stop| !stop.is_closed()) {
            tracing::debug!("Capture already running");
            return Ok(());
        }

        let sources = self.sources.clone();
        let mut handle = tokio::task::spawn_blocking(move || CaptureManager::open(&sources))
            .await
            .map_err(|e| StreamscribeError::Capture {
                message: format!("capture open task failed: {e}"),
            })??;

        for warning in handle.warnings() {
            let _ = self
                .event_tx
                .send(ClientEvent::CaptureWarning {
                    message: warning.clone(),
                })
                .await;
        }

        let frames = handle
            .take_frames()
            .ok_or_else(|| StreamscribeError::Capture {
                message: "capture handle yielded no frame stream".into(),
            })?;

        let (stop_tx, stop_rx) = mpsc::channel(1);
        *slot = Some(stop_tx);
        drop(slot);

        let pipeline = CapturePipeline {
            handle,
            frames,
            stop_rx,
            session: self.session.clone(),
            conditioner: Arc::clone(&self.conditioner),
            stats: Arc::clone(&self.stats),
            auto_stop_enabled: self.auto_stop_enabled.subscribe(),
            event_tx: self.event_tx.clone(),
        };
        tokio::spawn(pipeline.run());

        let _ = self.event_tx.send(ClientEvent::CaptureStarted).await;
        Ok(())
    }

    /// Stop capture and release the devices. Idempotent.
    pub async fn stop_capture(&self) {
        let stop = self.capture_stop.lock().await.take();
        if let Some(stop) = stop {
            let _ = stop.send(()).await;
        }
    }

    /// Stop everything: capture, then the transport session.
    pub async fn shutdown(&self) {
        self.stop_capture().await;
        self.session.disconnect().await;
        tracing::info!(session_id = %self.session_id, "Streaming client shut down");
    }

    async fn event_forwarder(
        mut session_events: mpsc::Receiver<SessionEvent>,
        event_tx: mpsc::Sender<ClientEvent>,
        stats: Arc<StdMutex<SessionStats>>,
    ) {
        while let Some(event) = session_events.recv().await {
            let mapped = match event {
                SessionEvent::StateChanged(state) => {
                    if state == ConnectionState::Reconnecting {
                        if let Ok(mut stats) = stats.lock() {
                            stats.reconnects += 1;
                        }
                    }
                    ClientEvent::StateChanged(state)
                }
                SessionEvent::Connected { session_id } => ClientEvent::Connected { session_id },
                SessionEvent::ConfigAcknowledged => ClientEvent::ConfigAcknowledged,
                SessionEvent::ConfigUnconfirmed => ClientEvent::ConfigUnconfirmed,
                SessionEvent::Transcription(t) => {
                    if let Ok(mut stats) = stats.lock() {
                        stats.transcriptions += 1;
                    }
                    ClientEvent::Transcription(t)
                }
                SessionEvent::ServiceError { message } => ClientEvent::ServiceError { message },
                SessionEvent::Failed { message } => ClientEvent::Failed { message },
            };
            if event_tx.send(mapped).await.is_err() {
                return;
            }
        }
    }
}

enum FrameConditionerSetup {
    Plain,
    Denoiser(Box<dyn Denoiser>),
}

/// One capture run: frames in, conditioned frames out, until stopped.
struct CapturePipeline {
    handle: CaptureHandle,
    frames: mpsc::Receiver<crate::frame::AudioFrame>,
    stop_rx: mpsc::Receiver<()>,
    session: TransportSession,
    conditioner: Arc<Mutex<FrameConditioner>>,
    stats: Arc<StdMutex<SessionStats>>,
    auto_stop_enabled: watch::Receiver<bool>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl CapturePipeline {
    async fn run(mut self) {
        let mut auto_stop = SilenceAutoStop::new(*self.auto_stop_enabled.borrow());
        let mut fired = false;

        loop {
            tokio::select! {
                _ = self.stop_rx.recv() => break,
                frame = self.frames.recv() => {
                    let Some(mut frame) = frame else {
                        tracing::warn!("Capture frame stream ended unexpectedly");
                        break;
                    };

                    let decision = self.conditioner.lock().await.process(&mut frame);
                    if let Ok(mut stats) = self.stats.lock() {
                        stats.record_frame(decision.keep);
                        // Only frames that would have gone out count as
                        // lost to a not-ready session.
                        if decision.keep && self.session.state() != ConnectionState::Ready {
                            stats.frames_dropped_not_ready += 1;
                        }
                    }

                    auto_stop.set_enabled(*self.auto_stop_enabled.borrow());
                    match auto_stop.observe(decision.keep, Instant::now()) {
                        AutoStopSignal::Fired => {
                            fired = true;
                            break;
                        }
                        AutoStopSignal::Armed
                        | AutoStopSignal::Canceled
                        | AutoStopSignal::Idle => {}
                    }

                    // Gated frames stop here; the session's near-silence
                    // filter stays an independent second check.
                    if decision.keep {
                        self.session.send_frame(frame).await;
                    }
                }
            }
        }

        // Releasing the devices joins the capture thread; keep that off
        // the async workers.
        let handle = self.handle;
        let _ = tokio::task::spawn_blocking(move || handle.stop()).await;
        if fired {
            if let Ok(mut stats) = self.stats.lock() {
                stats.auto_stops += 1;
            }
            let _ = self.event_tx.send(ClientEvent::AutoStopped).await;
        }
        let _ = self.event_tx.send(ClientEvent::CaptureStopped).await;
    }
}
