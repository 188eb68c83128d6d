//! Streamscribe: live-audio streaming transcription client.
//!
//! Captures microphone (and optionally system) audio, conditions it with a
//! voice gate, and streams it to a realtime transcription service over a
//! WebSocket-style transport, surfacing transcriptions and connection
//! lifecycle as events.
//!
//! ## Design
//! - Fixed pipeline unit: 1024-sample frames of 16-bit PCM at 16 kHz mono
//! - Single-actor connection state machine (config handshake, exponential
//!   backoff reconnect, degraded Ready when config never confirms)
//! - Heuristic voice gating (amplitude + RMS + spectral voice-band ratio)
//!   with a pluggable noise-suppression model behind `Denoiser`
//! - Silence auto-stop: sustained silence ends capture after a countdown
//! - Transport behind a trait, so the state machine tests run against an
//!   in-memory channel transport
//!
//! [`client::StreamingClient`] is the top-level entry point; the layers
//! underneath are usable on their own.

pub mod autostop;
pub mod capture;
pub mod client;
pub mod conditioner;
pub mod error;
pub mod frame;
pub mod protocol;
pub mod session;
pub mod stats;

pub use autostop::{AutoStopSignal, SilenceAutoStop};
pub use capture::{list_devices, CaptureHandle, CaptureManager, DeviceDescriptor, SourceSelection};
pub use client::{ClientConfig, ClientEvent, StreamingClient};
pub use conditioner::{
    Denoiser, FrameConditioner, GateDecision, GateMode, GateReason, HeuristicLevel, NoopDenoiser,
};
pub use error::{Result, StreamscribeError};
pub use frame::{AudioFrame, FRAME_SAMPLES, SAMPLE_RATE};
pub use protocol::{InboundEvent, OutboundControl, SessionConfig, Transcription};
pub use session::{ConnectionState, Endpoint, SessionEvent, TransportSession};
pub use stats::SessionStats;
