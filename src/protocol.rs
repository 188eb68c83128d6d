//! Wire protocol for the transcription service connection.
//!
//! Control messages are JSON text frames tagged by an `event` discriminant;
//! audio travels as raw binary frames of little-endian PCM16 samples with no
//! header (see [`crate::frame::AudioFrame::to_le_bytes`]).
//!
//! ## Outbound
//!
//! ```text
//! {"event":"config","config":{...full SessionConfig snapshot...}}
//! {"event":"keywords","keywords":["term a","term b"]}
//! <binary> raw PCM16LE frame
//! ```
//!
//! ## Inbound
//!
//! `connected`, `config_updated` / `config_received` (both spellings
//! acknowledge a prior config), `transcription`, `error`. Unrecognized
//! discriminants are logged and dropped, never fatal.

use serde::{Deserialize, Serialize};

// ── Session configuration ─────────────────────────────────────────

/// Immutable configuration snapshot for a recognition session.
///
/// Sent atomically on connect and on every caller update — always the
/// entire snapshot, never partial diffs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Source language code (e.g. "en", "ko").
    pub language: String,
    /// Recognition model identifier on the service side.
    pub recognition_model: String,
    /// Translation target language; `None` disables translation.
    pub target_language: Option<String>,
    /// Whether the service should apply its own noise suppression.
    pub noise_suppression_enabled: bool,
    /// Realtime model variant requested from the service.
    pub realtime_model_type: String,
    /// Transcript stabilization window, in segments.
    pub stabilization_window: u32,
    /// Fuzzy-match threshold for transcript refinement (0.0–1.0).
    pub match_threshold: f32,
    /// Pause between processing passes, in seconds.
    pub processing_pause_seconds: f32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            recognition_model: "general".to_string(),
            target_language: None,
            noise_suppression_enabled: true,
            realtime_model_type: "streaming".to_string(),
            stabilization_window: 4,
            match_threshold: 0.8,
            processing_pause_seconds: 0.5,
        }
    }
}

// ── Outbound control messages ─────────────────────────────────────

/// Control messages sent to the service as JSON text frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum OutboundControl {
    /// Full configuration snapshot.
    #[serde(rename = "config")]
    Config { config: SessionConfig },

    /// Ordered keyword list for recognition biasing. Sent on demand,
    /// independent of the config handshake.
    #[serde(rename = "keywords")]
    Keywords { keywords: Vec<String> },
}

impl OutboundControl {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

// ── Inbound events ────────────────────────────────────────────────

/// A transcription/translation result from the service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    pub text: String,
    /// Stabilized/refined version of the text, when available.
    pub refined_text: Option<String>,
    /// Translation into the configured target language.
    pub translation: Option<String>,
    /// Position in the session audio, in seconds.
    pub timestamp: Option<f64>,
}

/// Decoded inbound message, created on decode and consumed synchronously
/// by the session dispatcher.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event")]
pub enum InboundEvent {
    /// Connection accepted; carries the service-assigned session identifier
    /// to persist for reconnection correlation.
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// Acknowledges a prior config message. The service emits either
    /// spelling depending on version; both are equivalent.
    #[serde(rename = "config_updated", alias = "config_received")]
    ConfigAcknowledged {},

    #[serde(rename = "transcription")]
    Transcription(Transcription),

    #[serde(rename = "error")]
    ErrorReported { message: String },
}

/// Decode an inbound text frame.
///
/// Malformed payloads and unrecognized discriminants return `None` and are
/// logged at debug level — inbound garbage is never fatal to the session.
pub fn parse_inbound(text: &str) -> Option<InboundEvent> {
    match serde_json::from_str(text) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(error = %e, raw = %text, "Dropping undecodable inbound message");
            None
        }
    }
}

// ── Keyword normalization ─────────────────────────────────────────

/// Deduplicate keywords preserving first-seen order and dropping blanks.
pub fn normalize_keywords<I, S>(keywords: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = std::collections::HashSet::new();
    keywords
        .into_iter()
        .map(Into::into)
        .filter(|k| !k.trim().is_empty())
        .filter(|k| seen.insert(k.clone()))
        .collect()
}
