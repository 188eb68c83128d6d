//! Running counters for one streaming session.

use serde::{Deserialize, Serialize};

/// Statistics for a capture-and-stream session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionStats {
    /// Frames delivered by the capture layer.
    pub frames_captured: u64,
    /// Frames that passed the voice gate.
    pub frames_kept: u64,
    /// Frames silenced by the gate.
    pub frames_gated: u64,
    /// Frames handed to the transport while it was not ready.
    pub frames_dropped_not_ready: u64,
    /// Transcription events received from the service.
    pub transcriptions: u64,
    /// Reconnect cycles entered.
    pub reconnects: u64,
    /// Capture auto-stops triggered by sustained silence.
    pub auto_stops: u64,
}

impl SessionStats {
    /// Record one conditioned frame.
    pub fn record_frame(&mut self, kept: bool) {
        self.frames_captured += 1;
        if kept {
            self.frames_kept += 1;
        } else {
            self.frames_gated += 1;
        }
    }

    /// Fraction of captured frames that carried voice, 0.0 when empty.
    pub fn keep_ratio(&self) -> f64 {
        if self.frames_captured == 0 {
            return 0.0;
        }
        self.frames_kept as f64 / self.frames_captured as f64
    }
}
