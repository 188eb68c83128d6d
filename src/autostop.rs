//! Silence auto-stop: end capture after sustained silence.
//!
//! Counts consecutive gated (silent) frames; once enough accumulate, a
//! countdown arms. If the countdown elapses before any voiced frame
//! arrives, the detector fires and the caller is expected to stop capture.
//! One voiced frame at any point cancels everything.
//!
//! Pure frame-driven logic with the clock passed in, so tests fabricate
//! timelines instead of sleeping.

use std::time::{Duration, Instant};

/// Consecutive silent frames before the countdown arms (~3.2s of audio).
pub const SILENT_FRAME_THRESHOLD: u32 = 50;

/// Grace period after arming before the detector fires.
pub const COUNTDOWN: Duration = Duration::from_secs(3);

/// What the detector concluded from one observed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoStopSignal {
    /// Nothing changed.
    Idle,
    /// Silence threshold reached; countdown started.
    Armed,
    /// A voiced frame interrupted a running countdown.
    Canceled,
    /// Countdown elapsed; capture should stop.
    Fired,
}

/// Frame-driven silence detector.
#[derive(Debug)]
pub struct SilenceAutoStop {
    enabled: bool,
    silent_frames: u32,
    deadline: Option<Instant>,
    fired: bool,
}

impl SilenceAutoStop {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            silent_frames: 0,
            deadline: None,
            fired: false,
        }
    }

    /// Enable or disable the detector. Disabling discards all progress.
    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            tracing::debug!(enabled, "Silence auto-stop toggled");
        }
        self.enabled = enabled;
        if !enabled {
            self.reset();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Clear all progress. Called when capture restarts after a fire.
    pub fn reset(&mut self) {
        self.silent_frames = 0;
        self.deadline = None;
        self.fired = false;
    }

    /// Feed one frame's gate outcome. `kept` is whether the frame carried
    /// voice; `now` is the observation time.
    pub fn observe(&mut self, kept: bool, now: Instant) -> AutoStopSignal {
        if !self.enabled || self.fired {
            return AutoStopSignal::Idle;
        }

        if kept {
            self.silent_frames = 0;
            if self.deadline.take().is_some() {
                tracing::debug!("Silence countdown canceled by voiced frame");
                return AutoStopSignal::Canceled;
            }
            return AutoStopSignal::Idle;
        }

        self.silent_frames = self.silent_frames.saturating_add(1);

        if let Some(deadline) = self.deadline {
            if now >= deadline {
                self.deadline = None;
                self.fired = true;
                tracing::info!(
                    silent_frames = self.silent_frames,
                    "Silence countdown elapsed; stopping capture"
                );
                return AutoStopSignal::Fired;
            }
            return AutoStopSignal::Idle;
        }

        if self.silent_frames >= SILENT_FRAME_THRESHOLD {
            self.deadline = Some(now + COUNTDOWN);
            tracing::debug!(
                silent_frames = self.silent_frames,
                countdown_ms = COUNTDOWN.as_millis() as u64,
                "Silence countdown armed"
            );
            return AutoStopSignal::Armed;
        }

        AutoStopSignal::Idle
    }
}
