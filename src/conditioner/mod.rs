//! Frame conditioner: per-frame voice gating between capture and transport.
//!
//! Every captured frame passes through exactly one gate decision. Gated
//! frames are silenced in place rather than discarded, so the downstream
//! pipeline keeps its frame cadence and the silence auto-stop can observe
//! the gap.
//!
//! Two gating modes:
//! - **Heuristic**: amplitude/RMS thresholds plus a spectral voice-band
//!   energy ratio, at four sensitivity levels.
//! - **Model**: frames run through a pluggable noise-suppression
//!   [`Denoiser`] first, then a simple peak gate on the cleaned signal.
//!   Any denoiser failure latches a permanent fallback to heuristic
//!   gating for the rest of the conditioner's life.

use crate::error::Result;
use crate::frame::AudioFrame;

/// Peak threshold applied to model-denoised frames.
const MODEL_PEAK_THRESHOLD: i16 = 500;

/// DFT bin range treated as the voice band. With 1024-point frames at
/// 16 kHz each bin spans 15.625 Hz, so bins 5..=40 cover roughly
/// 78–625 Hz, where speech fundamentals live.
const VOICE_BIN_LOW: usize = 5;
const VOICE_BIN_HIGH: usize = 40;

/// Heuristic gate sensitivity. Higher levels demand more convincing
/// evidence of voice before a frame passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeuristicLevel {
    /// Gate disabled; every frame passes.
    Off,
    Low,
    Medium,
    High,
}

impl HeuristicLevel {
    /// (peak, rms, voice-ratio cutoff) for this level.
    fn thresholds(self) -> (i16, f64, f32) {
        match self {
            Self::Off => (0, 0.0, 0.0),
            Self::Low => (600, 200.0, 0.15),
            Self::Medium => (1200, 400.0, 0.15),
            Self::High => (2000, 700.0, 0.25),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// Denoise with the configured model, then peak-gate the result.
    Model,
    Heuristic(HeuristicLevel),
}

/// Why a frame was gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateReason {
    AmplitudeGate,
    RmsGate,
    SpectralVoiceRatio,
    ModelSuppressed,
}

/// Outcome of conditioning one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateDecision {
    pub keep: bool,
    /// Present only when `keep` is false.
    pub reason: Option<GateReason>,
    pub peak: i16,
    pub rms: f64,
    /// Voice-band share of total spectral energy, 0.0 when not computed.
    pub voice_ratio: f32,
}

/// Pluggable noise suppression applied in [`GateMode::Model`].
///
/// Implementations clean the frame in place. An `Err` signals the model is
/// unusable; the conditioner reacts by latching heuristic fallback.
pub trait Denoiser: Send {
    fn denoise(&mut self, frame: &mut AudioFrame) -> Result<()>;
    /// Human-readable identifier for logs.
    fn name(&self) -> &str;
}

/// Pass-through denoiser for configurations without a suppression model.
pub struct NoopDenoiser;

impl Denoiser for NoopDenoiser {
    fn denoise(&mut self, _frame: &mut AudioFrame) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        "noop"
    }
}

/// Stateful gate applied to each captured frame in order.
pub struct FrameConditioner {
    mode: GateMode,
    denoiser: Box<dyn Denoiser>,
    /// Set once a denoiser failure forces heuristic gating; never unset.
    model_fallback: bool,
    frames_seen: u64,
    frames_gated: u64,
}

impl FrameConditioner {
    pub fn new(mode: GateMode) -> Self {
        Self::with_denoiser(mode, Box::new(NoopDenoiser))
    }

    pub fn with_denoiser(mode: GateMode, denoiser: Box<dyn Denoiser>) -> Self {
        Self {
            mode,
            denoiser,
            model_fallback: false,
            frames_seen: 0,
            frames_gated: 0,
        }
    }

    /// Change the gate mode. A latched model fallback survives mode
    /// changes; re-selecting `Model` after a failure stays heuristic.
    pub fn set_mode(&mut self, mode: GateMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> GateMode {
        self.mode
    }

    /// Gate one frame. Gated frames come back silenced in place.
    pub fn process(&mut self, frame: &mut AudioFrame) -> GateDecision {
        self.frames_seen += 1;

        let decision = match self.mode {
            GateMode::Model if !self.model_fallback => self.gate_model(frame),
            GateMode::Model => gate_heuristic(frame, HeuristicLevel::Medium),
            GateMode::Heuristic(level) => gate_heuristic(frame, level),
        };

        if !decision.keep {
            frame.silence_in_place();
            self.frames_gated += 1;
            tracing::trace!(
                reason = ?decision.reason,
                peak = decision.peak,
                rms = decision.rms,
                voice_ratio = decision.voice_ratio,
                "Frame gated"
            );
        }
        if self.frames_seen % 500 == 0 {
            tracing::debug!(
                seen = self.frames_seen,
                gated = self.frames_gated,
                "Conditioner progress"
            );
        }
        decision
    }

    fn gate_model(&mut self, frame: &mut AudioFrame) -> GateDecision {
        if let Err(e) = self.denoiser.denoise(frame) {
            tracing::warn!(
                denoiser = self.denoiser.name(),
                error = %e,
                "Noise suppression failed; falling back to heuristic gating permanently"
            );
            self.model_fallback = true;
            return gate_heuristic(frame, HeuristicLevel::Medium);
        }

        let peak = frame.peak();
        let rms = frame.rms();
        let keep = peak > MODEL_PEAK_THRESHOLD;
        GateDecision {
            keep,
            reason: (!keep).then_some(GateReason::ModelSuppressed),
            peak,
            rms,
            voice_ratio: 0.0,
        }
    }
}

fn gate_heuristic(frame: &AudioFrame, level: HeuristicLevel) -> GateDecision {
    let peak = frame.peak();
    let rms = frame.rms();

    if level == HeuristicLevel::Off {
        return GateDecision {
            keep: true,
            reason: None,
            peak,
            rms,
            voice_ratio: 0.0,
        };
    }

    let (peak_thr, rms_thr, ratio_cutoff) = level.thresholds();
    let voice_ratio = voice_energy_ratio(frame.samples());
    let loud_enough = peak > peak_thr && rms > rms_thr;

    let (keep, reason) = match level {
        // Low and Medium: amplitude evidence OR spectral evidence suffices.
        HeuristicLevel::Low | HeuristicLevel::Medium => {
            if loud_enough || voice_ratio > ratio_cutoff {
                (true, None)
            } else if peak <= peak_thr {
                (false, Some(GateReason::AmplitudeGate))
            } else {
                (false, Some(GateReason::RmsGate))
            }
        }
        // High: demand both amplitude AND spectral evidence.
        HeuristicLevel::High => {
            if peak <= peak_thr {
                (false, Some(GateReason::AmplitudeGate))
            } else if rms <= rms_thr {
                (false, Some(GateReason::RmsGate))
            } else if voice_ratio <= ratio_cutoff {
                (false, Some(GateReason::SpectralVoiceRatio))
            } else {
                (true, None)
            }
        }
        HeuristicLevel::Off => unreachable!("handled above"),
    };

    GateDecision {
        keep,
        reason,
        peak,
        rms,
        voice_ratio,
    }
}

/// Share of the frame's spectral energy inside the voice band.
///
/// Goertzel per bin over the voice band only; full-spectrum energy comes
/// from the time domain via Parseval. Returns 0.0 for all-zero frames.
fn voice_energy_ratio(samples: &[i16]) -> f32 {
    let n = samples.len();
    let mut total = 0.0f64;
    for &s in samples {
        let v = f64::from(s);
        total += v * v;
    }
    if total <= f64::EPSILON {
        return 0.0;
    }

    let mut band = 0.0f64;
    for k in VOICE_BIN_LOW..=VOICE_BIN_HIGH {
        let w = 2.0 * std::f64::consts::PI * k as f64 / n as f64;
        let coeff = 2.0 * w.cos();
        let (mut s1, mut s2) = (0.0f64, 0.0f64);
        for &x in samples {
            let s0 = f64::from(x) + coeff * s1 - s2;
            s2 = s1;
            s1 = s0;
        }
        // Squared magnitude of bin k.
        band += s1 * s1 + s2 * s2 - coeff * s1 * s2;
    }

    // Factor 2: each band bin has a mirrored conjugate above Nyquist.
    let ratio = (2.0 * band) / (n as f64 * total);
    ratio.clamp(0.0, 1.0) as f32
}
