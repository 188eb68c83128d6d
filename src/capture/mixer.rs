//! Merging of two capture sources into a single mono frame stream.

use std::collections::VecDeque;

use crate::frame::{AudioFrame, FRAME_SAMPLES};

/// Combines a primary source (microphone) and an optional secondary source
/// (system-audio monitor) into fixed-size frames.
///
/// A frame is emitted as soon as the leading source has accumulated a full
/// frame's worth of samples; the lagging source contributes what it has and
/// is zero-padded for the remainder. Samples are mixed with saturating
/// addition. With one source the mixer degenerates to a plain framer.
#[derive(Debug, Default)]
pub struct FrameMixer {
    primary: VecDeque<i16>,
    secondary: VecDeque<i16>,
    frames_emitted: u64,
}

impl FrameMixer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_primary(&mut self, samples: &[i16]) {
        self.primary.extend(samples.iter().copied());
    }

    pub fn push_secondary(&mut self, samples: &[i16]) {
        self.secondary.extend(samples.iter().copied());
    }

    /// Number of buffered samples in the fuller queue.
    pub fn pending(&self) -> usize {
        self.primary.len().max(self.secondary.len())
    }

    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Pop the next mixed frame, if at least one source has a full frame.
    pub fn pop_frame(&mut self) -> Option<AudioFrame> {
        if self.pending() < FRAME_SAMPLES {
            return None;
        }

        let mut samples = vec![0i16; FRAME_SAMPLES];
        for slot in samples.iter_mut() {
            let a = self.primary.pop_front().unwrap_or(0);
            let b = self.secondary.pop_front().unwrap_or(0);
            *slot = a.saturating_add(b);
        }

        self.frames_emitted += 1;
        // Always full-length, so the constructor cannot reject it.
        AudioFrame::new(samples)
    }

    /// Discard all buffered samples.
    pub fn clear(&mut self) {
        self.primary.clear();
        self.secondary.clear();
    }
}
