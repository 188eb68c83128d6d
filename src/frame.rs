//! Fixed-size audio frames, the unit of capture and transport.
//!
//! A frame is 1024 signed 16-bit mono samples at 16 kHz (~64 ms of audio).
//! Frames are moved between pipeline stages, never shared: the capture
//! thread hands a frame to the conditioner, which hands it (possibly
//! silenced) to the transport session.

/// Sample rate of all captured and transmitted audio.
pub const SAMPLE_RATE: u32 = 16_000;

/// Number of samples per frame (~64 ms at 16 kHz).
pub const FRAME_SAMPLES: usize = 1024;

/// One frame of mono PCM16 audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    /// Create a frame from exactly [`FRAME_SAMPLES`] samples.
    ///
    /// Returns `None` if the sample count is wrong — frame boundaries are
    /// the capture framer's job, not the consumer's.
    pub fn new(samples: Vec<i16>) -> Option<Self> {
        if samples.len() == FRAME_SAMPLES {
            Some(Self { samples })
        } else {
            None
        }
    }

    /// A frame of pure silence.
    pub fn silence() -> Self {
        Self {
            samples: vec![0; FRAME_SAMPLES],
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Peak absolute amplitude over the frame.
    pub fn peak(&self) -> i16 {
        self.samples
            .iter()
            .map(|s| s.unsigned_abs())
            .max()
            .unwrap_or(0)
            .min(i16::MAX as u16) as i16
    }

    /// Root-mean-square energy over the frame.
    pub fn rms(&self) -> f64 {
        let sum_sq: f64 = self
            .samples
            .iter()
            .map(|&s| (s as f64) * (s as f64))
            .sum();
        (sum_sq / self.samples.len() as f64).sqrt()
    }

    /// Replace the frame contents with silence in place.
    pub fn silence_in_place(&mut self) {
        self.samples.fill(0);
    }

    /// Encode as raw little-endian PCM16 bytes (wire format, no header).
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    /// Decode from raw little-endian PCM16 bytes.
    ///
    /// Returns `None` unless the byte count matches exactly one frame.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != FRAME_SAMPLES * 2 {
            return None;
        }
        let samples = bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect();
        Self::new(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Frame filled with a constant sample value.
    fn constant_frame(value: i16) -> AudioFrame {
        AudioFrame::new(vec![value; FRAME_SAMPLES]).unwrap()
    }

    #[test]
    fn new_rejects_wrong_length() {
        assert!(AudioFrame::new(vec![0; FRAME_SAMPLES - 1]).is_none());
        assert!(AudioFrame::new(vec![0; FRAME_SAMPLES + 1]).is_none());
        assert!(AudioFrame::new(vec![0; FRAME_SAMPLES]).is_some());
    }

    #[test]
    fn silence_has_zero_peak_and_rms() {
        let frame = AudioFrame::silence();
        assert_eq!(frame.peak(), 0);
        assert_eq!(frame.rms(), 0.0);
    }

    #[test]
    fn peak_handles_i16_min() {
        let mut samples = vec![0i16; FRAME_SAMPLES];
        samples[3] = i16::MIN;
        let frame = AudioFrame::new(samples).unwrap();
        // |i16::MIN| saturates to i16::MAX rather than overflowing
        assert_eq!(frame.peak(), i16::MAX);
    }

    #[test]
    fn rms_of_constant_signal() {
        let frame = constant_frame(1000);
        assert!((frame.rms() - 1000.0).abs() < 1e-9);
    }

    #[test]
    fn le_bytes_round_trip() {
        let mut samples: Vec<i16> = (0..FRAME_SAMPLES as i16).collect();
        samples[0] = i16::MIN;
        samples[1] = i16::MAX;
        let frame = AudioFrame::new(samples).unwrap();

        let bytes = frame.to_le_bytes();
        assert_eq!(bytes.len(), FRAME_SAMPLES * 2);

        let decoded = AudioFrame::from_le_bytes(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn from_le_bytes_rejects_partial_frame() {
        assert!(AudioFrame::from_le_bytes(&[0u8; 10]).is_none());
    }

    #[test]
    fn silence_in_place_zeroes_samples() {
        let mut frame = constant_frame(500);
        frame.silence_in_place();
        assert_eq!(frame, AudioFrame::silence());
    }
}
