//! Audio capture: device enumeration and acquisition via CPAL.
//!
//! Captured audio is normalized to 16-bit PCM, 16 kHz, mono regardless of
//! what the hardware delivers. The preferred path asks the backend for that
//! format directly (PipeWire/PulseAudio convert transparently); devices
//! that refuse fall back to their native format with software channel
//! mixing and resampling.
//!
//! CPAL streams are not `Send`, so a dedicated thread owns them and pumps
//! mixed frames into an async channel. Frames are dropped, not queued
//! unboundedly, when the consumer falls behind.

pub mod mixer;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;

use crate::error::{Result, StreamscribeError};
use crate::frame::{AudioFrame, SAMPLE_RATE};
use mixer::FrameMixer;

/// Preferred device names on PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse"];

/// Device name patterns that are never useful for voice input.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "hdmi",
    "s/pdif",
    "digital output",
];

/// Name patterns identifying system-audio (playback loopback) inputs.
const MONITOR_PATTERNS: &[&str] = &["monitor", "loopback"];

/// How long to wait for the preferred-format stream to prove it delivers
/// data before falling back to the native format. Some PipeWire-ALSA
/// setups accept non-native configs but never fire the callback.
const CALLBACK_PROBE: Duration = Duration::from_millis(200);

/// Pump tick for draining mixed frames toward the consumer.
const PUMP_TICK: Duration = Duration::from_millis(32);

/// Capacity of the outgoing frame channel (~4s of audio).
const FRAME_CHANNEL_DEPTH: usize = 64;

/// Classify a backend failure message. CPAL flattens OS permission errors
/// into backend-specific strings, so this is a best-effort distinction.
fn capture_error(message: String) -> StreamscribeError {
    let lower = message.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not allowed") {
        StreamscribeError::PermissionDenied { message }
    } else {
        StreamscribeError::Capture { message }
    }
}

fn matches_any(name: &str, patterns: &[&str]) -> bool {
    let lower = name.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

fn is_filtered(name: &str) -> bool {
    matches_any(name, FILTERED_PATTERNS)
}

fn is_preferred(name: &str) -> bool {
    matches_any(name, PREFERRED_DEVICES)
}

fn is_monitor(name: &str) -> bool {
    matches_any(name, MONITOR_PATTERNS)
}

/// One usable input device, as presented to device pickers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: String,
    /// Preferred on this desktop (PipeWire/PulseAudio virtual devices).
    pub recommended: bool,
    /// A playback-loopback input usable for system-audio capture.
    pub monitor: bool,
}

/// What the caller wants captured.
#[derive(Debug, Clone, Default)]
pub struct SourceSelection {
    /// Exact device name, or `None` for the best available default.
    pub device: Option<String>,
    /// Also capture system playback through a monitor device, mixed into
    /// the same frame stream.
    pub capture_system_audio: bool,
}

/// Enumerate usable input devices, filtered and annotated.
pub fn list_devices() -> Result<Vec<DeviceDescriptor>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| StreamscribeError::Capture {
            message: format!("failed to enumerate input devices: {e}"),
        })?;

    let mut out = Vec::new();
    for device in devices {
        let Ok(name) = device.name() else { continue };
        if is_filtered(&name) {
            continue;
        }
        out.push(DeviceDescriptor {
            recommended: is_preferred(&name),
            monitor: is_monitor(&name),
            name,
        });
    }
    tracing::debug!(count = out.len(), "Enumerated input devices");
    Ok(out)
}

/// Source names resolved against the available device list.
#[derive(Debug, PartialEq, Eq)]
struct ResolvedSources {
    /// `None` means "pick the best default live".
    mic: Option<String>,
    monitor: Option<String>,
    warnings: Vec<String>,
}

/// Pure resolution of a [`SourceSelection`] against available names.
fn resolve_sources(available: &[String], selection: &SourceSelection) -> Result<ResolvedSources> {
    let mic = match &selection.device {
        Some(name) => {
            if !available.iter().any(|n| n == name) {
                return Err(StreamscribeError::DeviceUnavailable {
                    device: name.clone(),
                });
            }
            Some(name.clone())
        }
        None => None,
    };

    let mut warnings = Vec::new();
    let monitor = if selection.capture_system_audio {
        let found = available
            .iter()
            .find(|n| is_monitor(n) && Some(n.as_str()) != mic.as_deref())
            .cloned();
        if found.is_none() {
            warnings.push(
                "system-audio capture requested but no monitor/loopback input found; \
                 capturing microphone only"
                    .to_string(),
            );
        }
        found
    } else {
        None
    };

    Ok(ResolvedSources {
        mic,
        monitor,
        warnings,
    })
}

/// Handle to a running capture. Dropping it stops the capture thread.
pub struct CaptureHandle {
    frames: Option<mpsc::Receiver<AudioFrame>>,
    warnings: Vec<String>,
    stop_tx: std_mpsc::Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CaptureHandle {
    /// Non-fatal conditions noted while opening (e.g. a missing monitor
    /// device downgraded a system-audio request).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Take ownership of the frame stream. Yields `None` after the first
    /// call.
    pub fn take_frames(&mut self) -> Option<mpsc::Receiver<AudioFrame>> {
        self.frames.take()
    }

    /// Stop capture and release the devices.
    pub fn stop(self) {
        // Drop does the work.
    }

    /// Handle backed by a thread that only waits for the stop signal, for
    /// exercising consumers without audio hardware.
    #[cfg(test)]
    pub(crate) fn idle() -> Self {
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || {
                let _ = stop_rx.recv();
            })
            .unwrap();
        Self {
            frames: None,
            warnings: Vec::new(),
            stop_tx,
            thread: Some(thread),
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Opens capture sources and owns their lifetime.
pub struct CaptureManager;

impl CaptureManager {
    /// Acquire the selected sources and start delivering frames.
    ///
    /// Blocks for a few hundred milliseconds while stream formats are
    /// probed; call from a blocking-friendly context.
    pub fn open(selection: &SourceSelection) -> Result<CaptureHandle> {
        let available: Vec<String> = list_devices()?.into_iter().map(|d| d.name).collect();
        let resolved = resolve_sources(&available, selection)?;
        for warning in &resolved.warnings {
            tracing::warn!(%warning, "Capture source downgraded");
        }

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_CHANNEL_DEPTH);
        let (stop_tx, stop_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let mut warnings = resolved.warnings.clone();
        let thread = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || capture_thread(resolved, frame_tx, stop_rx, ready_tx))
            .map_err(|e| StreamscribeError::Capture {
                message: format!("failed to spawn capture thread: {e}"),
            })?;

        // The thread reports once its streams are actually delivering,
        // carrying any downgrades decided while opening them.
        match ready_rx.recv() {
            Ok(Ok(open_warnings)) => warnings.extend(open_warnings),
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(StreamscribeError::Capture {
                    message: "capture thread exited before reporting readiness".into(),
                });
            }
        }

        Ok(CaptureHandle {
            frames: Some(frame_rx),
            warnings,
            stop_tx,
            thread: Some(thread),
        })
    }
}

/// Body of the capture thread: open streams, pump mixed frames until told
/// to stop. CPAL streams live and die entirely on this thread.
fn capture_thread(
    resolved: ResolvedSources,
    frame_tx: mpsc::Sender<AudioFrame>,
    stop_rx: std_mpsc::Receiver<()>,
    ready_tx: std_mpsc::Sender<Result<Vec<String>>>,
) {
    let mixer = Arc::new(Mutex::new(FrameMixer::new()));

    let _streams = match open_streams(&resolved, &mixer) {
        Ok((streams, warnings)) => {
            let _ = ready_tx.send(Ok(warnings));
            streams
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut dropped: u64 = 0;
    loop {
        match stop_rx.recv_timeout(PUMP_TICK) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
        }

        loop {
            let frame = match mixer.lock() {
                Ok(mut mixer) => mixer.pop_frame(),
                Err(_) => None,
            };
            let Some(frame) = frame else { break };
            if frame_tx.try_send(frame).is_err() {
                dropped += 1;
                if dropped % 100 == 1 {
                    tracing::warn!(dropped, "Frame consumer lagging; dropping captured audio");
                }
            }
        }
    }
    tracing::debug!(dropped, "Capture thread stopping");
}

fn open_streams(
    resolved: &ResolvedSources,
    mixer: &Arc<Mutex<FrameMixer>>,
) -> Result<(Vec<cpal::Stream>, Vec<String>)> {
    let host = cpal::default_host();

    let mic = match &resolved.mic {
        Some(name) => find_device(&host, name)?,
        None => best_default_device(&host)?,
    };
    if let Ok(name) = mic.name() {
        tracing::info!(device = %name, "Opening microphone");
    }

    let mut streams = Vec::with_capacity(2);
    streams.push(start_stream(&mic, Arc::clone(mixer), false)?);

    let mut warnings = Vec::new();
    if let Some(name) = &resolved.monitor {
        tracing::info!(device = %name, "Opening system-audio monitor");
        let opened =
            find_device(&host, name).and_then(|monitor| start_stream(&monitor, Arc::clone(mixer), true));
        if let Some(stream) = monitor_stream_or_warning(name, opened, &mut warnings) {
            streams.push(stream);
        }
    }

    Ok((streams, warnings))
}

/// System-audio capture is best-effort: a monitor device that fails to
/// open (busy, permission denied) downgrades the run to microphone-only
/// instead of failing it. The microphone itself stays fatal.
fn monitor_stream_or_warning<T>(
    name: &str,
    opened: Result<T>,
    warnings: &mut Vec<String>,
) -> Option<T> {
    match opened {
        Ok(stream) => Some(stream),
        Err(e) => {
            tracing::warn!(device = %name, error = %e, "System-audio monitor failed to open");
            warnings.push(format!(
                "system-audio device {name:?} failed to open ({e}); capturing microphone only"
            ));
            None
        }
    }
}

fn find_device(host: &cpal::Host, name: &str) -> Result<cpal::Device> {
    let devices = host
        .input_devices()
        .map_err(|e| StreamscribeError::Capture {
            message: format!("failed to enumerate input devices: {e}"),
        })?;
    for device in devices {
        if device.name().map(|n| n == name).unwrap_or(false) {
            return Ok(device);
        }
    }
    Err(StreamscribeError::DeviceUnavailable {
        device: name.to_string(),
    })
}

/// Best default input: a preferred virtual device if one exists, else the
/// system default. Respects the desktop's own device routing.
fn best_default_device(host: &cpal::Host) -> Result<cpal::Device> {
    if let Ok(devices) = host.input_devices() {
        for device in devices {
            if device.name().map(|n| is_preferred(&n)).unwrap_or(false) {
                return Ok(device);
            }
        }
    }
    host.default_input_device()
        .ok_or_else(|| StreamscribeError::DeviceUnavailable {
            device: "default".to_string(),
        })
}

/// Build and start a stream on `device`, pushing normalized samples into
/// the mixer. Tries i16 then f32 at the target format, verifies the
/// callback actually fires, then falls back to the native format.
fn start_stream(
    device: &cpal::Device,
    mixer: Arc<Mutex<FrameMixer>>,
    secondary: bool,
) -> Result<cpal::Stream> {
    let counter = Arc::new(AtomicU64::new(0));

    if let Some(stream) = try_preferred_stream(device, &mixer, secondary, &counter) {
        if stream.play().is_ok() {
            std::thread::sleep(CALLBACK_PROBE);
            if counter.load(Ordering::Relaxed) > 0 {
                return Ok(stream);
            }
            tracing::warn!("Preferred capture format accepted but silent; using native format");
        }
    }

    let stream = build_native_stream(device, mixer, secondary)?;
    stream
        .play()
        .map_err(|e| capture_error(format!("failed to start capture stream: {e}")))?;
    Ok(stream)
}

fn push_samples(mixer: &Arc<Mutex<FrameMixer>>, secondary: bool, samples: &[i16]) {
    if let Ok(mut mixer) = mixer.lock() {
        if secondary {
            mixer.push_secondary(samples);
        } else {
            mixer.push_primary(samples);
        }
    }
}

fn try_preferred_stream(
    device: &cpal::Device,
    mixer: &Arc<Mutex<FrameMixer>>,
    secondary: bool,
    counter: &Arc<AtomicU64>,
) -> Option<cpal::Stream> {
    let config = cpal::StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };
    let err_callback = |err| {
        tracing::warn!(error = %err, "Capture stream error");
    };

    let m = Arc::clone(mixer);
    let c = Arc::clone(counter);
    if let Ok(stream) = device.build_input_stream(
        &config,
        move |data: &[i16], _: &cpal::InputCallbackInfo| {
            c.fetch_add(1, Ordering::Relaxed);
            push_samples(&m, secondary, data);
        },
        err_callback,
        None,
    ) {
        return Some(stream);
    }

    let m = Arc::clone(mixer);
    let c = Arc::clone(counter);
    device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                c.fetch_add(1, Ordering::Relaxed);
                push_samples(&m, secondary, &f32_to_i16(data));
            },
            err_callback,
            None,
        )
        .ok()
}

/// Native-format stream with software conversion to 16 kHz mono i16.
fn build_native_stream(
    device: &cpal::Device,
    mixer: Arc<Mutex<FrameMixer>>,
    secondary: bool,
) -> Result<cpal::Stream> {
    use cpal::SampleFormat;

    let default_config = device
        .default_input_config()
        .map_err(|e| StreamscribeError::Capture {
            message: format!("failed to query default input config: {e}"),
        })?;
    let native_rate = default_config.sample_rate().0;
    let native_channels = default_config.channels() as usize;
    let stream_config: cpal::StreamConfig = default_config.clone().into();

    tracing::info!(
        channels = native_channels,
        rate = native_rate,
        format = ?default_config.sample_format(),
        "Capturing at native format with software conversion"
    );

    let err_callback = |err| {
        tracing::warn!(error = %err, "Capture stream error");
    };

    match default_config.sample_format() {
        SampleFormat::I16 => device
            .build_input_stream(
                &stream_config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    let converted = normalize(data, native_channels, native_rate);
                    push_samples(&mixer, secondary, &converted);
                },
                err_callback,
                None,
            )
            .map_err(|e| capture_error(format!("failed to build native i16 stream: {e}"))),
        SampleFormat::F32 => device
            .build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let converted = normalize(&f32_to_i16(data), native_channels, native_rate);
                    push_samples(&mixer, secondary, &converted);
                },
                err_callback,
                None,
            )
            .map_err(|e| capture_error(format!("failed to build native f32 stream: {e}"))),
        other => Err(StreamscribeError::Unsupported {
            message: format!("unsupported native sample format {other:?}"),
        }),
    }
}

fn f32_to_i16(data: &[f32]) -> Vec<i16> {
    data.iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16)
        .collect()
}

/// Mix down to mono and resample to the target rate.
fn normalize(samples: &[i16], channels: usize, source_rate: u32) -> Vec<i16> {
    let mono: Vec<i16> = if channels <= 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|group| {
                let sum: i32 = group.iter().map(|&s| i32::from(s)).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    };
    resample(&mono, source_rate, SAMPLE_RATE)
}

/// Linear-interpolation resampler. Identity when rates match.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = (samples.len() as f64 / ratio).floor() as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = pos - idx as f64;
            let a = f64::from(samples[idx]);
            let b = f64::from(samples.get(idx + 1).copied().unwrap_or(samples[idx]));
            (a + (b - a) * frac) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_unusable_device_names() {
        assert!(is_filtered("surround51"));
        assert!(is_filtered("front:CARD=PCH"));
        assert!(is_filtered("HDMI Output"));
        assert!(is_filtered("Digital Output S/PDIF"));
        assert!(!is_filtered("pipewire"));
        assert!(!is_filtered("Built-in Audio"));
    }

    #[test]
    fn recognizes_preferred_and_monitor_devices() {
        assert!(is_preferred("PipeWire"));
        assert!(is_preferred("PulseAudio"));
        assert!(!is_preferred("hw:0,0"));

        assert!(is_monitor("Monitor of Built-in Audio"));
        assert!(is_monitor("loopback-0"));
        assert!(!is_monitor("Built-in Audio"));
    }

    #[test]
    fn resolve_rejects_unknown_device() {
        let available = vec!["pipewire".to_string()];
        let selection = SourceSelection {
            device: Some("usb-mic".into()),
            capture_system_audio: false,
        };
        match resolve_sources(&available, &selection) {
            Err(StreamscribeError::DeviceUnavailable { device }) => {
                assert_eq!(device, "usb-mic");
            }
            other => panic!("expected DeviceUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn resolve_finds_monitor_for_system_audio() {
        let available = vec![
            "pipewire".to_string(),
            "Monitor of Built-in Audio".to_string(),
        ];
        let selection = SourceSelection {
            device: None,
            capture_system_audio: true,
        };
        let resolved = resolve_sources(&available, &selection).unwrap();
        assert_eq!(resolved.monitor.as_deref(), Some("Monitor of Built-in Audio"));
        assert!(resolved.warnings.is_empty());
    }

    #[test]
    fn resolve_degrades_to_mic_only_without_monitor() {
        let available = vec!["pipewire".to_string()];
        let selection = SourceSelection {
            device: None,
            capture_system_audio: true,
        };
        let resolved = resolve_sources(&available, &selection).unwrap();
        assert_eq!(resolved.monitor, None);
        assert_eq!(resolved.warnings.len(), 1);
        assert!(resolved.warnings[0].contains("microphone only"));
    }

    #[test]
    fn monitor_open_failure_degrades_to_mic_only() {
        let mut warnings = Vec::new();
        let opened: Result<()> = Err(StreamscribeError::Capture {
            message: "device busy".into(),
        });
        assert!(monitor_stream_or_warning("Monitor of Built-in Audio", opened, &mut warnings)
            .is_none());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("microphone only"));
        assert!(warnings[0].contains("device busy"));
    }

    #[test]
    fn monitor_open_success_carries_no_warning() {
        let mut warnings = Vec::new();
        let opened: Result<u8> = Ok(7);
        assert_eq!(
            monitor_stream_or_warning("Monitor of Built-in Audio", opened, &mut warnings),
            Some(7)
        );
        assert!(warnings.is_empty());
    }

    #[test]
    fn capture_error_detects_permission_failures() {
        assert!(matches!(
            capture_error("Operation not permitted: permission denied".into()),
            StreamscribeError::PermissionDenied { .. }
        ));
        assert!(matches!(
            capture_error("device busy".into()),
            StreamscribeError::Capture { .. }
        ));
    }

    #[test]
    fn f32_conversion_clamps_and_scales() {
        let out = f32_to_i16(&[0.0, 1.0, -1.0, 2.0, 0.5]);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], i16::MAX);
        assert_eq!(out[3], i16::MAX, "out-of-range input clamps");
        assert!((out[4] - i16::MAX / 2).abs() <= 1);
    }

    #[test]
    fn normalize_mixes_stereo_to_mono() {
        let stereo = [100, 200, -100, -200, 50, 150];
        let mono = normalize(&stereo, 2, SAMPLE_RATE);
        assert_eq!(mono, vec![150, -150, 100]);
    }

    #[test]
    fn resample_identity_at_equal_rates() {
        let samples = [1, 2, 3, 4];
        assert_eq!(resample(&samples, 16_000, 16_000), samples.to_vec());
    }

    #[test]
    fn resample_halves_sample_count() {
        let samples: Vec<i16> = (0..100).collect();
        let out = resample(&samples, 32_000, 16_000);
        assert_eq!(out.len(), 50);
        // Downsampled ramp stays a ramp.
        assert!(out.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn resample_upsamples_by_interpolation() {
        let samples = [0i16, 100];
        let out = resample(&samples, 8_000, 16_000);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 50);
    }
}
