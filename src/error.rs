//! Error types for streamscribe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamscribeError {
    // Capture / device errors
    #[error("Audio device not found: {device}")]
    DeviceUnavailable { device: String },

    #[error("Audio capture permission denied: {message}")]
    PermissionDenied { message: String },

    #[error("Audio capture unsupported: {message}")]
    Unsupported { message: String },

    #[error("Audio capture failed: {message}")]
    Capture { message: String },

    // Transport errors
    #[error("Transport connect failed: {message}")]
    Connect { message: String },

    #[error("Transport send failed: {message}")]
    Send { message: String },

    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted { attempts: u32 },

    // Conditioning errors
    #[error("Noise suppression unit failed: {message}")]
    Denoiser { message: String },

    // Serialization
    #[error("Message encoding failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StreamscribeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_unavailable_display() {
        let err = StreamscribeError::DeviceUnavailable {
            device: "hw:0,0".to_string(),
        };
        assert_eq!(err.to_string(), "Audio device not found: hw:0,0");
    }

    #[test]
    fn reconnect_exhausted_display_names_attempts() {
        let err = StreamscribeError::ReconnectExhausted { attempts: 5 };
        assert!(err.to_string().contains("exhausted"));
        assert!(err.to_string().contains('5'));
    }

    #[test]
    fn serde_error_converts() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: StreamscribeError = parse_err.into();
        assert!(matches!(err, StreamscribeError::Serialization(_)));
    }
}
