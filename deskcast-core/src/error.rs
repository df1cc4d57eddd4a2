//! Error types for the capture and delivery pipeline.
//!
//! All fallible operations return `Result<T, CastError>`. Most of these
//! are recovered from inside the pipeline (a skipped capture tick, a
//! dropped frame); only startup failures reach the caller.

use std::time::Duration;
use thiserror::Error;

/// The canonical error type for deskcast.
#[derive(Debug, Error)]
pub enum CastError {
    // ── Capture Errors ───────────────────────────────────────────
    /// A single frame could not be acquired. The tick is skipped.
    #[error("capture failed: {0}")]
    Capture(String),

    /// No capture backend could be opened at startup.
    #[error("no capture backend available: {0}")]
    CaptureUnavailable(String),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// A frame buffer does not match its declared geometry.
    #[error("invalid frame: expected {expected} bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },

    // ── Encoder Errors ───────────────────────────────────────────
    /// The encoder process could not be started with `codec`.
    #[error("encoder launch failed ({codec}): {reason}")]
    EncoderLaunch { codec: String, reason: String },

    /// Writing a frame to the encoder's input failed.
    #[error("encoder write failed: {0}")]
    EncoderWrite(String),

    /// The encoder process is no longer running.
    #[error("encoder exited: {0}")]
    EncoderExited(String),

    // ── Configuration / Lifecycle ────────────────────────────────
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A pipeline state transition was requested from the wrong state.
    #[error("invalid state transition: {0}")]
    InvalidTransition(&'static str),

    /// The OS I/O layer reported an error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Catch-all for errors that do not fit another variant.
    #[error("{0}")]
    Other(String),
}

impl CastError {
    /// A capture error that only costs the current tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, CastError::Capture(_) | CastError::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_messages() {
        let e = CastError::EncoderLaunch {
            codec: "h264_nvenc".into(),
            reason: "exited with status 1".into(),
        };
        assert!(e.to_string().contains("h264_nvenc"));
        assert!(e.to_string().contains("status 1"));

        let e = CastError::InvalidFrame {
            expected: 921_600,
            actual: 10,
        };
        assert!(e.to_string().contains("921600"));
    }

    #[test]
    fn transient_kinds() {
        assert!(CastError::Capture("no frame".into()).is_transient());
        assert!(CastError::Timeout(Duration::from_millis(100)).is_transient());
        assert!(!CastError::CaptureUnavailable("none".into()).is_transient());
        assert!(!CastError::EncoderWrite("broken pipe".into()).is_transient());
    }

    #[test]
    fn from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe broke");
        let e: CastError = io_err.into();
        assert!(matches!(e, CastError::Io(_)));
    }
}
