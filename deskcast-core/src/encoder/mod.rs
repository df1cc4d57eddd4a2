//! External encoder process.
//!
//! The encoder is an opaque capability: it accepts raw BGR24 frames in
//! order on a byte stream and emits an RTP stream on its own. The
//! pipeline only sees [`EncoderBackend`], so tests can substitute an
//! in-memory recorder for the real ffmpeg process.

pub mod ffmpeg;

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::CastError;
use crate::types::Frame;

pub use ffmpeg::{FfmpegEncoder, FfmpegSession};

/// Hardware codec tried first unless software is forced.
pub const DEFAULT_HARDWARE_CODEC: &str = "h264_nvenc";
/// Codec used when hardware is forced off or fails to launch.
pub const DEFAULT_SOFTWARE_CODEC: &str = "libx264";

// ── Codec ────────────────────────────────────────────────────────

/// Encoding path for one launch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Codec {
    Hardware(String),
    Software(String),
}

impl Codec {
    /// ffmpeg codec name.
    pub fn name(&self) -> &str {
        match self {
            Codec::Hardware(name) | Codec::Software(name) => name,
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, Codec::Hardware(_))
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Codec::Hardware(name) => write!(f, "{name} (hardware)"),
            Codec::Software(name) => write!(f, "{name} (software)"),
        }
    }
}

// ── EncoderSettings ──────────────────────────────────────────────

/// Fixed parameter set for one encoder launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    /// Keyframe interval in frames.
    pub gop: u32,
    pub codec: Codec,
    pub destination: SocketAddr,
}

impl EncoderSettings {
    /// The same parameters with a different codec.
    pub fn with_codec(&self, codec: Codec) -> Self {
        Self {
            codec,
            ..self.clone()
        }
    }

    /// Size of one input frame in bytes.
    pub fn frame_bytes(&self) -> usize {
        Frame::byte_len_for(self.width, self.height)
    }
}

// ── EncoderBackend ───────────────────────────────────────────────

/// How the encoder process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReport {
    /// Exited on its own after its input was closed.
    Exited { success: bool, code: Option<i32> },
    /// Did not exit within the bounded wait and was killed.
    Killed,
}

/// Breaks a write that is blocked on a hung encoder, typically by
/// killing the process.
pub type Interrupter = Box<dyn FnOnce() + Send>;

/// start / write / stop over some encoder implementation.
pub trait EncoderBackend {
    type Handle;

    /// Launch the encoder with `settings`.
    fn start(&mut self, settings: &EncoderSettings) -> Result<Self::Handle, CastError>;

    /// Write one frame. Returns the number of bytes written.
    fn write(&mut self, handle: &mut Self::Handle, frame: &Frame) -> Result<usize, CastError>;

    /// Close the input and wait up to `timeout` for the process to end.
    fn stop(&mut self, handle: Self::Handle, timeout: Duration) -> Result<ExitReport, CastError>;

    /// Encoded bytes emitted so far, if the backend can tell.
    fn encoded_bytes(&self, _handle: &Self::Handle) -> u64 {
        0
    }

    /// A way to unblock `write` from another thread, if the backend has one.
    fn interrupter(&self, _handle: &Self::Handle) -> Option<Interrupter> {
        None
    }
}

/// Launch the encoder, substituting the software codec once if the
/// hardware launch fails.
///
/// At most two attempts are made: hardware then software. With a
/// software codec in `settings` there is exactly one attempt.
pub fn launch_with_fallback<E: EncoderBackend>(
    backend: &mut E,
    settings: &EncoderSettings,
    software_codec: &str,
) -> Result<(E::Handle, Codec), CastError> {
    match backend.start(settings) {
        Ok(handle) => {
            info!("encoder started ({})", settings.codec);
            Ok((handle, settings.codec.clone()))
        }
        Err(e) if settings.codec.is_hardware() => {
            warn!("encoder launch failed: {e}; retrying with software encoding");
            let fallback = settings.with_codec(Codec::Software(software_codec.to_string()));
            let handle = backend.start(&fallback)?;
            info!("encoder started ({})", fallback.codec);
            Ok((handle, fallback.codec))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Backend that fails for the codecs listed in `broken`.
    struct Scripted {
        broken: Vec<&'static str>,
        attempts: Vec<String>,
    }

    impl EncoderBackend for Scripted {
        type Handle = String;

        fn start(&mut self, settings: &EncoderSettings) -> Result<String, CastError> {
            let name = settings.codec.name().to_string();
            self.attempts.push(name.clone());
            if self.broken.contains(&name.as_str()) {
                return Err(CastError::EncoderLaunch {
                    codec: name,
                    reason: "unavailable".into(),
                });
            }
            Ok(name)
        }

        fn write(&mut self, _: &mut String, frame: &Frame) -> Result<usize, CastError> {
            Ok(frame.byte_len())
        }

        fn stop(&mut self, _: String, _: Duration) -> Result<ExitReport, CastError> {
            Ok(ExitReport::Exited {
                success: true,
                code: Some(0),
            })
        }
    }

    fn settings(codec: Codec) -> EncoderSettings {
        EncoderSettings {
            width: 640,
            height: 480,
            fps: 30,
            bitrate_kbps: 2000,
            gop: 30,
            codec,
            destination: "127.0.0.1:10000".parse().unwrap(),
        }
    }

    #[test]
    fn hardware_success_uses_one_attempt() {
        let mut b = Scripted {
            broken: vec![],
            attempts: vec![],
        };
        let (_, codec) =
            launch_with_fallback(&mut b, &settings(Codec::Hardware("h264_nvenc".into())), "libx264")
                .unwrap();
        assert_eq!(codec, Codec::Hardware("h264_nvenc".into()));
        assert_eq!(b.attempts, vec!["h264_nvenc"]);
    }

    #[test]
    fn hardware_failure_falls_back_once() {
        let mut b = Scripted {
            broken: vec!["h264_nvenc"],
            attempts: vec![],
        };
        let (_, codec) =
            launch_with_fallback(&mut b, &settings(Codec::Hardware("h264_nvenc".into())), "libx264")
                .unwrap();
        assert_eq!(codec, Codec::Software("libx264".into()));
        assert_eq!(b.attempts, vec!["h264_nvenc", "libx264"]);
    }

    #[test]
    fn both_failing_is_fatal_after_two_attempts() {
        let mut b = Scripted {
            broken: vec!["h264_nvenc", "libx264"],
            attempts: vec![],
        };
        let err =
            launch_with_fallback(&mut b, &settings(Codec::Hardware("h264_nvenc".into())), "libx264")
                .unwrap_err();
        assert!(matches!(err, CastError::EncoderLaunch { ref codec, .. } if codec == "libx264"));
        assert_eq!(b.attempts.len(), 2);
        assert_eq!(b.attempts.iter().filter(|c| *c == "h264_nvenc").count(), 1);
    }

    #[test]
    fn forced_software_is_not_retried() {
        let mut b = Scripted {
            broken: vec!["libx264"],
            attempts: vec![],
        };
        assert!(
            launch_with_fallback(&mut b, &settings(Codec::Software("libx264".into())), "libx264")
                .is_err()
        );
        assert_eq!(b.attempts, vec!["libx264"]);
    }
}
