//! Desktop frame acquisition.
//!
//! Capture strategy is decided once at startup by [`CaptureChoice::select`]:
//! the preferred full-desktop grab is tried first, and only if it cannot
//! be opened is the generic grab device used. The result is a tagged
//! variant; nothing is re-probed per frame.
//!
//! Desktop duplication only produces a frame when something on screen
//! changes. [`HoldLastFrame`] repeats the previous frame on idle ticks
//! so the encoder keeps receiving input at the configured rate.
//!
//! | Module    | Purpose                                              |
//! |-----------|------------------------------------------------------|
//! | `dxgi`    | DXGI Desktop Duplication grab (Windows, preferred)   |
//! | `device`  | ffmpeg grab-device fallback (any platform)           |
//! | `convert` | BGR24 repacking and scaling to the output size       |

pub mod convert;
pub mod device;
pub mod dxgi;

use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::CastError;
use crate::types::RawScreenFrame;

pub use convert::prepare_frame;
pub use device::{DeviceCapturer, DeviceSettings};
pub use dxgi::DxgiCapturer;

/// One frame per call from some desktop source.
pub trait FrameGrabber {
    /// Short backend name for logs and the startup banner.
    fn name(&self) -> &'static str;

    /// Acquire the next frame.
    ///
    /// `Timeout` and `Capture` errors mean "nothing this tick".
    fn grab(&mut self) -> Result<RawScreenFrame, CastError>;
}

impl<G: FrameGrabber + ?Sized> FrameGrabber for Box<G> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn grab(&mut self) -> Result<RawScreenFrame, CastError> {
        (**self).grab()
    }
}

// ── CaptureChoice ────────────────────────────────────────────────

/// The capture path chosen at startup.
pub enum CaptureChoice<P, F> {
    Preferred(P),
    Fallback(F),
}

impl<P: FrameGrabber, F: FrameGrabber> CaptureChoice<P, F> {
    /// Open the preferred backend, or the fallback if that fails.
    ///
    /// Each opener runs at most once. Fails only when both do.
    pub fn select(
        open_preferred: impl FnOnce() -> Result<P, CastError>,
        open_fallback: impl FnOnce() -> Result<F, CastError>,
    ) -> Result<Self, CastError> {
        match open_preferred() {
            Ok(p) => {
                info!("capture backend: {}", p.name());
                Ok(Self::Preferred(p))
            }
            Err(preferred_err) => {
                warn!("preferred capture unavailable ({preferred_err}); using fallback device");
                let f = open_fallback().map_err(|e| {
                    CastError::CaptureUnavailable(format!(
                        "preferred: {preferred_err}; fallback: {e}"
                    ))
                })?;
                info!("capture backend: {}", f.name());
                Ok(Self::Fallback(f))
            }
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback(_))
    }
}

impl<P: FrameGrabber, F: FrameGrabber> FrameGrabber for CaptureChoice<P, F> {
    fn name(&self) -> &'static str {
        match self {
            Self::Preferred(p) => p.name(),
            Self::Fallback(f) => f.name(),
        }
    }

    fn grab(&mut self) -> Result<RawScreenFrame, CastError> {
        match self {
            Self::Preferred(p) => p.grab(),
            Self::Fallback(f) => f.grab(),
        }
    }
}

// ── HoldLastFrame ────────────────────────────────────────────────

/// Repeats the most recent frame when the inner grabber has nothing new.
///
/// Only transient errors (`Timeout`, `Capture`) are covered, and only
/// once a first frame exists.
pub struct HoldLastFrame<G> {
    inner: G,
    last: Option<RawScreenFrame>,
}

impl<G: FrameGrabber> HoldLastFrame<G> {
    pub fn new(inner: G) -> Self {
        Self { inner, last: None }
    }
}

impl<G: FrameGrabber> FrameGrabber for HoldLastFrame<G> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn grab(&mut self) -> Result<RawScreenFrame, CastError> {
        match self.inner.grab() {
            Ok(raw) => {
                self.last = Some(raw.clone());
                Ok(raw)
            }
            Err(e) if e.is_transient() => match &self.last {
                Some(last) => {
                    if !matches!(e, CastError::Timeout(_)) {
                        debug!("repeating last frame: {e}");
                    }
                    Ok(last.clone())
                }
                None => Err(e),
            },
            Err(e) => Err(e),
        }
    }
}

/// Capture path used by the CLI.
pub type CaptureBackend = CaptureChoice<HoldLastFrame<DxgiCapturer>, DeviceCapturer>;

// ── CaptureSettings ──────────────────────────────────────────────

/// Inputs needed to open either capture backend.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    /// Monitor index for the desktop-duplication path (0 = primary).
    pub monitor_index: u32,
    /// Upper bound for a single desktop-duplication acquire.
    pub acquire_timeout_ms: u32,
    /// ffmpeg binary for the fallback grab device.
    pub device_program: PathBuf,
    /// Grab device input override.
    pub device_input: Option<String>,
    /// Output width.
    pub width: u32,
    /// Output height.
    pub height: u32,
    /// Target capture rate.
    pub fps: u32,
}

impl CaptureSettings {
    /// Acquire timeout actually used: the configured bound, capped at
    /// half a capture tick so an idle desktop does not stall the loop.
    pub fn effective_acquire_timeout_ms(&self) -> u32 {
        let half_tick = Duration::from_secs_f64(0.5 / self.fps.max(1) as f64);
        let cap = u32::try_from(half_tick.as_millis()).unwrap_or(u32::MAX);
        self.acquire_timeout_ms.min(cap).max(1)
    }

    /// Select and open the capture backend for this machine.
    pub fn open(&self) -> Result<CaptureBackend, CastError> {
        CaptureChoice::select(
            || {
                DxgiCapturer::open(self.monitor_index, self.effective_acquire_timeout_ms())
                    .map(HoldLastFrame::new)
            },
            || {
                DeviceCapturer::open(&DeviceSettings {
                    program: self.device_program.clone(),
                    input: self.device_input.clone(),
                    width: self.width,
                    height: self.height,
                    fps: self.fps,
                })
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::types::PixelFormat;

    struct Solid(&'static str);

    /// Yields the scripted results in order, then times out forever.
    struct Scripted(Vec<Result<RawScreenFrame, CastError>>);

    impl FrameGrabber for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn grab(&mut self) -> Result<RawScreenFrame, CastError> {
            if self.0.is_empty() {
                return Err(CastError::Timeout(Duration::from_millis(16)));
            }
            self.0.remove(0)
        }
    }

    fn shade(v: u8) -> RawScreenFrame {
        RawScreenFrame::packed(1, 1, PixelFormat::Bgr8, vec![v; 3])
    }

    impl FrameGrabber for Solid {
        fn name(&self) -> &'static str {
            self.0
        }

        fn grab(&mut self) -> Result<RawScreenFrame, CastError> {
            Ok(RawScreenFrame::packed(1, 1, PixelFormat::Bgr8, vec![0; 3]))
        }
    }

    #[test]
    fn preferred_wins_when_available() {
        let fallback_opened = Cell::new(false);
        let choice = CaptureChoice::select(
            || Ok(Solid("preferred")),
            || {
                fallback_opened.set(true);
                Ok(Solid("fallback"))
            },
        )
        .unwrap();
        assert!(!choice.is_fallback());
        assert_eq!(choice.name(), "preferred");
        assert!(!fallback_opened.get());
    }

    #[test]
    fn falls_back_once() {
        let attempts = Cell::new(0);
        let mut choice: CaptureChoice<Solid, Solid> = CaptureChoice::select(
            || {
                attempts.set(attempts.get() + 1);
                Err(CastError::CaptureUnavailable("no dxgi".into()))
            },
            || Ok(Solid("fallback")),
        )
        .unwrap();
        assert!(choice.is_fallback());
        // Grabbing never re-probes the preferred path.
        for _ in 0..5 {
            choice.grab().unwrap();
        }
        assert_eq!(attempts.get(), 1);
    }

    #[test]
    fn both_failing_is_fatal() {
        let result: Result<CaptureChoice<Solid, Solid>, _> = CaptureChoice::select(
            || Err(CastError::CaptureUnavailable("no dxgi".into())),
            || Err(CastError::CaptureUnavailable("no ffmpeg".into())),
        );
        let msg = result.err().unwrap().to_string();
        assert!(msg.contains("no dxgi"));
        assert!(msg.contains("no ffmpeg"));
    }

    #[test]
    fn idle_desktop_repeats_last_frame() {
        let mut grabber = HoldLastFrame::new(Scripted(vec![Ok(shade(7))]));
        assert_eq!(grabber.grab().unwrap().data, vec![7; 3]);
        for _ in 0..3 {
            assert_eq!(grabber.grab().unwrap().data, vec![7; 3]);
        }
    }

    #[test]
    fn newer_frame_replaces_held_one() {
        let mut grabber = HoldLastFrame::new(Scripted(vec![
            Ok(shade(1)),
            Err(CastError::Capture("access lost".into())),
            Ok(shade(2)),
        ]));
        assert_eq!(grabber.grab().unwrap().data, vec![1; 3]);
        assert_eq!(grabber.grab().unwrap().data, vec![1; 3]);
        assert_eq!(grabber.grab().unwrap().data, vec![2; 3]);
        assert_eq!(grabber.grab().unwrap().data, vec![2; 3]);
    }

    #[test]
    fn nothing_held_before_first_frame() {
        let mut grabber = HoldLastFrame::new(Scripted(Vec::new()));
        assert!(matches!(grabber.grab(), Err(CastError::Timeout(_))));
    }

    #[test]
    fn fatal_errors_are_not_masked() {
        let mut grabber = HoldLastFrame::new(Scripted(vec![
            Ok(shade(1)),
            Err(CastError::CaptureUnavailable("device gone".into())),
        ]));
        grabber.grab().unwrap();
        assert!(matches!(grabber.grab(), Err(CastError::CaptureUnavailable(_))));
    }

    #[test]
    fn acquire_timeout_fits_inside_a_tick() {
        let mut settings = CaptureSettings {
            monitor_index: 0,
            acquire_timeout_ms: 100,
            device_program: PathBuf::from("ffmpeg"),
            device_input: None,
            width: 640,
            height: 480,
            fps: 30,
        };
        assert_eq!(settings.effective_acquire_timeout_ms(), 16);
        settings.fps = 1;
        assert_eq!(settings.effective_acquire_timeout_ms(), 100);
        settings.fps = 240;
        assert_eq!(settings.effective_acquire_timeout_ms(), 2);
    }
}
