//! # deskcast-core
//!
//! Desktop capture pipeline that feeds raw frames to an external encoder
//! process, which streams RTP over UDP on its own.
//!
//! ```text
//! capture thread                         delivery loop (caller's thread)
//! ┌────────────────────┐                ┌──────────────────────────────┐
//! │ CaptureBackend     │                │ pop (1 s timeout)            │
//! │   ↓ grab           │   FrameQueue   │   ↓                          │
//! │ convert + resize   │ ─────────────► │ EncoderBackend::write        │
//! │   ↓ push           │  cap 3, drops  │   ↓                          │
//! │ pace to 1/fps      │  when full     │ StatsReporter (every 5 s)    │
//! └────────────────────┘                └──────────────────────────────┘
//!                                                    │ stdin (bgr24)
//!                                                    ▼
//!                                        ffmpeg ──RTP/UDP──► destination
//! ```
//!
//! This crate contains:
//! - **Capture**: `FrameGrabber`, DXGI preferred path, ffmpeg grab-device fallback
//! - **Queue**: `FrameQueue`, bounded, drop-when-full
//! - **Encoder**: `EncoderBackend`, `FfmpegEncoder`, single software fallback
//! - **Pipeline**: `Streamer`, the `Stopped → Running → Stopping → Stopped` loop
//! - **Stats**: monotonic counters and periodic throughput reports
//! - **Error**: `CastError`, typed, `thiserror`-based

pub mod capture;
pub mod encoder;
pub mod error;
pub mod net;
pub mod pipeline;
pub mod queue;
pub mod source;
pub mod state;
pub mod stats;
pub mod types;

// ── Re-exports ───────────────────────────────────────────────────

pub use capture::{CaptureBackend, CaptureChoice, CaptureSettings, FrameGrabber, HoldLastFrame};
pub use encoder::{
    Codec, EncoderBackend, EncoderSettings, ExitReport, FfmpegEncoder, Interrupter,
};
pub use error::CastError;
pub use pipeline::{SessionSummary, StreamSettings, Streamer};
pub use queue::{FrameQueue, PushOutcome};
pub use source::{FrameSource, SourceSettings};
pub use state::PipelineState;
pub use stats::{StatsCounters, StatsReporter, ThroughputReport};
pub use types::{Frame, PixelFormat, RawScreenFrame};

pub use tokio_util::sync::CancellationToken;
