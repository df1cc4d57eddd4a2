//! The delivery loop.
//!
//! Orchestrates one streaming session:
//!
//! 1. Launches the encoder (with the single software fallback).
//! 2. Opens the tuned UDP socket.
//! 3. Starts the [`FrameSource`] capture thread.
//! 4. Moves frames from the queue into the encoder until the stop
//!    token is cancelled, reporting throughput every interval.
//! 5. Tears everything down in reverse order.
//!
//! Stopping is bounded even when a child process hangs: a watchdog
//! interrupts the encoder if the loop is still stuck in a write one
//! queue timeout plus one encoder exit wait after the stop request, and
//! a capture thread stuck in a grab is detached.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{RecvTimeoutError, Sender};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::FrameGrabber;
use crate::encoder::{
    Codec, DEFAULT_HARDWARE_CODEC, DEFAULT_SOFTWARE_CODEC, EncoderBackend, EncoderSettings,
    ExitReport, Interrupter, launch_with_fallback,
};
use crate::error::CastError;
use crate::net::{DEFAULT_SEND_BUFFER, TunedSocket};
use crate::queue::{DEFAULT_QUEUE_CAPACITY, FrameQueue};
use crate::source::{CaptureSummary, FrameSource, SourceSettings};
use crate::state::PipelineState;
use crate::stats::{DEFAULT_STATS_INTERVAL, StatsCounters, StatsReporter, ThroughputReport};

/// Default blocking wait per queue read.
pub const DEFAULT_QUEUE_TIMEOUT: Duration = Duration::from_secs(1);
/// Default bounded wait for the encoder to exit after its input closes.
pub const DEFAULT_ENCODER_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

const WATCHDOG_POLL: Duration = Duration::from_millis(50);

// ── StreamSettings ───────────────────────────────────────────────

/// Session configuration, fixed for the lifetime of a [`Streamer`].
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate_kbps: u32,
    pub destination: SocketAddr,
    /// Try the hardware codec first.
    pub prefer_hardware: bool,
    pub hardware_codec: String,
    pub software_codec: String,
    /// Keyframe interval in frames; `None` means one per second.
    pub gop: Option<u32>,
    /// Requested UDP send buffer in bytes.
    pub send_buffer: usize,
    pub queue_capacity: usize,
    pub queue_timeout: Duration,
    pub stats_interval: Duration,
    pub encoder_exit_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate_kbps: 5000,
            destination: SocketAddr::from(([127, 0, 0, 1], 10000)),
            prefer_hardware: true,
            hardware_codec: DEFAULT_HARDWARE_CODEC.into(),
            software_codec: DEFAULT_SOFTWARE_CODEC.into(),
            gop: None,
            send_buffer: DEFAULT_SEND_BUFFER,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_timeout: DEFAULT_QUEUE_TIMEOUT,
            stats_interval: DEFAULT_STATS_INTERVAL,
            encoder_exit_timeout: DEFAULT_ENCODER_EXIT_TIMEOUT,
        }
    }
}

impl StreamSettings {
    /// Reject geometry and rates the encoder cannot use.
    pub fn validate(&self) -> Result<(), CastError> {
        if self.width == 0 || self.height == 0 {
            return Err(CastError::InvalidConfig("resolution must be non-zero".into()));
        }
        // yuv420 chroma subsampling needs even dimensions.
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(CastError::InvalidConfig(format!(
                "resolution {}x{} must have even dimensions",
                self.width, self.height
            )));
        }
        if !(1..=240).contains(&self.fps) {
            return Err(CastError::InvalidConfig(format!(
                "frame rate {} outside 1..=240",
                self.fps
            )));
        }
        if self.bitrate_kbps == 0 {
            return Err(CastError::InvalidConfig("bitrate must be non-zero".into()));
        }
        if self.destination.port() == 0 {
            return Err(CastError::InvalidConfig("destination port must be non-zero".into()));
        }
        if self.gop == Some(0) {
            return Err(CastError::InvalidConfig("GOP length must be non-zero".into()));
        }
        Ok(())
    }

    pub fn gop(&self) -> u32 {
        self.gop.unwrap_or(self.fps)
    }

    /// Codec of the first launch attempt.
    pub fn initial_codec(&self) -> Codec {
        if self.prefer_hardware {
            Codec::Hardware(self.hardware_codec.clone())
        } else {
            Codec::Software(self.software_codec.clone())
        }
    }

    pub fn encoder_settings(&self) -> EncoderSettings {
        EncoderSettings {
            width: self.width,
            height: self.height,
            fps: self.fps,
            bitrate_kbps: self.bitrate_kbps,
            gop: self.gop(),
            codec: self.initial_codec(),
            destination: self.destination,
        }
    }

    pub fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            width: self.width,
            height: self.height,
            fps: self.fps,
        }
    }

    /// How long shutdown waits for the capture thread.
    pub fn capture_join_timeout(&self) -> Duration {
        self.source_settings().frame_interval() + self.queue_timeout
    }

    /// How long after a stop request a blocked encoder write is tolerated.
    pub fn write_stall_grace(&self) -> Duration {
        self.queue_timeout + self.encoder_exit_timeout
    }
}

// ── SessionSummary ───────────────────────────────────────────────

/// What a finished session did.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub codec: Codec,
    pub capture_backend: &'static str,
    pub report: ThroughputReport,
    pub capture: CaptureSummary,
    /// `None` if stopping the encoder itself failed.
    pub encoder_exit: Option<ExitReport>,
}

// ── Streamer ─────────────────────────────────────────────────────

/// One capture → encoder session.
pub struct Streamer<E: EncoderBackend> {
    settings: StreamSettings,
    encoder: E,
    state: PipelineState,
    counters: Arc<StatsCounters>,
    queue: FrameQueue,
}

impl<E: EncoderBackend> Streamer<E> {
    pub fn new(settings: StreamSettings, encoder: E) -> Self {
        let queue = FrameQueue::new(settings.queue_capacity);
        Self {
            settings,
            encoder,
            state: PipelineState::default(),
            counters: Arc::new(StatsCounters::new()),
            queue,
        }
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    /// Run the session until `stop` is cancelled.
    ///
    /// `open_capture` runs on the capture thread. `on_report` is called
    /// on this thread once per stats interval. Returns an error only
    /// if startup fails; the state is `Stopped` either way on return.
    pub fn run<O, G, R>(
        &mut self,
        open_capture: O,
        stop: CancellationToken,
        mut on_report: R,
    ) -> Result<SessionSummary, CastError>
    where
        O: FnOnce() -> Result<G, CastError> + Send + 'static,
        G: FrameGrabber + 'static,
        R: FnMut(&ThroughputReport),
    {
        self.settings.validate()?;
        self.state.start()?;

        // ── Startup ──────────────────────────────────────────────
        let (mut handle, codec) = match launch_with_fallback(
            &mut self.encoder,
            &self.settings.encoder_settings(),
            &self.settings.software_codec,
        ) {
            Ok(launched) => launched,
            Err(e) => {
                self.state.force_stop();
                return Err(e);
            }
        };

        let socket = match TunedSocket::open(self.settings.destination, self.settings.send_buffer) {
            Ok(s) => s,
            Err(e) => {
                self.shutdown_encoder(handle);
                self.state.force_stop();
                return Err(e);
            }
        };

        let capture_stop = stop.child_token();
        let source = match FrameSource::spawn(
            open_capture,
            self.queue.clone(),
            self.settings.source_settings(),
            capture_stop.clone(),
        ) {
            Ok(s) => s,
            Err(e) => {
                self.shutdown_encoder(handle);
                self.state.force_stop();
                return Err(e);
            }
        };
        let capture_backend = source.backend();
        let watchdog = match self.encoder.interrupter(&handle) {
            Some(interrupt) => {
                StopWatchdog::spawn(stop.clone(), self.settings.write_stall_grace(), interrupt)
                    .map_err(|e| warn!("stop watchdog unavailable: {e}"))
                    .ok()
            }
            None => None,
        };

        info!(
            "streaming {}x{} @ {} fps, {} kbps, {} → rtp://{} (capture: {capture_backend})",
            self.settings.width,
            self.settings.height,
            self.settings.fps,
            self.settings.bitrate_kbps,
            codec,
            self.settings.destination
        );

        // ── Delivery ─────────────────────────────────────────────
        let mut reporter = StatsReporter::new(Instant::now(), self.settings.stats_interval);

        while !stop.is_cancelled() {
            if let Some(frame) = self.queue.pop_timeout(self.settings.queue_timeout) {
                match self.encoder.write(&mut handle, &frame) {
                    Ok(written) => self.counters.record_frame(written),
                    Err(e) => {
                        self.counters.record_write_failure();
                        let failures = self.counters.write_failures();
                        if failures == 1 || failures % 100 == 0 {
                            warn!("frame {} dropped: {e} ({failures} write failures)", frame.sequence());
                        }
                    }
                }
            }

            self.counters
                .observe_encoded_total(self.encoder.encoded_bytes(&handle));
            if let Some(report) =
                reporter.poll(Instant::now(), &self.counters, self.queue.dropped())
            {
                info!(
                    "{report} | raw {:.2} Mbps | dropped {} | write failures {}",
                    report.raw_mbps, report.dropped, report.write_failures
                );
                on_report(&report);
            }
        }

        // ── Shutdown ─────────────────────────────────────────────
        if let Some(watchdog) = watchdog {
            watchdog.disarm();
        }
        self.state.begin_stop()?;
        info!("stopping: halting capture");
        capture_stop.cancel();
        let capture = source.join(self.settings.capture_join_timeout());
        while self.queue.try_pop().is_some() {}

        self.counters
            .observe_encoded_total(self.encoder.encoded_bytes(&handle));
        let encoder_exit = self.shutdown_encoder(handle);
        drop(socket);

        let report =
            self.counters
                .report_at(reporter.started(), Instant::now(), self.queue.dropped());
        self.state.finish_stop()?;
        info!("stopped after {:.1}s, {} frames", report.elapsed.as_secs_f64(), report.frames);

        Ok(SessionSummary {
            codec,
            capture_backend,
            report,
            capture,
            encoder_exit,
        })
    }

    /// Stop the encoder; a failure here is logged, never escalated.
    fn shutdown_encoder(&mut self, handle: E::Handle) -> Option<ExitReport> {
        match self
            .encoder
            .stop(handle, self.settings.encoder_exit_timeout)
        {
            Ok(report) => {
                info!("encoder stopped: {report:?}");
                Some(report)
            }
            Err(e) => {
                warn!("encoder shutdown failed: {e}");
                None
            }
        }
    }
}

// ── StopWatchdog ─────────────────────────────────────────────────

/// Interrupts the encoder if the delivery loop is still running `grace`
/// after the stop token was cancelled.
struct StopWatchdog {
    disarm: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StopWatchdog {
    fn spawn(
        stop: CancellationToken,
        grace: Duration,
        interrupt: Interrupter,
    ) -> Result<Self, CastError> {
        let (disarm, disarmed) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::Builder::new()
            .name("deskcast-stop-watchdog".into())
            .spawn(move || {
                loop {
                    match disarmed.recv_timeout(WATCHDOG_POLL) {
                        Err(RecvTimeoutError::Timeout) if stop.is_cancelled() => break,
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => return,
                    }
                }
                if let Err(RecvTimeoutError::Timeout) = disarmed.recv_timeout(grace) {
                    warn!("delivery loop still blocked {grace:?} after stop; interrupting encoder");
                    interrupt();
                }
            })?;
        Ok(Self {
            disarm: Some(disarm),
            handle: Some(handle),
        })
    }

    /// Stand down; the delivery loop has exited.
    fn disarm(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        drop(self.disarm.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StopWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_are_valid() {
        let s = StreamSettings::default();
        assert_eq!((s.width, s.height, s.fps, s.bitrate_kbps), (1920, 1080, 30, 5000));
        assert_eq!(s.destination.to_string(), "127.0.0.1:10000");
        assert!(s.prefer_hardware);
        assert_eq!(s.queue_capacity, 3);
        assert_eq!(s.gop(), 30);
        s.validate().unwrap();
    }

    #[test]
    fn gop_override() {
        let s = StreamSettings {
            gop: Some(60),
            ..StreamSettings::default()
        };
        assert_eq!(s.encoder_settings().gop, 60);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let odd = StreamSettings {
            width: 641,
            ..StreamSettings::default()
        };
        assert!(matches!(odd.validate(), Err(CastError::InvalidConfig(_))));

        let no_fps = StreamSettings {
            fps: 0,
            ..StreamSettings::default()
        };
        assert!(no_fps.validate().is_err());

        let no_port = StreamSettings {
            destination: "127.0.0.1:0".parse().unwrap(),
            ..StreamSettings::default()
        };
        assert!(no_port.validate().is_err());
    }

    #[test]
    fn shutdown_bounds_follow_timeouts() {
        let s = StreamSettings {
            fps: 10,
            queue_timeout: Duration::from_millis(300),
            encoder_exit_timeout: Duration::from_secs(2),
            ..StreamSettings::default()
        };
        assert_eq!(s.capture_join_timeout(), Duration::from_millis(400));
        assert_eq!(s.write_stall_grace(), Duration::from_millis(2300));
    }

    #[test]
    fn watchdog_fires_only_after_stop_and_grace() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let stop = CancellationToken::new();
        let watchdog = StopWatchdog::spawn(
            stop.clone(),
            Duration::from_millis(100),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        assert!(!fired.load(Ordering::SeqCst));
        stop.cancel();
        std::thread::sleep(Duration::from_millis(400));
        assert!(fired.load(Ordering::SeqCst));
        watchdog.disarm();
    }

    #[test]
    fn disarmed_watchdog_never_fires() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let stop = CancellationToken::new();
        let watchdog = StopWatchdog::spawn(
            stop.clone(),
            Duration::from_millis(50),
            Box::new(move || flag.store(true, Ordering::SeqCst)),
        )
        .unwrap();
        stop.cancel();
        watchdog.disarm();
        std::thread::sleep(Duration::from_millis(150));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn forced_software_initial_codec() {
        let s = StreamSettings {
            prefer_hardware: false,
            ..StreamSettings::default()
        };
        assert_eq!(s.initial_codec(), Codec::Software("libx264".into()));
    }
}
