//! Capture thread feeding the frame queue.
//!
//! The grabber is opened on the capture thread itself (desktop
//! duplication handles cannot cross threads), and the outcome of that
//! open is reported back before [`FrameSource::spawn`] returns. After
//! that the thread grabs, scales and offers one frame per tick until the
//! stop token is cancelled.
//!
//! A grab can block inside the backend (a stalled grab-device process),
//! so joining is bounded: past the deadline the thread is detached and
//! left to exit on its own.

use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::{FrameGrabber, prepare_frame};
use crate::error::CastError;
use crate::queue::{FrameQueue, PushOutcome};

/// Output geometry and rate of the capture loop.
#[derive(Debug, Clone, Copy)]
pub struct SourceSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SourceSettings {
    /// Wall-clock time per capture tick.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}

/// What happened on one capture tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Queued,
    /// The queue was full and the frame was discarded.
    Dropped,
    /// Nothing was acquired this tick.
    Skipped,
}

/// Grab one frame, normalise it and offer it to the queue.
///
/// Acquisition and conversion failures are not fatal; they turn into
/// [`TickOutcome::Skipped`].
pub fn capture_tick<G: FrameGrabber + ?Sized>(
    grabber: &mut G,
    queue: &FrameQueue,
    settings: &SourceSettings,
    sequence: u64,
) -> TickOutcome {
    let raw = match grabber.grab() {
        Ok(raw) => raw,
        Err(CastError::Timeout(_)) => return TickOutcome::Skipped,
        Err(e) => {
            debug!("capture tick {sequence} skipped: {e}");
            return TickOutcome::Skipped;
        }
    };

    let frame = match prepare_frame(&raw, settings.width, settings.height, sequence) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("capture tick {sequence} conversion failed: {e}");
            return TickOutcome::Skipped;
        }
    };

    match queue.push(frame) {
        PushOutcome::Queued => TickOutcome::Queued,
        PushOutcome::Dropped => TickOutcome::Dropped,
    }
}

/// Join bound used when a running source is dropped without `join`.
const DROP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Running capture thread.
pub struct FrameSource {
    handle: Option<JoinHandle<CaptureSummary>>,
    backend: &'static str,
}

/// Totals reported by the capture thread when it exits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub ticks: u64,
    pub queued: u64,
    pub dropped: u64,
    pub skipped: u64,
}

impl FrameSource {
    /// Start the capture thread.
    ///
    /// `open` runs on the new thread. If it fails, the thread exits and
    /// the error is returned here.
    pub fn spawn<O, G>(
        open: O,
        queue: FrameQueue,
        settings: SourceSettings,
        stop: CancellationToken,
    ) -> Result<Self, CastError>
    where
        O: FnOnce() -> Result<G, CastError> + Send + 'static,
        G: FrameGrabber + 'static,
    {
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);

        let handle = std::thread::Builder::new()
            .name("deskcast-capture".into())
            .spawn(move || {
                let mut grabber = match open() {
                    Ok(g) => {
                        let _ = ready_tx.send(Ok(g.name()));
                        g
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return CaptureSummary::default();
                    }
                };
                run_capture_loop(&mut grabber, &queue, &settings, &stop)
            })?;

        match ready_rx.recv() {
            Ok(Ok(backend)) => Ok(Self {
                handle: Some(handle),
                backend,
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CastError::CaptureUnavailable(
                    "capture thread exited during startup".into(),
                ))
            }
        }
    }

    /// Name of the backend the thread opened.
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Wait up to `timeout` for the thread to observe the stop token
    /// and exit.
    ///
    /// A thread still stuck in a grab after `timeout` is detached and
    /// an empty summary is returned.
    pub fn join(mut self, timeout: Duration) -> CaptureSummary {
        self.join_inner(timeout)
    }

    fn join_inner(&mut self, timeout: Duration) -> CaptureSummary {
        let Some(handle) = self.handle.take() else {
            return CaptureSummary::default();
        };

        let deadline = Instant::now() + timeout;
        while !handle.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                warn!("capture thread did not stop within {timeout:?}; detaching it");
                return CaptureSummary::default();
            }
            std::thread::sleep(JOIN_POLL.min(deadline - now));
        }

        handle.join().unwrap_or_else(|_| {
            warn!("capture thread panicked");
            CaptureSummary::default()
        })
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        if self.handle.is_some() {
            debug!("frame source dropped while running; joining");
            self.join_inner(DROP_JOIN_TIMEOUT);
        }
    }
}

fn run_capture_loop<G: FrameGrabber>(
    grabber: &mut G,
    queue: &FrameQueue,
    settings: &SourceSettings,
    stop: &CancellationToken,
) -> CaptureSummary {
    let interval = settings.frame_interval();
    let mut summary = CaptureSummary::default();
    let mut next_tick = Instant::now();

    info!(
        "capture loop started ({}, {}x{} @ {} fps)",
        grabber.name(),
        settings.width,
        settings.height,
        settings.fps
    );

    while !stop.is_cancelled() {
        match capture_tick(grabber, queue, settings, summary.ticks) {
            TickOutcome::Queued => summary.queued += 1,
            TickOutcome::Dropped => summary.dropped += 1,
            TickOutcome::Skipped => summary.skipped += 1,
        }
        summary.ticks += 1;

        // Fixed-rate pacing; if a tick overran, restart the schedule
        // rather than bursting to catch up.
        next_tick += interval;
        let now = Instant::now();
        if next_tick > now {
            std::thread::sleep(next_tick - now);
        } else {
            next_tick = now;
        }
    }

    info!(
        "capture loop stopped: {} ticks, {} queued, {} dropped, {} skipped",
        summary.ticks, summary.queued, summary.dropped, summary.skipped
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PixelFormat, RawScreenFrame};

    struct Flaky {
        calls: u64,
    }

    impl FrameGrabber for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn grab(&mut self) -> Result<RawScreenFrame, CastError> {
            self.calls += 1;
            if self.calls % 2 == 0 {
                return Err(CastError::Capture("no frame".into()));
            }
            Ok(RawScreenFrame::packed(4, 4, PixelFormat::Bgra8, vec![1; 64]))
        }
    }

    fn settings() -> SourceSettings {
        SourceSettings {
            width: 2,
            height: 2,
            fps: 100,
        }
    }

    #[test]
    fn failed_grab_is_skipped() {
        let queue = FrameQueue::default();
        let mut grabber = Flaky { calls: 0 };
        assert_eq!(capture_tick(&mut grabber, &queue, &settings(), 0), TickOutcome::Queued);
        assert_eq!(capture_tick(&mut grabber, &queue, &settings(), 1), TickOutcome::Skipped);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.try_pop().unwrap().byte_len(), 12);
    }

    #[test]
    fn full_queue_reports_drop() {
        let queue = FrameQueue::new(1);
        let mut grabber = Flaky { calls: 0 };
        assert_eq!(capture_tick(&mut grabber, &queue, &settings(), 0), TickOutcome::Queued);
        grabber.calls = 2; // next call succeeds
        assert_eq!(capture_tick(&mut grabber, &queue, &settings(), 1), TickOutcome::Dropped);
        assert_eq!(queue.try_pop().unwrap().sequence(), 0);
    }

    #[test]
    fn spawn_reports_open_failure() {
        let result = FrameSource::spawn(
            || -> Result<Flaky, CastError> { Err(CastError::CaptureUnavailable("none".into())) },
            FrameQueue::default(),
            settings(),
            CancellationToken::new(),
        );
        assert!(matches!(result, Err(CastError::CaptureUnavailable(_))));
    }

    #[test]
    fn stops_on_cancel() {
        let stop = CancellationToken::new();
        let queue = FrameQueue::default();
        let source = FrameSource::spawn(
            || Ok(Flaky { calls: 0 }),
            queue.clone(),
            settings(),
            stop.clone(),
        )
        .unwrap();
        assert_eq!(source.backend(), "flaky");

        std::thread::sleep(Duration::from_millis(100));
        stop.cancel();
        let summary = source.join(Duration::from_secs(2));
        assert!(summary.ticks > 0);
        assert_eq!(summary.ticks, summary.queued + summary.dropped + summary.skipped);
        assert!(queue.len() <= 3);
    }

    /// Returns a frame once, then blocks every later grab.
    struct Wedged {
        served: bool,
    }

    impl FrameGrabber for Wedged {
        fn name(&self) -> &'static str {
            "wedged"
        }

        fn grab(&mut self) -> Result<RawScreenFrame, CastError> {
            if self.served {
                std::thread::sleep(Duration::from_secs(10));
            }
            self.served = true;
            Ok(RawScreenFrame::packed(2, 2, PixelFormat::Bgra8, vec![0; 16]))
        }
    }

    #[test]
    fn idle_ticks_still_produce_frames() {
        use crate::capture::HoldLastFrame;

        let queue = FrameQueue::new(8);
        let mut grabber = HoldLastFrame::new(Flaky { calls: 0 });
        for seq in 0..4 {
            assert_eq!(capture_tick(&mut grabber, &queue, &settings(), seq), TickOutcome::Queued);
        }
        assert_eq!(queue.len(), 4);
    }

    #[test]
    fn stuck_grab_is_detached_after_timeout() {
        let stop = CancellationToken::new();
        let source = FrameSource::spawn(
            || Ok(Wedged { served: false }),
            FrameQueue::default(),
            settings(),
            stop.clone(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        stop.cancel();
        let started = Instant::now();
        let summary = source.join(Duration::from_millis(200));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(summary, CaptureSummary::default());
    }
}
