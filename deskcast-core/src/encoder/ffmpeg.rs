//! ffmpeg-backed [`EncoderBackend`].
//!
//! Frames go in on stdin as `rawvideo`/`bgr24`; ffmpeg encodes and
//! sends RTP to the destination itself. Two helper threads drain the
//! child's pipes: stderr is forwarded to the log, stdout carries the
//! `-progress` key/value stream from which the encoded byte count is
//! read.
//!
//! ffmpeg only opens the codec once the first input frame has arrived,
//! so a launch is validated by writing one black frame and then
//! watching the process for [`DEFAULT_LAUNCH_PROBE`].

use std::io::{BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::encoder::{Codec, EncoderBackend, EncoderSettings, ExitReport, Interrupter};
use crate::error::CastError;
use crate::types::Frame;

/// How long an encoder must stay alive after its first frame to count
/// as launched.
pub const DEFAULT_LAUNCH_PROBE: Duration = Duration::from_millis(500);

const EXIT_POLL: Duration = Duration::from_millis(20);

// ── Command line ─────────────────────────────────────────────────

/// Codec-specific low-latency options.
pub fn preset_args(codec: &Codec) -> Vec<String> {
    let name = codec.name();
    let args: &[&str] = if name.contains("nvenc") {
        &["-preset", "p1", "-tune", "ll"]
    } else if name.contains("amf") {
        &["-usage", "lowlatency"]
    } else if name.contains("qsv") {
        &["-preset", "veryfast"]
    } else if name == "libx264" {
        &["-preset", "ultrafast", "-tune", "zerolatency"]
    } else {
        &[]
    };
    args.iter().map(|s| s.to_string()).collect()
}

/// Full ffmpeg argument list for `settings`.
pub fn build_args(settings: &EncoderSettings) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostats",
        "-progress",
        "pipe:1",
        "-f",
        "rawvideo",
        "-pixel_format",
        "bgr24",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    args.extend([
        "-video_size".into(),
        format!("{}x{}", settings.width, settings.height),
        "-framerate".into(),
        settings.fps.to_string(),
        "-i".into(),
        "pipe:0".into(),
        "-c:v".into(),
        settings.codec.name().to_string(),
    ]);
    args.extend(preset_args(&settings.codec));
    args.extend([
        "-b:v".into(),
        format!("{}k", settings.bitrate_kbps),
        "-g".into(),
        settings.gop.to_string(),
        "-bf".into(),
        "0".into(),
        "-f".into(),
        "rtp".into(),
        format!("rtp://{}", settings.destination),
    ]);
    args
}

/// Parse the encoded byte total out of one `-progress` line.
///
/// Returns `None` for every other key and for `total_size=N/A`.
pub fn parse_progress_line(line: &str) -> Option<u64> {
    let (key, value) = line.trim().split_once('=')?;
    if key != "total_size" {
        return None;
    }
    value.parse().ok()
}

// ── FfmpegEncoder ────────────────────────────────────────────────

/// Launches ffmpeg processes.
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    program: PathBuf,
    launch_probe: Duration,
}

impl FfmpegEncoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            launch_probe: DEFAULT_LAUNCH_PROBE,
        }
    }

    /// Override how long a launch is observed before it counts as up.
    pub fn with_launch_probe(mut self, probe: Duration) -> Self {
        self.launch_probe = probe;
        self
    }

    /// Spawn ffmpeg with `args`, write `first_frame` if given, then
    /// require the process to outlive the launch probe.
    fn spawn_session(
        &self,
        codec: &str,
        args: &[String],
        first_frame: Option<&[u8]>,
    ) -> Result<FfmpegSession, CastError> {
        debug!("encoder: {} {}", self.program.display(), args.join(" "));
        let launch_err = |reason: String| CastError::EncoderLaunch {
            codec: codec.to_string(),
            reason,
        };

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| launch_err(format!("spawn {}: {e}", self.program.display())))?;
        debug!("encoder pid {}", child.id());

        let stdin = child.stdin.take();
        let encoded_bytes = Arc::new(AtomicU64::new(0));
        let mut readers = Vec::with_capacity(2);

        if let Some(stdout) = child.stdout.take() {
            let counter = Arc::clone(&encoded_bytes);
            readers.push(spawn_reader("deskcast-ffmpeg-progress", stdout, move |line| {
                if let Some(total) = parse_progress_line(line) {
                    counter.store(total, Ordering::Relaxed);
                }
            })?);
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader("deskcast-ffmpeg-stderr", stderr, |line| {
                if !line.trim().is_empty() {
                    warn!("ffmpeg: {}", line.trim_end());
                }
            })?);
        }

        let mut session = FfmpegSession {
            child: Arc::new(Mutex::new(child)),
            stdin,
            encoded_bytes,
            readers,
        };

        if let (Some(frame), Some(stdin)) = (first_frame, session.stdin.as_mut()) {
            if let Err(e) = stdin.write_all(frame).and_then(|()| stdin.flush()) {
                // Dropping the session kills and reaps the child.
                return Err(launch_err(format!("encoder rejected its first frame: {e}")));
            }
        }

        if let Some(status) = session.wait_for_exit(self.launch_probe)? {
            session.join_readers();
            return Err(launch_err(format!("encoder exited during startup ({status})")));
        }
        Ok(session)
    }
}

impl Default for FfmpegEncoder {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

impl EncoderBackend for FfmpegEncoder {
    type Handle = FfmpegSession;

    fn start(&mut self, settings: &EncoderSettings) -> Result<FfmpegSession, CastError> {
        let black = vec![0u8; settings.frame_bytes()];
        self.spawn_session(settings.codec.name(), &build_args(settings), Some(&black))
    }

    fn write(&mut self, session: &mut FfmpegSession, frame: &Frame) -> Result<usize, CastError> {
        let stdin = session
            .stdin
            .as_mut()
            .ok_or_else(|| CastError::EncoderExited("encoder input already closed".into()))?;
        stdin
            .write_all(frame.as_bytes())
            .map_err(|e| CastError::EncoderWrite(e.to_string()))?;
        Ok(frame.byte_len())
    }

    fn stop(&mut self, mut session: FfmpegSession, timeout: Duration) -> Result<ExitReport, CastError> {
        // Closing stdin is ffmpeg's end-of-input signal.
        drop(session.stdin.take());

        let report = match session.wait_for_exit(timeout)? {
            Some(status) => ExitReport::Exited {
                success: status.success(),
                code: status.code(),
            },
            None => {
                warn!("encoder did not exit within {timeout:?}; killing it");
                let mut child = session.child();
                if let Err(e) = child.kill() {
                    debug!("encoder kill: {e}");
                }
                child.wait()?;
                ExitReport::Killed
            }
        };
        session.join_readers();
        Ok(report)
    }

    fn encoded_bytes(&self, session: &FfmpegSession) -> u64 {
        session.encoded_bytes()
    }

    fn interrupter(&self, session: &FfmpegSession) -> Option<Interrupter> {
        let child = Arc::clone(&session.child);
        Some(Box::new(move || {
            let mut child = child.lock().unwrap_or_else(PoisonError::into_inner);
            if let Err(e) = child.kill() {
                debug!("encoder kill: {e}");
            }
        }))
    }
}

// ── FfmpegSession ────────────────────────────────────────────────

/// A running ffmpeg process.
pub struct FfmpegSession {
    /// Shared with the interrupter so a blocked write can be broken.
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    encoded_bytes: Arc<AtomicU64>,
    readers: Vec<JoinHandle<()>>,
}

impl FfmpegSession {
    /// Encoded bytes ffmpeg reported via `-progress`.
    pub fn encoded_bytes(&self) -> u64 {
        self.encoded_bytes.load(Ordering::Relaxed)
    }

    fn child(&self) -> MutexGuard<'_, Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Poll until the child exits or `timeout` passes.
    fn wait_for_exit(&mut self, timeout: Duration) -> Result<Option<ExitStatus>, CastError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child().try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(EXIT_POLL.min(deadline - now));
        }
    }

    fn join_readers(&mut self) {
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for FfmpegSession {
    fn drop(&mut self) {
        // Only reached when `stop` was not called.
        if self.stdin.is_some() {
            drop(self.stdin.take());
            let mut child = self.child();
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Drain `pipe` line by line on its own thread.
fn spawn_reader<R, F>(name: &str, pipe: R, mut on_line: F) -> Result<JoinHandle<()>, CastError>
where
    R: Read + Send + 'static,
    F: FnMut(&str) + Send + 'static,
{
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::with_capacity(256);
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => on_line(&String::from_utf8_lossy(&buf)),
                }
            }
        })?;
    Ok(handle)
}
