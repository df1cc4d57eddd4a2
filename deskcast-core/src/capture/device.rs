//! Generic capture-device fallback.
//!
//! When the desktop-duplication path is unavailable, frames are read
//! from the platform's screen grab device through a second ffmpeg
//! process (`gdigrab`, `avfoundation` or `x11grab`). That process
//! scales to the output size and writes raw BGR24 frames to stdout, so
//! each grab is a single `read_exact` of one frame.

use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

use tracing::{debug, info, warn};

use crate::capture::FrameGrabber;
use crate::error::CastError;
use crate::types::{Frame, PixelFormat, RawScreenFrame};

/// Parameters of the grab-device process.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// ffmpeg binary used to read the grab device.
    pub program: PathBuf,
    /// Device input name; `None` picks the platform default.
    pub input: Option<String>,
    /// Output width after scaling.
    pub width: u32,
    /// Output height after scaling.
    pub height: u32,
    /// Rate requested from the grab device.
    pub fps: u32,
}

impl DeviceSettings {
    /// Grab format and default input for the current platform.
    pub fn platform_source() -> (&'static str, String) {
        if cfg!(target_os = "windows") {
            ("gdigrab", "desktop".into())
        } else if cfg!(target_os = "macos") {
            ("avfoundation", "1:none".into())
        } else {
            let display = std::env::var("DISPLAY").unwrap_or_else(|_| ":0.0".into());
            ("x11grab", display)
        }
    }

    /// Full argument list for the grab process.
    pub fn args(&self) -> Vec<String> {
        let (format, default_input) = Self::platform_source();
        let input = self.input.clone().unwrap_or(default_input);
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            format.into(),
            "-framerate".into(),
            self.fps.to_string(),
            "-i".into(),
            input,
            "-vf".into(),
            format!("scale={}:{}", self.width, self.height),
            "-pix_fmt".into(),
            "bgr24".into(),
            "-f".into(),
            "rawvideo".into(),
            "pipe:1".into(),
        ]
    }
}

/// Frame grabber backed by an ffmpeg grab-device process.
pub struct DeviceCapturer {
    child: Child,
    stdout: BufReader<ChildStdout>,
    width: u32,
    height: u32,
}

impl DeviceCapturer {
    /// Start the grab process.
    pub fn open(settings: &DeviceSettings) -> Result<Self, CastError> {
        Self::open_with(&settings.program, settings.args(), settings.width, settings.height)
    }

    fn open_with(
        program: &Path,
        args: Vec<String>,
        width: u32,
        height: u32,
    ) -> Result<Self, CastError> {
        debug!("capture device: {} {}", program.display(), args.join(" "));
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                CastError::CaptureUnavailable(format!("spawn {}: {e}", program.display()))
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CastError::CaptureUnavailable("grab process has no stdout".into()))?;

        info!("capture device started ({}x{} bgr24)", width, height);
        Ok(Self {
            child,
            stdout: BufReader::with_capacity(Frame::byte_len_for(width, height), stdout),
            width,
            height,
        })
    }
}

impl FrameGrabber for DeviceCapturer {
    fn name(&self) -> &'static str {
        "ffmpeg-grab-device"
    }

    fn grab(&mut self) -> Result<RawScreenFrame, CastError> {
        let mut data = vec![0u8; Frame::byte_len_for(self.width, self.height)];
        self.stdout
            .read_exact(&mut data)
            .map_err(|e| CastError::Capture(format!("grab device read: {e}")))?;
        Ok(RawScreenFrame {
            width: self.width,
            height: self.height,
            stride: self.width * PixelFormat::Bgr8.bytes_per_pixel() as u32,
            format: PixelFormat::Bgr8,
            data,
        })
    }
}

impl Drop for DeviceCapturer {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            // Already exited.
            debug!("grab process kill: {e}");
        }
        if let Err(e) = self.child.wait() {
            warn!("grab process wait: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DeviceSettings {
        DeviceSettings {
            program: PathBuf::from("ffmpeg"),
            input: Some("test-input".into()),
            width: 640,
            height: 480,
            fps: 30,
        }
    }

    #[test]
    fn args_scale_to_output_size() {
        let args = settings().args();
        assert!(args.windows(2).any(|w| w[0] == "-vf" && w[1] == "scale=640:480"));
        assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "test-input"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "bgr24"));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
    }

    #[test]
    fn missing_program_is_unavailable() {
        let mut s = settings();
        s.program = PathBuf::from("/nonexistent/deskcast-no-such-ffmpeg");
        let err = DeviceCapturer::open(&s).err().unwrap();
        assert!(matches!(err, CastError::CaptureUnavailable(_)));
    }

    #[cfg(unix)]
    #[test]
    fn reads_whole_frames_from_stdout() {
        // `head -c` stands in for ffmpeg: two 2x2 frames of zeros.
        let mut cap = DeviceCapturer::open_with(
            Path::new("head"),
            vec!["-c".into(), "24".into(), "/dev/zero".into()],
            2,
            2,
        )
        .unwrap();
        assert_eq!(cap.grab().unwrap().data.len(), 12);
        assert_eq!(cap.grab().unwrap().data.len(), 12);
        assert!(cap.grab().is_err());
    }
}
