//! Configuration for the deskcast CLI.
//!
//! Values come from three layers: built-in defaults, an optional TOML
//! file, and command-line flags. Later layers win.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use deskcast_core::capture::CaptureSettings;
use deskcast_core::encoder::{DEFAULT_HARDWARE_CODEC, DEFAULT_SOFTWARE_CODEC};
use deskcast_core::net::DEFAULT_SEND_BUFFER;
use deskcast_core::queue::DEFAULT_QUEUE_CAPACITY;
use deskcast_core::{CastError, StreamSettings};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CastConfig {
    /// Output picture and rate.
    pub stream: StreamConfig,
    /// Destination and socket tuning.
    pub network: NetworkConfig,
    /// External encoder process.
    pub encoder: EncoderConfig,
    /// Desktop capture.
    pub capture: CaptureConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Output picture and rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Target bitrate in kbit/s.
    pub bitrate_kbps: u32,
    /// Keyframe interval in frames. Defaults to one second (= fps).
    pub gop: Option<u32>,
    /// Seconds between statistics lines.
    pub stats_interval_secs: u64,
}

/// Destination and socket tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Destination IP address.
    pub ip: String,
    /// Destination UDP port.
    pub port: u16,
    /// Requested UDP send buffer in bytes.
    pub send_buffer_bytes: usize,
}

/// External encoder process.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// ffmpeg binary.
    pub program: PathBuf,
    /// Try the hardware codec before the software one.
    pub hardware: bool,
    /// Hardware codec name: "h264_nvenc", "h264_amf", "h264_qsv".
    pub hardware_codec: String,
    /// Software codec name.
    pub software_codec: String,
    /// How long a new encoder must survive its first frame to count as launched.
    pub launch_probe_ms: u64,
    /// Bounded wait for the encoder to exit on shutdown.
    pub exit_timeout_ms: u64,
}

/// Desktop capture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Monitor index to capture (0 = primary).
    pub monitor_index: u32,
    /// Upper bound for a desktop duplication acquire in milliseconds,
    /// further capped at half a capture tick.
    pub acquire_timeout_ms: u32,
    /// Grab device input for the fallback path, e.g. ":0.0".
    pub device_input: Option<String>,
    /// Frames held between capture and encoder.
    pub queue_capacity: usize,
    /// Delivery loop wait per queue read in milliseconds.
    pub queue_timeout_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate_kbps: 5000,
            gop: None,
            stats_interval_secs: 5,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".into(),
            port: 10000,
            send_buffer_bytes: DEFAULT_SEND_BUFFER,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("ffmpeg"),
            hardware: true,
            hardware_codec: DEFAULT_HARDWARE_CODEC.into(),
            software_codec: DEFAULT_SOFTWARE_CODEC.into(),
            launch_probe_ms: 500,
            exit_timeout_ms: 5000,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            monitor_index: 0,
            acquire_timeout_ms: 100,
            device_input: None,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_timeout_ms: 1000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── CLI overrides ────────────────────────────────────────────────

/// Values given on the command line. `None` keeps the file/default value.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub bitrate_kbps: Option<u32>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub gop: Option<u32>,
    pub monitor_index: Option<u32>,
    pub ffmpeg: Option<PathBuf>,
    pub hardware_codec: Option<String>,
    /// Force software encoding.
    pub cpu: bool,
}

// ── Loading ──────────────────────────────────────────────────────

/// Where a loaded configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Parsed from the file.
    File,
    /// No readable file; defaults used.
    Missing,
    /// The file did not parse; defaults used.
    Invalid(String),
}

impl ConfigSource {
    /// Log the outcome. Call once a subscriber is installed.
    pub fn log(&self, path: &Path) {
        match self {
            ConfigSource::File => tracing::info!("loaded config from {}", path.display()),
            ConfigSource::Missing => {
                tracing::info!("no config at {}; using defaults", path.display())
            }
            ConfigSource::Invalid(e) => {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display())
            }
        }
    }
}

impl CastConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// Nothing is logged here since the log level itself comes from the
    /// file; the returned [`ConfigSource`] says what happened.
    pub fn load(path: &Path) -> (Self, ConfigSource) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, ConfigSource::File),
                Err(e) => (Self::default(), ConfigSource::Invalid(e.to_string())),
            },
            Err(_) => (Self::default(), ConfigSource::Missing),
        }
    }

    /// Default configuration as pretty TOML.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&Self::default())
    }

    /// Layer command-line values on top of this configuration.
    pub fn apply(&mut self, cli: &CliOverrides) {
        if let Some(v) = cli.width {
            self.stream.width = v;
        }
        if let Some(v) = cli.height {
            self.stream.height = v;
        }
        if let Some(v) = cli.fps {
            self.stream.fps = v;
        }
        if let Some(v) = cli.bitrate_kbps {
            self.stream.bitrate_kbps = v;
        }
        if let Some(v) = cli.gop {
            self.stream.gop = Some(v);
        }
        if let Some(v) = &cli.ip {
            self.network.ip = v.clone();
        }
        if let Some(v) = cli.port {
            self.network.port = v;
        }
        if let Some(v) = cli.monitor_index {
            self.capture.monitor_index = v;
        }
        if let Some(v) = &cli.ffmpeg {
            self.encoder.program = v.clone();
        }
        if let Some(v) = &cli.hardware_codec {
            self.encoder.hardware_codec = v.clone();
        }
        if cli.cpu {
            self.encoder.hardware = false;
        }
    }

    /// Destination socket address.
    pub fn destination(&self) -> Result<SocketAddr, CastError> {
        let ip: IpAddr = self.network.ip.parse().map_err(|e| {
            CastError::InvalidConfig(format!("destination ip {:?}: {e}", self.network.ip))
        })?;
        Ok(SocketAddr::new(ip, self.network.port))
    }

    /// Convert into validated session settings.
    pub fn to_stream_settings(&self) -> Result<StreamSettings, CastError> {
        let settings = StreamSettings {
            width: self.stream.width,
            height: self.stream.height,
            fps: self.stream.fps,
            bitrate_kbps: self.stream.bitrate_kbps,
            destination: self.destination()?,
            prefer_hardware: self.encoder.hardware,
            hardware_codec: self.encoder.hardware_codec.clone(),
            software_codec: self.encoder.software_codec.clone(),
            gop: self.stream.gop,
            send_buffer: self.network.send_buffer_bytes,
            queue_capacity: self.capture.queue_capacity.max(1),
            queue_timeout: Duration::from_millis(self.capture.queue_timeout_ms.max(1)),
            stats_interval: Duration::from_secs(self.stream.stats_interval_secs.max(1)),
            encoder_exit_timeout: Duration::from_millis(self.encoder.exit_timeout_ms),
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Inputs for opening the capture backend.
    pub fn to_capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            monitor_index: self.capture.monitor_index,
            acquire_timeout_ms: self.capture.acquire_timeout_ms,
            device_program: self.encoder.program.clone(),
            device_input: self.capture.device_input.clone(),
            width: self.stream.width,
            height: self.stream.height,
            fps: self.stream.fps,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = CastConfig::default_toml().unwrap();
        assert!(text.contains("bitrate_kbps"));
        assert!(text.contains("hardware_codec"));
    }

    #[test]
    fn roundtrip_config() {
        let text = CastConfig::default_toml().unwrap();
        let parsed: CastConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, 10000);
        assert_eq!(parsed.stream.fps, 30);
        assert_eq!(parsed.stream.gop, None);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let parsed: CastConfig = toml::from_str("[stream]\nfps = 60\n").unwrap();
        assert_eq!(parsed.stream.fps, 60);
        assert_eq!(parsed.stream.width, 1920);
        assert_eq!(parsed.network.ip, "127.0.0.1");
    }

    #[test]
    fn missing_file_uses_defaults() {
        let (cfg, source) = CastConfig::load(Path::new("/nonexistent/deskcast.toml"));
        assert_eq!(cfg.stream.bitrate_kbps, 5000);
        assert_eq!(source, ConfigSource::Missing);
    }

    #[test]
    fn invalid_file_is_reported() {
        let path = std::env::temp_dir().join(format!("deskcast-bad-{}.toml", std::process::id()));
        std::fs::write(&path, "[stream]\nfps = \"fast\"\n").unwrap();
        let (cfg, source) = CastConfig::load(&path);
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.stream.fps, 30);
        assert!(matches!(source, ConfigSource::Invalid(ref e) if e.contains("fps")));
    }

    #[test]
    fn valid_file_is_loaded() {
        let path = std::env::temp_dir().join(format!("deskcast-ok-{}.toml", std::process::id()));
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();
        let (cfg, source) = CastConfig::load(&path);
        std::fs::remove_file(&path).ok();

        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(source, ConfigSource::File);
    }

    #[test]
    fn cli_overrides_file_values() {
        let mut cfg: CastConfig = toml::from_str("[stream]\nfps = 60\nwidth = 1280\n").unwrap();
        cfg.apply(&CliOverrides {
            width: Some(640),
            height: Some(480),
            ip: Some("192.168.1.100".into()),
            cpu: true,
            ..CliOverrides::default()
        });
        assert_eq!(cfg.stream.width, 640);
        assert_eq!(cfg.stream.height, 480);
        assert_eq!(cfg.stream.fps, 60);
        assert!(!cfg.encoder.hardware);
        assert_eq!(cfg.destination().unwrap().to_string(), "192.168.1.100:10000");
    }

    #[test]
    fn example_scenario_settings() {
        let mut cfg = CastConfig::default();
        cfg.apply(&CliOverrides {
            width: Some(640),
            height: Some(480),
            fps: Some(30),
            bitrate_kbps: Some(2000),
            ip: Some("127.0.0.1".into()),
            port: Some(10000),
            cpu: true,
            ..CliOverrides::default()
        });
        let settings = cfg.to_stream_settings().unwrap();
        let enc = settings.encoder_settings();
        assert_eq!((enc.width, enc.height, enc.fps, enc.gop), (640, 480, 30, 30));
        assert_eq!(enc.codec.name(), "libx264");
        assert_eq!(enc.destination.to_string(), "127.0.0.1:10000");
    }

    #[test]
    fn bad_ip_is_rejected() {
        let mut cfg = CastConfig::default();
        cfg.network.ip = "not-an-ip".into();
        assert!(matches!(cfg.to_stream_settings(), Err(CastError::InvalidConfig(_))));
    }
}
