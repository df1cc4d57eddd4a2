//! deskcast — entry point.
//!
//! ```text
//! deskcast                               Stream with defaults (1920x1080, 30 fps, 5 Mbps)
//! deskcast -W 640 -H 480 --cpu           Smaller picture, software encoder
//! deskcast --ip 192.168.1.100 -p 5004    Stream to another host
//! deskcast --config <path>               Load a custom config TOML
//! deskcast --gen-config                  Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use deskcast::config::{CastConfig, CliOverrides};
use deskcast::service::{CastService, summary_lines};

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "deskcast", about = "Stream the desktop over RTP/UDP through ffmpeg")]
struct Cli {
    /// Output width in pixels.
    #[arg(short = 'W', long)]
    width: Option<u32>,

    /// Output height in pixels.
    #[arg(short = 'H', long)]
    height: Option<u32>,

    /// Frames per second.
    #[arg(long)]
    fps: Option<u32>,

    /// Target bitrate in kbit/s.
    #[arg(short, long)]
    bitrate: Option<u32>,

    /// Destination IP address.
    #[arg(long)]
    ip: Option<String>,

    /// Destination UDP port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Force software encoding.
    #[arg(long)]
    cpu: bool,

    /// Keyframe interval in frames (default: one second).
    #[arg(long)]
    gop: Option<u32>,

    /// Monitor index to capture.
    #[arg(long)]
    monitor: Option<u32>,

    /// Path to the ffmpeg binary.
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Hardware codec to try first, e.g. h264_amf or h264_qsv.
    #[arg(long)]
    hw_codec: Option<String>,

    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "deskcast.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            width: self.width,
            height: self.height,
            fps: self.fps,
            bitrate_kbps: self.bitrate,
            ip: self.ip.clone(),
            port: self.port,
            gop: self.gop,
            monitor_index: self.monitor,
            ffmpeg: self.ffmpeg.clone(),
            hardware_codec: self.hw_codec.clone(),
            cpu: self.cpu,
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        println!("{}", CastConfig::default_toml()?);
        return Ok(());
    }

    // Load config, then layer flags on top.
    let (mut config, source) = CastConfig::load(&cli.config);
    config.apply(&cli.overrides());

    // Init tracing, then report how the config was loaded.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();
    source.log(&cli.config);

    info!("deskcast v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "streaming {}x{} @ {} fps, {} kbps to rtp://{}:{} ({})",
        config.stream.width,
        config.stream.height,
        config.stream.fps,
        config.stream.bitrate_kbps,
        config.network.ip,
        config.network.port,
        if config.encoder.hardware {
            config.encoder.hardware_codec.as_str()
        } else {
            config.encoder.software_codec.as_str()
        }
    );
    println!("press Ctrl-C to stop");

    let service = CastService::new(config);
    let stop = service.stop_handle();

    // Ctrl-C handler.
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, shutting down");
        stop.cancel();
    });

    let summary = service.run().await?;
    for line in summary_lines(&summary) {
        println!("{line}");
    }

    Ok(())
}
