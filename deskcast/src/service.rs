//! Session lifecycle for the CLI.
//!
//! Builds a [`Streamer`] from the loaded configuration, runs it on a
//! blocking worker and forwards periodic throughput lines to stdout.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use deskcast_core::{CastError, FfmpegEncoder, SessionSummary, Streamer, ThroughputReport};

use crate::config::CastConfig;

// ── CastService ──────────────────────────────────────────────────

/// One streaming session driven by a [`CastConfig`].
pub struct CastService {
    config: CastConfig,
    stop: CancellationToken,
}

impl CastService {
    pub fn new(config: CastConfig) -> Self {
        Self {
            config,
            stop: CancellationToken::new(),
        }
    }

    /// Token that ends the session when cancelled, e.g. from a Ctrl-C
    /// handler.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Run the session until the stop handle is cancelled.
    ///
    /// Startup failures (invalid settings, no usable encoder, no capture
    /// backend) are returned as errors. A stopped session returns its
    /// summary.
    pub async fn run(&self) -> Result<SessionSummary, CastError> {
        let settings = self.config.to_stream_settings()?;
        let capture = self.config.to_capture_settings();
        let encoder = FfmpegEncoder::new(self.config.encoder.program.clone())
            .with_launch_probe(Duration::from_millis(self.config.encoder.launch_probe_ms));
        let stop = self.stop.clone();

        info!(
            "starting session: {}x{} @ {} fps → {}",
            settings.width, settings.height, settings.fps, settings.destination
        );

        tokio::task::spawn_blocking(move || {
            let mut streamer = Streamer::new(settings, encoder);
            streamer.run(move || capture.open(), stop, print_report)
        })
        .await
        .map_err(|e| CastError::Other(format!("streaming task failed: {e}")))?
    }
}

fn print_report(report: &ThroughputReport) {
    println!("{report}");
}

/// Final lines printed after a session ends.
pub fn summary_lines(summary: &SessionSummary) -> Vec<String> {
    let report = &summary.report;
    vec![
        format!(
            "stopped after {:.1}s: {} frames sent, {} dropped at capture",
            report.elapsed.as_secs_f64(),
            report.frames,
            summary.capture.dropped
        ),
        format!(
            "average fps: {:.2} | average bitrate: {:.2} Mbps | encoder: {} | capture: {}",
            report.fps, report.encoded_mbps, summary.codec, summary.capture_backend
        ),
    ]
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use deskcast_core::Codec;
    use deskcast_core::source::CaptureSummary;

    #[tokio::test]
    async fn invalid_config_fails_before_launch() {
        let mut config = CastConfig::default();
        config.stream.width = 641;
        let service = CastService::new(config);
        let result = service.run().await;
        assert!(matches!(result, Err(CastError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn missing_encoder_binary_is_a_launch_error() {
        let mut config = CastConfig::default();
        config.stream.width = 64;
        config.stream.height = 32;
        config.encoder.program = "/nonexistent/ffmpeg".into();
        let service = CastService::new(config);
        let result = service.run().await;
        assert!(matches!(result, Err(CastError::EncoderLaunch { .. })));
    }

    #[test]
    fn stop_handle_is_shared() {
        let service = CastService::new(CastConfig::default());
        let handle = service.stop_handle();
        handle.cancel();
        assert!(service.stop_handle().is_cancelled());
    }

    #[test]
    fn summary_mentions_counts_and_codec() {
        let report = ThroughputReport::compute(150, 0, 0, Duration::from_secs(5), 4, 0);
        let summary = SessionSummary {
            codec: Codec::Software("libx264".into()),
            capture_backend: "ffmpeg-grab-device",
            report,
            capture: CaptureSummary {
                dropped: 4,
                ..CaptureSummary::default()
            },
            encoder_exit: None,
        };
        let lines = summary_lines(&summary);
        assert!(lines[0].contains("150 frames sent"));
        assert!(lines[0].contains("4 dropped"));
        assert!(lines[1].contains("libx264"));
    }
}
