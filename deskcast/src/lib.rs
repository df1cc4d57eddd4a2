//! # deskcast — desktop streaming CLI
//!
//! Captures the local desktop, hands raw frames to an `ffmpeg` process
//! and lets it publish H.264 over RTP/UDP to a single destination.
//!
//! Settings come from built-in defaults, an optional TOML file
//! (`--config`) and command-line flags, in that order. Ctrl-C stops the
//! session and prints a summary.

pub mod config;
pub mod service;
