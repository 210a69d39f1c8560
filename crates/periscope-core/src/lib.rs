//! Shared infrastructure for Periscope: configuration model, wire forms,
//! timing metadata, and error types.
//!
//! This crate is used by every Periscope component.

#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod status;
pub mod timing;
pub mod wire;

pub use config::{Codec, ConfigCell, Resolution, StreamingConfig, VideoMode};
pub use error::{Error, Result};
pub use status::ConnectionStatus;

/// Well-known ports of the telepresence link.
pub mod ports {
    /// REST API exposed by the camera server front-end.
    pub const REST_API: u16 = 32281;
    /// Default UDP port of the left-eye RTP flow.
    pub const LEFT_CAMERA: u16 = 8554;
    /// Default UDP port of the right-eye RTP flow.
    pub const RIGHT_CAMERA: u16 = 8556;
    /// Telemetry gateway datagrams from the robot-side forwarder.
    pub const ROBOT_GATEWAY: u16 = 8502;
    /// Camera-select datagrams in panoramic mode.
    pub const CAMERA_SELECT: u16 = 9100;
}

/// Initialize tracing with sensible defaults.
///
/// Log level is controlled by the `RUST_LOG` environment variable.
/// Defaults to `info` if not set.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

/// Current wall-clock time in microseconds since the Unix epoch, unadjusted.
///
/// Server-side stamps use this directly; the client aligns incoming stamps
/// against its NTP-adjusted clock.
pub fn local_now_us() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}
