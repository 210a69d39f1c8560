//! Headset-side transport consumer.
//!
//! Receives the RTP flows built by the camera server, decodes them,
//! extracts per-stage timing from the media, and exposes the most recent
//! frame and averaged latency statistics to the renderer. Also hosts the
//! REST control client and the robot telemetry consumer.

#![forbid(unsafe_code)]

pub mod frame;
pub mod gateway;
pub mod pipelines;
pub mod player;
pub mod rest;
pub mod stats;

pub use frame::{EyeFrame, TextureTarget};
pub use player::{Eye, StreamPlayer};
pub use rest::RestClient;
pub use stats::{LatencySnapshot, StageLatencies, HISTORY_SIZE};

use periscope_core::status::StatusCell;

/// Per-partner connection states surfaced to the HUD.
#[derive(Debug, Default)]
pub struct ConnectionBoard {
    pub camera_server: StatusCell,
    pub ntp_sync: StatusCell,
    pub robot_gateway: StatusCell,
}

impl ConnectionBoard {
    pub fn new() -> Self {
        Self::default()
    }
}
