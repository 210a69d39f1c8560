//! Streaming configuration model.
//!
//! `StreamingConfig` is the authoritative description of how the media
//! transport is configured. It is only ever mutated through the control
//! exchange, and every mutation bumps the version counter of the
//! [`ConfigCell`] that supervisors watch.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Video codec used on the wire.
///
/// VP8/VP9 are accepted by the command channel for forward compatibility but
/// rejected when a pipeline is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Jpeg,
    Vp8,
    Vp9,
    H264,
    H265,
}

impl Codec {
    /// Canonical wire label, as used in both JSON forms and RTP caps.
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Jpeg => "JPEG",
            Codec::Vp8 => "VP8",
            Codec::Vp9 => "VP9",
            Codec::H264 => "H264",
            Codec::H265 => "H265",
        }
    }

    pub fn from_label(label: &str) -> Result<Self> {
        match label {
            "JPEG" => Ok(Codec::Jpeg),
            "VP8" => Ok(Codec::Vp8),
            "VP9" => Ok(Codec::Vp9),
            "H264" => Ok(Codec::H264),
            "H265" => Ok(Codec::H265),
            other => Err(Error::config(format!("unknown codec {other:?}"))),
        }
    }

    /// RTP payload type: 26 for JPEG, 96 (dynamic) otherwise.
    pub fn rtp_payload_type(&self) -> i32 {
        match self {
            Codec::Jpeg => 26,
            _ => 96,
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational mode: how many source pipelines feed the encoder(s).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoMode {
    Stereo,
    Mono,
    Panoramic,
}

impl VideoMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoMode::Stereo => "stereo",
            VideoMode::Mono => "mono",
            VideoMode::Panoramic => "panoramic",
        }
    }

    pub fn from_label(label: &str) -> Result<Self> {
        match label {
            "stereo" => Ok(VideoMode::Stereo),
            "mono" => Ok(VideoMode::Mono),
            "panoramic" => Ok(VideoMode::Panoramic),
            other => Err(Error::config(format!("unknown video mode {other:?}"))),
        }
    }
}

impl fmt::Display for VideoMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A camera resolution from the fixed preset table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Ordered preset table, nHD through UHD.
pub const RESOLUTION_PRESETS: [(&str, Resolution); 10] = [
    ("nHD", Resolution { width: 640, height: 360 }),
    ("qHD", Resolution { width: 960, height: 540 }),
    ("WSVGA", Resolution { width: 1024, height: 576 }),
    ("HD", Resolution { width: 1280, height: 720 }),
    ("HD+", Resolution { width: 1600, height: 900 }),
    ("FHD", Resolution { width: 1920, height: 1080 }),
    ("QWXGA", Resolution { width: 2048, height: 1152 }),
    ("QHD", Resolution { width: 2560, height: 1440 }),
    ("WQXGA+", Resolution { width: 3200, height: 1800 }),
    ("UHD", Resolution { width: 3840, height: 2160 }),
];

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn from_label(label: &str) -> Result<Self> {
        RESOLUTION_PRESETS
            .iter()
            .find(|(name, _)| *name == label)
            .map(|(_, r)| *r)
            .ok_or_else(|| Error::config(format!("unknown resolution label {label:?}")))
    }

    pub fn from_index(index: usize) -> Result<Self> {
        RESOLUTION_PRESETS
            .get(index)
            .map(|(_, r)| *r)
            .ok_or_else(|| Error::config(format!("resolution index {index} out of range")))
    }

    /// Preset label of this resolution, if it is in the table.
    pub fn label(&self) -> Option<&'static str> {
        RESOLUTION_PRESETS
            .iter()
            .find(|(_, r)| r == self)
            .map(|(name, _)| *name)
    }

    pub fn is_preset(&self) -> bool {
        self.label().is_some()
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.width as f32 / self.height as f32
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Authoritative description of the media transport configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingConfig {
    /// Address the server sends RTP flows to (the headset).
    pub ip: String,
    pub port_left: u16,
    pub port_right: u16,
    pub codec: Codec,
    /// JPEG encoder quality, 0..=100.
    pub encoding_quality: u32,
    /// H.264/H.265 target bitrate in bits per second.
    pub bitrate: u32,
    pub resolution: Resolution,
    pub video_mode: VideoMode,
    pub fps: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            ip: "192.168.1.100".to_string(),
            port_left: crate::ports::LEFT_CAMERA,
            port_right: crate::ports::RIGHT_CAMERA,
            codec: Codec::Jpeg,
            encoding_quality: 85,
            bitrate: 400_000,
            resolution: Resolution::new(1920, 1080),
            video_mode: VideoMode::Stereo,
            fps: 60,
        }
    }
}

impl StreamingConfig {
    /// Check the configuration invariants: distinct ports, preset
    /// resolution, frame rate in `[1, 120]`.
    pub fn validate(&self) -> Result<()> {
        if self.port_left == self.port_right {
            return Err(Error::config(format!(
                "left and right ports must differ (both {})",
                self.port_left
            )));
        }
        if !self.resolution.is_preset() {
            return Err(Error::config(format!(
                "resolution {} is not a preset",
                self.resolution
            )));
        }
        if self.fps < 1 || self.fps > 120 {
            return Err(Error::config(format!("fps {} outside [1, 120]", self.fps)));
        }
        Ok(())
    }

    /// Whether the transition from `self` to `new` can be applied to a
    /// running pipeline by setting encoder properties.
    ///
    /// Only a change limited to encoder quality (JPEG) or bitrate
    /// (H.264/H.265) qualifies; anything structural forces a rebuild.
    pub fn hot_swappable_to(&self, new: &StreamingConfig) -> bool {
        let structural_change = self.resolution != new.resolution
            || self.fps != new.fps
            || self.codec != new.codec
            || self.video_mode != new.video_mode
            || self.ip != new.ip
            || self.port_left != new.port_left
            || self.port_right != new.port_right;

        !structural_change
    }

    /// Stream port for a given sensor (0 = left, anything else = right).
    pub fn port_for_sensor(&self, sensor_id: usize) -> u16 {
        if sensor_id == 0 {
            self.port_left
        } else {
            self.port_right
        }
    }
}

impl fmt::Display for StreamingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}fps -> {}:{}/{} ({}, quality={}, bitrate={})",
            self.codec,
            self.resolution,
            self.fps,
            self.ip,
            self.port_left,
            self.port_right,
            self.video_mode,
            self.encoding_quality,
            self.bitrate,
        )
    }
}

/// Shared `(config, version)` cell.
///
/// Writers replace the config and bump the version while holding the lock;
/// readers load the version with acquire ordering and clone under the lock,
/// so a snapshot never pairs a config with a foreign version. Version zero
/// means "not yet initialized" and supervisors idle until it advances.
#[derive(Debug, Default)]
pub struct ConfigCell {
    config: Mutex<StreamingConfig>,
    version: AtomicU64,
}

impl ConfigCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the config and bump the version. Returns the new version.
    pub fn publish(&self, config: StreamingConfig) -> u64 {
        let mut guard = match self.config.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = config;
        self.version.fetch_add(1, Ordering::Release) + 1
    }

    /// Cheap version probe for change detection.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Consistent `(config, version)` snapshot.
    pub fn snapshot(&self) -> (StreamingConfig, u64) {
        let guard = match self.config.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        (guard.clone(), self.version.load(Ordering::Acquire))
    }
}
