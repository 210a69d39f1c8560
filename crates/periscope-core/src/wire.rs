//! JSON wire forms of the streaming configuration.
//!
//! Two encodings exist side by side:
//!
//! - the REST form used by `/api/v1/stream/*` (snake_case keys, nested
//!   `resolution` object, codec limited to the buildable set), and
//! - the command-channel form read from the server's standard input
//!   (camelCase keys, flat resolution fields, codec including VP8/VP9).
//!
//! Both convert to and from [`StreamingConfig`]; unknown codec or mode
//! labels fail with a descriptive error instead of defaulting.

use serde::{Deserialize, Serialize};

use crate::config::{Codec, Resolution, StreamingConfig, VideoMode};
use crate::error::{Error, Result};

/// Body of `POST /api/v1/stream/start` and `PUT /api/v1/stream/update`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestStreamRequest {
    pub bitrate: u32,
    pub codec: String,
    pub encoding_quality: u32,
    pub fps: u32,
    pub ip_address: String,
    pub port_left: u16,
    pub port_right: u16,
    pub resolution: RestResolution,
    pub video_mode: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestResolution {
    pub width: u32,
    pub height: u32,
}

impl RestStreamRequest {
    /// Build the request body for a config, overriding the destination
    /// address with `ip_address` (the caller's own headset address).
    pub fn from_config(config: &StreamingConfig, ip_address: &str) -> Self {
        Self {
            bitrate: config.bitrate,
            codec: config.codec.as_str().to_string(),
            encoding_quality: config.encoding_quality,
            fps: config.fps,
            ip_address: ip_address.to_string(),
            port_left: config.port_left,
            port_right: config.port_right,
            resolution: RestResolution {
                width: config.resolution.width,
                height: config.resolution.height,
            },
            video_mode: config.video_mode.as_str().to_string(),
        }
    }

    pub fn into_config(self) -> Result<StreamingConfig> {
        Ok(StreamingConfig {
            ip: self.ip_address,
            port_left: self.port_left,
            port_right: self.port_right,
            codec: Codec::from_label(&self.codec)?,
            encoding_quality: self.encoding_quality,
            bitrate: self.bitrate,
            resolution: Resolution::new(self.resolution.width, self.resolution.height),
            video_mode: VideoMode::from_label(&self.video_mode)?,
            fps: self.fps,
        })
    }
}

/// Config object of the command-channel `update` command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub ip: String,
    pub port_left: u16,
    pub port_right: u16,
    pub codec: String,
    pub encoding_quality: u32,
    pub bitrate: u32,
    pub horizontal_resolution: u32,
    pub vertical_resolution: u32,
    pub video_mode: String,
    pub fps: u32,
}

impl ChannelConfig {
    pub fn from_config(config: &StreamingConfig) -> Self {
        Self {
            ip: config.ip.clone(),
            port_left: config.port_left,
            port_right: config.port_right,
            codec: config.codec.as_str().to_string(),
            encoding_quality: config.encoding_quality,
            bitrate: config.bitrate,
            horizontal_resolution: config.resolution.width,
            vertical_resolution: config.resolution.height,
            video_mode: config.video_mode.as_str().to_string(),
            fps: config.fps,
        }
    }

    pub fn into_config(self) -> Result<StreamingConfig> {
        Ok(StreamingConfig {
            ip: self.ip,
            port_left: self.port_left,
            port_right: self.port_right,
            codec: Codec::from_label(&self.codec)?,
            encoding_quality: self.encoding_quality,
            bitrate: self.bitrate,
            resolution: Resolution::new(self.horizontal_resolution, self.vertical_resolution),
            video_mode: VideoMode::from_label(&self.video_mode)?,
            fps: self.fps,
        })
    }
}

/// A line of the server's command channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum ControlCommand {
    Update { config: ChannelConfig },
    Stop,
}

impl ControlCommand {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line).map_err(Error::serialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> StreamingConfig {
        StreamingConfig {
            ip: "10.0.31.220".to_string(),
            port_left: 8554,
            port_right: 8556,
            codec: Codec::H264,
            encoding_quality: 60,
            bitrate: 4_000_000,
            resolution: Resolution::new(1280, 720),
            video_mode: VideoMode::Stereo,
            fps: 60,
        }
    }

    #[test]
    fn rest_form_round_trips() {
        let config = sample_config();
        let request = RestStreamRequest::from_config(&config, &config.ip);
        let json = serde_json::to_string(&request).unwrap();
        let back: RestStreamRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.into_config().unwrap(), config);
    }

    #[test]
    fn rest_form_uses_snake_case_keys() {
        let request = RestStreamRequest::from_config(&sample_config(), "10.0.31.220");
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("encoding_quality").is_some());
        assert!(value.get("ip_address").is_some());
        assert_eq!(value["resolution"]["width"], 1280);
        assert_eq!(value["video_mode"], "stereo");
        assert_eq!(value["codec"], "H264");
    }

    #[test]
    fn channel_form_round_trips() {
        let config = sample_config();
        let channel = ChannelConfig::from_config(&config);
        let json = serde_json::to_string(&channel).unwrap();
        let back: ChannelConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.into_config().unwrap(), config);
    }

    #[test]
    fn channel_form_uses_camel_case_keys() {
        let channel = ChannelConfig::from_config(&sample_config());
        let value = serde_json::to_value(&channel).unwrap();
        assert!(value.get("portLeft").is_some());
        assert!(value.get("encodingQuality").is_some());
        assert_eq!(value["horizontalResolution"], 1280);
        assert_eq!(value["verticalResolution"], 720);
    }

    #[test]
    fn unknown_labels_fail_cleanly() {
        let mut request = RestStreamRequest::from_config(&sample_config(), "10.0.31.220");
        request.codec = "AV1".to_string();
        assert!(request.into_config().is_err());

        let mut channel = ChannelConfig::from_config(&sample_config());
        channel.video_mode = "quad".to_string();
        assert!(channel.into_config().is_err());
    }

    #[test]
    fn channel_form_accepts_reserved_codecs() {
        let mut channel = ChannelConfig::from_config(&sample_config());
        channel.codec = "VP9".to_string();
        assert_eq!(channel.into_config().unwrap().codec, Codec::Vp9);
    }

    #[test]
    fn update_command_parses() {
        let line = r#"{"cmd":"update","config":{"ip":"192.168.1.50","portLeft":8554,"portRight":8556,"codec":"JPEG","encodingQuality":85,"bitrate":400000,"horizontalResolution":1920,"verticalResolution":1080,"videoMode":"stereo","fps":60}}"#;
        match ControlCommand::parse(line).unwrap() {
            ControlCommand::Update { config } => {
                let config = config.into_config().unwrap();
                assert_eq!(config.ip, "192.168.1.50");
                assert_eq!(config.codec, Codec::Jpeg);
                assert_eq!(config.resolution, Resolution::new(1920, 1080));
            }
            other => panic!("expected update, got {other:?}"),
        }
    }

    #[test]
    fn stop_command_parses() {
        assert!(matches!(
            ControlCommand::parse(r#"{"cmd":"stop"}"#).unwrap(),
            ControlCommand::Stop
        ));
    }

    #[test]
    fn malformed_command_is_an_error() {
        assert!(ControlCommand::parse("not json").is_err());
        assert!(ControlCommand::parse(r#"{"cmd":"reboot"}"#).is_err());
    }
}
