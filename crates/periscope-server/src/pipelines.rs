//! Textual pipeline descriptions for the camera server.
//!
//! Instrumentation identities (`camsrc_ident`, `vidconv_ident`,
//! `enc_ident`, `rtppay_ident`) sit between the stages so probes can
//! timestamp each buffer as it flows; the encoder is always named
//! `encoder` so quality/bitrate can be retuned in place.

use periscope_core::{Codec, Error, Result, StreamingConfig};

/// Cameras addressable on the select channel in panoramic mode.
pub const PANORAMIC_NUM_CAMERAS: u8 = 6;

/// Physical sensors materialized as selector branches. The capture ISP
/// supports three concurrent sessions, so the window holds exactly three.
pub const PANORAMIC_ACTIVE_SENSORS: [u8; 3] = [0, 1, 5];

fn camera_source(sensor_id: usize, config: &StreamingConfig) -> String {
    format!(
        "nvarguscamerasrc aeantibanding=AeAntibandingMode_Off ee-mode=EdgeEnhancement_Off \
         tnr-mode=NoiseReduction_Off saturation=1.2 sensor-id={sensor_id} \
         ! video/x-raw(memory:NVMM),width=(int){width},height=(int){height},\
framerate=(fraction){fps}/1,format=(string)NV12",
        width = config.resolution.width,
        height = config.resolution.height,
        fps = config.fps,
    )
}

fn encode_and_pay(config: &StreamingConfig) -> Result<String> {
    let chain = match config.codec {
        Codec::Jpeg => format!(
            "nvjpegenc name=encoder quality={} idct-method=ifast \
             ! identity name=enc_ident \
             ! rtpjpegpay mtu=1300",
            config.encoding_quality
        ),
        Codec::H264 => format!(
            "nvv4l2h264enc name=encoder insert-sps-pps=1 bitrate={} preset-level=1 \
             ! identity name=enc_ident \
             ! rtph264pay mtu=1300 config-interval=1 pt=96",
            config.bitrate
        ),
        Codec::H265 => format!(
            "nvv4l2h265enc name=encoder insert-sps-pps=1 bitrate={} preset-level=1 \
             ! identity name=enc_ident \
             ! rtph265pay mtu=1300 config-interval=1 pt=96",
            config.bitrate
        ),
        other => {
            return Err(Error::config(format!(
                "codec {other} is not supported by this build"
            )))
        }
    };
    Ok(chain)
}

/// Streaming pipeline for one sensor: camera source, vertical flip,
/// encode, RTP payload, UDP out.
pub fn streaming_pipeline(sensor_id: usize, config: &StreamingConfig) -> Result<String> {
    let port = config.port_for_sensor(sensor_id);
    Ok(format!(
        "{source} \
         ! identity name=camsrc_ident \
         ! nvvidconv flip-method=vertical-flip \
         ! identity name=vidconv_ident \
         ! {encode} \
         ! identity name=rtppay_ident \
         ! udpsink host={host} sync=false port={port}",
        source = camera_source(sensor_id, config),
        encode = encode_and_pay(config)?,
        host = config.ip,
    ))
}

/// Panoramic pipeline: the active sensor window fans into an
/// input-selector, whose output feeds a single encode/pay/UDP chain on the
/// left port. Camera switching retargets the selector's `active-pad`.
pub fn panoramic_pipeline(config: &StreamingConfig) -> Result<String> {
    let mut description = String::new();
    for (pad_index, sensor) in PANORAMIC_ACTIVE_SENSORS.iter().enumerate() {
        description.push_str(&format!(
            "{source} ! sel.sink_{pad_index} ",
            source = camera_source(*sensor as usize, config),
        ));
    }
    description.push_str(&format!(
        "input-selector name=sel \
         ! identity name=camsrc_ident \
         ! nvvidconv flip-method=vertical-flip \
         ! identity name=vidconv_ident \
         ! {encode} \
         ! identity name=rtppay_ident \
         ! udpsink host={host} sync=false port={port}",
        encode = encode_and_pay(config)?,
        host = config.ip,
        port = config.port_left,
    ));
    Ok(description)
}

/// Map a select-channel camera index to its selector pad, if the camera is
/// inside the active window.
pub fn pad_index_for_camera(camera: u8) -> Option<usize> {
    PANORAMIC_ACTIVE_SENSORS.iter().position(|s| *s == camera)
}
