//! Receive/decode pipeline descriptions.
//!
//! The chain mirrors the server's instrumentation: the four identity
//! elements (`udpsrc_ident`, `rtpdepay_ident`, `dec_ident`, `queue_ident`)
//! are the client-side probe points, and `rtp_capsfilter` is configured at
//! build time with the negotiated codec, payload type, and dimensions.

use periscope_core::{Codec, Error, Result, StreamingConfig};

/// Field values for the RTP capsfilter of one flow, applied to the parsed
/// pipeline rather than embedded in the description (the x-dimensions
/// value contains a comma, which the textual caps syntax would split).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpCaps {
    pub encoding_name: &'static str,
    pub payload: i32,
    pub x_dimensions: String,
}

pub fn rtp_caps(config: &StreamingConfig) -> RtpCaps {
    RtpCaps {
        encoding_name: config.codec.as_str(),
        payload: config.codec.rtp_payload_type(),
        x_dimensions: format!("{},{}", config.resolution.width, config.resolution.height),
    }
}

fn depay_and_decode(codec: Codec) -> Result<&'static str> {
    match codec {
        Codec::Jpeg => Ok("rtpjpegdepay \
             ! identity name=rtpdepay_ident \
             ! jpegdec"),
        Codec::H264 => Ok("rtph264depay \
             ! identity name=rtpdepay_ident \
             ! h264parse \
             ! avdec_h264"),
        Codec::H265 => Ok("rtph265depay \
             ! identity name=rtpdepay_ident \
             ! h265parse \
             ! avdec_h265"),
        other => Err(Error::config(format!(
            "codec {other} is not supported by this build"
        ))),
    }
}

/// Receive pipeline for one eye. The decoded output is converted to RGB
/// and handed to the appsink; the sink never blocks the stream (one
/// buffer, drop on overrun).
pub fn receive_pipeline(port: u16, config: &StreamingConfig) -> Result<String> {
    Ok(format!(
        "udpsrc name=udpsrc port={port} \
         ! identity name=udpsrc_ident \
         ! capsfilter name=rtp_capsfilter caps=application/x-rtp \
         ! {decode} \
         ! identity name=dec_ident \
         ! queue max-size-buffers=1 leaky=downstream \
         ! identity name=queue_ident \
         ! videoconvert \
         ! video/x-raw,format=RGB \
         ! appsink name=appsink max-buffers=1 drop=true sync=false",
        decode = depay_and_decode(config.codec)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_core::Resolution;

    fn config(codec: Codec) -> StreamingConfig {
        StreamingConfig {
            codec,
            resolution: Resolution::new(1920, 1080),
            ..StreamingConfig::default()
        }
    }

    #[test]
    fn jpeg_receive_chain_has_all_probe_points() {
        let desc = receive_pipeline(8554, &config(Codec::Jpeg)).unwrap();
        for ident in ["udpsrc_ident", "rtpdepay_ident", "dec_ident", "queue_ident"] {
            assert!(desc.contains(&format!("identity name={ident}")), "{ident}");
        }
        assert!(desc.contains("udpsrc name=udpsrc port=8554"));
        assert!(desc.contains("rtpjpegdepay"));
        assert!(desc.contains("jpegdec"));
        assert!(desc.contains("appsink name=appsink"));
    }

    #[test]
    fn h26x_receive_chains_parse_before_decoding() {
        let desc = receive_pipeline(8554, &config(Codec::H264)).unwrap();
        assert!(desc.contains("rtph264depay"));
        assert!(desc.contains("h264parse"));
        assert!(desc.contains("avdec_h264"));

        let desc = receive_pipeline(8556, &config(Codec::H265)).unwrap();
        assert!(desc.contains("port=8556"));
        assert!(desc.contains("rtph265depay"));
        assert!(desc.contains("h265parse"));
        assert!(desc.contains("avdec_h265"));
    }

    #[test]
    fn caps_carry_codec_payload_and_dimensions() {
        let caps = rtp_caps(&config(Codec::Jpeg));
        assert_eq!(caps.encoding_name, "JPEG");
        assert_eq!(caps.payload, 26);
        assert_eq!(caps.x_dimensions, "1920,1080");

        let caps = rtp_caps(&config(Codec::H265));
        assert_eq!(caps.encoding_name, "H265");
        assert_eq!(caps.payload, 96);
    }

    #[test]
    fn reserved_codecs_are_rejected() {
        assert!(receive_pipeline(8554, &config(Codec::Vp8)).is_err());
        assert!(receive_pipeline(8554, &config(Codec::Vp9)).is_err());
    }
}
