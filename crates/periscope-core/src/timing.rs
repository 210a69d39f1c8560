//! Per-frame timing metadata carried in RTP header extensions.
//!
//! The server attaches six one-byte-form header extensions (RFC 8285) to
//! the first packet of every frame. Each carries one u64 value in network
//! byte order; subsequent fragments of the same frame carry none.

/// One-byte-form extension IDs, in wire order.
pub mod ext_id {
    /// Monotonic per-flow frame counter.
    pub const FRAME_ID: u8 = 1;
    /// Inter-frame duration at the camera source, microseconds.
    pub const FRAME_DURATION: u8 = 2;
    /// Video-convert stage duration, microseconds.
    pub const VIDCONV: u8 = 3;
    /// Encoder stage duration, microseconds.
    pub const ENCODER: u8 = 4;
    /// Payloader stage duration, microseconds.
    pub const PAYLOADER: u8 = 5;
    /// Payloader-exit timestamp, server clock, microseconds.
    pub const PAYLOAD_TS: u8 = 6;
}

/// Number of extensions on a stamped packet.
pub const EXTENSION_COUNT: usize = 6;

/// Payload size of each extension.
pub const EXTENSION_LEN: usize = 8;

/// Timing record for one frame, as stamped by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingExtension {
    pub frame_id: u64,
    pub frame_duration_us: u64,
    pub vidconv_us: u64,
    pub encoder_us: u64,
    pub payloader_us: u64,
    pub payloader_ts_us: u64,
}

impl TimingExtension {
    /// `(extension id, value)` pairs in wire order.
    pub fn fields(&self) -> [(u8, u64); EXTENSION_COUNT] {
        [
            (ext_id::FRAME_ID, self.frame_id),
            (ext_id::FRAME_DURATION, self.frame_duration_us),
            (ext_id::VIDCONV, self.vidconv_us),
            (ext_id::ENCODER, self.encoder_us),
            (ext_id::PAYLOADER, self.payloader_us),
            (ext_id::PAYLOAD_TS, self.payloader_ts_us),
        ]
    }
}

/// Encode one extension value. The wire commits to network byte order.
pub fn encode_value(value: u64) -> [u8; EXTENSION_LEN] {
    value.to_be_bytes()
}

/// Decode one extension payload; `None` if the length is wrong.
pub fn decode_value(data: &[u8]) -> Option<u64> {
    let bytes: [u8; EXTENSION_LEN] = data.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trip() {
        for value in [0u64, 1, 12_345, u64::from(u32::MAX), u64::MAX] {
            assert_eq!(decode_value(&encode_value(value)), Some(value));
        }
    }

    #[test]
    fn wire_order_is_big_endian() {
        assert_eq!(
            encode_value(0x0102_0304_0506_0708),
            [1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn short_payload_is_rejected() {
        assert_eq!(decode_value(&[0; 7]), None);
        assert_eq!(decode_value(&[0; 9]), None);
    }

    #[test]
    fn fields_cover_ids_one_through_six() {
        let ext = TimingExtension {
            frame_id: 7,
            frame_duration_us: 16_666,
            vidconv_us: 900,
            encoder_us: 4_200,
            payloader_us: 120,
            payloader_ts_us: 1_700_000_000_000_000,
        };
        let fields = ext.fields();
        let ids: Vec<u8> = fields.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(fields[0].1, 7);
        assert_eq!(fields[5].1, 1_700_000_000_000_000);
    }
}
