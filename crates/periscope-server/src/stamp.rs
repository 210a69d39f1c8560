//! Server-side timing instrumentation.
//!
//! Each pipeline owns one [`StampState`]; the four identity probes append
//! wall-clock stamps as a buffer moves camera → vidconv → encoder →
//! payloader, and the payloader probe folds them into RTP header
//! extensions on the first packet of every frame.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use gstreamer as gst;
use gstreamer_rtp::prelude::*;
use gstreamer_rtp::RTPBuffer;
use tracing::warn;

use periscope_core::timing::{encode_value, TimingExtension};
use periscope_core::local_now_us;
use periscope_media::MediaPipeline;

/// Stage indices inside the per-frame stamp vector.
const STAGE_CAMSRC: usize = 0;
const STAGE_VIDCONV: usize = 1;
const STAGE_ENCODER: usize = 2;
const STAGE_PAYLOADER: usize = 3;

/// Per-pipeline frame timing accumulator.
#[derive(Debug, Default)]
pub struct StampState {
    frame_id: u64,
    frame_stamped: bool,
    last_source_us: u64,
    frame_duration_us: u64,
    stage_us: Vec<u64>,
}

impl StampState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Camera-source probe: arm a new frame and track the source cadence.
    pub fn on_camera(&mut self, now_us: u64) {
        if self.last_source_us != 0 {
            self.frame_duration_us = now_us.saturating_sub(self.last_source_us);
        }
        self.last_source_us = now_us;

        if !self.stage_us.is_empty() {
            // Previous frame left the pipeline; start collecting the next.
            self.stage_us.clear();
            self.frame_stamped = false;
        }
        self.stage_us.push(now_us);
    }

    /// Intermediate probes (vidconv, encoder) just record their exit time.
    pub fn on_stage(&mut self, now_us: u64) {
        self.stage_us.push(now_us);
    }

    /// Payloader probe. Returns the timing record to stamp onto the wire
    /// for the first packet of the frame, `None` for later fragments.
    pub fn on_payloader(&mut self, now_us: u64) -> Option<TimingExtension> {
        if self.frame_stamped {
            return None;
        }
        self.stage_us.push(now_us);
        if self.stage_us.len() <= STAGE_PAYLOADER {
            // A stage probe was missed; drop the frame's record entirely
            // rather than stamping a partial one.
            self.frame_stamped = true;
            return None;
        }

        let ext = TimingExtension {
            frame_id: self.frame_id,
            frame_duration_us: self.frame_duration_us,
            vidconv_us: self.stage_us[STAGE_VIDCONV].saturating_sub(self.stage_us[STAGE_CAMSRC]),
            encoder_us: self.stage_us[STAGE_ENCODER].saturating_sub(self.stage_us[STAGE_VIDCONV]),
            payloader_us: self.stage_us[STAGE_PAYLOADER]
                .saturating_sub(self.stage_us[STAGE_ENCODER]),
            payloader_ts_us: self.stage_us[STAGE_PAYLOADER],
        };
        self.frame_stamped = true;
        self.frame_id += 1;
        Some(ext)
    }
}

fn write_extensions(buffer: &mut gst::Buffer, ext: &TimingExtension) {
    let buffer = buffer.make_mut();
    match RTPBuffer::from_buffer_writable(buffer) {
        Ok(mut rtp) => {
            for (id, value) in ext.fields() {
                if rtp.add_extension_onebyte_header(id, &encode_value(value)).is_err() {
                    warn!("could not add RTP timing extension {id}");
                    return;
                }
            }
        }
        Err(err) => warn!("payloader buffer is not RTP: {err}"),
    }
}

/// Wire the four instrumentation probes of a streaming pipeline to a fresh
/// stamp state.
pub fn attach_probes(pipeline: &MediaPipeline) -> Result<Arc<Mutex<StampState>>> {
    let state = Arc::new(Mutex::new(StampState::new()));

    let camera_state = Arc::clone(&state);
    pipeline.add_buffer_probe("camsrc_ident", move |_buffer| {
        if let Ok(mut state) = camera_state.lock() {
            state.on_camera(local_now_us());
        }
    })?;

    for ident in ["vidconv_ident", "enc_ident"] {
        let stage_state = Arc::clone(&state);
        pipeline.add_buffer_probe(ident, move |_buffer| {
            if let Ok(mut state) = stage_state.lock() {
                state.on_stage(local_now_us());
            }
        })?;
    }

    let pay_state = Arc::clone(&state);
    pipeline.add_buffer_probe("rtppay_ident", move |buffer| {
        let ext = match pay_state.lock() {
            Ok(mut state) => state.on_payloader(local_now_us()),
            Err(_) => None,
        };
        if let Some(ext) = ext {
            write_extensions(buffer, &ext);
        }
    })?;

    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_core::timing::decode_value;

    fn run_frame(state: &mut StampState, base_us: u64) -> Option<TimingExtension> {
        state.on_camera(base_us);
        state.on_stage(base_us + 1_000); // vidconv exit
        state.on_stage(base_us + 5_000); // encoder exit
        state.on_payloader(base_us + 5_200)
    }

    #[test]
    fn first_packet_of_a_frame_is_stamped() {
        let mut state = StampState::new();
        let ext = run_frame(&mut state, 1_000_000).expect("first packet must stamp");
        assert_eq!(ext.frame_id, 0);
        assert_eq!(ext.vidconv_us, 1_000);
        assert_eq!(ext.encoder_us, 4_000);
        assert_eq!(ext.payloader_us, 200);
        assert_eq!(ext.payloader_ts_us, 1_005_200);
        // First frame has no predecessor to measure cadence against.
        assert_eq!(ext.frame_duration_us, 0);
    }

    #[test]
    fn later_fragments_are_not_stamped() {
        let mut state = StampState::new();
        assert!(run_frame(&mut state, 1_000_000).is_some());
        // Further payloader callbacks belong to the same frame.
        assert!(state.on_payloader(1_005_300).is_none());
        assert!(state.on_payloader(1_005_400).is_none());
    }

    #[test]
    fn frame_ids_are_monotonic_and_cadence_is_tracked() {
        let mut state = StampState::new();
        let first = run_frame(&mut state, 1_000_000).unwrap();
        let second = run_frame(&mut state, 1_016_666).unwrap();
        let third = run_frame(&mut state, 1_033_332).unwrap();

        assert_eq!(first.frame_id, 0);
        assert_eq!(second.frame_id, 1);
        assert_eq!(third.frame_id, 2);
        assert_eq!(second.frame_duration_us, 16_666);
        assert_eq!(third.frame_duration_us, 16_666);
    }

    #[test]
    fn extensions_round_trip_on_the_wire() {
        gst::init().unwrap();
        let mut buffer = gst::Buffer::new_rtp_with_sizes(64, 0, 0).unwrap();

        let ext = TimingExtension {
            frame_id: 42,
            frame_duration_us: 16_666,
            vidconv_us: 950,
            encoder_us: 4_100,
            payloader_us: 210,
            payloader_ts_us: 1_700_000_000_123_456,
        };
        write_extensions(&mut buffer, &ext);

        let rtp = RTPBuffer::from_buffer_readable(&buffer).unwrap();
        for (id, value) in ext.fields() {
            let data = rtp
                .extension_onebyte_header(id, 0)
                .unwrap_or_else(|| panic!("extension {id} missing"));
            assert_eq!(decode_value(data), Some(value));
        }
        // Exactly six extensions, IDs 1 through 6.
        assert!(rtp.extension_onebyte_header(7, 0).is_none());
        assert!(rtp.extension_onebyte_header(1, 1).is_none());
    }

    #[test]
    fn missed_stage_probe_skips_the_stamp() {
        let mut state = StampState::new();
        state.on_camera(1_000_000);
        state.on_stage(1_001_000);
        // Encoder probe never fired for this frame.
        assert!(state.on_payloader(1_002_000).is_none());
        // Next frame recovers.
        assert!(run_frame(&mut state, 1_016_666).is_some());
    }
}
