//! Receive-pipeline construction and the probe/sample callbacks.
//!
//! One pipeline per eye in stereo, a single one in mono/panoramic. The
//! appsink handoff publishes decoded frames; the identity probes mirror
//! the server's instrumentation points and complete the per-stage latency
//! record. All callback state is passed by reference into the closures;
//! nothing is keyed on pipeline names at dispatch time.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_rtp::prelude::*;
use gstreamer_rtp::RTPBuffer;
use tracing::{debug, info, warn};

use periscope_clock::ClockSync;
use periscope_core::timing::{decode_value, ext_id};
use periscope_core::{StreamingConfig, VideoMode};
use periscope_media::MediaPipeline;

use crate::frame::{EyeFrame, TextureTarget};
use crate::pipelines::{receive_pipeline, rtp_caps};
use crate::stats::StageLatencies;

/// Which eye a pipeline feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left,
    Right,
}

#[derive(Clone)]
struct EyeState {
    frame: Arc<Mutex<EyeFrame>>,
    stats: Arc<StageLatencies>,
}

impl EyeState {
    fn new(width: u32, height: u32) -> Self {
        let stats = Arc::new(StageLatencies::new());
        Self {
            frame: Arc::new(Mutex::new(EyeFrame::new(width, height, Arc::clone(&stats)))),
            stats,
        }
    }
}

/// Client-side stream consumer: owns the receive pipelines and the per-eye
/// frames/statistics they publish.
pub struct StreamPlayer {
    clock: Arc<ClockSync>,
    left: EyeState,
    right: EyeState,
    pipelines: Vec<MediaPipeline>,
}

impl StreamPlayer {
    pub fn new(clock: Arc<ClockSync>) -> Self {
        let config = StreamingConfig::default();
        Self {
            clock,
            left: EyeState::new(config.resolution.width, config.resolution.height),
            right: EyeState::new(config.resolution.width, config.resolution.height),
            pipelines: Vec::new(),
        }
    }

    /// Tear down any current pipelines and build new ones for `config`.
    pub fn configure(&mut self, config: &StreamingConfig) -> Result<()> {
        info!("(re)configuring receive pipelines: {config}");
        self.shutdown();

        // With the pipelines at Null and dropped, no callback can hold the
        // frames; reallocate them for the new geometry.
        for eye in [&self.left, &self.right] {
            match eye.frame.lock() {
                Ok(mut frame) => {
                    frame.reallocate(config.resolution.width, config.resolution.height)
                }
                Err(_) => return Err(anyhow!("frame lock poisoned")),
            }
        }

        let single_pipeline = matches!(config.video_mode, VideoMode::Mono | VideoMode::Panoramic);

        let left =
            self.build_eye_pipeline("pipeline_left", config.port_left, config, self.left.clone())?;
        self.pipelines.push(left);
        if !single_pipeline {
            let right = self.build_eye_pipeline(
                "pipeline_right",
                config.port_right,
                config,
                self.right.clone(),
            )?;
            self.pipelines.push(right);
        }

        for pipeline in &self.pipelines {
            pipeline.play()?;
        }
        Ok(())
    }

    /// Stop and release all pipelines. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        for pipeline in &self.pipelines {
            pipeline.send_eos();
            pipeline.stop();
        }
        self.pipelines.clear();
    }

    pub fn frame(&self, eye: Eye) -> Arc<Mutex<EyeFrame>> {
        Arc::clone(&self.eye(eye).frame)
    }

    pub fn stats(&self, eye: Eye) -> Arc<StageLatencies> {
        Arc::clone(&self.eye(eye).stats)
    }

    pub fn averaged(&self, eye: Eye) -> crate::stats::LatencySnapshot {
        self.eye(eye).stats.averaged_snapshot()
    }

    fn eye(&self, eye: Eye) -> &EyeState {
        match eye {
            Eye::Left => &self.left,
            Eye::Right => &self.right,
        }
    }

    fn build_eye_pipeline(
        &self,
        label: &str,
        port: u16,
        config: &StreamingConfig,
        eye: EyeState,
    ) -> Result<MediaPipeline> {
        let description = receive_pipeline(port, config)?;
        debug!("building {label}: {description}");
        let pipeline = MediaPipeline::parse(&description, label)?;
        configure_rtp_caps(&pipeline, config)?;

        attach_timing_probes(&pipeline, Arc::clone(&eye.stats), Arc::clone(&self.clock))?;
        attach_sample_handler(&pipeline, eye, Arc::clone(&self.clock))?;
        Ok(pipeline)
    }
}

impl Drop for StreamPlayer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Narrow the RTP capsfilter to the negotiated codec, payload type, and
/// frame dimensions.
fn configure_rtp_caps(pipeline: &MediaPipeline, config: &StreamingConfig) -> Result<()> {
    let fields = rtp_caps(config);
    let caps = gst::Caps::builder("application/x-rtp")
        .field("encoding-name", fields.encoding_name)
        .field("payload", fields.payload)
        .field("x-dimensions", fields.x_dimensions.as_str())
        .build();
    let capsfilter = pipeline.by_name("rtp_capsfilter")?;
    capsfilter.set_property("caps", &caps);
    Ok(())
}

/// Copy the server-side timing extensions and the network arrival stamp
/// into the eye's statistics. Runs for every received packet; only the
/// first packet of a frame carries the extensions.
fn on_udp_packet(stats: &StageLatencies, clock: &ClockSync, buffer: &gst::Buffer) {
    use std::sync::atomic::Ordering;

    if let Ok(rtp) = RTPBuffer::from_buffer_readable(buffer) {
        if let Some(frame_id) = rtp
            .extension_onebyte_header(ext_id::FRAME_ID, 0)
            .and_then(decode_value)
        {
            debug!(
                "new frame {frame_id}, packets in previous frame: {}",
                stats.packets_per_frame.load(Ordering::Relaxed)
            );
            stats.frame_id.store(frame_id, Ordering::Relaxed);
            stats.packets_per_frame.store(0, Ordering::Relaxed);
        }
        for (id, slot) in [
            (ext_id::FRAME_DURATION, &stats.camera),
            (ext_id::VIDCONV, &stats.vid_conv),
            (ext_id::ENCODER, &stats.enc),
            (ext_id::PAYLOADER, &stats.rtp_pay),
            (ext_id::PAYLOAD_TS, &stats.rtp_pay_ts),
        ] {
            if let Some(value) = rtp.extension_onebyte_header(id, 0).and_then(decode_value) {
                slot.store(value, Ordering::Relaxed);
            }
        }
    }

    // Arrival stamp of the latest fragment; the stream latency spans from
    // payloader exit to here.
    let now = clock.now_us();
    stats.udp_src_ts.store(now, Ordering::Relaxed);
    stats.udp_stream.store(
        now.saturating_sub(stats.rtp_pay_ts.load(Ordering::Relaxed)),
        Ordering::Relaxed,
    );
    stats.packets_per_frame.fetch_add(1, Ordering::Relaxed);
}

fn attach_timing_probes(
    pipeline: &MediaPipeline,
    stats: Arc<StageLatencies>,
    clock: Arc<ClockSync>,
) -> Result<()> {
    use std::sync::atomic::Ordering;

    {
        let stats = Arc::clone(&stats);
        let clock = Arc::clone(&clock);
        pipeline.add_buffer_probe("udpsrc_ident", move |buffer| {
            on_udp_packet(&stats, &clock, buffer);
        })?;
    }

    {
        let stats = Arc::clone(&stats);
        let clock = Arc::clone(&clock);
        pipeline.add_buffer_probe("rtpdepay_ident", move |_buffer| {
            let now = clock.now_us();
            stats.rtp_depay_ts.store(now, Ordering::Relaxed);
            stats.rtp_depay.store(
                now.saturating_sub(stats.udp_src_ts.load(Ordering::Relaxed)),
                Ordering::Relaxed,
            );
        })?;
    }

    {
        let stats = Arc::clone(&stats);
        let clock = Arc::clone(&clock);
        pipeline.add_buffer_probe("dec_ident", move |_buffer| {
            let now = clock.now_us();
            stats.dec_ts.store(now, Ordering::Relaxed);
            stats.dec.store(
                now.saturating_sub(stats.rtp_depay_ts.load(Ordering::Relaxed)),
                Ordering::Relaxed,
            );
        })?;
    }

    {
        pipeline.add_buffer_probe("queue_ident", move |_buffer| {
            let now = clock.now_us();
            stats.queue_ts.store(now, Ordering::Relaxed);
            stats.queue.store(
                now.saturating_sub(stats.dec_ts.load(Ordering::Relaxed)),
                Ordering::Relaxed,
            );

            let total = stats.camera.load(Ordering::Relaxed)
                + stats.vid_conv.load(Ordering::Relaxed)
                + stats.enc.load(Ordering::Relaxed)
                + stats.rtp_pay.load(Ordering::Relaxed)
                + stats.udp_stream.load(Ordering::Relaxed)
                + stats.rtp_depay.load(Ordering::Relaxed)
                + stats.dec.load(Ordering::Relaxed)
                + stats.queue.load(Ordering::Relaxed);
            stats.total_latency.store(total, Ordering::Relaxed);

            // Every stage of this frame is recorded; fold it into the
            // rolling history.
            stats.update_history();
        })?;
    }

    Ok(())
}

/// Wire the appsink handoff: publish each decoded sample into the eye's
/// frame, taking the texture path when the sample is GPU-backed and the
/// CPU-copy path otherwise.
fn attach_sample_handler(
    pipeline: &MediaPipeline,
    eye: EyeState,
    clock: Arc<ClockSync>,
) -> Result<()> {
    let appsink = pipeline
        .by_name("appsink")?
        .downcast::<gst_app::AppSink>()
        .map_err(|_| anyhow!("appsink element has an unexpected type"))?;

    appsink.set_callbacks(
        gst_app::AppSinkCallbacks::builder()
            .new_sample(move |sink| {
                let sample = sink.pull_sample().map_err(|_| gst::FlowError::Eos)?;
                if let Err(err) = publish_sample(&eye, &clock, &sample) {
                    warn!("dropping decoded sample: {err}");
                }
                Ok(gst::FlowSuccess::Ok)
            })
            .build(),
    );
    Ok(())
}

fn publish_sample(eye: &EyeState, clock: &ClockSync, sample: &gst::Sample) -> Result<()> {
    let caps = sample.caps().ok_or_else(|| anyhow!("sample has no caps"))?;
    let structure = caps
        .structure(0)
        .ok_or_else(|| anyhow!("sample caps are empty"))?;
    let width = structure.get::<i32>("width").unwrap_or(0).max(0) as u32;
    let height = structure.get::<i32>("height").unwrap_or(0).max(0) as u32;

    let gpu_backed = caps
        .features(0)
        .map(|features| features.contains("memory:GLMemory"))
        .unwrap_or(false);

    let buffer = sample
        .buffer()
        .ok_or_else(|| anyhow!("sample has no buffer"))?;

    let mut frame = eye
        .frame
        .lock()
        .map_err(|_| anyhow!("frame lock poisoned"))?;

    if gpu_backed {
        // Hardware path: the mapped GL memory leads with the texture name.
        let map = buffer
            .map_readable()
            .map_err(|_| anyhow!("failed to map GL buffer"))?;
        let data = map.as_slice();
        if data.len() < 4 {
            return Err(anyhow!("GL buffer too small for a texture handle"));
        }
        frame.texture_id = u32::from_ne_bytes([data[0], data[1], data[2], data[3]]);
        frame.texture_target = match structure.get::<&str>("texture-target") {
            Ok("external-oes") => TextureTarget::ExternalOes,
            _ => TextureTarget::Texture2d,
        };
        frame.has_texture = true;
        if width > 0 && height > 0 {
            frame.width = width;
            frame.height = height;
        }
    } else {
        // Software path: copy the RGB payload into the owned buffer.
        let map = buffer
            .map_readable()
            .map_err(|_| anyhow!("failed to map CPU buffer"))?;
        let data = map.as_slice();
        let expected = frame.buffer_size();
        if data.len() < expected {
            return Err(anyhow!(
                "short decoded buffer: {} < {expected} bytes",
                data.len()
            ));
        }
        let len = expected;
        frame.pixels[..len].copy_from_slice(&data[..len]);
        frame.has_texture = false;
    }

    eye.stats.mark_frame_ready(clock.now_us());
    Ok(())
}
