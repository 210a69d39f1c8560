//! Pipeline supervision: build, play, watch, hot-update or rebuild.
//!
//! One worker per sensor in stereo/mono, a single worker in panoramic.
//! Workers never propagate failures to each other; a broken camera backs
//! off and retries while its sibling keeps streaming.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::{error, info, warn};

use periscope_core::{Codec, ConfigCell, StreamingConfig, VideoMode};
use periscope_media::{set_if_exists, BusHalt, MediaPipeline};

use crate::pipelines;
use crate::stamp;

/// Consecutive failures after which a worker stops fast-retrying.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Bus poll granularity; also bounds stop-flag latency.
const BUS_POLL: Duration = Duration::from_millis(100);

/// Hardware release time between teardown and rebuild on a config change.
const REBUILD_RELEASE_DELAY: Duration = Duration::from_millis(500);

/// Retry interval once a worker has degraded to slow-retry mode.
const SLOW_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Startup stagger for the second sensor, avoiding ISP session contention.
const SENSOR1_STAGGER: Duration = Duration::from_millis(100);

/// Idle period while the worker's role is incompatible with the mode.
const MODE_IDLE: Duration = Duration::from_secs(1);

/// Backoff before retry attempt `failures` (1-based): 200 ms doubling up
/// to 3.2 s, then 10 s.
pub fn backoff_delay(failures: u32) -> Duration {
    match failures {
        0 => Duration::ZERO,
        1..=MAX_CONSECUTIVE_FAILURES => Duration::from_millis(200u64 << (failures - 1)),
        _ => SLOW_RETRY_DELAY,
    }
}

/// Selector handle shared between the panoramic worker (rebuild path) and
/// the camera-select listener (switch path). The mutex makes the two
/// mutually exclusive.
#[derive(Default)]
pub struct SelectorState {
    inner: Mutex<Option<SelectorHandle>>,
}

pub struct SelectorHandle {
    pub selector: gst::Element,
    pub pads: Vec<gst::Pad>,
    pub encoder: Option<gst::Element>,
    pub codec: Codec,
}

impl SelectorState {
    pub fn new() -> Self {
        Self::default()
    }

    fn install(&self, handle: SelectorHandle) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = Some(handle);
        }
    }

    fn clear(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = None;
        }
    }

    /// Retarget the selector to `pad_index`. Returns false when no
    /// panoramic pipeline is live or the pad is unknown.
    pub fn switch_to(&self, pad_index: usize) -> bool {
        let guard = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return false,
        };
        let Some(handle) = guard.as_ref() else {
            return false;
        };
        let Some(pad) = handle.pads.get(pad_index) else {
            return false;
        };
        handle.selector.set_property("active-pad", pad);

        // Compressed codecs need a fresh key frame so the receiver can
        // resynchronize without artifacts.
        if matches!(handle.codec, Codec::H264 | Codec::H265) {
            if let Some(encoder) = &handle.encoder {
                let event = gstreamer_video::UpstreamForceKeyUnitEvent::builder()
                    .all_headers(true)
                    .count(0)
                    .build();
                if !encoder.send_event(event) {
                    warn!("force-key-unit event was not handled by the encoder");
                }
            }
        }
        true
    }
}

/// Shared supervisor state.
pub struct ServerState {
    pub config: ConfigCell,
    pub stop: AtomicBool,
    pub selector: SelectorState,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            config: ConfigCell::new(),
            stop: AtomicBool::new(false),
            selector: SelectorState::new(),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
    }

    /// Sleep in 100 ms slices so stop requests are honored promptly.
    fn sleep(&self, total: Duration) {
        let mut remaining = total;
        while remaining > Duration::ZERO && !self.stop_requested() {
            let step = remaining.min(BUS_POLL);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }

    /// Sleep, returning early (true) if the config version moves past
    /// `seen_version`.
    fn sleep_watching_version(&self, total: Duration, seen_version: u64) -> bool {
        let mut remaining = total;
        while remaining > Duration::ZERO && !self.stop_requested() {
            if self.config.version() != seen_version {
                return true;
            }
            let step = remaining.min(BUS_POLL);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
        self.config.version() != seen_version
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a hot-swappable change in place: retune the encoder element.
fn apply_dynamic_update(pipeline: &MediaPipeline, new_cfg: &StreamingConfig) -> bool {
    let encoder = match pipeline.try_by_name("encoder") {
        Some(e) => e,
        None => {
            error!("cannot retune '{}': no element named encoder", pipeline.label());
            return false;
        }
    };

    match new_cfg.codec {
        Codec::Jpeg => {
            info!("retuning '{}' quality to {}", pipeline.label(), new_cfg.encoding_quality);
            set_if_exists(&encoder, "quality", &(new_cfg.encoding_quality as i32));
            true
        }
        Codec::H264 | Codec::H265 => {
            info!("retuning '{}' bitrate to {}", pipeline.label(), new_cfg.bitrate);
            set_if_exists(&encoder, "bitrate", &new_cfg.bitrate);
            true
        }
        _ => {
            error!("codec {} cannot be retuned in place", new_cfg.codec);
            false
        }
    }
}

/// Outcome of one built-and-playing pipeline session.
enum SessionEnd {
    /// Stop was requested; the worker should exit.
    Stop,
    /// Rebuild needed after a config change.
    Rebuild,
    /// Rebuild needed after a streaming error or EOS.
    StreamingError,
}

/// Watch a playing pipeline until it halts, the config forces a rebuild,
/// or stop is requested. Hot-swappable changes are applied in place.
fn watch_pipeline(
    state: &ServerState,
    pipeline: &MediaPipeline,
    current_cfg: &mut StreamingConfig,
    seen_version: &mut u64,
) -> SessionEnd {
    loop {
        if state.stop_requested() {
            return SessionEnd::Stop;
        }

        if let Some(halt) = pipeline.poll_halt(BUS_POLL) {
            match halt {
                BusHalt::Error(message) => {
                    error!("pipeline '{}' error: {message}", pipeline.label())
                }
                BusHalt::Eos => warn!("pipeline '{}' reached end of stream", pipeline.label()),
            }
            return SessionEnd::StreamingError;
        }

        let version = state.config.version();
        if version != *seen_version {
            let (new_cfg, new_version) = state.config.snapshot();
            *seen_version = new_version;

            if current_cfg.hot_swappable_to(&new_cfg) {
                info!("config change is hot-swappable, updating in place");
                if apply_dynamic_update(pipeline, &new_cfg) {
                    *current_cfg = new_cfg;
                    continue;
                }
                warn!("dynamic update failed, rebuilding pipeline");
                return SessionEnd::Rebuild;
            }
            info!("config change requires pipeline rebuild");
            return SessionEnd::Rebuild;
        }
    }
}

/// Supervisor loop for one sensor in stereo or mono mode.
pub fn run_sensor_worker(state: Arc<ServerState>, sensor_id: usize) {
    if sensor_id == 1 {
        info!("delaying sensor 1 start by {:?}", SENSOR1_STAGGER);
        std::thread::sleep(SENSOR1_STAGGER);
    }

    let mut seen_version = 0u64;
    let mut consecutive_failures = 0u32;

    while !state.stop_requested() {
        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            error!(
                "sensor {sensor_id} failed {consecutive_failures} times; \
                 retrying every {SLOW_RETRY_DELAY:?} until the config changes"
            );
            if state.sleep_watching_version(SLOW_RETRY_DELAY, seen_version) {
                info!("config changed, resetting failure counter for sensor {sensor_id}");
                consecutive_failures = 0;
            }
            continue;
        }

        let (cfg, version) = state.config.snapshot();
        if version == 0 {
            state.sleep(BUS_POLL);
            continue;
        }
        seen_version = version;

        let role_active = match cfg.video_mode {
            VideoMode::Stereo => true,
            VideoMode::Mono => sensor_id == 0,
            VideoMode::Panoramic => false,
        };
        if !role_active {
            state.sleep(MODE_IDLE);
            continue;
        }

        let label = if sensor_id == 0 { "pipeline_left" } else { "pipeline_right" };
        let session = build_and_watch(&state, label, &mut seen_version, cfg, |cfg| {
            pipelines::streaming_pipeline(sensor_id, cfg).map_err(anyhow::Error::from)
        });

        match session {
            Ok(end) => {
                // The pipeline reached Playing, so the startup streak is over.
                if consecutive_failures > 0 {
                    info!("sensor {sensor_id} recovered after {consecutive_failures} failures");
                }
                consecutive_failures = 0;
                match end {
                    SessionEnd::Stop => return,
                    SessionEnd::Rebuild => {
                        if !state.stop_requested() {
                            info!("waiting for sensor {sensor_id} hardware to release");
                            state.sleep(REBUILD_RELEASE_DELAY);
                        }
                    }
                    SessionEnd::StreamingError => {
                        consecutive_failures = 1;
                        let delay = backoff_delay(consecutive_failures);
                        warn!("sensor {sensor_id} streaming failure, retrying in {delay:?}");
                        state.sleep(delay);
                    }
                }
            }
            Err(err) => {
                consecutive_failures += 1;
                let delay = backoff_delay(consecutive_failures);
                warn!(
                    "sensor {sensor_id} failure {consecutive_failures} ({err}), \
                     retrying in {delay:?}"
                );
                state.sleep(delay);
            }
        }
    }
}

/// Supervisor loop for the single panoramic pipeline.
pub fn run_panoramic_worker(state: Arc<ServerState>) {
    let mut seen_version = 0u64;
    let mut consecutive_failures = 0u32;

    while !state.stop_requested() {
        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
            error!(
                "panoramic pipeline failed {consecutive_failures} times; \
                 retrying every {SLOW_RETRY_DELAY:?} until the config changes"
            );
            if state.sleep_watching_version(SLOW_RETRY_DELAY, seen_version) {
                consecutive_failures = 0;
            }
            continue;
        }

        let (cfg, version) = state.config.snapshot();
        if version == 0 {
            state.sleep(BUS_POLL);
            continue;
        }
        seen_version = version;

        if cfg.video_mode != VideoMode::Panoramic {
            state.sleep(MODE_IDLE);
            continue;
        }

        let session = build_and_watch(&state, "pipeline_panoramic", &mut seen_version, cfg, |cfg| {
            pipelines::panoramic_pipeline(cfg).map_err(anyhow::Error::from)
        });
        state.selector.clear();

        match session {
            Ok(end) => {
                consecutive_failures = 0;
                match end {
                    SessionEnd::Stop => return,
                    SessionEnd::Rebuild => {
                        if !state.stop_requested() {
                            info!("waiting for panoramic cameras to release");
                            state.sleep(REBUILD_RELEASE_DELAY);
                        }
                    }
                    SessionEnd::StreamingError => {
                        consecutive_failures = 1;
                        let delay = backoff_delay(consecutive_failures);
                        warn!("panoramic streaming failure, retrying in {delay:?}");
                        state.sleep(delay);
                    }
                }
            }
            Err(err) => {
                consecutive_failures += 1;
                let delay = backoff_delay(consecutive_failures);
                warn!("panoramic failure {consecutive_failures} ({err}), retrying in {delay:?}");
                state.sleep(delay);
            }
        }
    }
}

/// Build, instrument, and play one pipeline, then watch it to completion.
fn build_and_watch(
    state: &Arc<ServerState>,
    label: &str,
    seen_version: &mut u64,
    mut cfg: StreamingConfig,
    build: impl Fn(&StreamingConfig) -> anyhow::Result<String>,
) -> anyhow::Result<SessionEnd> {
    let description = build(&cfg)?;
    info!("building {label}: {description}");

    let pipeline = MediaPipeline::parse(&description, label)?;
    stamp::attach_probes(&pipeline)?;

    if label == "pipeline_panoramic" {
        install_selector(state, &pipeline, &cfg);
    }

    if let Err(err) = pipeline.play() {
        pipeline.stop();
        return Err(err);
    }

    let end = watch_pipeline(state, &pipeline, &mut cfg, seen_version);
    pipeline.stop();
    Ok(end)
}

/// Cache the selector element and its sink pads for the select listener.
fn install_selector(state: &Arc<ServerState>, pipeline: &MediaPipeline, cfg: &StreamingConfig) {
    let Some(selector) = pipeline.try_by_name("sel") else {
        error!("panoramic pipeline has no input-selector");
        return;
    };

    let mut pads = Vec::new();
    for pad_index in 0..pipelines::PANORAMIC_ACTIVE_SENSORS.len() {
        match selector.static_pad(&format!("sink_{pad_index}")) {
            Some(pad) => pads.push(pad),
            None => warn!("selector pad sink_{pad_index} missing"),
        }
    }

    state.selector.install(SelectorHandle {
        selector,
        pads,
        encoder: pipeline.try_by_name("encoder"),
        codec: cfg.codec,
    });
}
