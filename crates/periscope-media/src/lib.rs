//! Thin capability layer over the GStreamer element/bus/bin model.
//!
//! Periscope drives media graphs through textual pipeline descriptions.
//! This crate wraps the handful of operations the supervisors and the
//! consumer need: parse, bounded state changes, named-element lookup,
//! property updates, buffer probes, and bus polling.

use std::time::Duration;

use anyhow::{anyhow, Result};
use gstreamer as gst;
use gstreamer::prelude::*;
use tracing::{info, warn};

/// Bounded wait for state changes to settle.
const STATE_CHANGE_TIMEOUT: Duration = Duration::from_secs(5);

/// Initialize the media engine. Must succeed before any pipeline is built.
pub fn init() -> Result<()> {
    gst::init().map_err(|e| anyhow!("media engine init failed: {e}"))
}

pub fn element_available(name: &str) -> bool {
    gst::ElementFactory::find(name).is_some()
}

pub fn require_elements(names: &[&str]) -> Result<()> {
    let missing: Vec<&str> = names
        .iter()
        .copied()
        .filter(|name| !element_available(name))
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!("missing GStreamer elements: {}", missing.join(", ")))
    }
}

/// Why a bus poll asked for a halt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusHalt {
    Error(String),
    Eos,
}

/// A parsed media pipeline with bounded lifecycle operations.
///
/// Element handles and pads are thread-safe; probe callbacks run on the
/// engine's streaming threads and must only touch state that is.
pub struct MediaPipeline {
    pipeline: gst::Pipeline,
    label: String,
}

impl MediaPipeline {
    /// Build a pipeline from a textual description.
    pub fn parse(description: &str, label: impl Into<String>) -> Result<Self> {
        let label = label.into();
        let element = gst::parse::launch(description)
            .map_err(|e| anyhow!("failed to parse pipeline '{label}': {e}"))?;
        let pipeline = element
            .downcast::<gst::Pipeline>()
            .map_err(|_| anyhow!("description '{label}' did not produce a pipeline"))?;
        Ok(Self { pipeline, label })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Look up an element by its unique name.
    pub fn by_name(&self, name: &str) -> Result<gst::Element> {
        self.pipeline
            .by_name(name)
            .ok_or_else(|| anyhow!("element '{name}' not found in pipeline '{}'", self.label))
    }

    pub fn try_by_name(&self, name: &str) -> Option<gst::Element> {
        self.pipeline.by_name(name)
    }

    /// Transition to Playing and wait (bounded) for the change to settle.
    /// Live sources settling at no-preroll count as success.
    pub fn play(&self) -> Result<()> {
        self.pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| anyhow!("pipeline '{}' refused Playing: {e}", self.label))?;
        let (result, _current, _pending) = self
            .pipeline
            .state(gst::ClockTime::from_mseconds(STATE_CHANGE_TIMEOUT.as_millis() as u64));
        result.map_err(|e| anyhow!("pipeline '{}' failed to reach Playing: {e}", self.label))?;
        info!("pipeline '{}' playing", self.label);
        Ok(())
    }

    /// Transition to Null and wait (bounded) for completion. Never fails:
    /// teardown problems are logged and the handle is still dropped.
    pub fn stop(&self) {
        info!("stopping pipeline '{}'", self.label);
        if self.pipeline.set_state(gst::State::Null).is_err() {
            warn!("pipeline '{}' refused Null", self.label);
            return;
        }
        let (result, _current, _pending) = self
            .pipeline
            .state(gst::ClockTime::from_mseconds(STATE_CHANGE_TIMEOUT.as_millis() as u64));
        if result.is_err() {
            warn!("pipeline '{}' did not stop cleanly", self.label);
        }
    }

    pub fn send_eos(&self) {
        self.pipeline.send_event(gst::event::Eos::new());
    }

    /// Poll the bus for Error/EOS with a timeout. `None` means keep going.
    pub fn poll_halt(&self, timeout: Duration) -> Option<BusHalt> {
        let bus = self.pipeline.bus()?;
        let msg = bus.timed_pop_filtered(
            gst::ClockTime::from_mseconds(timeout.as_millis() as u64),
            &[gst::MessageType::Error, gst::MessageType::Eos],
        )?;
        match msg.view() {
            gst::MessageView::Error(err) => Some(BusHalt::Error(format!(
                "{} ({})",
                err.error(),
                err.debug().unwrap_or_default()
            ))),
            gst::MessageView::Eos(_) => Some(BusHalt::Eos),
            _ => None,
        }
    }

    /// Attach a buffer probe to the src pad of a named element.
    ///
    /// The engine hands the probe a borrowed buffer; the callback may
    /// rewrite packet headers through the mutable reference.
    pub fn add_buffer_probe<F>(&self, element_name: &str, callback: F) -> Result<()>
    where
        F: Fn(&mut gst::Buffer) + Send + Sync + 'static,
    {
        let element = self.by_name(element_name)?;
        let pad = element
            .static_pad("src")
            .ok_or_else(|| anyhow!("element '{element_name}' has no src pad"))?;
        pad.add_probe(gst::PadProbeType::BUFFER, move |_pad, info| {
            if let Some(gst::PadProbeData::Buffer(ref mut buffer)) = info.data {
                callback(buffer);
            }
            gst::PadProbeReturn::Ok
        });
        Ok(())
    }

    /// Set a property on a named element if the element exposes it.
    pub fn set_element_property(&self, element_name: &str, key: &str, value: &dyn ToValue) -> Result<()> {
        let element = self.by_name(element_name)?;
        set_if_exists(&element, key, value);
        Ok(())
    }

    /// Borrow the underlying pipeline for operations this wrapper does not
    /// cover (appsink wiring, pad queries).
    pub fn inner(&self) -> &gst::Pipeline {
        &self.pipeline
    }
}

/// Set a property only when the element exposes it; skips silently
/// otherwise so one encoder family's knobs do not break another's.
pub fn set_if_exists(element: &gst::Element, name: &str, value: &dyn ToValue) {
    if element.has_property(name, None) {
        element.set_property_from_value(name, &value.to_value());
    }
}
