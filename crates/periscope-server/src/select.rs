//! Camera-select channel for panoramic mode.
//!
//! A single-byte datagram names the camera the operator wants on the wire.
//! Indices outside the materialized sensor window are rejected with a log
//! and no change.

use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::pipelines::{pad_index_for_camera, PANORAMIC_NUM_CAMERAS};
use crate::supervisor::ServerState;

const RECV_TIMEOUT: Duration = Duration::from_secs(1);

/// Decide what to do with one received camera index.
/// Returns the selector pad to activate, or `None` to ignore the datagram.
fn classify_request(camera: u8, current_camera: u8) -> Option<usize> {
    if camera >= PANORAMIC_NUM_CAMERAS {
        warn!("camera index {camera} out of range, ignoring");
        return None;
    }
    if camera == current_camera {
        return None;
    }
    match pad_index_for_camera(camera) {
        Some(pad_index) => Some(pad_index),
        None => {
            info!("camera {camera} not in the active window, ignoring");
            None
        }
    }
}

/// Blocking listener loop. Runs until stop is requested; the receive
/// timeout bounds shutdown latency.
pub fn run_select_listener(state: Arc<ServerState>, port: u16) {
    let socket = match UdpSocket::bind(("0.0.0.0", port)) {
        Ok(socket) => socket,
        Err(err) => {
            error!("failed to bind camera select socket on port {port}: {err}");
            return;
        }
    };
    if let Err(err) = socket.set_read_timeout(Some(RECV_TIMEOUT)) {
        error!("failed to set camera select socket timeout: {err}");
        return;
    }

    info!("camera select listener started on port {port}");
    let mut buf = [0u8; 16];
    let mut current_camera = 0u8;

    while !state.stop_requested() {
        let received = match socket.recv_from(&mut buf) {
            Ok((len, _peer)) => len,
            Err(_) => continue,
        };
        if received < 1 {
            continue;
        }

        let camera = buf[0];
        let Some(pad_index) = classify_request(camera, current_camera) else {
            continue;
        };

        if state.selector.switch_to(pad_index) {
            current_camera = camera;
            info!("switched to camera {camera} (pad {pad_index})");
        } else {
            warn!("camera switch to {camera} refused: no live panoramic pipeline");
        }
    }

    info!("camera select listener stopped");
}
