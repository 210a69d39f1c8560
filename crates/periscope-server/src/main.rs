//! Camera-server streaming driver.
//!
//! Reads config updates as line-delimited JSON on standard input, builds
//! and supervises the encode/transport pipelines, and stamps outgoing
//! media with per-stage timing. In panoramic mode an additional UDP
//! channel selects the live camera.

mod control;
mod pipelines;
mod select;
mod stamp;
mod supervisor;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use periscope_core::VideoMode;
use supervisor::ServerState;

#[derive(Debug, Parser)]
#[command(name = "periscope-server", about = "Periscope camera streaming driver")]
struct Args {
    /// UDP port of the camera-select channel (panoramic mode).
    #[arg(long, default_value_t = periscope_core::ports::CAMERA_SELECT)]
    select_port: u16,
}

fn main() -> ExitCode {
    periscope_core::init_tracing();
    let args = Args::parse();

    if let Err(err) = periscope_media::init() {
        error!("{err}");
        return ExitCode::FAILURE;
    }

    let state = Arc::new(ServerState::new());

    let control_state = Arc::clone(&state);
    let control_thread = std::thread::Builder::new()
        .name("command-channel".into())
        .spawn(move || control::run_command_reader(control_state));
    let control_thread = match control_thread {
        Ok(handle) => handle,
        Err(err) => {
            error!("failed to spawn command reader: {err}");
            return ExitCode::FAILURE;
        }
    };

    info!("streaming driver running; waiting for updates on stdin");
    run_streaming(&state, args.select_port);

    state.request_stop();
    let _ = control_thread.join();
    info!("streaming driver stopped");
    ExitCode::SUCCESS
}

/// Wait for the first config, then supervise pipelines in the mode it
/// names until stop is requested.
fn run_streaming(state: &Arc<ServerState>, select_port: u16) {
    while !state.stop_requested() && state.config.version() == 0 {
        std::thread::sleep(Duration::from_millis(100));
    }
    if state.stop_requested() {
        return;
    }

    let (initial, _version) = state.config.snapshot();

    let mut workers = Vec::new();
    if initial.video_mode == VideoMode::Panoramic {
        let select_state = Arc::clone(state);
        workers.push(std::thread::spawn(move || {
            select::run_select_listener(select_state, select_port)
        }));

        let worker_state = Arc::clone(state);
        workers.push(std::thread::spawn(move || {
            supervisor::run_panoramic_worker(worker_state)
        }));
    } else {
        for sensor_id in 0..2 {
            let worker_state = Arc::clone(state);
            workers.push(std::thread::spawn(move || {
                supervisor::run_sensor_worker(worker_state, sensor_id)
            }));
        }
    }

    for worker in workers {
        let _ = worker.join();
    }
}
