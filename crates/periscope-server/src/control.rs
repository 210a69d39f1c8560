//! Line-delimited JSON command channel on standard input.
//!
//! The REST front-end translates HTTP calls into these lines; this reader
//! is the only writer of the shared config cell.

use std::io::BufRead;
use std::sync::Arc;

use tracing::{error, info};

use periscope_core::wire::ControlCommand;
use periscope_core::StreamingConfig;

use crate::supervisor::ServerState;

fn dump_config(config: &StreamingConfig) {
    info!("  ip: {}", config.ip);
    info!("  ports: {} / {}", config.port_left, config.port_right);
    info!("  codec: {}", config.codec);
    info!("  encoding quality: {}", config.encoding_quality);
    info!("  bitrate: {}", config.bitrate);
    info!("  resolution: {}", config.resolution);
    info!("  video mode: {}", config.video_mode);
    info!("  fps: {}", config.fps);
}

/// Apply one command line. Returns false when the reader should exit.
fn dispatch_line(state: &ServerState, line: &str) -> bool {
    let command = match ControlCommand::parse(line) {
        Ok(command) => command,
        Err(err) => {
            error!("bad control message: {err}");
            return true;
        }
    };

    match command {
        ControlCommand::Update { config } => {
            let config = match config.into_config() {
                Ok(config) => config,
                Err(err) => {
                    error!("rejected config update: {err}");
                    return true;
                }
            };
            if let Err(err) = config.validate() {
                error!("rejected config update: {err}");
                return true;
            }
            let version = state.config.publish(config.clone());
            info!("config updated (version {version})");
            dump_config(&config);
            true
        }
        ControlCommand::Stop => {
            info!("stop requested via command channel");
            state.request_stop();
            false
        }
    }
}

/// Blocking reader loop over standard input. Returns when stdin closes or
/// a stop command arrives; either way the process-wide stop flag is set.
pub fn run_command_reader(state: Arc<ServerState>) {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = match line {
            Ok(line) => line,
            Err(err) => {
                error!("command channel read error: {err}");
                break;
            }
        };
        if line.is_empty() {
            continue;
        }
        if !dispatch_line(&state, &line) {
            break;
        }
    }
    state.request_stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use periscope_core::{Codec, Resolution};

    const UPDATE_LINE: &str = r#"{"cmd":"update","config":{"ip":"10.0.31.220","portLeft":8554,"portRight":8556,"codec":"H265","encodingQuality":85,"bitrate":6000000,"horizontalResolution":2560,"verticalResolution":1440,"videoMode":"mono","fps":30}}"#;

    #[test]
    fn update_publishes_and_bumps_version() {
        let state = ServerState::new();
        assert_eq!(state.config.version(), 0);
        assert!(dispatch_line(&state, UPDATE_LINE));

        let (config, version) = state.config.snapshot();
        assert_eq!(version, 1);
        assert_eq!(config.codec, Codec::H265);
        assert_eq!(config.resolution, Resolution::new(2560, 1440));
        assert_eq!(config.fps, 30);
        assert!(!state.stop_requested());
    }

    #[test]
    fn invalid_update_leaves_config_untouched() {
        let state = ServerState::new();
        let bad = UPDATE_LINE.replace("\"H265\"", "\"H266\"");
        assert!(dispatch_line(&state, &bad));
        assert_eq!(state.config.version(), 0);

        // Same ports on both eyes violates the config invariant.
        let bad = UPDATE_LINE.replace("\"portRight\":8556", "\"portRight\":8554");
        assert!(dispatch_line(&state, &bad));
        assert_eq!(state.config.version(), 0);
    }

    #[test]
    fn stop_sets_the_flag_and_ends_the_reader() {
        let state = ServerState::new();
        assert!(!dispatch_line(&state, r#"{"cmd":"stop"}"#));
        assert!(state.stop_requested());
    }

    #[test]
    fn garbage_lines_keep_the_reader_alive() {
        let state = ServerState::new();
        assert!(dispatch_line(&state, "{not json"));
        assert!(dispatch_line(&state, r#"{"cmd":"unknown"}"#));
        assert!(!state.stop_requested());
    }
}
