//! Headless telepresence consumer.
//!
//! Builds the receive pipelines, starts the clock synchronizer and the
//! telemetry consumer, asks the camera server to start streaming, and
//! reports averaged latency once per second until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

use periscope_client::gateway::GatewayConsumer;
use periscope_client::{ConnectionBoard, Eye, RestClient, StreamPlayer};
use periscope_clock::ClockSync;
use periscope_core::{ConnectionStatus, StreamingConfig};

#[derive(Debug, Parser)]
#[command(name = "periscope-client", about = "Periscope headset-side consumer")]
struct Args {
    /// Camera server address.
    #[arg(long, default_value = "10.0.31.42")]
    server_ip: String,

    /// This headset's address, sent as the stream destination.
    #[arg(long, default_value = "10.0.31.220")]
    headset_ip: String,

    /// Primary NTP reference (normally the camera server itself).
    #[arg(long)]
    ntp_server: Option<String>,

    /// Fallback NTP reference after repeated failures.
    #[arg(long, default_value = "pool.ntp.org")]
    ntp_fallback: String,

    /// Telemetry gateway port.
    #[arg(long, default_value_t = periscope_core::ports::ROBOT_GATEWAY)]
    gateway_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    periscope_core::init_tracing();
    let args = Args::parse();

    periscope_media::init()?;

    let board = Arc::new(ConnectionBoard::new());

    let ntp_server = args.ntp_server.clone().unwrap_or_else(|| args.server_ip.clone());
    let clock = Arc::new(ClockSync::spawn(ntp_server, Some(args.ntp_fallback.clone())));
    board.ntp_sync.set(ConnectionStatus::Connecting);

    // The telemetry consumer is optional: a failed bind leaves the rest of
    // the client running.
    let gateway = match GatewayConsumer::bind(args.gateway_port) {
        Ok(gateway) => {
            board.robot_gateway.set(ConnectionStatus::Connecting);
            Some(gateway)
        }
        Err(err) => {
            error!("telemetry gateway unavailable: {err}");
            board.robot_gateway.set(ConnectionStatus::Failed);
            None
        }
    };

    let config = StreamingConfig::default();
    let mut player = StreamPlayer::new(Arc::clone(&clock));
    player.configure(&config)?;

    let rest = RestClient::new(&args.server_ip, &args.headset_ip, config)?;
    board.camera_server.set(ConnectionStatus::Connecting);
    match rest.start_stream().await {
        Ok(()) => board.camera_server.set(ConnectionStatus::Connected),
        Err(err) => {
            // Leave the pipelines running; they will wait for media.
            warn!("camera server not reachable yet: {err}");
            board.camera_server.set(ConnectionStatus::Failed);
        }
    }

    let mut report = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
            _ = report.tick() => {
                board.ntp_sync.set(if clock.is_healthy() {
                    ConnectionStatus::Connected
                } else if clock.has_offset() {
                    ConnectionStatus::Failed
                } else {
                    ConnectionStatus::Connecting
                });

                if let Some(gateway) = gateway.as_ref() {
                    board.robot_gateway.set(match gateway.idle_us() {
                        None => ConnectionStatus::Connecting,
                        Some(idle) if idle < 5_000_000 => ConnectionStatus::Connected,
                        Some(_) => ConnectionStatus::Failed,
                    });
                }

                let left = player.averaged(Eye::Left);
                info!(
                    "left eye: {:.1} fps, total {}us (cam {} conv {} enc {} pay {} \
                     net {} depay {} dec {} queue {})",
                    left.fps,
                    left.total_latency,
                    left.camera,
                    left.vid_conv,
                    left.enc,
                    left.rtp_pay,
                    left.udp_stream,
                    left.rtp_depay,
                    left.dec,
                    left.queue,
                );
                info!(
                    "partners: camera {} | ntp {} | robot {}",
                    board.camera_server.get(),
                    board.ntp_sync.get(),
                    board.robot_gateway.get(),
                );
            }
        }
    }

    if let Err(err) = rest.stop_stream().await {
        warn!("stop stream request failed: {err}");
    }
    player.shutdown();
    drop(gateway);
    Ok(())
}
