//! Per-partner connection state for HUD display.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Connection state of an external party (camera server, NTP reference,
/// robot gateway). Failures of one partner never affect another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
    #[default]
    Unknown,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            3 => ConnectionStatus::Failed,
            _ => ConnectionStatus::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionStatus::Unknown => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Connected => 2,
            ConnectionStatus::Failed => 3,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionStatus::Unknown => "unknown",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Failed => "connection lost",
        };
        f.write_str(label)
    }
}

/// Lock-free status cell readable from the render thread.
#[derive(Debug, Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, status: ConnectionStatus) {
        self.0.store(status.as_u8(), Ordering::Relaxed);
    }

    pub fn get(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.0.load(Ordering::Relaxed))
    }
}
