//! NTP-based wall-clock synchronization.
//!
//! Maintains a smoothed offset between the local clock and a designated
//! reference clock so that timestamps stamped on one device are directly
//! comparable on the other. A dead reference never blocks callers: the
//! adjusted clock simply degrades to the local clock while the offset is
//! stale.

#![forbid(unsafe_code)]

mod packet;
mod sync;

pub use packet::{client_request, parse_response, ServerTimestamps, NTP_PACKET_LEN};
pub use sync::{ClockSync, NtpSample, CYCLE_INTERVAL, FALLBACK_THRESHOLD, MAX_SAMPLE_RTT_US};
