//! Synchronization loop: periodic sampling, smoothing, fallback.

use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use periscope_core::local_now_us;

use crate::packet::{client_request, parse_response, NTP_PACKET_LEN};

/// Time between sync cycles.
pub const CYCLE_INTERVAL: Duration = Duration::from_secs(2);
/// Samples attempted per cycle.
pub const SAMPLES_PER_CYCLE: usize = 3;
/// Idle time between samples within a cycle.
const SAMPLE_SPACING: Duration = Duration::from_millis(20);
/// Samples with a longer round trip are unreliable and rejected.
pub const MAX_SAMPLE_RTT_US: u64 = 20_000;
/// Failed cycles before switching to the fallback reference.
pub const FALLBACK_THRESHOLD: u32 = 5;
/// EMA smoothing factor.
const ALPHA: f64 = 0.1;

const SOCKET_TIMEOUT: Duration = Duration::from_secs(1);
const STOP_POLL: Duration = Duration::from_millis(100);

/// One accepted NTP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpSample {
    /// `((T2-T1) + (T3-T4)) / 2`, reference minus local.
    pub offset_us: i64,
    /// `(T4-T1) - (T3-T2)`.
    pub rtt_us: u64,
}

impl NtpSample {
    /// Derive a sample from the four exchange timestamps.
    pub fn from_exchange(t1: u64, t2: u64, t3: u64, t4: u64) -> Self {
        let offset_us = (t2.wrapping_sub(t1) as i64 + t3.wrapping_sub(t4) as i64) / 2;
        let rtt_us = t4.saturating_sub(t1).saturating_sub(t3.saturating_sub(t2));
        Self { offset_us, rtt_us }
    }
}

/// Offset state machine, separated from socket I/O so the cycle semantics
/// are testable without a reference server.
#[derive(Debug)]
struct OffsetState {
    smoothed_offset_us: f64,
    has_offset: bool,
    consecutive_failed_cycles: u32,
}

impl OffsetState {
    fn new() -> Self {
        Self {
            smoothed_offset_us: 0.0,
            has_offset: false,
            consecutive_failed_cycles: 0,
        }
    }

    /// Fold one cycle's accepted samples into the smoothed offset. Returns
    /// whether the cycle succeeded.
    fn on_cycle(&mut self, samples: &[NtpSample]) -> bool {
        let Some(best) = samples.iter().min_by_key(|s| s.rtt_us) else {
            self.consecutive_failed_cycles += 1;
            return false;
        };

        if self.has_offset {
            self.smoothed_offset_us =
                ALPHA * best.offset_us as f64 + (1.0 - ALPHA) * self.smoothed_offset_us;
        } else {
            self.smoothed_offset_us = best.offset_us as f64;
            self.has_offset = true;
        }
        self.consecutive_failed_cycles = 0;
        true
    }

    /// Whether this cycle's failure should trigger the fallback switch.
    fn should_fall_back(&self, using_fallback: bool, has_fallback: bool) -> bool {
        !using_fallback && has_fallback && self.consecutive_failed_cycles >= FALLBACK_THRESHOLD
    }

    fn offset_us(&self) -> i64 {
        self.smoothed_offset_us as i64
    }
}

#[derive(Debug, Default)]
struct Shared {
    offset_us: AtomicI64,
    has_offset: AtomicBool,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    using_fallback: AtomicBool,
    last_sync_local_us: AtomicU64,
    stop: AtomicBool,
}

/// Wall-clock synchronizer against an NTP reference.
///
/// Runs its own thread; dropping the handle stops the thread (bounded by
/// the 1-second socket timeout). All accessors are wait-free, so a dead
/// reference never stalls a caller.
pub struct ClockSync {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl ClockSync {
    /// Start the sync loop against `primary`, with an optional fallback
    /// engaged after [`FALLBACK_THRESHOLD`] consecutive failed cycles.
    ///
    /// Server strings may carry an explicit port; port 123 is assumed
    /// otherwise.
    pub fn spawn(primary: impl Into<String>, fallback: Option<String>) -> Self {
        let primary = primary.into();
        info!(
            "clock sync starting against '{}' (fallback: {})",
            primary,
            fallback.as_deref().unwrap_or("none")
        );

        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("ntp-sync".into())
            .spawn(move || run_sync_loop(thread_shared, primary, fallback))
            .ok();

        if handle.is_none() {
            error!("failed to spawn clock sync thread; timestamps stay unadjusted");
        }

        Self { shared, handle }
    }

    /// Smoothed offset in microseconds (reference minus local).
    pub fn offset_us(&self) -> i64 {
        self.shared.offset_us.load(Ordering::Relaxed)
    }

    /// True iff the last cycle produced at least one accepted sample.
    pub fn is_healthy(&self) -> bool {
        self.shared.healthy.load(Ordering::Relaxed)
    }

    pub fn has_offset(&self) -> bool {
        self.shared.has_offset.load(Ordering::Relaxed)
    }

    pub fn using_fallback(&self) -> bool {
        self.shared.using_fallback.load(Ordering::Relaxed)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.shared.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Microseconds since the last successful cycle, by the local clock.
    pub fn time_since_sync_us(&self) -> u64 {
        let last = self.shared.last_sync_local_us.load(Ordering::Relaxed);
        if last == 0 {
            return u64::MAX;
        }
        local_now_us().saturating_sub(last)
    }

    /// Reference-aligned current time. Falls back to the plain local clock
    /// while no offset has been learned.
    pub fn now_us(&self) -> u64 {
        let local = local_now_us();
        local.saturating_add_signed(self.offset_us())
    }
}

impl Drop for ClockSync {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_sync_loop(shared: Arc<Shared>, primary: String, fallback: Option<String>) {
    let mut server = primary.clone();
    let mut state = OffsetState::new();
    let mut reported_failure = false;

    while !shared.stop.load(Ordering::Relaxed) {
        let mut accepted = Vec::with_capacity(SAMPLES_PER_CYCLE);
        for i in 0..SAMPLES_PER_CYCLE {
            if shared.stop.load(Ordering::Relaxed) {
                return;
            }
            match take_sample(&server) {
                Ok(sample) => {
                    debug!(
                        "ntp sample from '{}': offset={}us rtt={}us",
                        server, sample.offset_us, sample.rtt_us
                    );
                    accepted.push(sample);
                }
                Err(err) => {
                    if !reported_failure {
                        error!(
                            "ntp sample against '{}' failed: {err}; \
                             latency measurements may be inaccurate",
                            server
                        );
                        reported_failure = true;
                    }
                }
            }
            if i + 1 < SAMPLES_PER_CYCLE {
                std::thread::sleep(SAMPLE_SPACING);
            }
        }

        let cycle_ok = state.on_cycle(&accepted);
        shared.healthy.store(cycle_ok, Ordering::Relaxed);
        shared
            .consecutive_failures
            .store(state.consecutive_failed_cycles, Ordering::Relaxed);

        if cycle_ok {
            shared.offset_us.store(state.offset_us(), Ordering::Relaxed);
            shared.has_offset.store(true, Ordering::Relaxed);
            shared
                .last_sync_local_us
                .store(local_now_us(), Ordering::Relaxed);
            if reported_failure {
                info!("ntp sync recovered against '{}'", server);
                reported_failure = false;
            }
            debug!("smoothed clock offset: {}us", state.offset_us());
        } else if state.should_fall_back(
            shared.using_fallback.load(Ordering::Relaxed),
            fallback.is_some(),
        ) {
            if let Some(fallback_server) = &fallback {
                warn!(
                    "primary reference '{}' unreachable after {} cycles, \
                     switching to '{}'",
                    server, state.consecutive_failed_cycles, fallback_server
                );
                server = fallback_server.clone();
                state.consecutive_failed_cycles = 0;
                shared.using_fallback.store(true, Ordering::Relaxed);
                shared.consecutive_failures.store(0, Ordering::Relaxed);
                reported_failure = false;
            }
        }

        sleep_with_stop(&shared, CYCLE_INTERVAL);
    }
}

fn sleep_with_stop(shared: &Shared, total: Duration) {
    let mut remaining = total;
    while remaining > Duration::ZERO && !shared.stop.load(Ordering::Relaxed) {
        let step = remaining.min(STOP_POLL);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

/// One request/response exchange. Rejects samples whose round trip exceeds
/// [`MAX_SAMPLE_RTT_US`].
fn take_sample(server: &str) -> std::io::Result<NtpSample> {
    let target = resolve(server)?;
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(SOCKET_TIMEOUT))?;

    let t1 = local_now_us();
    socket.send_to(&client_request(t1), target)?;

    let mut buf = [0u8; NTP_PACKET_LEN];
    let (len, _) = socket.recv_from(&mut buf)?;
    let t4 = local_now_us();

    let stamps = parse_response(&buf[..len])
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;

    let sample = NtpSample::from_exchange(t1, stamps.receive_us, stamps.transmit_us, t4);
    if sample.rtt_us > MAX_SAMPLE_RTT_US {
        return Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("round trip {}us exceeds limit", sample.rtt_us),
        ));
    }
    Ok(sample)
}

fn resolve(server: &str) -> std::io::Result<std::net::SocketAddr> {
    let with_port = if server.contains(':') {
        server.to_string()
    } else {
        format!("{server}:123")
    };
    with_port
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::server_response;

    #[test]
    fn sample_math_matches_the_textbook() {
        // Reference clock 10ms ahead, 4ms symmetric path.
        let t1 = 1_000_000;
        let t2 = 1_012_000; // t1 + 10ms offset + 2ms uplink
        let t3 = 1_012_100;
        let t4 = 1_004_100; // t1 + 4ms path + 100us server hold
        let sample = NtpSample::from_exchange(t1, t2, t3, t4);
        assert_eq!(sample.offset_us, 10_000);
        assert_eq!(sample.rtt_us, 4_000);
    }

    #[test]
    fn negative_offsets_are_preserved() {
        let t1 = 2_000_000;
        let t2 = 1_995_000;
        let t3 = 1_995_000;
        let t4 = 2_000_000;
        let sample = NtpSample::from_exchange(t1, t2, t3, t4);
        assert_eq!(sample.offset_us, -5_000);
        assert_eq!(sample.rtt_us, 0);
    }

    #[test]
    fn first_cycle_sets_offset_directly() {
        let mut state = OffsetState::new();
        assert!(state.on_cycle(&[NtpSample {
            offset_us: 4_000,
            rtt_us: 900,
        }]));
        assert_eq!(state.offset_us(), 4_000);
    }

    #[test]
    fn later_cycles_apply_ema() {
        let mut state = OffsetState::new();
        state.on_cycle(&[NtpSample {
            offset_us: 10_000,
            rtt_us: 500,
        }]);
        state.on_cycle(&[NtpSample {
            offset_us: 20_000,
            rtt_us: 500,
        }]);
        // 0.1 * 20000 + 0.9 * 10000
        assert_eq!(state.offset_us(), 11_000);
    }

    #[test]
    fn best_sample_is_lowest_rtt() {
        let mut state = OffsetState::new();
        state.on_cycle(&[
            NtpSample {
                offset_us: 100,
                rtt_us: 9_000,
            },
            NtpSample {
                offset_us: 7_000,
                rtt_us: 800,
            },
            NtpSample {
                offset_us: -300,
                rtt_us: 15_000,
            },
        ]);
        assert_eq!(state.offset_us(), 7_000);
    }

    #[test]
    fn fallback_engages_after_exactly_five_failed_cycles() {
        let mut state = OffsetState::new();
        for cycle in 1..=4 {
            assert!(!state.on_cycle(&[]));
            assert_eq!(state.consecutive_failed_cycles, cycle);
            assert!(!state.should_fall_back(false, true));
        }
        assert!(!state.on_cycle(&[]));
        assert!(state.should_fall_back(false, true));
        // Never while already on the fallback, never without one configured.
        assert!(!state.should_fall_back(true, true));
        assert!(!state.should_fall_back(false, false));
    }

    #[test]
    fn success_resets_the_failure_counter() {
        let mut state = OffsetState::new();
        for _ in 0..4 {
            state.on_cycle(&[]);
        }
        state.on_cycle(&[NtpSample {
            offset_us: 0,
            rtt_us: 100,
        }]);
        assert_eq!(state.consecutive_failed_cycles, 0);
        state.on_cycle(&[]);
        assert!(!state.should_fall_back(false, true));
    }

    #[test]
    fn loopback_sample_exchange() {
        // Fake reference replying 2500us ahead of the client clock.
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = server.local_addr().unwrap().to_string();
        let responder = std::thread::spawn(move || {
            let mut buf = [0u8; NTP_PACKET_LEN];
            let (len, peer) = server.recv_from(&mut buf).unwrap();
            assert_eq!(len, NTP_PACKET_LEN);
            let request = parse_response(&buf).unwrap();
            let now = request.transmit_us + 2_500;
            let reply = server_response(request.transmit_us, now, now + 10);
            server.send_to(&reply, peer).unwrap();
        });

        let sample = take_sample(&addr).unwrap();
        responder.join().unwrap();

        assert!(sample.rtt_us <= MAX_SAMPLE_RTT_US);
        // Offset should land near 2500us minus half the (tiny) local RTT.
        assert!(
            (sample.offset_us - 2_500).abs() < 2_500,
            "offset {}us",
            sample.offset_us
        );
    }

    #[test]
    fn unreachable_reference_fails_without_blocking_callers() {
        // RFC 5737 TEST-NET address, nothing listens there.
        let sync = ClockSync::spawn("192.0.2.1", None);
        let before = periscope_core::local_now_us();
        let now = sync.now_us();
        assert!(now >= before);
        assert!(!sync.has_offset());
    }
}
