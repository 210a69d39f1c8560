//! Per-eye latency statistics.
//!
//! Every per-frame field is an atomic so the render thread reads without
//! locking; the rolling history has its own mutex. Averaging is computed
//! lazily on demand: duration fields are averaged over the whole history,
//! identity fields (frame id, packet count, absolute timestamps) come from
//! the most recent entry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Mutex;

/// Snapshots kept for averaging.
pub const HISTORY_SIZE: usize = 50;

/// Copyable snapshot of one eye's statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencySnapshot {
    pub prev_timestamp_us: u64,
    pub curr_timestamp_us: u64,
    pub fps: f64,

    // Pipeline stage latencies, microseconds.
    pub camera: u64,
    pub vid_conv: u64,
    pub enc: u64,
    pub rtp_pay: u64,
    pub udp_stream: u64,
    pub rtp_depay: u64,
    pub dec: u64,
    pub queue: u64,
    pub presentation: u64,
    pub total_latency: u64,

    // Absolute probe timestamps, client clock.
    pub rtp_pay_ts: u64,
    pub udp_src_ts: u64,
    pub rtp_depay_ts: u64,
    pub dec_ts: u64,
    pub queue_ts: u64,
    pub frame_ready_ts: u64,

    pub frame_id: u64,
    pub packets_per_frame: u16,
}

/// Thread-safe per-eye statistics with rolling-average support.
#[derive(Debug, Default)]
pub struct StageLatencies {
    pub prev_timestamp_us: AtomicU64,
    pub curr_timestamp_us: AtomicU64,
    fps_bits: AtomicU64,

    pub camera: AtomicU64,
    pub vid_conv: AtomicU64,
    pub enc: AtomicU64,
    pub rtp_pay: AtomicU64,
    pub udp_stream: AtomicU64,
    pub rtp_depay: AtomicU64,
    pub dec: AtomicU64,
    pub queue: AtomicU64,
    pub presentation: AtomicU64,
    pub total_latency: AtomicU64,

    pub rtp_pay_ts: AtomicU64,
    pub udp_src_ts: AtomicU64,
    pub rtp_depay_ts: AtomicU64,
    pub dec_ts: AtomicU64,
    pub queue_ts: AtomicU64,
    pub frame_ready_ts: AtomicU64,

    pub frame_id: AtomicU64,
    pub packets_per_frame: AtomicU16,

    history: Mutex<VecDeque<LatencySnapshot>>,
}

impl StageLatencies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }

    /// Record a decoded-frame arrival and update the FPS estimate.
    pub fn mark_frame_ready(&self, now_us: u64) {
        let prev = self.curr_timestamp_us.load(Ordering::Relaxed);
        self.prev_timestamp_us.store(prev, Ordering::Relaxed);
        self.curr_timestamp_us.store(now_us, Ordering::Relaxed);
        self.frame_ready_ts.store(now_us, Ordering::Relaxed);
        if prev != 0 && now_us > prev {
            self.set_fps(1e6 / (now_us - prev) as f64);
        }
    }

    /// Presentation latency, set by the renderer right before drawing.
    pub fn mark_presented(&self, now_us: u64) {
        let ready = self.frame_ready_ts.load(Ordering::Relaxed);
        if ready != 0 && now_us >= ready {
            self.presentation.store(now_us - ready, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            prev_timestamp_us: self.prev_timestamp_us.load(Ordering::Relaxed),
            curr_timestamp_us: self.curr_timestamp_us.load(Ordering::Relaxed),
            fps: self.fps(),
            camera: self.camera.load(Ordering::Relaxed),
            vid_conv: self.vid_conv.load(Ordering::Relaxed),
            enc: self.enc.load(Ordering::Relaxed),
            rtp_pay: self.rtp_pay.load(Ordering::Relaxed),
            udp_stream: self.udp_stream.load(Ordering::Relaxed),
            rtp_depay: self.rtp_depay.load(Ordering::Relaxed),
            dec: self.dec.load(Ordering::Relaxed),
            queue: self.queue.load(Ordering::Relaxed),
            presentation: self.presentation.load(Ordering::Relaxed),
            total_latency: self.total_latency.load(Ordering::Relaxed),
            rtp_pay_ts: self.rtp_pay_ts.load(Ordering::Relaxed),
            udp_src_ts: self.udp_src_ts.load(Ordering::Relaxed),
            rtp_depay_ts: self.rtp_depay_ts.load(Ordering::Relaxed),
            dec_ts: self.dec_ts.load(Ordering::Relaxed),
            queue_ts: self.queue_ts.load(Ordering::Relaxed),
            frame_ready_ts: self.frame_ready_ts.load(Ordering::Relaxed),
            frame_id: self.frame_id.load(Ordering::Relaxed),
            packets_per_frame: self.packets_per_frame.load(Ordering::Relaxed),
        }
    }

    /// Push the current snapshot into the rolling history. Called once per
    /// frame, after every stage field has been recorded.
    pub fn update_history(&self) {
        let snap = self.snapshot();
        let mut history = match self.history.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        history.push_back(snap);
        while history.len() > HISTORY_SIZE {
            history.pop_front();
        }
    }

    pub fn history_len(&self) -> usize {
        match self.history.lock() {
            Ok(h) => h.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    /// Averaged snapshot over the history. Before any history exists this
    /// is just the live snapshot.
    pub fn averaged_snapshot(&self) -> LatencySnapshot {
        let history = match self.history.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        if history.is_empty() {
            return self.snapshot();
        }

        let count = history.len() as u64;
        let mut avg = LatencySnapshot::default();
        for snap in history.iter() {
            avg.prev_timestamp_us += snap.prev_timestamp_us;
            avg.curr_timestamp_us += snap.curr_timestamp_us;
            avg.fps += snap.fps;
            avg.camera += snap.camera;
            avg.vid_conv += snap.vid_conv;
            avg.enc += snap.enc;
            avg.rtp_pay += snap.rtp_pay;
            avg.udp_stream += snap.udp_stream;
            avg.rtp_depay += snap.rtp_depay;
            avg.dec += snap.dec;
            avg.queue += snap.queue;
            avg.presentation += snap.presentation;
            avg.total_latency += snap.total_latency;
        }
        avg.prev_timestamp_us /= count;
        avg.curr_timestamp_us /= count;
        avg.fps /= count as f64;
        avg.camera /= count;
        avg.vid_conv /= count;
        avg.enc /= count;
        avg.rtp_pay /= count;
        avg.udp_stream /= count;
        avg.rtp_depay /= count;
        avg.dec /= count;
        avg.queue /= count;
        avg.presentation /= count;
        avg.total_latency /= count;

        // Most recent values for the non-averaged fields.
        let latest = history
            .back()
            .copied()
            .unwrap_or_default();
        avg.frame_id = latest.frame_id;
        avg.packets_per_frame = latest.packets_per_frame;
        avg.rtp_pay_ts = latest.rtp_pay_ts;
        avg.udp_src_ts = latest.udp_src_ts;
        avg.rtp_depay_ts = latest.rtp_depay_ts;
        avg.dec_ts = latest.dec_ts;
        avg.queue_ts = latest.queue_ts;
        avg.frame_ready_ts = latest.frame_ready_ts;

        avg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill_frame(stats: &StageLatencies, frame_id: u64, base: u64) {
        stats.frame_id.store(frame_id, Ordering::Relaxed);
        stats.camera.store(base, Ordering::Relaxed);
        stats.vid_conv.store(base + 1, Ordering::Relaxed);
        stats.enc.store(base + 2, Ordering::Relaxed);
        stats.rtp_pay.store(base + 3, Ordering::Relaxed);
        stats.udp_stream.store(base + 4, Ordering::Relaxed);
        stats.rtp_depay.store(base + 5, Ordering::Relaxed);
        stats.dec.store(base + 6, Ordering::Relaxed);
        stats.queue.store(base + 7, Ordering::Relaxed);
        stats
            .total_latency
            .store(8 * base + 28, Ordering::Relaxed);
        stats.update_history();
    }

    #[test]
    fn history_is_bounded_and_positive_once_fed() {
        let stats = StageLatencies::new();
        assert_eq!(stats.history_len(), 0);
        for i in 0..(HISTORY_SIZE + 25) {
            fill_frame(&stats, i as u64, 100);
            assert!(stats.history_len() >= 1);
            assert!(stats.history_len() <= HISTORY_SIZE);
        }
        assert_eq!(stats.history_len(), HISTORY_SIZE);
    }

    #[test]
    fn averaging_covers_durations_and_keeps_latest_identity() {
        let stats = StageLatencies::new();
        fill_frame(&stats, 10, 100);
        fill_frame(&stats, 11, 200);

        let avg = stats.averaged_snapshot();
        assert_eq!(avg.camera, 150);
        assert_eq!(avg.queue, 157);
        assert_eq!(avg.total_latency, (828 + 1628) / 2);
        // Identity fields come from the newest entry, not the average.
        assert_eq!(avg.frame_id, 11);
    }

    #[test]
    fn averaged_snapshot_without_history_is_the_live_one() {
        let stats = StageLatencies::new();
        stats.camera.store(42, Ordering::Relaxed);
        let avg = stats.averaged_snapshot();
        assert_eq!(avg.camera, 42);
    }

    #[test]
    fn fps_tracks_frame_cadence() {
        let stats = StageLatencies::new();
        stats.mark_frame_ready(1_000_000);
        assert_eq!(stats.fps(), 0.0);
        stats.mark_frame_ready(1_016_666);
        assert!((stats.fps() - 60.0).abs() < 0.1);
    }

    #[test]
    fn presentation_is_relative_to_frame_ready() {
        let stats = StageLatencies::new();
        stats.mark_frame_ready(2_000_000);
        stats.mark_presented(2_003_500);
        assert_eq!(stats.presentation.load(Ordering::Relaxed), 3_500);
    }
}
