//! Server-clock estimation from periodic echo probes.
//!
//! The client sends its local timestamp; the server echoes it back alongside
//! its own clock. From `(echoed_local, remote, now)` we derive the round
//! trip and the server-minus-client offset. All functions take `now`
//! explicitly so the math can be tested without timers; the async shell owns
//! the probe cadence and the reply timeout. A timed-out probe is simply
//! skipped; offset and latency keep their last good values.

use std::collections::VecDeque;

/// How many round-trip samples the ring retains.
pub const RTT_SAMPLE_CAPACITY: usize = 10;
/// Probe cadence.
pub const PROBE_INTERVAL_MS: u64 = 5000;
/// A probe without a reply within this window is abandoned.
pub const PROBE_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Default)]
pub struct ClockSync {
    offset_ms: f64,
    rtt_samples: VecDeque<f64>,
    synced: bool,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one probe reply into the estimate.
    ///
    /// `echoed_local_ms` is the local send time the server echoed back,
    /// `remote_ms` the server clock at reply time, `now_ms` the local clock
    /// at receipt.
    pub fn apply_reply(&mut self, now_ms: u64, echoed_local_ms: u64, remote_ms: u64) {
        let round_trip = now_ms.saturating_sub(echoed_local_ms) as f64;
        self.offset_ms = remote_ms as f64 + round_trip / 2.0 - now_ms as f64;
        self.synced = true;

        self.rtt_samples.push_back(round_trip);
        while self.rtt_samples.len() > RTT_SAMPLE_CAPACITY {
            self.rtt_samples.pop_front();
        }
    }

    /// True once at least one probe has completed.
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Latest server-minus-client offset, milliseconds.
    pub fn offset_ms(&self) -> f64 {
        self.offset_ms
    }

    /// Mean of the retained round-trip samples, milliseconds.
    pub fn average_latency_ms(&self) -> f64 {
        if self.rtt_samples.is_empty() {
            return 0.0;
        }
        self.rtt_samples.iter().sum::<f64>() / self.rtt_samples.len() as f64
    }

    /// Mean absolute difference between consecutive round-trip samples.
    pub fn jitter_ms(&self) -> f64 {
        if self.rtt_samples.len() < 2 {
            return 0.0;
        }
        let diffs: f64 = self
            .rtt_samples
            .iter()
            .zip(self.rtt_samples.iter().skip(1))
            .map(|(a, b)| (b - a).abs())
            .sum();
        diffs / (self.rtt_samples.len() - 1) as f64
    }

    /// Estimated server time for a given local time.
    pub fn remote_time(&self, now_ms: u64) -> u64 {
        let remote = now_ms as f64 + self.offset_ms;
        if remote < 0.0 {
            0
        } else {
            remote as u64
        }
    }
}
