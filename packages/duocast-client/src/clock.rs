//! Clock synchronization against the coordinator.
//!
//! The client periodically pings the server and the server echoes the
//! client timestamp alongside its own, captured at response-write time.
//! Each pong yields a `{latency, offset}` sample; the median offset
//! over the most recent five samples is the authoritative clock skew
//! used to translate server timestamps into local scheduling instants.
//!
//! A missed pong never terminates the sync loop - the estimator keeps
//! serving the last median until fresh samples arrive.

use std::collections::VecDeque;
use std::time::Duration;

/// Number of rapid warm-up pings sent after connecting.
pub const WARMUP_PINGS: u32 = 3;

/// Spacing between warm-up pings.
pub const WARMUP_SPACING: Duration = Duration::from_millis(200);

/// Steady-state ping interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);

/// Samples retained; the median over these is authoritative. Five is
/// robust to a single severe outlier but not two, an accepted
/// precision/complexity trade.
pub const MAX_SAMPLES: usize = 5;

/// One ping/pong measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncSample {
    /// Half-RTT estimate in milliseconds.
    pub latency_ms: f64,
    /// `serverTime - localTime` estimate in milliseconds.
    pub offset_ms: f64,
}

/// Clock-offset estimator over the most recent samples.
#[derive(Debug, Default)]
pub struct ClockSync {
    samples: VecDeque<SyncSample>,
}

impl ClockSync {
    /// Creates an estimator with no samples (offset 0 until warmed up).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one pong.
    ///
    /// `client_sent_ms` is the timestamp the ping carried (echoed back
    /// by the server), `server_ms` the server's write-time clock, and
    /// `client_received_ms` the local clock at pong receipt. No sample
    /// is rejected for outliers; the median filter absorbs them.
    pub fn record(
        &mut self,
        client_sent_ms: u64,
        server_ms: u64,
        client_received_ms: u64,
    ) -> SyncSample {
        let rtt = client_received_ms.saturating_sub(client_sent_ms) as f64;
        let latency_ms = rtt / 2.0;
        let offset_ms = server_ms as f64 - client_sent_ms as f64 - latency_ms;

        let sample = SyncSample {
            latency_ms,
            offset_ms,
        };
        self.samples.push_back(sample);
        while self.samples.len() > MAX_SAMPLES {
            self.samples.pop_front();
        }
        sample
    }

    /// Authoritative clock skew: median offset over the retained
    /// samples, 0 before the first pong.
    #[must_use]
    pub fn offset_ms(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut offsets: Vec<f64> = self.samples.iter().map(|s| s.offset_ms).collect();
        offsets.sort_by(|a, b| a.partial_cmp(b).expect("offsets are finite"));
        let mid = offsets.len() / 2;
        if offsets.len() % 2 == 1 {
            offsets[mid]
        } else {
            (offsets[mid - 1] + offsets[mid]) / 2.0
        }
    }

    /// Most recent half-RTT estimate in milliseconds.
    #[must_use]
    pub fn latency_ms(&self) -> f64 {
        self.samples.back().map(|s| s.latency_ms).unwrap_or(0.0)
    }

    /// Whether at least one pong has been recorded.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        !self.samples.is_empty()
    }

    /// Number of retained samples.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Translates a server wall-clock instant (ms) into the local clock.
    #[must_use]
    pub fn server_time_to_local(&self, server_ms: f64) -> f64 {
        server_ms - self.offset_ms()
    }

    /// Translates a local wall-clock instant (ms) into the server clock.
    #[must_use]
    pub fn local_time_to_server(&self, local_ms: f64) -> f64 {
        local_ms + self.offset_ms()
    }
}
