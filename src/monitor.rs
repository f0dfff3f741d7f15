//! Rolling health aggregation for the link.
//!
//! The monitor owns a bounded window of [`HealthSample`]s; the oldest sample
//! is evicted on insert so memory use is fixed. Aggregation is pure: the only
//! side effect of [`Monitor::record`] is updating the window.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::core::ConfigError;

/// One observation of link health.
#[derive(Debug, Clone, Copy)]
pub struct HealthSample {
    /// When the sample was taken.
    pub at: Instant,
    /// Whether the link was up at sample time.
    pub link_up: bool,
    /// Consecutive failures observed at sample time (connect attempts or
    /// command timeouts, whichever source produced the sample).
    pub consecutive_failures: u32,
    /// Acknowledgment latency, when the sample came from a command ack.
    pub ack_latency: Option<Duration>,
}

impl HealthSample {
    /// A sample representing a healthy link with no backlog of failures.
    pub fn healthy(at: Instant) -> Self {
        Self {
            at,
            link_up: true,
            consecutive_failures: 0,
            ack_latency: None,
        }
    }

    /// A sample representing a down link.
    pub fn link_down(at: Instant, consecutive_failures: u32) -> Self {
        Self {
            at,
            link_up: false,
            consecutive_failures,
            ack_latency: None,
        }
    }

    /// Whether this sample counts toward de-escalation hysteresis.
    pub fn is_healthy(&self) -> bool {
        self.link_up && self.consecutive_failures == 0
    }
}

/// Aggregated view over the rolling window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthStatus {
    /// Fraction of window samples with the link up, in `0.0..=1.0`.
    pub uptime_ratio: f64,
    /// Mean ack latency over samples that carried one.
    pub avg_ack_latency: Option<Duration>,
    /// Consecutive failures from the most recent sample.
    pub consecutive_failures: u32,
    /// Whether the most recent sample was healthy.
    pub latest_healthy: bool,
}

impl HealthStatus {
    /// Status for an empty window: optimistic defaults before any sample.
    pub fn empty() -> Self {
        Self {
            uptime_ratio: 1.0,
            avg_ack_latency: None,
            consecutive_failures: 0,
            latest_healthy: true,
        }
    }
}

/// Bounded rolling window of health samples.
#[derive(Debug)]
pub struct Monitor {
    samples: VecDeque<HealthSample>,
    capacity: usize,
}

impl Monitor {
    /// Create a monitor with the given window capacity.
    pub fn new(capacity: usize) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::EmptyWindow);
        }
        Ok(Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Record a sample, evicting the oldest if the window is full.
    pub fn record(&mut self, sample: HealthSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the window is empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Aggregate the current window.
    pub fn status(&self) -> HealthStatus {
        let Some(latest) = self.samples.back() else {
            return HealthStatus::empty();
        };

        let up = self.samples.iter().filter(|s| s.link_up).count();
        let uptime_ratio = up as f64 / self.samples.len() as f64;

        let latencies: Vec<Duration> =
            self.samples.iter().filter_map(|s| s.ack_latency).collect();
        let avg_ack_latency = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<Duration>() / latencies.len() as u32)
        };

        HealthStatus {
            uptime_ratio,
            avg_ack_latency,
            consecutive_failures: latest.consecutive_failures,
            latest_healthy: latest.is_healthy(),
        }
    }
}
