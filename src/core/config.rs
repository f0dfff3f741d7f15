//! Externally supplied configuration for the link and safety layers.
//!
//! These are plain value types: the embedding application decides where they
//! come from (settings UI, config file, discovery). Validation happens once,
//! at construction of the component that consumes them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// Which kind of transport carries the telemetry stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// TCP stream, one sentence per line.
    Tcp,
    /// UDP datagrams, one sentence per datagram.
    Udp,
}

/// Options for one logical link.
///
/// Immutable per connection attempt: updating the connection means building a
/// new manager with new options, never mutating these in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Host name or IP address of the telemetry gateway / autopilot.
    pub address: String,
    /// Destination port.
    pub port: u16,
    /// Transport kind for this link.
    pub transport: TransportKind,
}

impl ConnectionOptions {
    /// Create options for a TCP link.
    pub fn tcp(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            transport: TransportKind::Tcp,
        }
    }

    /// Create options for a UDP link.
    pub fn udp(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            transport: TransportKind::Udp,
        }
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::EmptyAddress);
        }
        if self.port == 0 {
            return Err(ConfigError::ZeroPort);
        }
        Ok(())
    }
}

/// Link timing thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTiming {
    /// Give up on a single connect attempt after this long.
    pub connect_timeout: Duration,
    /// No inbound line for this long marks the link `Degraded`.
    pub stale_after: Duration,
    /// No inbound line for this long counts as link loss.
    pub dead_interval: Duration,
}

impl Default for LinkTiming {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            stale_after: Duration::from_secs(5),
            dead_interval: Duration::from_secs(15),
        }
    }
}

/// Safety interlock thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum age of the last vessel-state update before steering
    /// commands are denied with `StaleContext`.
    pub max_context_age: Duration,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_context_age: Duration::from_secs(10),
        }
    }
}

/// Thresholds driving the graceful-degradation state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DegradationThresholds {
    /// A sample with at least this many consecutive failures escalates
    /// the tier immediately (K1).
    pub escalate_failures: u32,
    /// Consecutive healthy samples required before de-escalating one
    /// tier (K2, the hysteresis guard).
    pub recovery_samples: u32,
}

impl Default for DegradationThresholds {
    fn default() -> Self {
        Self {
            escalate_failures: 3,
            recovery_samples: 5,
        }
    }
}

impl DegradationThresholds {
    /// Validate the thresholds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.escalate_failures == 0 || self.recovery_samples == 0 {
            return Err(ConfigError::ZeroThreshold);
        }
        Ok(())
    }
}
