//! Graceful-degradation tier state machine.
//!
//! Escalation is immediate: one offending status moves the tier one step
//! toward [`DegradationTier::Disengaged`]. Recovery is guarded by
//! hysteresis: a configured number of consecutive healthy samples is
//! required per de-escalation step, so a flapping link cannot oscillate the
//! tier.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core::DegradationThresholds;
use crate::monitor::HealthStatus;

/// Discrete health tier gating which commands are permitted.
///
/// Ordered: `Nominal < Reduced < SafeMode < Disengaged`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DegradationTier {
    /// Everything permitted.
    Nominal,
    /// Non-essential features disabled; commands still flow.
    Reduced,
    /// Steering commands denied; disengage still permitted.
    SafeMode,
    /// Worst tier: autopilot is force-disengaged.
    Disengaged,
}

impl DegradationTier {
    /// The next tier toward `Disengaged`, saturating.
    pub fn escalated(self) -> Self {
        match self {
            Self::Nominal => Self::Reduced,
            Self::Reduced => Self::SafeMode,
            Self::SafeMode | Self::Disengaged => Self::Disengaged,
        }
    }

    /// The next tier toward `Nominal`, saturating.
    pub fn recovered(self) -> Self {
        match self {
            Self::Disengaged => Self::SafeMode,
            Self::SafeMode => Self::Reduced,
            Self::Reduced | Self::Nominal => Self::Nominal,
        }
    }
}

/// A tier change produced by [`DegradationController::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierChange {
    /// Tier before the change.
    pub from: DegradationTier,
    /// Tier after the change.
    pub to: DegradationTier,
}

impl TierChange {
    /// Whether this change entered the `Disengaged` tier.
    pub fn entered_disengaged(&self) -> bool {
        self.to == DegradationTier::Disengaged && self.from != DegradationTier::Disengaged
    }
}

/// Single-writer state machine over [`DegradationTier`].
///
/// All updates must flow through one owner (the dispatch task); readers see
/// tier transitions via the pilot's health subscription.
#[derive(Debug)]
pub struct DegradationController {
    thresholds: DegradationThresholds,
    tier: DegradationTier,
    healthy_streak: u32,
}

impl DegradationController {
    /// Create a controller starting at `Nominal`.
    pub fn new(thresholds: DegradationThresholds) -> Self {
        Self {
            thresholds,
            tier: DegradationTier::Nominal,
            healthy_streak: 0,
        }
    }

    /// Current tier.
    pub fn tier(&self) -> DegradationTier {
        self.tier
    }

    /// Consecutive healthy samples seen since the last unhealthy one.
    pub fn healthy_streak(&self) -> u32 {
        self.healthy_streak
    }

    /// Feed one aggregated status; returns a change if the tier moved.
    pub fn observe(&mut self, status: &HealthStatus) -> Option<TierChange> {
        if status.consecutive_failures >= self.thresholds.escalate_failures {
            self.healthy_streak = 0;
            let from = self.tier;
            let to = from.escalated();
            if to != from {
                self.tier = to;
                warn!(?from, ?to, failures = status.consecutive_failures, "degradation tier escalated");
                return Some(TierChange { from, to });
            }
            return None;
        }

        if status.latest_healthy {
            self.healthy_streak = self.healthy_streak.saturating_add(1);
            if self.healthy_streak >= self.thresholds.recovery_samples {
                let from = self.tier;
                let to = from.recovered();
                // Streak restarts per step: Disengaged -> Nominal takes
                // three full recovery windows, never one.
                self.healthy_streak = 0;
                if to != from {
                    self.tier = to;
                    info!(?from, ?to, "degradation tier recovered");
                    return Some(TierChange { from, to });
                }
            }
        } else {
            self.healthy_streak = 0;
        }

        None
    }
}
