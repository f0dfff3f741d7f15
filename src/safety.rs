//! Safety interlocks evaluated before any actuator command is queued or sent.
//!
//! Authorization is advisory for the moment of check: the dispatch task runs
//! it once at enqueue and again immediately before each transmission
//! attempt, so a health downgrade between approval and send can never let a
//! stale approval reach the wire.

use std::time::Instant;

use tracing::warn;

use crate::command::CommandCategory;
use crate::core::{DenyReason, SafetyLimits};
use crate::degrade::DegradationTier;

/// Evaluates preconditions for autopilot commands.
#[derive(Debug)]
pub struct SafetyManager {
    limits: SafetyLimits,
    last_context_update: Option<Instant>,
}

impl SafetyManager {
    /// Create a safety manager with the given limits.
    pub fn new(limits: SafetyLimits) -> Self {
        Self {
            limits,
            last_context_update: None,
        }
    }

    /// Record that fresh vessel-state context arrived (position, heading,
    /// speed — parsed by the external collaborator).
    pub fn record_context_update(&mut self, at: Instant) {
        self.last_context_update = Some(at);
    }

    /// When the vessel context was last refreshed.
    pub fn last_context_update(&self) -> Option<Instant> {
        self.last_context_update
    }

    /// Authorize a command against current health and queue state.
    ///
    /// `disengage_live` reports whether a disengage command is pending or
    /// in flight; it blocks any command that would counteract it.
    ///
    /// Disengage itself is exempt from the link-health and context checks:
    /// releasing the actuator must stay possible on a sick link.
    pub fn authorize(
        &self,
        category: CommandCategory,
        tier: DegradationTier,
        disengage_live: bool,
        now: Instant,
    ) -> Result<(), DenyReason> {
        if category == CommandCategory::Disengage {
            return Ok(());
        }

        if disengage_live {
            warn!(?category, "denied: disengage pending");
            return Err(DenyReason::ConflictingCommand);
        }

        if tier >= DegradationTier::SafeMode {
            warn!(?category, ?tier, "denied: link health");
            return Err(DenyReason::LinkUnhealthy);
        }

        let fresh = self
            .last_context_update
            .is_some_and(|at| now.duration_since(at) <= self.limits.max_context_age);
        if !fresh {
            warn!(?category, "denied: vessel context stale");
            return Err(DenyReason::StaleContext);
        }

        Ok(())
    }
}
