//! Autopilot command types and the outbound command queue.
//!
//! Commands are small value types; every queued command is wrapped in a
//! [`QueueEntry`] that tracks attempts and status until a terminal outcome
//! is reached and reported to the submitter.

mod queue;

pub use queue::CommandQueue;

use std::time::Instant;

use crate::core::DenyReason;

/// Identifier for one queued command.
pub type EntryId = u64;

/// Category of an autopilot command.
///
/// Categories drive both supersession (one live command per category) and
/// dispatch priority (disengage always precedes steering changes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandCategory {
    /// Release the actuator. Highest priority; always safe.
    Disengage,
    /// Engage the autopilot.
    Engage,
    /// Change the commanded heading.
    HeadingChange,
}

impl CommandCategory {
    /// Dispatch rank; lower dispatches first.
    pub fn priority(self) -> u8 {
        match self {
            Self::Disengage => 0,
            Self::Engage => 1,
            Self::HeadingChange => 2,
        }
    }
}

/// One autopilot command as submitted by the caller.
#[derive(Debug, Clone)]
pub struct Command {
    /// Command category.
    pub category: CommandCategory,
    /// Pre-formatted sentence payload. Wire framing and checksums belong
    /// to the external sentence composer, not this layer.
    pub payload: String,
    /// When the command was created.
    pub created_at: Instant,
    /// Latest instant at which transmission is still meaningful. A command
    /// past its deadline is dropped as `Expired`, never sent stale.
    pub deadline: Instant,
}

impl Command {
    /// Create a command.
    pub fn new(
        category: CommandCategory,
        payload: impl Into<String>,
        created_at: Instant,
        deadline: Instant,
    ) -> Self {
        Self {
            category,
            payload: payload.into(),
            created_at,
            deadline,
        }
    }

    /// Whether the deadline has passed.
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Lifecycle status of a queued command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    /// Waiting for dispatch.
    Pending,
    /// Transmitted, awaiting acknowledgment.
    Sent,
    /// Acknowledged by the device. Terminal.
    Acked,
    /// Retries exhausted or denied at send time. Terminal.
    Rejected,
    /// Deadline passed before transmission. Terminal.
    Expired,
    /// Replaced by a newer command of the same category. Terminal.
    Superseded,
}

impl CommandStatus {
    /// Whether this status ends the entry's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Acked | Self::Rejected | Self::Expired | Self::Superseded
        )
    }
}

/// A command wrapped with queue bookkeeping.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// Queue-assigned identifier.
    pub id: EntryId,
    /// The wrapped command.
    pub command: Command,
    /// Transmission attempts made so far.
    pub attempts: u32,
    /// When the last attempt started.
    pub last_attempt_at: Option<Instant>,
    /// Earliest instant the next attempt may start (retry backoff).
    pub next_attempt_at: Option<Instant>,
    /// Current status.
    pub status: CommandStatus,
}

/// Terminal outcome reported to the submitter of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    /// The device acknowledged the command.
    Acked,
    /// Retries exhausted, or re-authorization failed at send time.
    Rejected,
    /// Deadline passed before transmission.
    Expired,
    /// A newer command of the same category replaced this one.
    Superseded,
    /// The safety manager denied the command before it was queued.
    Denied(DenyReason),
}

impl CommandOutcome {
    /// Map a terminal status to the outcome the submitter sees.
    pub fn from_status(status: CommandStatus) -> Option<Self> {
        match status {
            CommandStatus::Acked => Some(Self::Acked),
            CommandStatus::Rejected => Some(Self::Rejected),
            CommandStatus::Expired => Some(Self::Expired),
            CommandStatus::Superseded => Some(Self::Superseded),
            CommandStatus::Pending | CommandStatus::Sent => None,
        }
    }
}
