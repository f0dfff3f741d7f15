//! Outbound command queue with supersession and priority dispatch.
//!
//! Ordering rules:
//! - FIFO within a category, by enqueue order.
//! - Across categories, lower [`CommandCategory::priority`] dispatches
//!   first: a queued disengage always beats a queued heading change.
//! - At most one command per category is live (`Pending` or `Sent`); a
//!   newer command supersedes the older one the instant it is enqueued.
//!
//! The queue is a plain synchronous structure driven by the dispatch task;
//! all time-dependent decisions take `now` explicitly so tests are
//! deterministic.

use std::time::Instant;

use tracing::debug;

use super::{Command, CommandStatus, EntryId, QueueEntry};

/// Serializes outbound autopilot commands.
#[derive(Debug, Default)]
pub struct CommandQueue {
    entries: Vec<QueueEntry>,
    next_id: EntryId,
}

impl CommandQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a command, superseding any live entry of the same category.
    ///
    /// Returns the new entry's id. The superseded entry (if any) becomes
    /// terminal and will be returned by [`drain_terminal`](Self::drain_terminal).
    pub fn enqueue(&mut self, command: Command, now: Instant) -> EntryId {
        for entry in &mut self.entries {
            if entry.command.category == command.category && !entry.status.is_terminal() {
                debug!(
                    id = entry.id,
                    category = ?entry.command.category,
                    "command superseded by newer submission"
                );
                entry.status = CommandStatus::Superseded;
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(QueueEntry {
            id,
            command,
            attempts: 0,
            last_attempt_at: None,
            next_attempt_at: Some(now),
            status: CommandStatus::Pending,
        });
        id
    }

    /// Whether a disengage command is live (pending or in flight).
    pub fn has_live_disengage(&self) -> bool {
        self.entries.iter().any(|e| {
            e.command.category == super::CommandCategory::Disengage && !e.status.is_terminal()
        })
    }

    /// The entry currently in flight, if any.
    pub fn in_flight(&self) -> Option<&QueueEntry> {
        self.entries
            .iter()
            .find(|e| e.status == CommandStatus::Sent)
    }

    /// Select the next entry for transmission and mark it `Sent`.
    ///
    /// Expired pending entries are marked `Expired` here, at dequeue time,
    /// so a stale command is never handed to the transport. Returns `None`
    /// while another entry is in flight or nothing is ready.
    pub fn begin_send(&mut self, now: Instant) -> Option<QueueEntry> {
        self.expire_pending(now);

        if self.in_flight().is_some() {
            return None;
        }

        let candidate = self
            .entries
            .iter_mut()
            .filter(|e| e.status == CommandStatus::Pending)
            .filter(|e| e.next_attempt_at.is_none_or(|at| at <= now))
            .min_by_key(|e| (e.command.category.priority(), e.id))?;

        candidate.status = CommandStatus::Sent;
        candidate.attempts += 1;
        candidate.last_attempt_at = Some(now);
        candidate.next_attempt_at = None;
        Some(candidate.clone())
    }

    /// Mark pending entries past their deadline as `Expired`.
    ///
    /// Also runs inside [`begin_send`](Self::begin_send); exposed so the
    /// dispatch task can expire entries while the link is down and no
    /// dispatch is possible.
    pub fn expire_pending(&mut self, now: Instant) {
        for entry in &mut self.entries {
            if entry.status == CommandStatus::Pending && entry.command.is_expired(now) {
                debug!(id = entry.id, "command expired before transmission");
                entry.status = CommandStatus::Expired;
            }
        }
    }

    /// Acknowledge the in-flight entry of the given category.
    ///
    /// Returns the entry id and its send instant (for latency measurement).
    pub fn acknowledge(
        &mut self,
        category: super::CommandCategory,
        _now: Instant,
    ) -> Option<(EntryId, Instant)> {
        let entry = self.entries.iter_mut().find(|e| {
            e.status == CommandStatus::Sent && e.command.category == category
        })?;
        // Resolve the send instant before touching status: an ack must
        // never land without a measurable attempt behind it.
        let sent_at = entry.last_attempt_at?;
        entry.status = CommandStatus::Acked;
        Some((entry.id, sent_at))
    }

    /// Record a failed or timed-out attempt for the in-flight entry.
    ///
    /// With `retry_at` the entry returns to `Pending` and waits for its
    /// backoff; without, retries are exhausted and the entry is `Rejected`.
    pub fn attempt_failed(&mut self, id: EntryId, retry_at: Option<Instant>) {
        let Some(entry) = self.entry_mut(id) else {
            return;
        };
        if entry.status != CommandStatus::Sent {
            return;
        }
        match retry_at {
            Some(at) => {
                entry.status = CommandStatus::Pending;
                entry.next_attempt_at = Some(at);
            }
            None => {
                debug!(id, attempts = entry.attempts, "command retries exhausted");
                entry.status = CommandStatus::Rejected;
            }
        }
    }

    /// Reject an entry outright (send-time safety denial).
    pub fn reject(&mut self, id: EntryId) {
        if let Some(entry) = self.entry_mut(id)
            && !entry.status.is_terminal()
        {
            entry.status = CommandStatus::Rejected;
        }
    }

    /// Earliest instant at which the queue needs attention again:
    /// a backoff elapsing or a pending deadline passing.
    pub fn next_wake(&self, now: Instant) -> Option<Instant> {
        self.entries
            .iter()
            .filter(|e| e.status == CommandStatus::Pending)
            .flat_map(|e| {
                let backoff = e.next_attempt_at.filter(|&at| at > now);
                let deadline = Some(e.command.deadline).filter(|&d| d > now);
                [backoff, deadline]
            })
            .flatten()
            .min()
    }

    /// Remove and return all terminal entries so their waiters can be
    /// resolved. Never drops an entry silently.
    pub fn drain_terminal(&mut self) -> Vec<QueueEntry> {
        let mut terminal = Vec::new();
        self.entries.retain(|e| {
            if e.status.is_terminal() {
                terminal.push(e.clone());
                false
            } else {
                true
            }
        });
        terminal
    }

    /// Number of live (non-terminal) entries.
    pub fn live_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !e.status.is_terminal())
            .count()
    }

    fn entry_mut(&mut self, id: EntryId) -> Option<&mut QueueEntry> {
        self.entries.iter_mut().find(|e| e.id == id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::super::{Command, CommandCategory, CommandStatus};
    use super::*;

    fn cmd(category: CommandCategory, now: Instant) -> Command {
        Command::new(category, "PAYLOAD", now, now + Duration::from_secs(5))
    }

    #[test]
    fn test_fifo_dispatch_single_category() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        let first = queue.enqueue(cmd(CommandCategory::HeadingChange, now), now);
        let entry = queue.begin_send(now).unwrap();
        assert_eq!(entry.id, first);
        assert_eq!(entry.attempts, 1);
    }

    #[test]
    fn test_supersession_of_pending_entry() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        let first = queue.enqueue(cmd(CommandCategory::HeadingChange, now), now);
        let second = queue.enqueue(cmd(CommandCategory::HeadingChange, now), now);

        // The newer entry dispatches; the older one is terminal
        let sent = queue.begin_send(now).unwrap();
        assert_eq!(sent.id, second);

        let terminal = queue.drain_terminal();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].id, first);
        assert_eq!(terminal[0].status, CommandStatus::Superseded);
    }

    #[test]
    fn test_supersession_of_in_flight_entry() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        let first = queue.enqueue(cmd(CommandCategory::HeadingChange, now), now);
        queue.begin_send(now).unwrap();

        // Newer command arrives while the first is in flight
        queue.enqueue(cmd(CommandCategory::HeadingChange, now), now);
        let terminal = queue.drain_terminal();
        assert_eq!(terminal[0].id, first);
        assert_eq!(terminal[0].status, CommandStatus::Superseded);
    }

    #[test]
    fn test_disengage_beats_heading_change() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        queue.enqueue(cmd(CommandCategory::HeadingChange, now), now);
        let disengage = queue.enqueue(cmd(CommandCategory::Disengage, now), now);

        let sent = queue.begin_send(now).unwrap();
        assert_eq!(sent.id, disengage);
        assert_eq!(sent.command.category, CommandCategory::Disengage);
    }

    #[test]
    fn test_expired_command_never_sent() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        let command = Command::new(
            CommandCategory::HeadingChange,
            "PAYLOAD",
            now,
            now + Duration::from_millis(10),
        );
        queue.enqueue(command, now);

        let later = now + Duration::from_millis(20);
        assert!(queue.begin_send(later).is_none());

        let terminal = queue.drain_terminal();
        assert_eq!(terminal[0].status, CommandStatus::Expired);
    }

    #[test]
    fn test_one_in_flight_at_a_time() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        queue.enqueue(cmd(CommandCategory::Engage, now), now);
        queue.enqueue(cmd(CommandCategory::HeadingChange, now), now);

        assert!(queue.begin_send(now).is_some());
        assert!(queue.begin_send(now).is_none());
        assert!(queue.in_flight().is_some());
    }

    #[test]
    fn test_acknowledge_in_flight() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        let id = queue.enqueue(cmd(CommandCategory::Engage, now), now);
        queue.begin_send(now).unwrap();

        let later = now + Duration::from_millis(50);
        let (acked, sent_at) = queue.acknowledge(CommandCategory::Engage, later).unwrap();
        assert_eq!(acked, id);
        assert_eq!(sent_at, now);

        let terminal = queue.drain_terminal();
        assert_eq!(terminal[0].status, CommandStatus::Acked);
    }

    #[test]
    fn test_acknowledge_without_sent_entry_changes_nothing() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        // Pending, never dispatched: an ack must not resolve it
        queue.enqueue(cmd(CommandCategory::Engage, now), now);
        assert!(queue.acknowledge(CommandCategory::Engage, now).is_none());

        assert_eq!(queue.live_len(), 1);
        assert!(queue.drain_terminal().is_empty());
    }

    #[test]
    fn test_retry_backoff_respected() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        let id = queue.enqueue(cmd(CommandCategory::Engage, now), now);
        queue.begin_send(now).unwrap();

        let retry_at = now + Duration::from_millis(200);
        queue.attempt_failed(id, Some(retry_at));

        // Backoff not elapsed
        assert!(queue.begin_send(now + Duration::from_millis(100)).is_none());
        // Backoff elapsed
        let entry = queue.begin_send(retry_at).unwrap();
        assert_eq!(entry.id, id);
        assert_eq!(entry.attempts, 2);
    }

    #[test]
    fn test_exhausted_retries_reject() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        let id = queue.enqueue(cmd(CommandCategory::Engage, now), now);
        queue.begin_send(now).unwrap();
        queue.attempt_failed(id, None);

        let terminal = queue.drain_terminal();
        assert_eq!(terminal[0].status, CommandStatus::Rejected);
    }

    #[test]
    fn test_next_wake_tracks_backoff_and_deadline() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        let id = queue.enqueue(cmd(CommandCategory::Engage, now), now);
        queue.begin_send(now).unwrap();
        let retry_at = now + Duration::from_millis(300);
        queue.attempt_failed(id, Some(retry_at));

        assert_eq!(queue.next_wake(now), Some(retry_at));
    }

    #[test]
    fn test_live_disengage_detection() {
        let mut queue = CommandQueue::new();
        let now = Instant::now();

        assert!(!queue.has_live_disengage());
        queue.enqueue(cmd(CommandCategory::Disengage, now), now);
        assert!(queue.has_live_disengage());

        queue.begin_send(now).unwrap();
        assert!(queue.has_live_disengage());

        queue.acknowledge(CommandCategory::Disengage, now).unwrap();
        assert!(!queue.has_live_disengage());
    }
}
