//! Pure connection state machine, driven by the link supervisor.
//!
//! Transitions:
//!
//! ```text
//! Disconnected --connect--> Connecting --success--> Connected
//! Connecting --failure--> Reconnecting --backoff elapsed--> Connecting
//! Connected --link lost--> Reconnecting
//! Connected --stale--> Degraded --line received--> Connected
//! any --disconnect--> Disconnected          (terminal for the instance)
//! Reconnecting --retries exhausted--> Failed (terminal, reported upward)
//! ```

/// Lifecycle state of one logical link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No connection and none in progress.
    Disconnected,
    /// Connect attempt in progress.
    Connecting,
    /// Link up, telemetry flowing.
    Connected,
    /// Link up but inbound traffic has gone quiet; sends still accepted.
    Degraded,
    /// Link lost or attempt failed; waiting out backoff.
    Reconnecting,
    /// Retry budget exhausted. Terminal: surfaced to callers instead of
    /// retrying silently forever.
    Failed,
}

impl LinkState {
    /// Whether sends are accepted in this state.
    pub fn accepts_sends(self) -> bool {
        matches!(self, Self::Connected | Self::Degraded)
    }
}

/// Tracks state, connect-cycle generation, and consecutive failures for
/// one link instance.
///
/// The generation number keys every scheduled reconnect so superseding the
/// link cancels stale timers deterministically.
#[derive(Debug)]
pub struct LinkStateMachine {
    state: LinkState,
    generation: u64,
    consecutive_failures: u32,
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkStateMachine {
    /// Create a machine in `Disconnected`.
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            generation: 0,
            consecutive_failures: 0,
        }
    }

    /// Current state.
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Current connect-cycle generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Consecutive failures since the last successful connection.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Start a connect cycle; returns the new generation.
    pub fn begin_connect(&mut self) -> u64 {
        self.generation += 1;
        self.state = LinkState::Connecting;
        self.generation
    }

    /// The connect attempt succeeded.
    pub fn on_connected(&mut self) {
        self.state = LinkState::Connected;
        self.consecutive_failures = 0;
    }

    /// The connect attempt failed; returns the updated failure count.
    pub fn on_connect_failed(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.state = LinkState::Reconnecting;
        self.consecutive_failures
    }

    /// An established link dropped; returns the updated failure count.
    pub fn on_link_lost(&mut self) -> u32 {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.state = LinkState::Reconnecting;
        self.consecutive_failures
    }

    /// Inbound traffic went quiet on an established link.
    pub fn on_stale(&mut self) {
        if self.state == LinkState::Connected {
            self.state = LinkState::Degraded;
        }
    }

    /// Inbound traffic resumed on a degraded link.
    pub fn on_recovered(&mut self) {
        if self.state == LinkState::Degraded {
            self.state = LinkState::Connected;
        }
    }

    /// Retry budget exhausted; terminal.
    pub fn on_failed(&mut self) {
        self.state = LinkState::Failed;
    }

    /// Explicit disconnect; terminal for this instance.
    pub fn on_disconnected(&mut self) {
        self.state = LinkState::Disconnected;
    }
}
