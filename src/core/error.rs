//! Error types for the helmlink resilience layer.

use thiserror::Error;

/// Errors raised while validating externally supplied configuration.
///
/// Configuration problems are fatal at construction time: no connection
/// attempt is made with invalid options.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// The connection address is empty.
    #[error("connection address is empty")]
    EmptyAddress,

    /// Port 0 is not a routable destination.
    #[error("connection port must be non-zero")]
    ZeroPort,

    /// Retry policy allows zero attempts.
    #[error("retry policy must allow at least one attempt")]
    NoAttempts,

    /// Jitter ratio outside the permitted `0.0..1.0` range.
    #[error("jitter ratio {0} outside 0.0..1.0")]
    JitterOutOfRange(f64),

    /// Backoff multiplier below 1.0 would shrink delays.
    #[error("backoff multiplier {0} must be >= 1.0")]
    MultiplierTooSmall(f64),

    /// Rolling health window cannot be empty.
    #[error("health window capacity must be non-zero")]
    EmptyWindow,

    /// Degradation thresholds of zero would disable hysteresis.
    #[error("degradation thresholds must be non-zero")]
    ZeroThreshold,
}

/// Errors crossing the transport boundary.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection attempt failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// Connection attempt did not complete within the timeout.
    #[error("connect timed out")]
    ConnectTimeout,

    /// Writing a sentence to the wire failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Reading from the wire failed.
    #[error("receive failed: {0}")]
    RecvFailed(#[source] std::io::Error),

    /// The peer closed the stream.
    #[error("stream closed by peer")]
    Closed,
}

/// Errors surfaced by the connection manager.
#[derive(Debug, Error)]
pub enum LinkError {
    /// A send was attempted while the link is not connected.
    #[error("link is not connected")]
    NotConnected,

    /// The link exhausted its retry budget and is in the terminal
    /// `Failed` state.
    #[error("link failed after {attempts} connect attempts")]
    Failed {
        /// Connect attempts made before giving up.
        attempts: u32,
    },

    /// The link was torn down while the operation was in flight.
    #[error("link superseded or shut down")]
    Superseded,

    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid connection options.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Reasons the safety manager denies a command.
///
/// Denials are surfaced immediately and never retried automatically; the
/// caller must resubmit with updated context.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Degradation tier is at or beyond `SafeMode`.
    #[error("link health too degraded for this command")]
    LinkUnhealthy,

    /// An opposing command (disengage) is pending or in flight.
    #[error("conflicting command pending")]
    ConflictingCommand,

    /// Vessel-state context is older than the freshness threshold.
    #[error("vessel context is stale")]
    StaleContext,
}

/// Top-level errors for the pilot link orchestrator.
#[derive(Debug, Error)]
pub enum PilotError {
    /// Link-layer failure.
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The dispatch task has shut down.
    #[error("pilot link is shut down")]
    ShutDown,
}
