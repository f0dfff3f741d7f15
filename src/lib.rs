//! # Helmlink
//!
//! Connection resilience and command safety for marine autopilot links.
//!
//! Helmlink sits between an application and an NMEA-speaking autopilot
//! reached over TCP or UDP, and keeps the channel trustworthy when the
//! network is not:
//!
//! - **Resilience**: supervised reconnection with exponential backoff,
//!   staleness detection, and a bounded retry budget
//! - **Safety**: every actuator command is authorized before enqueue and
//!   re-checked at the moment of transmission
//! - **Serialization**: one command in flight at a time, newer steering
//!   inputs supersede older ones, stale commands never reach the wire
//! - **Degradation**: a four-tier health model that sheds capability
//!   gradually and forces an autopilot disengage at the worst tier
//!
//! Sentence parsing and checksum validation are deliberately out of scope:
//! the embedding application parses inbound telemetry and feeds
//! acknowledgments and vessel-context freshness back in.
//!
//! ## Modules
//!
//! - [`core`](crate::core): configuration and error types
//! - [`transport`]: TCP/UDP line transport
//! - [`link`]: connection state machine and reconnect supervisor
//! - [`retry`]: backoff policy and schedule
//! - [`command`]: outbound command queue with supersession
//! - [`safety`]: command authorization interlocks
//! - [`monitor`]: rolling link-health window
//! - [`degrade`]: graceful degradation tiers
//! - [`pilot`]: top-level orchestrator
//!
//! ## Example Usage
//!
//! ```no_run
//! use helmlink::prelude::*;
//! use std::time::{Duration, Instant};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), PilotError> {
//! let mut pilot = PilotLinkBuilder::new(ConnectionOptions::tcp("autopilot.local", 10110))
//!     .ack_timeout(Duration::from_secs(2))
//!     .spawn()?;
//!
//! // The external parser reports fresh vessel state before steering
//! pilot.record_context_update().await?;
//!
//! let outcome = pilot
//!     .submit_command(
//!         CommandCategory::HeadingChange,
//!         "$APHDG,095.0*1C",
//!         Instant::now() + Duration::from_secs(2),
//!     )
//!     .await?;
//! println!("command outcome: {outcome:?}");
//!
//! pilot.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod core;
pub mod degrade;
pub mod link;
pub mod monitor;
pub mod pilot;
pub mod retry;
pub mod safety;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::command::{Command, CommandCategory, CommandOutcome};
    pub use crate::core::{
        ConnectionOptions, DegradationThresholds, DenyReason, LinkError, LinkTiming,
        PilotError, SafetyLimits, TransportKind,
    };
    pub use crate::degrade::{DegradationTier, TierChange};
    pub use crate::link::{LinkEvent, LinkState};
    pub use crate::monitor::HealthStatus;
    pub use crate::pilot::{PilotConfig, PilotLink, PilotLinkBuilder};
    pub use crate::retry::RetryPolicy;
}

// Re-export commonly used items at crate root
pub use crate::command::{CommandCategory, CommandOutcome};
pub use crate::core::{ConnectionOptions, DenyReason, PilotError};
pub use crate::degrade::DegradationTier;
pub use crate::link::LinkState;
pub use crate::pilot::{PilotLink, PilotLinkBuilder};
pub use crate::retry::RetryPolicy;
