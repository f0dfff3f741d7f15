//! Core configuration and error types shared by every layer.

mod config;
mod error;

pub use config::{
    ConnectionOptions, DegradationThresholds, LinkTiming, SafetyLimits, TransportKind,
};
pub use error::{ConfigError, DenyReason, LinkError, PilotError, TransportError};
