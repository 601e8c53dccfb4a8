//! Coex Core - shared model of the coexistence migration engine
//!
//! Everything the engine, the store and the tests agree on:
//! - Identifiers, modes, strategies and the per-community aggregate
//! - Shadow records, divergence and prediction history
//! - The mode state-machine table
//! - Configuration (TOML, validated)
//! - Error taxonomy
//! - Collaborator contracts (platform, eligibility, identity, alerts, clock)
//! - Hash-chained audit entries

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod audit;
pub mod clock;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod state_machine;
pub mod types;

pub use audit::{verify_chain, AuditAction, AuditEntry};
pub use clock::{Clock, SystemClock};
pub use collaborators::{
    AlertAction, AlertSeverity, AlertSink, EligibilityProvider, IdentityResolver, OperatorAlert,
    PlatformClient, PlatformReader, PlatformWriter,
};
pub use config::{
    HealthConfig, JobConfig, MigrationConfig, NamespaceConfig, ReadinessConfig,
    ReadinessThresholds, RetryConfig, RolloutConfig, ShadowConfig, WatcherConfig,
};
pub use error::{CoexError, CollaboratorError, ConfigError, InvariantViolation, StoreError};
pub use state_machine::{TransitionError, TransitionKind};
pub use types::*;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
