//! Coex Engine - coexistence migration engine
//!
//! Moves a community's access control off an incumbent token-gating system
//! in stages without ever leaving members without access:
//!
//! 1. **SHADOW**: observe the incumbent, compute what we would do, never mutate
//! 2. **PARALLEL**: run alongside it on namespaced grants only
//! 3. **PRIMARY**: new system is authoritative, the incumbent is backup
//! 4. **EXCLUSIVE**: incumbent removed; irreversible
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use coex_engine::prelude::*;
//!
//! let ctx = EngineContext::new(store, platform, eligibility, identities, alerts);
//! IncumbentProfiler::new(ctx.clone())?.detect(&community).await?;
//! ShadowLedger::new(ctx.clone()).sync(&community).await?;
//!
//! let control = ControlPlane::new(ctx);
//! let outcome = control
//!     .request_mode_change(&community, MigrationMode::Parallel, MigrationStrategy::Gradual, None, "op")
//!     .await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod catalog;
pub mod context;
pub mod control;
pub mod grants;
pub mod health;
pub mod ledger;
pub mod migration;
pub mod profiler;
pub mod readiness;
pub mod scheduler;
#[cfg(feature = "simulator")]
pub mod simulator;
pub mod strategy;
pub mod tiers;
pub mod watcher;

mod telemetry;

pub use context::EngineContext;
pub use control::{
    AuditRecord, CommunityStatus, ControlPlane, EmergencyOutcome, ModeChangeOutcome,
    PredictionSummary, RollbackOutcome,
};
pub use migration::{MigrationEngine, RollbackApplied, StepOutcome, SYSTEM_ACTOR};
pub use scheduler::{JobFailure, JobKind, JobReport, JobRunner, JobSchedule};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything needed to wire and drive the engine
pub mod prelude {
    pub use crate::catalog::{CompiledCatalog, DetectionCatalog};
    pub use crate::context::EngineContext;
    pub use crate::control::{ControlPlane, EmergencyOutcome, ModeChangeOutcome, RollbackOutcome};
    pub use crate::grants::NamespacedGrantManager;
    pub use crate::health::HealthMonitor;
    pub use crate::ledger::ShadowLedger;
    pub use crate::migration::MigrationEngine;
    pub use crate::profiler::IncumbentProfiler;
    pub use crate::readiness::ReadinessEvaluator;
    pub use crate::scheduler::{JobKind, JobRunner};
    pub use crate::tiers::TierResolver;
    pub use crate::watcher::RollbackWatcher;
    pub use coex_core::{CoexError, CommunityId, MigrationConfig, MigrationMode, MigrationStrategy};
}
