//! Testing utilities for the coexistence migration workspace
//!
//! Recording fakes for every collaborator contract plus shared fixtures.

#![allow(missing_docs)]

pub mod fakes;
pub mod platform;

pub use fakes::{FailingStore, FakeEligibility, FakeIdentities, ManualClock, RecordingAlerts};
pub use platform::{FakePlatform, Mutation};

use chrono::{DateTime, TimeZone, Utc};
use coex_core::{CommunityId, MigrationConfig};

/// Id of the known Collab.Land automation used by fixtures
pub const COLLABLAND_BOT: &str = "704521096837464076";

/// Fixed start of time for tests
#[must_use]
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

#[must_use]
pub fn community() -> CommunityId {
    CommunityId::from("guild-1")
}

/// Default configuration with short intervals and no retry delay
#[must_use]
pub fn test_config() -> MigrationConfig {
    let mut config = MigrationConfig::default();
    config.jobs.retry.base_delay_ms = 1;
    config.jobs.retry.max_delay_ms = 5;
    config.shadow.member_timeout_secs = 2;
    config
}

/// Community gated by Collab.Land with `Holder` as its access grant
///
/// Members are added by the caller.
#[must_use]
pub fn collabland_platform(community: &CommunityId, now: DateTime<Utc>) -> FakePlatform {
    FakePlatform::new()
        .with_automation(community, COLLABLAND_BOT, "Collab.Land", true)
        .with_activity(community, COLLABLAND_BOT, now)
        .with_channel(community, "collabland-join")
        .with_channel(community, "general")
        .with_grant(community, "Holder", 5)
        .with_grant(community, "Moderator", 10)
}
