#![allow(dead_code)]

use chrono::Duration;
use coex_core::{
    Clock, CommunityId, CommunityMigrationState, EligibilityResult, IncumbentProfile,
    MigrationConfig, MigrationMode, MigrationStrategy, TransitionKind,
};
use coex_engine::ledger::{ShadowLedger, SyncReport};
use coex_engine::profiler::IncumbentProfiler;
use coex_engine::{ControlPlane, EngineContext};
use coex_store::{InMemoryStore, MigrationStore};
use coex_test_utils::{
    collabland_platform, community, t0, test_config, FakeEligibility, FakeIdentities,
    FakePlatform, ManualClock, RecordingAlerts, COLLABLAND_BOT,
};
use std::sync::Arc;

pub struct Harness {
    pub community: CommunityId,
    pub store: Arc<InMemoryStore>,
    pub platform: Arc<FakePlatform>,
    pub eligibility: Arc<FakeEligibility>,
    pub identities: Arc<FakeIdentities>,
    pub alerts: Arc<RecordingAlerts>,
    pub clock: Arc<ManualClock>,
    pub ctx: EngineContext,
}

impl Harness {
    pub fn new(platform: FakePlatform) -> Self {
        Self::with_config(platform, test_config())
    }

    pub fn with_config(platform: FakePlatform, config: MigrationConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let platform = Arc::new(platform);
        let eligibility = Arc::new(FakeEligibility::new());
        let identities = Arc::new(FakeIdentities::new());
        let alerts = Arc::new(RecordingAlerts::new());
        let clock = Arc::new(ManualClock::new(t0()));
        let ctx = EngineContext::new(
            store.clone(),
            platform.clone(),
            eligibility.clone(),
            identities.clone(),
            alerts.clone(),
        )
        .with_clock(clock.clone())
        .with_config(config);
        Self {
            community: community(),
            store,
            platform,
            eligibility,
            identities,
            alerts,
            clock,
            ctx,
        }
    }

    /// Collab.Land community where `holders` members hold `Holder` and are
    /// eligible, all linked
    pub fn aligned(holders: usize) -> Self {
        let c = community();
        let mut platform = collabland_platform(&c, t0());
        for i in 0..holders {
            platform = platform.with_member(&c, &member_name(i), &["Holder"]);
        }
        let h = Self::new(platform);
        for i in 0..holders {
            h.link(&member_name(i), Some("Holder"));
        }
        h
    }

    /// Link `member` to a wallet with the given eligibility tier
    pub fn link(&self, member: &str, tier: Option<&str>) {
        let identity = format!("wallet-{member}");
        self.identities.link(member, &identity);
        self.set_tier(member, tier);
    }

    pub fn set_tier(&self, member: &str, tier: Option<&str>) {
        let result = match tier {
            Some(t) => EligibilityResult::eligible(t, 0.9),
            None => EligibilityResult::ineligible(0.1),
        };
        self.eligibility.set(&format!("wallet-{member}"), result);
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
        self.platform
            .set_activity(&self.community, COLLABLAND_BOT, self.clock.now());
    }

    pub async fn detect(&self) -> Option<IncumbentProfile> {
        IncumbentProfiler::new(self.ctx.clone())
            .unwrap()
            .detect(&self.community)
            .await
            .unwrap()
    }

    pub async fn sync(&self) -> SyncReport {
        ShadowLedger::new(self.ctx.clone())
            .sync(&self.community)
            .await
            .unwrap()
    }

    /// One shadow sync per day for `days` days; returns the last report
    pub async fn shadow_days(&self, days: u32) -> Option<SyncReport> {
        let mut last = None;
        for _ in 0..days {
            self.advance(Duration::days(1));
            last = Some(self.sync().await);
        }
        last
    }

    pub async fn state(&self) -> CommunityMigrationState {
        self.store
            .load_state(&self.community)
            .await
            .unwrap()
            .expect("community is managed")
    }

    /// Walk the stored aggregate up to `target` without side effects
    pub async fn force_mode(&self, target: MigrationMode) {
        let lock = self.store.lock_community(&self.community).await.unwrap();
        let mut state = self.state().await;
        while state.mode() != target {
            let next = match state.mode() {
                MigrationMode::Shadow => MigrationMode::Parallel,
                MigrationMode::Parallel => MigrationMode::Primary,
                MigrationMode::Primary => MigrationMode::Exclusive,
                MigrationMode::Exclusive => panic!("cannot force past EXCLUSIVE"),
            };
            state
                .apply_transition(next, TransitionKind::Escalate, self.now())
                .unwrap();
        }
        state.strategy.get_or_insert(MigrationStrategy::Instant);
        state.rollout_percent = 100;
        self.store.save_state(&state, &lock).await.unwrap();
    }

    pub fn control(&self) -> ControlPlane {
        ControlPlane::new(self.ctx.clone())
    }
}

pub fn member_name(i: usize) -> String {
    format!("m{i:03}")
}
