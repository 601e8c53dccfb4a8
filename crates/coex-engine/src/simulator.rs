//! Seeded end-to-end simulation
//!
//! Builds a Collab.Land-gated community on the in-memory collaborators, runs
//! daily shadow syncs while the incumbent slowly catches up with the new
//! system's view, then asks for PARALLEL and runs the first namespaced sync
//! and rollback watch. The same seed always produces the same report.
//!
//! Checked along the way:
//! - zero platform mutations while in SHADOW
//! - accuracy stays within 0..=100
//! - the audit chain verifies at the end

use crate::context::EngineContext;
use crate::control::{ControlPlane, ModeChangeOutcome, PredictionSummary};
use crate::health::HealthMonitor;
use crate::ledger::ShadowLedger;
use crate::profiler::IncumbentProfiler;
use crate::scheduler::{JobKind, JobReport, JobRunner};
use chrono::Duration;
use coex_core::{
    Clock, CoexError, CommunityId, EligibilityResult, MemberId, MigrationMode, MigrationStrategy,
};
use coex_store::InMemoryStore;
use coex_test_utils::{
    collabland_platform, t0, FakeEligibility, FakeIdentities, FakePlatform, ManualClock,
    RecordingAlerts, COLLABLAND_BOT,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

const ACTOR: &str = "simulator";

#[derive(Debug, Clone, Serialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub members: usize,
    /// Days of shadow observation before PARALLEL is requested
    pub days: u32,
    /// Share of members whose wallet actually qualifies
    pub holder_ratio: f64,
    /// Share of members without a linked identity
    pub unlinked_ratio: f64,
    /// Share of members the incumbent has wrong on day zero
    pub initial_drift: f64,
    /// Per-day chance the incumbent fixes a member it has wrong
    pub catch_up_rate: f64,
    /// Per-day chance a member's holdings change
    pub churn_rate: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            members: 200,
            days: 15,
            holder_ratio: 0.6,
            unlinked_ratio: 0.1,
            initial_drift: 0.1,
            catch_up_rate: 0.9,
            churn_rate: 0.0,
        }
    }
}

/// One shadow day
#[derive(Debug, Clone, Serialize)]
pub struct DayStats {
    pub day: u32,
    pub accuracy_percent: f64,
    pub divergences_opened: usize,
    pub divergences_resolved: usize,
    pub readiness_passed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub config: SimulatorConfig,
    pub incumbent: Option<String>,
    pub days: Vec<DayStats>,
    pub shadow_mutations: usize,
    pub mode_change: ModeChangeOutcome,
    pub final_mode: MigrationMode,
    pub predictions: PredictionSummary,
    pub parallel_sync: Option<JobReport>,
    pub rollback_watch: Option<JobReport>,
    pub violations: Vec<String>,
}

impl SimulationReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    #[must_use]
    pub fn final_accuracy(&self) -> Option<f64> {
        self.days.last().map(|d| d.accuracy_percent)
    }
}

/// Ground truth for one simulated member
struct SimMember {
    id: MemberId,
    identity: Option<String>,
    holder: bool,
    incumbent_holder: bool,
}

impl SimMember {
    fn incumbent_grants(&self) -> &'static [&'static str] {
        if self.incumbent_holder {
            &["Holder"]
        } else {
            &[]
        }
    }
}

struct World {
    community: CommunityId,
    platform: Arc<FakePlatform>,
    eligibility: Arc<FakeEligibility>,
    clock: Arc<ManualClock>,
    members: Vec<SimMember>,
}

impl World {
    fn build(config: &SimulatorConfig, rng: &mut StdRng) -> (Self, Arc<FakeIdentities>) {
        let community = CommunityId::from("sim-guild");
        let mut platform = collabland_platform(&community, t0());
        let identities = Arc::new(FakeIdentities::new());
        let eligibility = Arc::new(FakeEligibility::new());

        let mut members = Vec::with_capacity(config.members);
        for i in 0..config.members {
            let holder = rng.gen_bool(config.holder_ratio);
            let drifted = rng.gen_bool(config.initial_drift);
            let linked = !rng.gen_bool(config.unlinked_ratio);
            let member = SimMember {
                id: MemberId::from(format!("m{i:04}").as_str()),
                identity: linked.then(|| format!("wallet-{i:04}")),
                holder,
                incumbent_holder: holder != drifted,
            };
            platform = platform.with_member(&community, member.id.as_str(), member.incumbent_grants());
            members.push(member);
        }

        let world = Self {
            community,
            platform: Arc::new(platform),
            eligibility,
            clock: Arc::new(ManualClock::new(t0())),
            members,
        };
        for member in &world.members {
            if let Some(identity) = &member.identity {
                identities.link(member.id.as_str(), identity);
            }
            world.publish_eligibility(member);
        }
        (world, identities)
    }

    fn publish_eligibility(&self, member: &SimMember) {
        if let Some(identity) = &member.identity {
            let result = if member.holder {
                EligibilityResult::eligible("Holder", 1.0)
            } else {
                EligibilityResult::ineligible(0.0)
            };
            self.eligibility.set(identity, result);
        }
    }

    fn churn(&mut self, rate: f64, rng: &mut StdRng) {
        for i in 0..self.members.len() {
            if rng.gen_bool(rate) {
                self.members[i].holder = !self.members[i].holder;
                self.publish_eligibility(&self.members[i]);
            }
        }
    }

    /// The incumbent fixes some of the members it has wrong
    fn catch_up(&mut self, rate: f64, rng: &mut StdRng) -> usize {
        let mut fixed = 0;
        for member in &mut self.members {
            if member.incumbent_holder != member.holder && rng.gen_bool(rate) {
                member.incumbent_holder = member.holder;
                self.platform
                    .set_member_grants(&self.community, &member.id, member.incumbent_grants());
                fixed += 1;
            }
        }
        fixed
    }
}

/// Run the simulation
pub async fn run_simulator(config: SimulatorConfig) -> Result<SimulationReport, CoexError> {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let (mut world, identities) = World::build(&config, &mut rng);
    let community = world.community.clone();
    let store = Arc::new(InMemoryStore::new());
    let ctx = EngineContext::new(
        store,
        world.platform.clone(),
        world.eligibility.clone(),
        identities,
        Arc::new(RecordingAlerts::new()),
    )
    .with_clock(world.clock.clone());

    let profiler = IncumbentProfiler::new(ctx.clone())?;
    let ledger = ShadowLedger::new(ctx.clone());
    let health = HealthMonitor::new(ctx.clone());
    let control = ControlPlane::new(ctx.clone());
    let jobs = JobRunner::new(ctx.clone());

    let incumbent = profiler.detect(&community).await?.map(|p| p.provider);
    info!(seed = config.seed, members = config.members, ?incumbent, "simulation started");

    let mut violations = Vec::new();
    let mut days = Vec::with_capacity(config.days as usize);
    for day in 1..=config.days {
        world.clock.advance(Duration::days(1));
        world.churn(config.churn_rate, &mut rng);
        world
            .platform
            .set_activity(&community, COLLABLAND_BOT, world.clock.now());

        let sync = ledger.sync(&community).await?;
        health.check(&community).await?;
        if !(0.0..=100.0).contains(&sync.accuracy_percent) {
            violations.push(format!("day {day}: accuracy {} out of range", sync.accuracy_percent));
        }
        let fixed = world.catch_up(config.catch_up_rate, &mut rng);
        debug!(day, accuracy = sync.accuracy_percent, fixed, "shadow day complete");
        days.push(DayStats {
            day,
            accuracy_percent: sync.accuracy_percent,
            divergences_opened: sync.divergences_opened,
            divergences_resolved: sync.divergences_resolved,
            readiness_passed: sync.readiness_passed,
        });
    }

    let shadow_mutations = world.platform.mutation_count();
    if shadow_mutations > 0 {
        violations.push(format!("{shadow_mutations} platform mutations during SHADOW"));
    }
    let predictions = control.prediction_summary(&community).await?;

    let mode_change = control
        .request_mode_change(
            &community,
            MigrationMode::Parallel,
            MigrationStrategy::Instant,
            None,
            ACTOR,
        )
        .await?;

    let (parallel_sync, rollback_watch) = if matches!(mode_change, ModeChangeOutcome::Success { .. }) {
        world.clock.advance(Duration::minutes(10));
        let sync = jobs.run(&community, JobKind::ParallelSync).await.map_err(|f| f.source)?;
        let watch = jobs.run(&community, JobKind::RollbackWatch).await.map_err(|f| f.source)?;
        (Some(sync), Some(watch))
    } else {
        (None, None)
    };

    if let Err(e) = control.audit_trail(&community).await {
        violations.push(format!("audit chain: {e}"));
    }
    let final_mode = control.get_status(&community).await?.mode;
    info!(?final_mode, violations = violations.len(), "simulation finished");

    Ok(SimulationReport {
        config,
        incumbent,
        days,
        shadow_mutations,
        mode_change,
        final_mode,
        predictions,
        parallel_sync,
        rollback_watch,
        violations,
    })
}
