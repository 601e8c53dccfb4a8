//! Incumbent profiler
//!
//! Runs once per community (and on demand afterwards) to find the external
//! system currently controlling access. Tiers are tried in order and the first
//! positive tier wins:
//!
//! 1. Known automation identity present in the community
//! 2. Channels named like a verification flow
//! 3. Grants named like access tiers
//! 4. Any automation whose name suggests gating

use crate::catalog::{CompiledCatalog, DetectionCatalog};
use crate::context::EngineContext;
use coex_core::{
    Automation, AutomationId, Channel, CoexError, CommunityId, CommunityMigrationState,
    DetectionTier, Grant, HealthStatus, IncumbentProfile,
};
use std::collections::BTreeMap;
use tracing::{debug, info};

const UNKNOWN_PROVIDER: &str = "unknown";

/// What the heuristics found, before it is merged with any stored profile
#[derive(Debug, Clone, PartialEq)]
struct Detection {
    provider: String,
    confidence: f64,
    tier: DetectionTier,
    automation: Option<AutomationId>,
    alternates: Vec<String>,
}

pub struct IncumbentProfiler {
    ctx: EngineContext,
    catalog: CompiledCatalog,
}

impl IncumbentProfiler {
    /// Profiler with the built-in catalog
    pub fn new(ctx: EngineContext) -> Result<Self, CoexError> {
        Self::with_catalog(ctx, &DetectionCatalog::default())
    }

    pub fn with_catalog(ctx: EngineContext, catalog: &DetectionCatalog) -> Result<Self, CoexError> {
        Ok(Self {
            ctx,
            catalog: catalog.compile()?,
        })
    }

    /// Detect the incumbent, persist the profile and make sure the community
    /// has a migration state
    ///
    /// Returns `None` when nothing controls access; the community is then
    /// eligible for direct takeover.
    pub async fn detect(&self, community: &CommunityId) -> Result<Option<IncumbentProfile>, CoexError> {
        let automations = self.ctx.reader.list_automations(community).await?;
        let channels = self.ctx.reader.list_channels(community).await?;
        let grants = self.ctx.reader.list_grants(community).await?;
        let now = self.ctx.now();

        let suspect_grants = self.suspect_grants(&grants);
        let monitored_channels = self.monitored_channels(&channels);
        let detection = self
            .by_known_automation(&automations)
            .or_else(|| self.by_channels(&channels))
            .or_else(|| by_grants(&suspect_grants))
            .or_else(|| self.by_fallback(&automations));

        self.ensure_state(community).await?;

        let Some(detection) = detection else {
            info!(community = %community, "no incumbent detected");
            return Ok(None);
        };

        let previous = self.ctx.store.load_profile(community).await?;
        let profile = IncumbentProfile {
            community_id: community.clone(),
            provider: detection.provider,
            confidence: detection.confidence,
            detection_tier: detection.tier,
            automation_identity: detection.automation,
            monitored_channels,
            suspect_grants,
            alternates: detection.alternates,
            catalog_version: self.catalog.version(),
            detected_at: previous.as_ref().map_or(now, |p| p.detected_at),
            health_status: previous
                .as_ref()
                .map_or(HealthStatus::Unknown, |p| p.health_status),
            last_health_check_at: previous.as_ref().and_then(|p| p.last_health_check_at),
        };
        self.ctx.store.save_profile(&profile).await?;

        info!(
            community = %community,
            provider = %profile.provider,
            confidence = profile.confidence,
            tier = ?profile.detection_tier,
            "incumbent detected"
        );
        Ok(Some(profile))
    }

    async fn ensure_state(&self, community: &CommunityId) -> Result<(), CoexError> {
        let lock = self.ctx.store.lock_community(community).await?;
        if self.ctx.store.load_state(community).await?.is_none() {
            let state = CommunityMigrationState::new(community.clone(), self.ctx.now());
            self.ctx.store.save_state(&state, &lock).await?;
            info!(community = %community, "community enrolled in SHADOW");
        }
        Ok(())
    }

    fn suspect_grants(&self, grants: &[Grant]) -> BTreeMap<String, f64> {
        let namespace = &self.ctx.config.namespace;
        grants
            .iter()
            .filter(|g| !namespace.contains(&g.name))
            .filter_map(|g| {
                self.catalog
                    .grant_confidence(&g.name)
                    .map(|c| (g.name.clone(), c))
            })
            .collect()
    }

    fn monitored_channels(&self, channels: &[Channel]) -> Vec<String> {
        channels
            .iter()
            .filter(|c| self.catalog.best_channel_rule(&c.name).is_some())
            .map(|c| c.name.clone())
            .collect()
    }

    fn by_known_automation(&self, automations: &[Automation]) -> Option<Detection> {
        let mut found: Vec<_> = automations
            .iter()
            .filter_map(|a| {
                self.catalog
                    .known_automation(a.id.as_str())
                    .map(|known| (a, known))
            })
            .collect();
        found.sort_by(|a, b| b.1.confidence.total_cmp(&a.1.confidence));

        let mut found = found.into_iter();
        let (automation, known) = found.next()?;
        let alternates: Vec<String> = found.map(|(_, k)| k.provider.clone()).collect();
        if !alternates.is_empty() {
            debug!(winner = %known.provider, ?alternates, "several known automations present");
        }
        Some(Detection {
            provider: known.provider.clone(),
            confidence: known.confidence,
            tier: DetectionTier::KnownAutomation,
            automation: Some(automation.id.clone()),
            alternates,
        })
    }

    fn by_channels(&self, channels: &[Channel]) -> Option<Detection> {
        let best = channels
            .iter()
            .filter_map(|c| self.catalog.best_channel_rule(&c.name))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence))?;
        Some(Detection {
            provider: best
                .provider
                .clone()
                .unwrap_or_else(|| UNKNOWN_PROVIDER.to_string()),
            confidence: best.confidence,
            tier: DetectionTier::ChannelPattern,
            automation: None,
            alternates: Vec::new(),
        })
    }

    fn by_fallback(&self, automations: &[Automation]) -> Option<Detection> {
        let automation = automations
            .iter()
            .find(|a| self.catalog.suggests_gating(&a.name))?;
        Some(Detection {
            provider: UNKNOWN_PROVIDER.to_string(),
            confidence: self.catalog.fallback_confidence(),
            tier: DetectionTier::Fallback,
            automation: Some(automation.id.clone()),
            alternates: Vec::new(),
        })
    }
}

fn by_grants(suspect: &BTreeMap<String, f64>) -> Option<Detection> {
    let confidence = suspect.values().copied().max_by(f64::total_cmp)?;
    Some(Detection {
        provider: UNKNOWN_PROVIDER.to_string(),
        confidence,
        tier: DetectionTier::GrantPattern,
        automation: None,
        alternates: Vec::new(),
    })
}
