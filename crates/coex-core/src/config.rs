//! Engine configuration
//!
//! All sections deserialize with defaults, so a TOML file only needs the keys
//! it overrides:
//!
//! ```toml
//! [readiness.parallel]
//! min_shadow_days = 7
//!
//! [namespace]
//! prefix = "coex-"
//! tiers = ["Holder", "Whale"]
//! ```

use crate::error::ConfigError;
use crate::types::MigrationMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub readiness: ReadinessConfig,
    pub shadow: ShadowConfig,
    pub namespace: NamespaceConfig,
    pub rollout: RolloutConfig,
    pub health: HealthConfig,
    pub watcher: WatcherConfig,
    pub jobs: JobConfig,
}

impl MigrationConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate TOML
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// With readiness thresholds for PARALLEL
    #[inline]
    #[must_use]
    pub fn with_parallel_readiness(mut self, thresholds: ReadinessThresholds) -> Self {
        self.readiness.parallel = thresholds;
        self
    }

    /// With namespaced grant prefix
    #[inline]
    #[must_use]
    pub fn with_namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.namespace.prefix = prefix.into();
        self
    }

    /// With namespaced tiers
    #[inline]
    #[must_use]
    pub fn with_tiers<I, S>(mut self, tiers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.namespace.tiers = tiers.into_iter().map(Into::into).collect();
        self
    }

    /// Check ranges and internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (mode, t) in [
            (MigrationMode::Parallel, &self.readiness.parallel),
            (MigrationMode::Primary, &self.readiness.primary),
            (MigrationMode::Exclusive, &self.readiness.exclusive),
        ] {
            if !(0.0..=100.0).contains(&t.min_accuracy_percent) {
                return Err(ConfigError::invalid(
                    format!("readiness.{}.min_accuracy_percent", mode.as_str().to_lowercase()),
                    "must be within 0..=100",
                ));
            }
            if t.divergence_window_hours == 0 {
                return Err(ConfigError::invalid(
                    format!("readiness.{}.divergence_window_hours", mode.as_str().to_lowercase()),
                    "must be positive",
                ));
            }
        }
        if self.shadow.concurrency == 0 {
            return Err(ConfigError::invalid("shadow.concurrency", "must be positive"));
        }
        if !(0.0..=1.0).contains(&self.shadow.max_member_failure_ratio) {
            return Err(ConfigError::invalid(
                "shadow.max_member_failure_ratio",
                "must be within 0..=1",
            ));
        }
        if !(0.0..=1.0).contains(&self.shadow.access_grant_min_confidence) {
            return Err(ConfigError::invalid(
                "shadow.access_grant_min_confidence",
                "must be within 0..=1",
            ));
        }
        if self.namespace.prefix.trim().is_empty() {
            return Err(ConfigError::invalid("namespace.prefix", "must not be empty"));
        }
        if self.namespace.tiers.is_empty() {
            return Err(ConfigError::invalid("namespace.tiers", "must list at least one tier"));
        }
        if self.rollout.gradual_initial_percent > 100 || self.rollout.gradual_step_percent > 100 {
            return Err(ConfigError::invalid("rollout", "percentages must be within 0..=100"));
        }
        if self.rollout.gradual_step_percent == 0 {
            return Err(ConfigError::invalid("rollout.gradual_step_percent", "must be positive"));
        }
        if self.health.warning_hours >= self.health.critical_hours {
            return Err(ConfigError::invalid(
                "health.warning_hours",
                "must be below health.critical_hours",
            ));
        }
        if self.watcher.window_minutes == 0 {
            return Err(ConfigError::invalid("watcher.window_minutes", "must be positive"));
        }
        for (key, v) in [
            ("jobs.shadow_sync_interval_mins", self.jobs.shadow_sync_interval_mins),
            ("jobs.parallel_sync_interval_mins", self.jobs.parallel_sync_interval_mins),
            ("jobs.health_check_interval_mins", self.jobs.health_check_interval_mins),
            ("jobs.rollback_watch_interval_mins", self.jobs.rollback_watch_interval_mins),
            ("jobs.timeout_secs", self.jobs.timeout_secs),
        ] {
            if v == 0 {
                return Err(ConfigError::invalid(key, "must be positive"));
            }
        }
        if self.jobs.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("jobs.retry.max_attempts", "must be positive"));
        }
        Ok(())
    }
}

/// Readiness thresholds for one target mode
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadinessThresholds {
    /// Minimum time since SHADOW started
    pub min_shadow_days: u32,
    /// Minimum shadow accuracy
    pub min_accuracy_percent: f64,
    /// Trailing window in which no unresolved divergence may have been detected
    pub divergence_window_hours: u32,
}

impl ReadinessThresholds {
    #[inline]
    #[must_use]
    pub fn new(min_shadow_days: u32, min_accuracy_percent: f64, divergence_window_hours: u32) -> Self {
        Self {
            min_shadow_days,
            min_accuracy_percent,
            divergence_window_hours,
        }
    }
}

/// Per-target readiness profiles
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub parallel: ReadinessThresholds,
    pub primary: ReadinessThresholds,
    pub exclusive: ReadinessThresholds,
}

impl ReadinessConfig {
    /// Thresholds gating entry into `target`
    #[must_use]
    pub fn for_target(&self, target: MigrationMode) -> ReadinessThresholds {
        match target {
            MigrationMode::Shadow | MigrationMode::Parallel => self.parallel,
            MigrationMode::Primary => self.primary,
            MigrationMode::Exclusive => self.exclusive,
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            parallel: ReadinessThresholds::new(14, 95.0, 24),
            primary: ReadinessThresholds::new(21, 98.0, 72),
            exclusive: ReadinessThresholds::new(30, 99.5, 168),
        }
    }
}

/// Shadow ledger tuning
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    /// Members evaluated concurrently
    pub concurrency: usize,
    /// Per-member budget for collaborator calls
    pub member_timeout_secs: u64,
    /// Share of members allowed to fail before the sync is discarded
    pub max_member_failure_ratio: f64,
    /// Suspect grants at or above this confidence count as incumbent access
    pub access_grant_min_confidence: f64,
    /// Pending predictions older than this are judged incorrect
    pub prediction_window_hours: u32,
}

impl ShadowConfig {
    #[inline]
    #[must_use]
    pub fn member_timeout(&self) -> Duration {
        Duration::from_secs(self.member_timeout_secs)
    }
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            concurrency: 16,
            member_timeout_secs: 10,
            max_member_failure_ratio: 0.05,
            access_grant_min_confidence: 0.5,
            prediction_window_hours: 168,
        }
    }
}

/// Reserved namespace for grants owned by the new system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub prefix: String,
    /// Eligibility tiers that get a namespaced grant
    pub tiers: Vec<String>,
}

impl NamespaceConfig {
    /// Namespaced grant name for a tier
    #[inline]
    #[must_use]
    pub fn grant_name(&self, tier: &str) -> String {
        format!("{}{}", self.prefix, tier)
    }

    /// Whether a grant name lives in the namespace
    #[inline]
    #[must_use]
    pub fn contains(&self, grant_name: &str) -> bool {
        grant_name.starts_with(&self.prefix)
    }

    /// Whether a grant name is one the manager creates for a configured tier
    ///
    /// Other prefixed grants may exist on the platform; they are not ours.
    #[must_use]
    pub fn is_managed(&self, grant_name: &str) -> bool {
        self.tiers.iter().any(|tier| self.grant_name(tier) == grant_name)
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            prefix: "coex-".to_string(),
            tiers: vec!["Holder".to_string(), "Member".to_string()],
        }
    }
}

/// GRADUAL rollout pacing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    pub gradual_initial_percent: u8,
    pub gradual_step_percent: u8,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            gradual_initial_percent: 10,
            gradual_step_percent: 10,
        }
    }
}

/// Incumbent health thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub warning_hours: u32,
    pub critical_hours: u32,
    /// At most one alert per community per window
    pub alert_throttle_hours: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            warning_hours: 48,
            critical_hours: 72,
            alert_throttle_hours: 4,
        }
    }
}

/// Rollback watcher thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub window_minutes: u32,
    pub max_access_loss_percent: f64,
    pub max_error_rate_percent: f64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            window_minutes: 60,
            max_access_loss_percent: 5.0,
            max_error_rate_percent: 10.0,
        }
    }
}

/// Job intervals, timeout and retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    pub shadow_sync_interval_mins: u64,
    pub parallel_sync_interval_mins: u64,
    pub health_check_interval_mins: u64,
    pub rollback_watch_interval_mins: u64,
    /// Hard wall-clock budget per attempt
    pub timeout_secs: u64,
    pub retry: RetryConfig,
}

impl JobConfig {
    #[inline]
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            shadow_sync_interval_mins: 6 * 60,
            parallel_sync_interval_mins: 60,
            health_check_interval_mins: 60,
            rollback_watch_interval_mins: 60,
            timeout_secs: 15 * 60,
            retry: RetryConfig::default(),
        }
    }
}

/// Exponential backoff bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_config_is_valid() {
        MigrationConfig::default().validate().unwrap();
    }

    #[test]
    fn only_tier_grants_are_managed() {
        let ns = NamespaceConfig::default();
        assert!(ns.is_managed("coex-Holder"));
        assert!(ns.is_managed("coex-Member"));
        assert!(ns.contains("coex-Legacy"));
        assert!(!ns.is_managed("coex-Legacy"));
        assert!(!ns.is_managed("Holder"));
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let raw = r#"
            [readiness.parallel]
            min_shadow_days = 7
            min_accuracy_percent = 90.0
            divergence_window_hours = 12

            [namespace]
            prefix = "nx-"
            tiers = ["Holder", "Whale"]
        "#;
        let config = MigrationConfig::from_toml_str(raw).unwrap();

        assert_eq!(config.readiness.parallel, ReadinessThresholds::new(7, 90.0, 12));
        assert_eq!(config.readiness.primary, ReadinessConfig::default().primary);
        assert_eq!(config.namespace.grant_name("Whale"), "nx-Whale");
        assert_eq!(config.health, HealthConfig::default());
    }

    #[test]
    fn toml_round_trip() {
        let config = MigrationConfig::default().with_namespace_prefix("rt-");
        let raw = config.to_toml_string().unwrap();
        assert_eq!(MigrationConfig::from_toml_str(&raw).unwrap(), config);
    }

    #[test]
    fn rejects_inverted_health_thresholds() {
        let mut config = MigrationConfig::default();
        config.health.warning_hours = 80;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("health.warning_hours"));
    }

    #[test]
    fn rejects_out_of_range_accuracy() {
        let config = MigrationConfig::default()
            .with_parallel_readiness(ReadinessThresholds::new(14, 120.0, 24));
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_empty_prefix() {
        let config = MigrationConfig::default().with_namespace_prefix("  ");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coex.toml");
        std::fs::write(&path, "[watcher]\nmax_access_loss_percent = 2.5\n").unwrap();

        let config = MigrationConfig::load(&path).unwrap();
        assert_eq!(config.watcher.max_access_loss_percent, 2.5);
        assert_eq!(config.watcher.window_minutes, 60);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = MigrationConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let retry = RetryConfig {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(350));
    }
}
