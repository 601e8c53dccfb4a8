//! Versioned detection catalog
//!
//! Heuristic data for the incumbent profiler: known automation identities,
//! verification-channel naming, access-grant naming and fallback keywords.
//! Serializable so operators can ship an updated table as TOML without a
//! rebuild.

use coex_core::ConfigError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Exact automation identity of a known incumbent provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnownAutomation {
    pub id: String,
    pub provider: String,
    pub confidence: f64,
}

/// Name pattern with a confidence weight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRule {
    /// Regular expression matched against the channel or grant name
    pub pattern: String,
    pub confidence: f64,
    /// Provider the pattern is characteristic of, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl PatternRule {
    fn new(pattern: &str, confidence: f64, provider: Option<&str>) -> Self {
        Self {
            pattern: pattern.to_string(),
            confidence,
            provider: provider.map(str::to_string),
        }
    }
}

/// Catalog as data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionCatalog {
    pub version: u32,
    pub known_automations: Vec<KnownAutomation>,
    pub channel_patterns: Vec<PatternRule>,
    pub grant_patterns: Vec<PatternRule>,
    /// Case-insensitive substrings of automation names that suggest gating
    pub fallback_keywords: Vec<String>,
    pub fallback_confidence: f64,
}

impl Default for DetectionCatalog {
    fn default() -> Self {
        let known = |id: &str, provider: &str| KnownAutomation {
            id: id.to_string(),
            provider: provider.to_string(),
            confidence: 0.95,
        };
        Self {
            version: 1,
            known_automations: vec![
                known("704521096837464076", "collabland"),
                known("879673158287544361", "matrica"),
                known("868172385000509460", "guild.xyz"),
                known("1001937812735729734", "vulcan"),
            ],
            channel_patterns: vec![
                PatternRule::new(r"(?i)collab-?land", 0.8, Some("collabland")),
                PatternRule::new(r"(?i)matrica", 0.8, Some("matrica")),
                PatternRule::new(r"(?i)guild-?(join|verify)", 0.75, Some("guild.xyz")),
                PatternRule::new(r"(?i)^(get-)?verif(y|ication|ied)", 0.7, None),
                PatternRule::new(r"(?i)wallet-?(check|verify|connect)", 0.7, None),
            ],
            grant_patterns: vec![
                PatternRule::new(r"(?i)^holders?$", 0.8, None),
                PatternRule::new(r"(?i)(whale|diamond|og)", 0.6, None),
                PatternRule::new(r"(?i)verified", 0.5, None),
                PatternRule::new(r"(?i)(nft|token)", 0.5, None),
                PatternRule::new(r"(?i)member", 0.3, None),
            ],
            fallback_keywords: ["verify", "gate", "guard", "access", "holder"]
                .iter()
                .map(|k| (*k).to_string())
                .collect(),
            fallback_confidence: 0.25,
        }
    }
}

impl DetectionCatalog {
    /// Parse a catalog from TOML
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load a catalog file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Validate confidences and compile every pattern
    pub fn compile(&self) -> Result<CompiledCatalog, ConfigError> {
        let check = |key: &str, c: f64| {
            if (0.0..=1.0).contains(&c) {
                Ok(())
            } else {
                Err(ConfigError::invalid(key, format!("confidence {c} outside 0..=1")))
            }
        };
        for k in &self.known_automations {
            check("known_automations.confidence", k.confidence)?;
        }
        check("fallback_confidence", self.fallback_confidence)?;

        let compile_rules = |key: &str, rules: &[PatternRule]| {
            rules
                .iter()
                .map(|rule| {
                    check(key, rule.confidence)?;
                    let regex = Regex::new(&rule.pattern)
                        .map_err(|e| ConfigError::invalid(key, e.to_string()))?;
                    Ok(CompiledRule {
                        regex,
                        confidence: rule.confidence,
                        provider: rule.provider.clone(),
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()
        };

        Ok(CompiledCatalog {
            version: self.version,
            known_automations: self.known_automations.clone(),
            channel_rules: compile_rules("channel_patterns", &self.channel_patterns)?,
            grant_rules: compile_rules("grant_patterns", &self.grant_patterns)?,
            fallback_keywords: self
                .fallback_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            fallback_confidence: self.fallback_confidence,
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    regex: Regex,
    pub(crate) confidence: f64,
    pub(crate) provider: Option<String>,
}

impl CompiledRule {
    pub(crate) fn is_match(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

/// Catalog with compiled patterns, ready for matching
#[derive(Debug, Clone)]
pub struct CompiledCatalog {
    version: u32,
    known_automations: Vec<KnownAutomation>,
    channel_rules: Vec<CompiledRule>,
    grant_rules: Vec<CompiledRule>,
    fallback_keywords: Vec<String>,
    fallback_confidence: f64,
}

impl CompiledCatalog {
    #[inline]
    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    /// Known entry for an automation id
    #[must_use]
    pub fn known_automation(&self, id: &str) -> Option<&KnownAutomation> {
        self.known_automations.iter().find(|k| k.id == id)
    }

    /// Highest-confidence channel rule matching `name`
    pub(crate) fn best_channel_rule(&self, name: &str) -> Option<&CompiledRule> {
        best_rule(&self.channel_rules, name)
    }

    /// Confidence that a grant named `name` controls access
    #[must_use]
    pub fn grant_confidence(&self, name: &str) -> Option<f64> {
        best_rule(&self.grant_rules, name).map(|r| r.confidence)
    }

    /// Whether an automation's display name suggests gating
    #[must_use]
    pub fn suggests_gating(&self, automation_name: &str) -> bool {
        let lower = automation_name.to_lowercase();
        self.fallback_keywords.iter().any(|k| lower.contains(k))
    }

    #[inline]
    #[must_use]
    pub fn fallback_confidence(&self) -> f64 {
        self.fallback_confidence
    }
}

fn best_rule<'a>(rules: &'a [CompiledRule], name: &str) -> Option<&'a CompiledRule> {
    rules
        .iter()
        .filter(|r| r.is_match(name))
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}
