//! Category policy registry: per-category cooldown, TTL and generation limits.
//!
//! Categories are data, not branching logic: adding a category means adding a row
//! to `BUILTIN_POLICIES` (or to the JSON file named by `INSIGHT_POLICY_FILE`) plus a
//! prompt template. The registry is loaded once at startup and never mutated.
//!
//! A category missing from the registry is rejected as invalid everywhere, so no
//! category can bypass rate limiting by being unknown here.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Duration;
use serde::Deserialize;
use tracing::info;

use crate::insights::errors::InsightError;
use crate::insights::prompts::template_exists;

const HOUR_SECS: i64 = 60 * 60;
const DAY_SECS: i64 = 24 * HOUR_SECS;

/// Immutable configuration for one insight category.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryPolicy {
    pub name: String,
    pub cooldown_period: Duration,
    pub ttl: Duration,
    pub text_max_length: usize,
    pub prompt_template_id: String,
    /// Bundles with fewer data points than this are reported as insufficient.
    pub min_data_points: u32,
    /// Bucket width for confidence-like fields when fingerprinting.
    pub confidence_noise: f64,
    /// Placeholder shown when generation fails. Never empty.
    pub fallback_text: String,
}

/// On-disk / built-in representation. Durations are whole seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    pub cooldown_secs: i64,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
    pub text_max_length: usize,
    pub prompt_template_id: String,
    #[serde(default = "default_min_data_points")]
    pub min_data_points: u32,
    #[serde(default = "default_confidence_noise")]
    pub confidence_noise: f64,
    pub fallback_text: String,
}

fn default_ttl_secs() -> i64 {
    7 * DAY_SECS
}

fn default_min_data_points() -> u32 {
    1
}

fn default_confidence_noise() -> f64 {
    0.05
}

/// (name, cooldown secs, text max length, min data points, fallback)
const BUILTIN_POLICIES: &[(&str, i64, usize, u32, &str)] = &[
    (
        "emotional",
        3 * HOUR_SECS,
        500,
        5,
        "We're still getting a feel for your emotional patterns. Check back soon for a fresh read.",
    ),
    (
        "behavioral",
        6 * HOUR_SECS,
        500,
        10,
        "Your routines are still taking shape in the data. A behavioral insight will appear once there's more to go on.",
    ),
    (
        "social",
        12 * HOUR_SECS,
        500,
        10,
        "We don't have a clear picture of your social rhythms yet. Keep going and we'll surface something soon.",
    ),
    (
        "productivity",
        24 * HOUR_SECS,
        600,
        15,
        "Your productivity insight isn't ready yet. We'll have one once your recent activity settles in.",
    ),
    (
        "growth",
        48 * HOUR_SECS,
        800,
        20,
        "Growth shows up over weeks, not hours. Your next growth insight is on its way.",
    ),
];

impl TryFrom<PolicySpec> for CategoryPolicy {
    type Error = InsightError;

    fn try_from(spec: PolicySpec) -> Result<Self, Self::Error> {
        let name = spec.name.trim().to_lowercase();
        if name.is_empty() {
            return Err(InsightError::Policy("category name cannot be empty".to_string()));
        }
        if spec.cooldown_secs <= 0 {
            return Err(InsightError::Policy(format!(
                "{name}: cooldown_secs must be positive"
            )));
        }
        if spec.ttl_secs <= 0 {
            return Err(InsightError::Policy(format!("{name}: ttl_secs must be positive")));
        }
        if spec.text_max_length == 0 {
            return Err(InsightError::Policy(format!(
                "{name}: text_max_length must be positive"
            )));
        }
        if !(spec.confidence_noise > 0.0 && spec.confidence_noise <= 1.0) {
            return Err(InsightError::Policy(format!(
                "{name}: confidence_noise must be in (0, 1]"
            )));
        }
        if spec.fallback_text.trim().is_empty() {
            return Err(InsightError::Policy(format!(
                "{name}: fallback_text cannot be empty"
            )));
        }
        if !template_exists(&spec.prompt_template_id) {
            return Err(InsightError::Policy(format!(
                "{name}: unknown prompt template '{}'",
                spec.prompt_template_id
            )));
        }

        Ok(CategoryPolicy {
            name,
            cooldown_period: Duration::seconds(spec.cooldown_secs),
            ttl: Duration::seconds(spec.ttl_secs),
            text_max_length: spec.text_max_length,
            prompt_template_id: spec.prompt_template_id,
            min_data_points: spec.min_data_points,
            confidence_noise: spec.confidence_noise,
            fallback_text: spec.fallback_text,
        })
    }
}

/// Static category → policy lookup.
#[derive(Debug, Clone)]
pub struct CategoryPolicyRegistry {
    policies: BTreeMap<String, CategoryPolicy>,
}

impl CategoryPolicyRegistry {
    /// Builds a registry from policy specs, rejecting duplicates and invalid rows.
    pub fn from_specs(specs: Vec<PolicySpec>) -> Result<Self, InsightError> {
        let mut policies = BTreeMap::new();
        for spec in specs {
            let policy = CategoryPolicy::try_from(spec)?;
            if policies.contains_key(&policy.name) {
                return Err(InsightError::Policy(format!(
                    "duplicate category '{}'",
                    policy.name
                )));
            }
            policies.insert(policy.name.clone(), policy);
        }
        if policies.is_empty() {
            return Err(InsightError::Policy(
                "at least one category policy is required".to_string(),
            ));
        }
        Ok(Self { policies })
    }

    /// The built-in policy table.
    pub fn builtin() -> Result<Self, InsightError> {
        let specs = BUILTIN_POLICIES
            .iter()
            .map(|(name, cooldown_secs, max_len, min_points, fallback)| PolicySpec {
                name: name.to_string(),
                cooldown_secs: *cooldown_secs,
                ttl_secs: default_ttl_secs(),
                text_max_length: *max_len,
                prompt_template_id: format!("insight.{name}.v1"),
                min_data_points: *min_points,
                confidence_noise: default_confidence_noise(),
                fallback_text: fallback.to_string(),
            })
            .collect();

        Self::from_specs(specs)
    }

    /// Parses a JSON array of policy specs.
    pub fn from_json_str(json: &str) -> Result<Self, InsightError> {
        let specs: Vec<PolicySpec> = serde_json::from_str(json)
            .map_err(|e| InsightError::Policy(format!("invalid policy JSON: {e}")))?;
        Self::from_specs(specs)
    }

    /// Loads the registry from `path` if given, otherwise the built-in table.
    pub fn load(path: Option<&Path>) -> Result<Self, InsightError> {
        let registry = match path {
            Some(path) => {
                let json = std::fs::read_to_string(path).map_err(|e| {
                    InsightError::Policy(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_json_str(&json)?
            }
            None => Self::builtin()?,
        };

        info!(
            "Loaded {} insight category policies: {}",
            registry.policies.len(),
            registry.categories().collect::<Vec<_>>().join(", ")
        );
        Ok(registry)
    }

    pub fn get(&self, category: &str) -> Option<&CategoryPolicy> {
        self.policies.get(category)
    }

    /// Category names in stable (sorted) order.
    pub fn categories(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }

    pub fn policies(&self) -> impl Iterator<Item = &CategoryPolicy> {
        self.policies.values()
    }
}
