//! Dynamic scaler overrides: JSON documents supplied through a scaling rule's
//! metadata or through a job property, keyed by stage.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fmt::Debug;
use tracing::{debug, error};

/// Metadata key on a scaling rule carrying the override document.
pub const SCALER_CONFIG_KEY: &str = "jobmaster.scaler.config";

/// Job property carrying the override document when no rule provides one.
pub fn scaler_config_property() -> String {
    format!("JOB_PARAM_{}", SCALER_CONFIG_KEY)
}

/// Stage a bare (not stage keyed) override document applies to.
pub const LEGACY_OVERRIDE_STAGE: i32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RpsConfig {
    #[serde(default)]
    pub scale_up_above_pct: Option<f64>,
    #[serde(default)]
    pub scale_down_below_pct: Option<f64>,
    #[serde(default)]
    pub scale_up_multiplier: Option<f64>,
    #[serde(default)]
    pub scale_down_multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalerOverride {
    #[serde(default)]
    pub min_size: i64,
    #[serde(default)]
    pub max_size: i64,
    #[serde(default)]
    pub set_point: Option<f64>,
    #[serde(default)]
    pub rope: Option<(f64, f64)>,
    #[serde(default)]
    pub kp: Option<f64>,
    #[serde(default)]
    pub ki: Option<f64>,
    #[serde(default)]
    pub kd: Option<f64>,
    #[serde(default)]
    pub integral_decay: Option<f64>,
    #[serde(default)]
    pub cooldown_seconds: Option<u64>,
    #[serde(default)]
    pub use_experimental: Option<bool>,
    #[serde(default)]
    pub rps_config: Option<RpsConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum OverrideError {
    #[error("override is neither a stage map nor a single config: {0}")]
    Malformed(#[source] serde_json::Error),
}

/// Decodes an override document. Accepts a `stage -> config` map, or a single
/// config which then only applies to [`LEGACY_OVERRIDE_STAGE`].
pub fn parse_overrides(json: &str) -> Result<HashMap<i32, ScalerOverride>, OverrideError> {
    serde_json::from_str::<HashMap<i32, ScalerOverride>>(json).or_else(|map_error| {
        debug!(error = %map_error, "Override is not a stage map, trying a single config");

        serde_json::from_str::<ScalerOverride>(json)
            .map(|config| {
                let mut configs = HashMap::new();
                configs.insert(LEGACY_OVERRIDE_STAGE, config);
                configs
            })
            .map_err(OverrideError::Malformed)
    })
}

pub trait PropertySource: Send + Sync + Debug {
    fn property(&self, key: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvPropertySource;

impl PropertySource for EnvPropertySource {
    fn property(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapPropertySource(pub HashMap<String, String>);

impl PropertySource for MapPropertySource {
    fn property(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}

/// Where a scaler's override document is looked up. The rule's metadata wins
/// over the property source.
#[derive(Debug, Clone)]
pub struct OverrideSource {
    from_rule: Option<String>,
    overrides: Option<HashMap<i32, ScalerOverride>>,
}

impl OverrideSource {
    pub fn new(rule_metadata: Option<&HashMap<String, String>>, properties: &dyn PropertySource) -> Self {
        let from_rule = rule_metadata.and_then(|m| m.get(SCALER_CONFIG_KEY).cloned());
        let document = from_rule
            .clone()
            .or_else(|| properties.property(&scaler_config_property()));

        let overrides = document.and_then(|json| match parse_overrides(&json) {
            Ok(overrides) => Some(overrides),
            Err(e) => {
                error!(error = %e, document = json.as_str(), "Failed to parse scaler override");
                None
            }
        });

        Self {
            from_rule,
            overrides,
        }
    }

    pub fn none() -> Self {
        Self {
            from_rule: None,
            overrides: None,
        }
    }

    pub fn is_from_rule(&self) -> bool {
        self.from_rule.is_some()
    }

    /// A document was supplied and decoded, regardless of which stages it names.
    pub fn is_present(&self) -> bool {
        self.overrides.is_some()
    }

    pub fn for_stage(&self, stage: i32) -> Option<&ScalerOverride> {
        self.overrides.as_ref().and_then(|o| o.get(&stage))
    }
}
