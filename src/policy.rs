//! Statically declared scaling policy, as it comes from the job's scheduling
//! info or from a job scaling rule.

use crate::event::ScalingReason;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RollingCount {
    pub count: usize,
    pub of: usize,
}

impl Default for RollingCount {
    fn default() -> Self {
        Self { count: 1, of: 1 }
    }
}

impl RollingCount {
    pub fn normalized(self) -> Self {
        let count = self.count.max(1);

        Self {
            count,
            of: self.of.max(count),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Strategy {
    pub reason: ScalingReason,
    #[serde(default)]
    pub scale_up_above_pct: f64,
    #[serde(default)]
    pub scale_down_below_pct: f64,
    #[serde(default)]
    pub rolling_count: RollingCount,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StageScalingPolicy {
    pub min: i64,
    pub max: i64,
    #[serde(default = "default_step")]
    pub increment: i64,
    #[serde(default = "default_step")]
    pub decrement: i64,
    #[serde(default)]
    pub cooldown_secs: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub allow_autoscale_manager: bool,
    #[serde(default)]
    pub strategies: HashMap<ScalingReason, Strategy>,
}

fn default_step() -> i64 {
    1
}

fn default_enabled() -> bool {
    true
}

impl StageScalingPolicy {
    pub fn strategy(&self, reason: ScalingReason) -> Option<&Strategy> {
        self.strategies.get(&reason)
    }

    /// Reasons declared across all strategies; mode markers live here too.
    pub fn reasons(&self) -> HashSet<ScalingReason> {
        self.strategies.values().map(|s| s.reason).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StageSchedulingInfo {
    pub number_of_instances: i64,
    #[serde(default)]
    pub scaling_policy: Option<StageScalingPolicy>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StageRuleConfig {
    #[serde(default)]
    pub desire_size: Option<i64>,
    #[serde(default)]
    pub scaling_policy: Option<StageScalingPolicy>,
}

/// A job scaling rule; when present it replaces the scheduling info's
/// per-stage policies.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScalerRule {
    pub rule_id: String,
    #[serde(default)]
    pub stages: HashMap<i32, StageRuleConfig>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// What a stage pipeline is built from: the initial size and the policy.
#[derive(Debug, Clone, PartialEq)]
pub struct StageScalingInfo {
    pub desire_size: i64,
    pub scaling_policy: Option<StageScalingPolicy>,
}

/// Collects the per-stage scaling info, preferring the rule's stage configs
/// over the scheduling info when a rule is given.
pub fn stage_scaling_infos(
    scheduling: &HashMap<i32, StageSchedulingInfo>,
    rule: Option<&ScalerRule>,
) -> HashMap<i32, StageScalingInfo> {
    match rule {
        Some(rule) => rule
            .stages
            .iter()
            .map(|(stage, config)| {
                let desire_size = config.desire_size.unwrap_or_else(|| {
                    scheduling
                        .get(stage)
                        .map(|info| info.number_of_instances)
                        .unwrap_or(0)
                });

                (
                    *stage,
                    StageScalingInfo {
                        desire_size,
                        scaling_policy: config.scaling_policy.clone(),
                    },
                )
            })
            .collect(),
        None => scheduling
            .iter()
            .filter(|(_, info)| info.scaling_policy.is_some())
            .map(|(stage, info)| {
                (
                    *stage,
                    StageScalingInfo {
                        desire_size: info.number_of_instances,
                        scaling_policy: info.scaling_policy.clone(),
                    },
                )
            })
            .collect(),
    }
}
