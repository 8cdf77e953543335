use crate::event::ScalingReason;
use crate::overrides::{OverrideSource, ScalerOverride};
use crate::policy::{StageScalingInfo, StageScalingPolicy};
use strum::Display;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ScalerMode {
    /// Threshold scaler driven by the stage's rolling trackers.
    RuleBased,
    ClassicPid,
    ExperimentalPid,
    RpsPid,
    /// Controller configured entirely by the override document.
    JsonConfig,
}

/// Everything needed to build one stage's pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePlan {
    pub stage: i32,
    pub mode: ScalerMode,
    pub initial_size: i64,
    pub min_size: i64,
    pub max_size: i64,
    pub policy: Option<StageScalingPolicy>,
    pub overrides: Option<ScalerOverride>,
}

/// Decides how a stage is scaled. Returns `None` for stages that are not
/// scaled at all; their events are dropped.
pub fn resolve_stage(
    stage: i32,
    info: Option<&StageScalingInfo>,
    source: &OverrideSource,
) -> Option<StagePlan> {
    let info = info?;
    let policy = info.scaling_policy.as_ref();

    if policy.is_none() && !source.is_present() {
        return None;
    }

    let overrides = source.for_stage(stage);
    let mode = match (overrides, policy) {
        (Some(o), _) => mode_from_override(o),
        (None, Some(p)) => mode_from_policy(p),
        (None, None) => {
            warn!(stage, "Stage has neither a scaling policy nor an override for it");
            return None;
        }
    };

    let (mut min_size, mut max_size) = policy.map(|p| (p.min, p.max)).unwrap_or((0, 0));
    if let Some(o) = overrides {
        if o.min_size > 0 {
            min_size = o.min_size;
        }
        if o.max_size > 0 {
            max_size = o.max_size;
        }
    }

    info!(
        stage,
        %mode,
        min_size,
        max_size,
        initial_size = info.desire_size,
        from_rule = source.is_from_rule(),
        "Resolved stage scaler"
    );

    Some(StagePlan {
        stage,
        mode,
        initial_size: info.desire_size,
        min_size,
        max_size,
        policy: policy.cloned(),
        overrides: overrides.cloned(),
    })
}

fn mode_from_override(overrides: &ScalerOverride) -> ScalerMode {
    if overrides.rps_config.is_some() {
        ScalerMode::RpsPid
    } else if overrides.use_experimental.unwrap_or(false) {
        ScalerMode::ClassicPid
    } else {
        ScalerMode::JsonConfig
    }
}

fn mode_from_policy(policy: &StageScalingPolicy) -> ScalerMode {
    let reasons = policy.reasons();

    if reasons.contains(&ScalingReason::Clutch) {
        ScalerMode::ClassicPid
    } else if reasons.contains(&ScalingReason::ClutchExperimental) {
        ScalerMode::ExperimentalPid
    } else if reasons.contains(&ScalingReason::ClutchRps) {
        ScalerMode::RpsPid
    } else {
        ScalerMode::RuleBased
    }
}
