mod rule_based;

use crate::actuator::StageActuator;
use crate::event::{ScalingEvent, ScalingReason};
use crate::policy::StageScalingPolicy;
use crate::toggles::ScalingToggles;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

pub use rule_based::{Decision, RuleBasedScaler};

/// Computes desired sizes for one stage under its policy and forwards the
/// resulting requests to the stage's actuator.
pub struct StageScaler {
    policy: StageScalingPolicy,
    actuator: StageActuator,
    toggles: Arc<dyn ScalingToggles>,
}

impl fmt::Display for StageScaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StageScaler ({} stage {})",
            self.actuator.job_id(),
            self.actuator.stage()
        )
    }
}

impl fmt::Debug for StageScaler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl StageScaler {
    pub fn new(
        policy: StageScalingPolicy,
        actuator: StageActuator,
        toggles: Arc<dyn ScalingToggles>,
    ) -> Self {
        Self {
            policy,
            actuator,
            toggles,
        }
    }

    pub fn policy(&self) -> &StageScalingPolicy {
        &self.policy
    }

    pub fn actuator(&self) -> &StageActuator {
        &self.actuator
    }

    fn stage(&self) -> i32 {
        self.actuator.stage()
    }

    /// Position inside `[min, max]` the event's effective value points at.
    fn interpolated_size(&self, event: &ScalingEvent) -> i64 {
        let fraction = event.effective_value.max(0.0).min(100.0) / 100.0;
        let span = (self.policy.max - self.policy.min) as f64;

        self.policy.min + (span * fraction).round() as i64
    }

    pub fn desired_for_scale_up(&self, increment: i64, current: i64, event: &ScalingEvent) -> i64 {
        if !self.policy.enabled {
            warn!(
                stage = self.stage(),
                increment, "Stage is not scalable, can't increment workers"
            );
            return current;
        }

        if current < 0 || increment < 1 {
            error!(
                stage = self.stage(),
                current, increment, "Current worker count unknown or increment < 1, will not scale up"
            );
            current
        } else if self.policy.allow_autoscale_manager && !self.toggles.is_scale_up_enabled() {
            warn!(stage = self.stage(), "Scale up is disabled for all autoscaling strategies");
            current
        } else if event.reason == ScalingReason::ManagerEvent {
            let desired = self.interpolated_size(event);
            info!(stage = self.stage(), desired, "Manager event scaling up");
            desired
        } else {
            (current + increment).min(self.policy.max)
        }
    }

    pub fn desired_for_scale_down(
        &self,
        decrement: i64,
        current: i64,
        event: &ScalingEvent,
    ) -> i64 {
        if !self.policy.enabled {
            warn!(
                stage = self.stage(),
                decrement, "Stage is not scalable, can't decrement workers"
            );
            return current;
        }

        if current < 0 || decrement < 1 {
            error!(
                stage = self.stage(),
                current, decrement, "Current worker count unknown or decrement < 1, will not scale down"
            );
            current
        } else if self.policy.allow_autoscale_manager && !self.toggles.is_scale_down_enabled() {
            warn!(stage = self.stage(), "Scale down is disabled for all autoscaling strategies");
            current
        } else if event.reason == ScalingReason::ManagerEvent {
            let desired = self.interpolated_size(event);
            info!(stage = self.stage(), desired, "Manager event scaling down");
            desired
        } else {
            (current - decrement).max(self.policy.min)
        }
    }

    pub fn scale_up(&self, current: i64, desired: i64, reason: String) -> bool {
        info!(
            stage = self.stage(),
            "Scaling up from {} to {} due to {}", current, desired, reason
        );

        if self.policy.allow_autoscale_manager && !self.toggles.is_scale_up_enabled() {
            warn!(stage = self.stage(), "Scale up is disabled for all autoscaling strategies");
            return false;
        }

        self.actuator.request_scale(desired, reason)
    }

    pub fn scale_down(&self, current: i64, desired: i64, reason: String) -> bool {
        info!(
            stage = self.stage(),
            "Scaling down from {} to {} due to {}", current, desired, reason
        );

        if self.policy.allow_autoscale_manager && !self.toggles.is_scale_down_enabled() {
            warn!(stage = self.stage(), "Scale down is disabled for all autoscaling strategies");
            return false;
        }

        self.actuator.request_scale(desired, reason)
    }
}
