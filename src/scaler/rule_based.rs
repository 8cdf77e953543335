use super::StageScaler;
use crate::clock::{secs_to_millis, Clock};
use crate::event::{ScalingEvent, ScalingReason};
use crate::tracker::RollingThresholdTracker;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of feeding one event to a [`RuleBasedScaler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Policy disabled or no strategy declared for the event's reason.
    Ignored,
    CoolingDown,
    NoChange,
    ScaledUp { from: i64, to: i64 },
    ScaledDown { from: i64, to: i64 },
    /// A size change was computed but the actuator refused to dispatch it.
    NotDispatched,
}

/// Threshold scaler: per-reason rolling trackers gated by a cooldown. The
/// cooldown is stamped on the stage's actuator and outlives the scaler.
#[derive(Debug)]
pub struct RuleBasedScaler {
    scaler: StageScaler,
    clock: Arc<dyn Clock>,
    trackers: HashMap<ScalingReason, RollingThresholdTracker>,
}

impl RuleBasedScaler {
    pub fn new(scaler: StageScaler, clock: Arc<dyn Clock>) -> Self {
        Self {
            scaler,
            clock,
            trackers: HashMap::new(),
        }
    }

    pub fn last_scaled_at_millis(&self) -> Option<i64> {
        self.scaler.actuator().last_scaled_at_millis()
    }

    fn cooldown_elapsed(&self) -> bool {
        let cooldown_millis = secs_to_millis(self.scaler.policy().cooldown_secs);
        self.last_scaled_at_millis()
            .map_or(true, |last| self.clock.now_millis().saturating_sub(last) >= cooldown_millis)
    }

    pub fn on_event(&mut self, event: &ScalingEvent) -> Decision {
        let policy = self.scaler.policy();
        if !policy.enabled {
            debug!(%event, "Scaling policy disabled, dropping event");
            return Decision::Ignored;
        }

        let strategy = match policy.strategy(event.reason) {
            Some(strategy) => strategy,
            None => {
                debug!(%event, "No strategy for reason, dropping event");
                return Decision::Ignored;
            }
        };
        let (up_pct, down_pct) = (strategy.scale_up_above_pct, strategy.scale_down_below_pct);
        let (increment, decrement) = (policy.increment, policy.decrement);

        let tracker = self.trackers.entry(event.reason).or_insert_with(|| {
            RollingThresholdTracker::new(up_pct, down_pct, strategy.rolling_count)
        });
        tracker.add(event.effective_value);
        let (high, low) = (tracker.high_thresh_triggered(), tracker.low_thresh_triggered());

        if !self.cooldown_elapsed() {
            debug!(%event, "Cooldown not elapsed, skipping decision");
            return Decision::CoolingDown;
        }

        let current = event.current_worker_count;
        if high {
            let desired = self.scaler.desired_for_scale_up(increment, current, event);
            if desired > current {
                let reason = format!(
                    "{} with value {:5.2} exceeded scaleUp threshold of {:3.1}",
                    event.reason, event.effective_value, up_pct
                );
                return self.dispatch(self.scaler.scale_up(current, desired, reason), || {
                    Decision::ScaledUp {
                        from: current,
                        to: desired,
                    }
                });
            }
            debug!(current, desired, "Already at desired size, not scaling up");
        } else if low {
            let desired = self.scaler.desired_for_scale_down(decrement, current, event);
            if desired < current {
                let reason = format!(
                    "{} with value {:5.2} is below scaleDown threshold of {:3.1}",
                    event.reason, event.effective_value, down_pct
                );
                return self.dispatch(self.scaler.scale_down(current, desired, reason), || {
                    Decision::ScaledDown {
                        from: current,
                        to: desired,
                    }
                });
            }
            debug!(current, desired, "Already at desired size, not scaling down");
        }

        Decision::NoChange
    }

    fn dispatch(&mut self, dispatched: bool, decision: impl FnOnce() -> Decision) -> Decision {
        if !dispatched {
            return Decision::NotDispatched;
        }

        let now = self.clock.now_millis();
        self.scaler.actuator().mark_scaled_at(now);
        let decision = decision();
        info!(?decision, at = now, "Scaling decision issued");
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::tests::{actuator_with, desired_sizes, Attempts};
    use crate::clock::ManualClock;
    use crate::policy::tests::policy_with;
    use crate::policy::StageScalingPolicy;
    use crate::toggles::SwitchToggles;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const START: i64 = 1_600_000_000_000;

    fn rule_based(
        policy: StageScalingPolicy,
        toggles: Arc<SwitchToggles>,
    ) -> (RuleBasedScaler, Arc<ManualClock>, Attempts) {
        let (actuator, attempts, _) = actuator_with(0, CancellationToken::new());
        let clock = Arc::new(ManualClock::starting_at(START));
        let scaler = RuleBasedScaler::new(
            StageScaler::new(policy, actuator, toggles),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );

        (scaler, clock, attempts)
    }

    fn cpu(effective_value: f64, workers: i64) -> ScalingEvent {
        ScalingEvent::new(ScalingReason::Cpu, Some(1), effective_value, effective_value, workers)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_cooldown_gates_consecutive_decisions() {
        let (mut scaler, clock, attempts) =
            rule_based(policy_with(&[ScalingReason::Cpu]), Default::default());

        assert_eq!(Decision::ScaledUp { from: 2, to: 4 }, scaler.on_event(&cpu(90.0, 2)));
        assert_eq!(Some(START), scaler.last_scaled_at_millis());

        clock.advance_secs(30);
        assert_eq!(Decision::CoolingDown, scaler.on_event(&cpu(90.0, 4)));

        clock.advance_secs(31);
        assert_eq!(Decision::ScaledUp { from: 4, to: 6 }, scaler.on_event(&cpu(90.0, 4)));

        settle().await;
        assert_eq!(vec![4, 6], desired_sizes(&attempts));
    }

    #[tokio::test]
    async fn test_cooldown_prevents_repeated_requests() {
        let (mut scaler, clock, attempts) =
            rule_based(policy_with(&[ScalingReason::Cpu]), Default::default());

        scaler.on_event(&cpu(90.0, 2));
        for _ in 0..5 {
            clock.advance_secs(5);
            assert_eq!(Decision::CoolingDown, scaler.on_event(&cpu(90.0, 2)));
        }

        settle().await;
        assert_eq!(vec![4], desired_sizes(&attempts));
    }

    #[tokio::test]
    async fn test_huge_cooldown_saturates() {
        let mut policy = policy_with(&[ScalingReason::Cpu]);
        policy.cooldown_secs = u64::MAX;
        let (mut scaler, clock, attempts) = rule_based(policy, Default::default());

        assert_eq!(Decision::ScaledUp { from: 2, to: 4 }, scaler.on_event(&cpu(90.0, 2)));
        clock.advance_secs(10 * 365 * 24 * 3600);
        assert_eq!(Decision::CoolingDown, scaler.on_event(&cpu(90.0, 4)));

        settle().await;
        assert_eq!(vec![4], desired_sizes(&attempts));
    }

    #[tokio::test]
    async fn test_cooldown_survives_a_rebuilt_scaler() {
        let (actuator, attempts, _) = actuator_with(0, CancellationToken::new());
        let clock = Arc::new(ManualClock::starting_at(START));
        let build = || {
            RuleBasedScaler::new(
                StageScaler::new(
                    policy_with(&[ScalingReason::Cpu]),
                    actuator.clone(),
                    Arc::new(SwitchToggles::default()),
                ),
                Arc::clone(&clock) as Arc<dyn Clock>,
            )
        };

        assert_eq!(Decision::ScaledUp { from: 2, to: 4 }, build().on_event(&cpu(90.0, 2)));
        clock.advance_secs(30);
        assert_eq!(Decision::CoolingDown, build().on_event(&cpu(90.0, 4)));

        settle().await;
        assert_eq!(vec![4], desired_sizes(&attempts));
    }

    #[tokio::test]
    async fn test_scale_down_stops_at_min() {
        let (mut scaler, clock, _) = rule_based(policy_with(&[ScalingReason::Cpu]), Default::default());

        assert_eq!(Decision::ScaledDown { from: 2, to: 1 }, scaler.on_event(&cpu(10.0, 2)));
        clock.advance_secs(61);
        assert_eq!(Decision::NoChange, scaler.on_event(&cpu(10.0, 1)));
        assert_eq!(Decision::NoChange, scaler.on_event(&cpu(50.0, 1)));
    }

    #[tokio::test]
    async fn test_scale_up_stops_at_max() {
        let (mut scaler, _, _) = rule_based(policy_with(&[ScalingReason::Cpu]), Default::default());

        assert_eq!(Decision::ScaledUp { from: 9, to: 10 }, scaler.on_event(&cpu(95.0, 9)));
        let (mut scaler, _, _) = rule_based(policy_with(&[ScalingReason::Cpu]), Default::default());
        assert_eq!(Decision::NoChange, scaler.on_event(&cpu(95.0, 10)));
    }

    #[tokio::test]
    async fn test_high_threshold_wins_over_low() {
        let mut policy = policy_with(&[ScalingReason::Cpu]);
        if let Some(strategy) = policy.strategies.get_mut(&ScalingReason::Cpu) {
            strategy.scale_up_above_pct = 10.0;
            strategy.scale_down_below_pct = 90.0;
        }
        let (mut scaler, _, _) = rule_based(policy, Default::default());

        assert_eq!(Decision::ScaledUp { from: 3, to: 5 }, scaler.on_event(&cpu(50.0, 3)));
    }

    #[tokio::test]
    async fn test_zero_increment_is_a_no_op() {
        let mut policy = policy_with(&[ScalingReason::Cpu]);
        policy.increment = 0;
        let (mut scaler, _, attempts) = rule_based(policy, Default::default());

        assert_eq!(Decision::NoChange, scaler.on_event(&cpu(90.0, 3)));
        assert_eq!(None, scaler.last_scaled_at_millis());
        settle().await;
        assert!(desired_sizes(&attempts).is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_reasons_and_disabled_policies_are_ignored() {
        let (mut scaler, _, _) = rule_based(policy_with(&[ScalingReason::Memory]), Default::default());
        assert_eq!(Decision::Ignored, scaler.on_event(&cpu(90.0, 3)));

        let mut disabled = policy_with(&[ScalingReason::Cpu]);
        disabled.enabled = false;
        let (mut scaler, _, _) = rule_based(disabled, Default::default());
        assert_eq!(Decision::Ignored, scaler.on_event(&cpu(90.0, 3)));
    }

    #[tokio::test]
    async fn test_rolling_count_requires_repeated_crossings() {
        let mut policy = policy_with(&[ScalingReason::Cpu]);
        if let Some(strategy) = policy.strategies.get_mut(&ScalingReason::Cpu) {
            strategy.rolling_count = crate::policy::RollingCount { count: 2, of: 3 };
        }
        let (mut scaler, _, _) = rule_based(policy, Default::default());

        assert_eq!(Decision::NoChange, scaler.on_event(&cpu(90.0, 3)));
        assert_eq!(Decision::NoChange, scaler.on_event(&cpu(50.0, 3)));
        assert_eq!(Decision::ScaledUp { from: 3, to: 5 }, scaler.on_event(&cpu(90.0, 3)));
    }

    #[tokio::test]
    async fn test_vetoed_scale_up_does_not_start_cooldown() {
        let toggles = Arc::new(SwitchToggles::new(false, true));
        let mut policy = policy_with(&[ScalingReason::Cpu]);
        policy.allow_autoscale_manager = true;
        let (mut scaler, _, attempts) = rule_based(policy, Arc::clone(&toggles));

        assert_eq!(Decision::NoChange, scaler.on_event(&cpu(90.0, 3)));
        assert_eq!(None, scaler.last_scaled_at_millis());

        toggles.set_scale_up_enabled(true);
        assert_eq!(Decision::ScaledUp { from: 3, to: 5 }, scaler.on_event(&cpu(90.0, 3)));
        settle().await;
        assert_eq!(vec![5], desired_sizes(&attempts));
    }
}
