//! PID family scalers. The pipeline only knows the [`StageController`] contract;
//! [`ProportionalControllerFactory`] provides the in-crate control law.

use crate::actuator::StageActuator;
use crate::clock::{secs_to_millis, Clock};
use crate::event::{ControllerMetric, ScalingEvent};
use crate::overrides::{RpsConfig, ScalerOverride};
use crate::resolver::ScalerMode;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info};

/// What a controller is constructed from.
#[derive(Debug, Clone)]
pub struct ControllerSpec {
    pub job_id: String,
    pub stage: i32,
    pub mode: ScalerMode,
    pub initial_size: i64,
    pub min_size: i64,
    pub max_size: i64,
    pub overrides: Option<ScalerOverride>,
    pub actuator: StageActuator,
}

pub trait StageController: Send + Debug {
    fn observe_metric(&mut self, metric: ControllerMetric, event: &ScalingEvent);
    fn observe_worker_count(&mut self, count: usize);
}

pub trait ControllerFactory: Send + Sync + Debug {
    fn build(&self, spec: ControllerSpec) -> anyhow::Result<Box<dyn StageController>>;
}

const DEFAULT_SET_POINT: f64 = 60.0;
const DEFAULT_ROPE: (f64, f64) = (5.0, 5.0);
const DEFAULT_COOLDOWN_SECS: u64 = 60;
const DEFAULT_RPS_SCALE_UP_ABOVE_PCT: f64 = 30.0;
const DEFAULT_RPS_SCALE_DOWN_BELOW_PCT: f64 = 50.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Gains {
    set_point: f64,
    rope: (f64, f64),
    kp: f64,
    ki: f64,
    kd: f64,
    integral_decay: f64,
}

impl Gains {
    fn from_overrides(overrides: Option<&ScalerOverride>) -> Self {
        let o = overrides.cloned().unwrap_or_default();

        Self {
            set_point: o.set_point.unwrap_or(DEFAULT_SET_POINT),
            rope: o.rope.unwrap_or(DEFAULT_ROPE),
            kp: o.kp.unwrap_or(1.0),
            ki: o.ki.unwrap_or(0.0),
            kd: o.kd.unwrap_or(0.0),
            integral_decay: o.integral_decay.unwrap_or(1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct RpsThresholds {
    scale_up_above_pct: f64,
    scale_down_below_pct: f64,
    scale_up_multiplier: f64,
    scale_down_multiplier: f64,
}

impl From<&RpsConfig> for RpsThresholds {
    fn from(config: &RpsConfig) -> Self {
        Self {
            scale_up_above_pct: config
                .scale_up_above_pct
                .unwrap_or(DEFAULT_RPS_SCALE_UP_ABOVE_PCT),
            scale_down_below_pct: config
                .scale_down_below_pct
                .unwrap_or(DEFAULT_RPS_SCALE_DOWN_BELOW_PCT),
            scale_up_multiplier: config.scale_up_multiplier.unwrap_or(1.0),
            scale_down_multiplier: config.scale_down_multiplier.unwrap_or(1.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProportionalControllerFactory {
    clock: Arc<dyn Clock>,
}

impl ProportionalControllerFactory {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl ControllerFactory for ProportionalControllerFactory {
    fn build(&self, spec: ControllerSpec) -> anyhow::Result<Box<dyn StageController>> {
        if spec.min_size > spec.max_size {
            anyhow::bail!(
                "Invalid bounds for stage {}: min {} > max {}",
                spec.stage,
                spec.min_size,
                spec.max_size
            );
        }

        let overrides = spec.overrides.as_ref();
        let rps = match spec.mode {
            ScalerMode::RpsPid => Some(
                overrides
                    .and_then(|o| o.rps_config.as_ref())
                    .map(RpsThresholds::from)
                    .unwrap_or_else(|| RpsThresholds::from(&RpsConfig::default())),
            ),
            _ => None,
        };
        let cooldown_millis = secs_to_millis(
            overrides
                .and_then(|o| o.cooldown_seconds)
                .unwrap_or(DEFAULT_COOLDOWN_SECS),
        );

        info!(
            job_id = spec.job_id.as_str(),
            stage = spec.stage,
            mode = %spec.mode,
            initial_size = spec.initial_size,
            "Building stage controller"
        );

        Ok(Box::new(ProportionalController {
            gains: Gains::from_overrides(overrides),
            rps,
            cooldown_millis,
            min_size: spec.min_size,
            max_size: spec.max_size,
            current_size: spec.initial_size,
            latest: HashMap::new(),
            integral: 0.0,
            previous_error: None,
            clock: Arc::clone(&self.clock),
            actuator: spec.actuator,
        }))
    }
}

#[derive(Debug)]
pub struct ProportionalController {
    gains: Gains,
    rps: Option<RpsThresholds>,
    cooldown_millis: i64,
    min_size: i64,
    max_size: i64,
    current_size: i64,
    latest: HashMap<ControllerMetric, f64>,
    integral: f64,
    previous_error: Option<f64>,
    clock: Arc<dyn Clock>,
    actuator: StageActuator,
}

impl ProportionalController {
    fn pid_target(&mut self) -> Option<i64> {
        let value = self
            .latest
            .values()
            .copied()
            .fold(None, |max: Option<f64>, v| Some(max.map_or(v, |m| m.max(v))))?;
        let error = value - self.gains.set_point;

        if -self.gains.rope.0 <= error && error <= self.gains.rope.1 {
            log_hold(value, error);
            return None;
        }

        self.integral = self.integral * self.gains.integral_decay + error;
        let derivative = self.previous_error.map_or(0.0, |previous| error - previous);
        self.previous_error = Some(error);

        let output = self.gains.kp * error + self.gains.ki * self.integral + self.gains.kd * derivative;
        let base = self.current_size.max(1) as f64;

        Some((base * (1.0 + output / 100.0)).round() as i64)
    }

    fn rps_target(&self, thresholds: RpsThresholds) -> Option<i64> {
        let value = *self.latest.get(&ControllerMetric::Rps)?;
        if self.gains.set_point <= 0.0 {
            return None;
        }

        let error_pct = (value - self.gains.set_point) / self.gains.set_point * 100.0;
        let current = self.current_size.max(1) as f64;

        if error_pct > thresholds.scale_up_above_pct {
            Some((current * (1.0 + error_pct / 100.0 * thresholds.scale_up_multiplier)).ceil() as i64)
        } else if error_pct < -thresholds.scale_down_below_pct {
            Some((current * (1.0 + error_pct / 100.0 * thresholds.scale_down_multiplier)).floor() as i64)
        } else {
            log_hold(value, error_pct);
            None
        }
    }

    fn cooldown_elapsed(&self, now: i64) -> bool {
        self.actuator
            .last_scaled_at_millis()
            .map_or(true, |last| now.saturating_sub(last) >= self.cooldown_millis)
    }
}

fn log_hold(value: f64, error: f64) {
    debug!(value, error, "Within deadband, holding size");
}

impl StageController for ProportionalController {
    fn observe_metric(&mut self, metric: ControllerMetric, event: &ScalingEvent) {
        if self.rps.is_some() && metric != ControllerMetric::Rps {
            return;
        }
        self.latest.insert(metric, event.effective_value);

        let target = match self.rps {
            Some(thresholds) => self.rps_target(thresholds),
            None => self.pid_target(),
        };
        let desired = match target {
            Some(target) => target.max(self.min_size).min(self.max_size),
            None => return,
        };

        let now = self.clock.now_millis();
        if desired == self.current_size || !self.cooldown_elapsed(now) {
            return;
        }

        let reason = format!("{} controller output for {} at {:5.2}", metric, event.reason, event.effective_value);
        if self.actuator.request_scale(desired, reason) {
            info!(from = self.current_size, to = desired, "Controller scaled stage");
            self.current_size = desired;
            self.actuator.mark_scaled_at(now);
        }
    }

    fn observe_worker_count(&mut self, count: usize) {
        debug!(count, "Observed worker count");
        self.current_size = count as i64;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::actuator::tests::{actuator_with, desired_sizes, Attempts};
    use crate::clock::ManualClock;
    use crate::event::ScalingReason;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn controller(
        mode: ScalerMode,
        overrides: Option<ScalerOverride>,
    ) -> (Box<dyn StageController>, Arc<ManualClock>, Attempts) {
        let (actuator, attempts, _) = actuator_with(0, CancellationToken::new());
        let clock = Arc::new(ManualClock::starting_at(1_000_000));
        let factory = ProportionalControllerFactory::new(Arc::clone(&clock) as Arc<dyn Clock>);

        let controller = factory
            .build(ControllerSpec {
                job_id: "job-1".into(),
                stage: 1,
                mode,
                initial_size: 4,
                min_size: 2,
                max_size: 8,
                overrides,
                actuator,
            })
            .unwrap();

        (controller, clock, attempts)
    }

    fn observe(controller: &mut Box<dyn StageController>, reason: ScalingReason, value: f64) {
        let event = ScalingEvent::new(reason, Some(1), value, value, 4);
        if let Some(metric) = reason.controller_metric() {
            controller.observe_metric(metric, &event);
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_deadband_holds_size() {
        let (mut c, _, attempts) = controller(ScalerMode::ClassicPid, None);

        observe(&mut c, ScalingReason::Cpu, 63.0);
        observe(&mut c, ScalingReason::Cpu, 56.0);

        settle().await;
        assert!(desired_sizes(&attempts).is_empty());
    }

    #[tokio::test]
    async fn test_most_loaded_metric_drives_output() {
        let (mut c, clock, attempts) = controller(ScalerMode::JsonConfig, None);

        // round(4 * 1.3)
        observe(&mut c, ScalingReason::Cpu, 90.0);
        settle().await;
        assert_eq!(vec![5], desired_sizes(&attempts));

        clock.advance_secs(61);
        observe(&mut c, ScalingReason::Memory, 40.0);
        settle().await;
        assert_eq!(vec![5, 7], desired_sizes(&attempts));

        clock.advance_secs(61);
        c.observe_worker_count(8);
        observe(&mut c, ScalingReason::Cpu, 100.0);
        settle().await;
        assert_eq!(vec![5, 7], desired_sizes(&attempts));
    }

    #[tokio::test]
    async fn test_cooldown_spaces_out_requests() {
        let overrides = ScalerOverride {
            cooldown_seconds: Some(30),
            ..Default::default()
        };
        let (mut c, clock, attempts) = controller(ScalerMode::ClassicPid, Some(overrides));

        observe(&mut c, ScalingReason::Cpu, 90.0);
        clock.advance_secs(10);
        observe(&mut c, ScalingReason::Cpu, 100.0);
        clock.advance_secs(20);
        observe(&mut c, ScalingReason::Cpu, 100.0);

        settle().await;
        assert_eq!(vec![5, 7], desired_sizes(&attempts));
    }

    #[tokio::test]
    async fn test_huge_cooldown_blocks_further_requests() {
        let overrides = ScalerOverride {
            cooldown_seconds: Some(u64::MAX),
            ..Default::default()
        };
        let (mut c, clock, attempts) = controller(ScalerMode::ClassicPid, Some(overrides));

        observe(&mut c, ScalingReason::Cpu, 90.0);
        clock.advance_secs(3600);
        observe(&mut c, ScalingReason::Cpu, 100.0);

        settle().await;
        assert_eq!(vec![5], desired_sizes(&attempts));
    }

    #[tokio::test]
    async fn test_rps_mode_only_reacts_to_rps() {
        let overrides = ScalerOverride {
            set_point: Some(100.0),
            rps_config: Some(RpsConfig::default()),
            ..Default::default()
        };
        let (mut c, clock, attempts) = controller(ScalerMode::RpsPid, Some(overrides));

        observe(&mut c, ScalingReason::Cpu, 100.0);
        observe(&mut c, ScalingReason::Rps, 120.0);
        settle().await;
        assert!(desired_sizes(&attempts).is_empty());

        observe(&mut c, ScalingReason::Rps, 150.0);
        clock.advance_secs(60);
        observe(&mut c, ScalingReason::Rps, 20.0);
        settle().await;
        assert_eq!(vec![6, 2], desired_sizes(&attempts));
    }

    #[tokio::test]
    async fn test_inverted_bounds_are_rejected() {
        let (actuator, _, _) = actuator_with(0, CancellationToken::new());
        let factory = ProportionalControllerFactory::new(Arc::new(ManualClock::default()));

        let result = factory.build(ControllerSpec {
            job_id: "job-1".into(),
            stage: 1,
            mode: ScalerMode::ClassicPid,
            initial_size: 1,
            min_size: 5,
            max_size: 2,
            overrides: None,
            actuator,
        });

        assert!(result.is_err());
    }
}
