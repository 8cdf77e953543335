use crate::actor::handle_error;
use crate::actuator::{RetryPolicy, StageActuator, StageActuators};
use crate::clock::Clock;
use crate::controller::{ControllerFactory, ControllerSpec, StageController};
use crate::event::ScalingEvent;
use crate::gateway::ScaleGateway;
use crate::metrics::ScalerMetrics;
use crate::overrides::OverrideSource;
use crate::policy::StageScalingInfo;
use crate::resolver::{resolve_stage, ScalerMode, StagePlan};
use crate::scaler::{RuleBasedScaler, StageScaler};
use crate::toggles::ScalingToggles;
use crate::workers::{sample_worker_counts, WorkerCountFeed, WorkerCountStream};
use act_zero::runtimes::tokio::spawn_actor;
use act_zero::{send, Actor, ActorError, ActorResult, Addr, AddrLike, Produces, WeakAddr};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, trace, warn};

enum Scaling {
    RuleBased(RuleBasedScaler),
    Controller(Box<dyn StageController>),
    /// The stage is not scaled; its events are dropped.
    Ignored,
}

impl fmt::Display for Scaling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RuleBased(_) => write!(f, "rule based"),
            Self::Controller(_) => write!(f, "controller"),
            Self::Ignored => write!(f, "ignored"),
        }
    }
}

/// Consumes the events of one stage, in order, with the scaler resolved for
/// that stage.
pub struct StagePipeline {
    job_id: String,
    stage: i32,
    scaling: Scaling,
    worker_counts: Option<WorkerCountStream>,
    sample_interval: Duration,
    sampling: Option<DropGuard>,
}

#[async_trait]
impl Actor for StagePipeline {
    #[tracing::instrument(
        name = "StagePipeline::started",
        skip(self, addr),
        fields(job_id = %self.job_id, stage = self.stage)
    )]
    async fn started(&mut self, addr: Addr<Self>) -> ActorResult<()> {
        info!("Started {} stage pipeline", self.scaling);

        if let Some(worker_counts) = self.worker_counts.take() {
            let token = CancellationToken::new();
            self.sampling = Some(token.clone().drop_guard());

            addr.send_fut(forward_worker_counts(
                addr.downgrade(),
                sample_worker_counts(worker_counts, self.sample_interval),
                token,
            ));
        }

        Produces::ok(())
    }

    async fn error(&mut self, error: ActorError) -> bool {
        handle_error(error)
    }
}

impl StagePipeline {
    fn new(job_id: String, stage: i32, scaling: Scaling) -> Self {
        Self {
            job_id,
            stage,
            scaling,
            worker_counts: None,
            sample_interval: Duration::from_secs(5),
            sampling: None,
        }
    }

    fn with_worker_counts(self, worker_counts: WorkerCountStream, sample_interval: Duration) -> Self {
        Self {
            worker_counts: Some(worker_counts),
            sample_interval,
            ..self
        }
    }

    #[tracing::instrument(
        name = "StagePipeline::process",
        skip(self, event),
        fields(job_id = %self.job_id, stage = self.stage)
    )]
    pub async fn process(&mut self, event: ScalingEvent) -> ActorResult<()> {
        match &mut self.scaling {
            Scaling::RuleBased(scaler) => {
                let decision = scaler.on_event(&event);
                trace!(?decision, %event, "Processed event");
            }
            Scaling::Controller(controller) => match event.reason.controller_metric() {
                Some(metric) => controller.observe_metric(metric, &event),
                None => trace!(%event, "Event has no controller metric, skipping"),
            },
            Scaling::Ignored => trace!(%event, "Stage is not scaled, dropping event"),
        }

        Produces::ok(())
    }

    pub async fn observe_worker_count(&mut self, count: usize) -> ActorResult<()> {
        if let Scaling::Controller(controller) = &mut self.scaling {
            controller.observe_worker_count(count);
        }

        Produces::ok(())
    }
}

async fn forward_worker_counts(
    pipeline: WeakAddr<StagePipeline>,
    mut worker_counts: WorkerCountStream,
    token: CancellationToken,
) {
    loop {
        let count = tokio::select! {
            _ = token.cancelled() => break,
            count = worker_counts.next() => match count {
                Some(count) => count,
                None => {
                    warn!("Worker count feed ended");
                    break;
                }
            },
        };

        send!(pipeline.observe_worker_count(count));
    }

    debug!("Stopped forwarding worker counts");
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineSettings {
    pub retry_policy: RetryPolicy,
    pub worker_count_sample_interval: Duration,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            worker_count_sample_interval: Duration::from_secs(5),
        }
    }
}

/// Everything a stage pipeline is built from, shared by all stages of a job.
/// Actuators are cached by stage so rebuilt pipelines reuse them.
#[derive(Clone)]
pub struct PipelineBuilder {
    pub job_id: String,
    pub stages: Arc<HashMap<i32, StageScalingInfo>>,
    pub overrides: Arc<OverrideSource>,
    pub gateway: Addr<dyn ScaleGateway>,
    pub metrics: Arc<ScalerMetrics>,
    pub toggles: Arc<dyn ScalingToggles>,
    pub clock: Arc<dyn Clock>,
    pub controller_factory: Arc<dyn ControllerFactory>,
    pub worker_counts: Box<dyn WorkerCountFeed>,
    pub settings: PipelineSettings,
    pub actuators: StageActuators,
    pub shutdown: CancellationToken,
}

impl PipelineBuilder {
    #[tracing::instrument(name = "PipelineBuilder::build", skip(self), fields(job_id = %self.job_id))]
    pub fn build(&self, stage: i32) -> Addr<StagePipeline> {
        let pipeline = match resolve_stage(stage, self.stages.get(&stage), &self.overrides) {
            Some(plan) => self.scaled_pipeline(plan),
            None => {
                info!("No scaler configured for stage, ignoring its events");
                StagePipeline::new(self.job_id.clone(), stage, Scaling::Ignored)
            }
        };

        spawn_actor(pipeline)
    }

    fn actuator(&self, stage: i32) -> StageActuator {
        self.actuators.get_or_insert_with(stage, || {
            StageActuator::new(
                self.job_id.clone(),
                stage,
                self.gateway.clone(),
                self.metrics.desire_worker_size(stage),
                self.settings.retry_policy,
                self.shutdown.child_token(),
            )
        })
    }

    fn scaled_pipeline(&self, plan: StagePlan) -> StagePipeline {
        let stage = plan.stage;
        let actuator = self.actuator(stage);

        if plan.mode == ScalerMode::RuleBased {
            return match plan.policy {
                Some(policy) => {
                    let scaler = StageScaler::new(policy, actuator, Arc::clone(&self.toggles));
                    StagePipeline::new(
                        self.job_id.clone(),
                        stage,
                        Scaling::RuleBased(RuleBasedScaler::new(scaler, Arc::clone(&self.clock))),
                    )
                }
                None => {
                    error!("Rule based stage without a scaling policy, ignoring its events");
                    StagePipeline::new(self.job_id.clone(), stage, Scaling::Ignored)
                }
            };
        }

        let spec = ControllerSpec {
            job_id: self.job_id.clone(),
            stage,
            mode: plan.mode,
            initial_size: plan.initial_size,
            min_size: plan.min_size,
            max_size: plan.max_size,
            overrides: plan.overrides,
            actuator,
        };

        match self.controller_factory.build(spec) {
            Ok(controller) => StagePipeline::new(self.job_id.clone(), stage, Scaling::Controller(controller))
                .with_worker_counts(
                    self.worker_counts.worker_counts(stage),
                    self.settings.worker_count_sample_interval,
                ),
            Err(e) => {
                error!("Failed to build stage controller, ignoring its events {:?}", e);
                StagePipeline::new(self.job_id.clone(), stage, Scaling::Ignored)
            }
        }
    }
}
