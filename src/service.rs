use crate::actuator::StageActuators;
use crate::clock::Clock;
use crate::controller::ControllerFactory;
use crate::gateway::ScaleGateway;
use crate::metrics::ScalerMetrics;
use crate::overrides::{OverrideSource, PropertySource};
use crate::pipeline::{PipelineBuilder, PipelineSettings};
use crate::policy::{stage_scaling_infos, ScalerRule, StageSchedulingInfo};
use crate::router::{EventBuffer, EventRouter, EventSink, DEFAULT_BUFFER_CAPACITY};
use crate::toggles::ScalingToggles;
use crate::workers::WorkerCountFeed;
use act_zero::Addr;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Everything a job scaler is created from.
pub struct ScalerContext {
    pub job_id: String,
    pub stages: HashMap<i32, StageSchedulingInfo>,
    pub rule: Option<ScalerRule>,
    pub properties: Arc<dyn PropertySource>,
    pub gateway: Addr<dyn ScaleGateway>,
    pub worker_counts: Box<dyn WorkerCountFeed>,
    pub toggles: Arc<dyn ScalingToggles>,
    pub controller_factory: Arc<dyn ControllerFactory>,
    pub clock: Arc<dyn Clock>,
    pub buffer_capacity: usize,
    pub settings: PipelineSettings,
}

impl ScalerContext {
    pub fn scaler_id(&self) -> String {
        format!(
            "{}-{}",
            self.job_id,
            self.rule
                .as_ref()
                .map(|rule| rule.rule_id.as_str())
                .unwrap_or("default")
        )
    }
}

/// Autoscaler of one job: owns the event buffer, the router task and the
/// shutdown of everything spawned below it.
pub struct JobAutoScaler {
    scaler_id: String,
    metrics: Arc<ScalerMetrics>,
    buffer: Arc<EventBuffer>,
    shutdown: CancellationToken,
    router: Mutex<Option<EventRouter>>,
    router_handle: Mutex<Option<JoinHandle<()>>>,
}

impl JobAutoScaler {
    pub fn new(context: ScalerContext) -> Self {
        let scaler_id = context.scaler_id();
        let metrics = Arc::new(ScalerMetrics::new(scaler_id.clone()));
        let capacity = if context.buffer_capacity == 0 {
            DEFAULT_BUFFER_CAPACITY
        } else {
            context.buffer_capacity
        };
        let buffer = Arc::new(EventBuffer::new(capacity, Arc::clone(&metrics)));
        let shutdown = CancellationToken::new();

        let overrides = OverrideSource::new(
            context.rule.as_ref().map(|rule| &rule.metadata),
            context.properties.as_ref(),
        );
        let stages = stage_scaling_infos(&context.stages, context.rule.as_ref());

        let builder = PipelineBuilder {
            job_id: context.job_id,
            stages: Arc::new(stages),
            overrides: Arc::new(overrides),
            gateway: context.gateway,
            metrics: Arc::clone(&metrics),
            toggles: context.toggles,
            clock: context.clock,
            controller_factory: context.controller_factory,
            worker_counts: context.worker_counts,
            settings: context.settings,
            actuators: StageActuators::default(),
            shutdown: shutdown.clone(),
        };
        let router = EventRouter::new(
            Arc::clone(&buffer),
            builder,
            Arc::clone(&metrics),
            shutdown.clone(),
        );

        Self {
            scaler_id,
            metrics,
            buffer,
            shutdown,
            router: Mutex::new(Some(router)),
            router_handle: Mutex::new(None),
        }
    }

    pub fn scaler_id(&self) -> &str {
        &self.scaler_id
    }

    /// Spawns the router. Only the first call has an effect.
    pub fn start(&self) {
        let router = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match router {
            Some(router) => {
                info!(scaler_id = self.scaler_id.as_str(), "Starting job auto scaler");
                let handle = tokio::spawn(router.run());
                *self
                    .router_handle
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            None => warn!(scaler_id = self.scaler_id.as_str(), "Job auto scaler already started"),
        }
    }

    /// Stops intake, ends the router and abandons outstanding scale requests.
    pub fn shutdown(&self) {
        info!(scaler_id = self.scaler_id.as_str(), "Shutting down job auto scaler");
        self.shutdown.cancel();
        self.buffer.close();
    }

    /// Resolves once the router ended after [`JobAutoScaler::shutdown`].
    pub async fn stopped(&self) {
        let handle = self
            .router_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(scaler_id = self.scaler_id.as_str(), "Event router task failed {:?}", e);
            }
        }
    }

    /// Resolves once every buffered event was handed to its stage pipeline.
    pub async fn drained(&self) {
        self.buffer.drained().await;
    }

    pub fn sink(&self) -> EventSink {
        EventSink::new(Arc::clone(&self.buffer))
    }

    pub fn metrics(&self) -> Arc<ScalerMetrics> {
        Arc::clone(&self.metrics)
    }
}
