mod buffer;

use crate::event::ScalingEvent;
use crate::metrics::ScalerMetrics;
use crate::pipeline::{PipelineBuilder, StagePipeline};
use act_zero::{call, Addr, AddrLike};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub use buffer::{EventBuffer, DEFAULT_BUFFER_CAPACITY};

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("event router is shut down")]
    Closed,
    #[error("pipeline of stage {0} terminated")]
    PipelineTerminated(i32),
    #[error("pipeline of stage {stage} failed: {reason}")]
    PipelineFailed { stage: i32, reason: String },
}

/// Producer side of the router. Cheap to clone and never blocks.
#[derive(Debug, Clone)]
pub struct EventSink {
    buffer: Arc<EventBuffer>,
}

impl EventSink {
    pub fn new(buffer: Arc<EventBuffer>) -> Self {
        Self { buffer }
    }

    pub fn send(&self, event: ScalingEvent) -> Result<(), RouterError> {
        self.buffer.push(event)
    }
}

/// Pulls events from the buffer and hands them to per-stage pipelines, built
/// on first use. The next event is only pulled once the previous one was
/// processed, so a slow stage backs up into the bounded buffer. Runs under a
/// supervisor that rebuilds the pipelines after any failure until shutdown.
pub struct EventRouter {
    buffer: Arc<EventBuffer>,
    builder: PipelineBuilder,
    metrics: Arc<ScalerMetrics>,
    shutdown: CancellationToken,
}

impl EventRouter {
    pub fn new(
        buffer: Arc<EventBuffer>,
        builder: PipelineBuilder,
        metrics: Arc<ScalerMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            buffer,
            builder,
            metrics,
            shutdown,
        }
    }

    #[tracing::instrument(name = "EventRouter::run", skip(self), fields(scaler_id = self.metrics.scaler_id()))]
    pub async fn run(self) {
        let mut pending: Option<ScalingEvent> = None;
        let mut restarts: u64 = 0;

        loop {
            let mut pipelines = HashMap::new();
            let routing = AssertUnwindSafe(self.route(&mut pipelines, &mut pending))
                .catch_unwind()
                .await;

            match routing {
                Ok(Ok(())) => {
                    info!(restarts, "Event router stopped");
                    return;
                }
                Ok(Err(e)) => error!(restarts, "Event router failed, restarting: {}", e),
                Err(panic) => error!(
                    restarts,
                    "Event router panicked, restarting: {}",
                    panic_message(&*panic)
                ),
            }

            if self.shutdown.is_cancelled() {
                info!(restarts, "Event router stopped during restart");
                return;
            }

            restarts += 1;
        }
    }

    async fn route(
        &self,
        pipelines: &mut HashMap<i32, Addr<StagePipeline>>,
        pending: &mut Option<ScalingEvent>,
    ) -> Result<(), RouterError> {
        loop {
            let event = match pending.take() {
                Some(event) => {
                    debug!(%event, "Re-dispatching event after restart");
                    event
                }
                None => {
                    let next = tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => None,
                        next = self.buffer.pull() => next,
                    };

                    match next {
                        Some(event) => {
                            self.metrics.request_metrics_count().increment();
                            event
                        }
                        None => return Ok(()),
                    }
                }
            };

            let stage = event.stage;
            let pipeline = pipelines
                .entry(stage)
                .or_insert_with(|| self.builder.build(stage))
                .clone();

            if pipeline.termination().now_or_never().is_some() {
                *pending = Some(event);
                return Err(RouterError::PipelineTerminated(stage));
            }

            let processed = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                processed = call!(pipeline.process(event)) => processed,
            };

            // the event that took the pipeline down is not retried
            if let Err(e) = processed {
                return Err(RouterError::PipelineFailed {
                    stage,
                    reason: e.to_string(),
                });
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| String::from("unknown panic"))
}
