use crate::gateway::{ScaleGateway, ScaleRequest};
use crate::metrics::Gauge;
use act_zero::{call, Addr};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn};
use tracing_futures::Instrument;

/// Linear backoff: attempt `n` waits `backoff_step * min(n, max_backoff_multiplier)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_step: Duration,
    pub max_backoff_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_step: Duration::from_secs(2),
            max_backoff_multiplier: 10,
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt.min(self.max_backoff_multiplier)
    }
}

/// Sends capacity changes for one stage. At most one request is outstanding;
/// a new request cancels the previous one before it is issued. Clones share
/// the outstanding request and the time of the last scaling decision.
#[derive(Clone)]
pub struct StageActuator {
    inner: Arc<Inner>,
}

struct Inner {
    job_id: String,
    stage: i32,
    gateway: Addr<dyn ScaleGateway>,
    desire_worker_size: Arc<Gauge>,
    retry_policy: RetryPolicy,
    outstanding: Mutex<Option<CancellationToken>>,
    last_scaled_at_millis: Mutex<Option<i64>>,
    shutdown: CancellationToken,
}

impl fmt::Debug for StageActuator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageActuator")
            .field("job_id", &self.inner.job_id)
            .field("stage", &self.inner.stage)
            .field("retry_policy", &self.inner.retry_policy)
            .finish()
    }
}

impl StageActuator {
    pub fn new(
        job_id: impl Into<String>,
        stage: i32,
        gateway: Addr<dyn ScaleGateway>,
        desire_worker_size: Arc<Gauge>,
        retry_policy: RetryPolicy,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                job_id: job_id.into(),
                stage,
                gateway,
                desire_worker_size,
                retry_policy,
                outstanding: Mutex::new(None),
                last_scaled_at_millis: Mutex::new(None),
                shutdown,
            }),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.inner.job_id
    }

    pub fn stage(&self) -> i32 {
        self.inner.stage
    }

    /// Issues a capacity change and returns whether it was dispatched. Gateway
    /// failures are retried in the background and only ever logged.
    pub fn request_scale(&self, desired_size: i64, reason: impl Into<String>) -> bool {
        self.inner.desire_worker_size.set(desired_size);

        if self.inner.shutdown.is_cancelled() {
            warn!(
                job_id = self.inner.job_id.as_str(),
                stage = self.inner.stage,
                desired_size,
                "Scaler is shut down, dropping scale request"
            );
            return false;
        }

        let token = self.inner.shutdown.child_token();
        self.supersede(token.clone());

        let request = ScaleRequest {
            job_id: self.inner.job_id.clone(),
            stage: self.inner.stage,
            desired_size,
            reason: reason.into(),
        };
        let span = info_span!(
            "scale_with_retry",
            job_id = request.job_id.as_str(),
            stage = request.stage,
            desired_size
        );

        tokio::spawn(
            scale_with_retry(
                self.inner.gateway.clone(),
                request,
                self.inner.retry_policy,
                token,
            )
            .instrument(span),
        );

        true
    }

    /// When a scaler last dispatched a request through this actuator.
    pub fn last_scaled_at_millis(&self) -> Option<i64> {
        *self
            .inner
            .last_scaled_at_millis
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mark_scaled_at(&self, at_millis: i64) {
        *self
            .inner
            .last_scaled_at_millis
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(at_millis);
    }

    fn supersede(&self, next: CancellationToken) {
        let previous = self
            .inner
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(next);

        if let Some(previous) = previous {
            if !previous.is_cancelled() {
                debug!(stage = self.inner.stage, "Cancelling outstanding scale request");
                previous.cancel();
            }
        }
    }
}

async fn scale_with_retry(
    gateway: Addr<dyn ScaleGateway>,
    request: ScaleRequest,
    retry_policy: RetryPolicy,
    token: CancellationToken,
) {
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);
        let scaling = call!(gateway.scale_stage(request.clone()));

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(attempt, "Scale request superseded");
                return;
            }
            result = scaling => result,
        };

        match result {
            Ok(()) if token.is_cancelled() => {
                debug!(attempt, "Ignoring completion of superseded scale request");
                return;
            }
            Ok(()) => {
                info!(attempt, "Scale request {} succeeded", request);
                return;
            }
            Err(e) => {
                let delay = retry_policy.delay(attempt);
                warn!(
                    attempt,
                    delay_secs = delay.as_secs(),
                    "Scale request failed, retrying after backoff: {:?}",
                    e
                );

                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        debug!(attempt, "Scale request superseded during backoff");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Actuators by stage, kept for the lifetime of a job scaler so that stage
/// pipelines rebuilt after a router restart keep driving the same one.
#[derive(Debug, Clone, Default)]
pub struct StageActuators {
    actuators: Arc<Mutex<HashMap<i32, StageActuator>>>,
}

impl StageActuators {
    pub fn get_or_insert_with(&self, stage: i32, create: impl FnOnce() -> StageActuator) -> StageActuator {
        self.actuators
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(stage)
            .or_insert_with(create)
            .clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::gateway::MockScaleGateway;
    use act_zero::runtimes::tokio::spawn_actor;
    use act_zero::upcast;

    pub(crate) type Attempts = Arc<Mutex<Vec<ScaleRequest>>>;

    pub(crate) fn actuator_with(failures: usize, shutdown: CancellationToken) -> (StageActuator, Attempts, Arc<Gauge>) {
        let gateway = MockScaleGateway::failing(failures);
        let attempts = gateway.attempts();
        let gauge = Arc::new(Gauge::default());
        let actuator = StageActuator::new(
            "job-1",
            1,
            upcast!(spawn_actor(gateway)),
            Arc::clone(&gauge),
            RetryPolicy::default(),
            shutdown,
        );

        (actuator, attempts, gauge)
    }

    pub(crate) fn desired_sizes(attempts: &Attempts) -> Vec<i64> {
        attempts
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.desired_size)
            .collect()
    }

    async fn advance(secs: f64) {
        tokio::time::sleep(Duration::from_secs_f64(secs)).await;
    }

    #[test]
    fn test_linear_backoff_is_capped() {
        let policy = RetryPolicy::default();

        assert_eq!(Duration::from_secs(2), policy.delay(1));
        assert_eq!(Duration::from_secs(10), policy.delay(5));
        assert_eq!(Duration::from_secs(20), policy.delay(10));
        assert_eq!(Duration::from_secs(20), policy.delay(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_requests_are_retried_until_success() {
        let (actuator, attempts, gauge) = actuator_with(2, CancellationToken::new());

        assert!(actuator.request_scale(5, "cpu"));
        assert_eq!(5, gauge.value());

        advance(1.0).await;
        assert_eq!(vec![5], desired_sizes(&attempts));

        // second attempt after 2s, third after another 4s
        advance(2.0).await;
        assert_eq!(2, desired_sizes(&attempts).len());
        advance(4.0).await;
        assert_eq!(3, desired_sizes(&attempts).len());

        advance(120.0).await;
        assert_eq!(vec![5, 5, 5], desired_sizes(&attempts));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_request_supersedes_outstanding_one() {
        let (actuator, attempts, gauge) = actuator_with(usize::MAX, CancellationToken::new());

        actuator.request_scale(5, "cpu");
        advance(1.0).await;

        actuator.clone().request_scale(6, "cpu");
        assert_eq!(6, gauge.value());
        advance(60.0).await;

        let sizes = desired_sizes(&attempts);
        assert_eq!(1, sizes.iter().filter(|size| **size == 5).count());
        assert!(sizes.iter().filter(|size| **size == 6).count() >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_actuator_is_shared_per_stage() {
        let (actuator, attempts, _) = actuator_with(usize::MAX, CancellationToken::new());
        let actuators = StageActuators::default();

        let first = actuators.get_or_insert_with(1, || actuator.clone());
        first.request_scale(4, "cpu");
        first.mark_scaled_at(42);
        advance(1.0).await;

        let second = actuators.get_or_insert_with(1, || panic!("actuator must be reused"));
        assert_eq!(Some(42), second.last_scaled_at_millis());
        second.request_scale(5, "cpu");
        advance(60.0).await;

        assert_eq!(1, desired_sizes(&attempts).iter().filter(|size| **size == 4).count());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_retries() {
        let shutdown = CancellationToken::new();
        let (actuator, attempts, gauge) = actuator_with(usize::MAX, shutdown.clone());

        actuator.request_scale(4, "cpu");
        advance(1.0).await;
        shutdown.cancel();
        advance(60.0).await;
        assert_eq!(vec![4], desired_sizes(&attempts));

        assert!(!actuator.request_scale(7, "cpu"));
        assert_eq!(7, gauge.value());
        advance(1.0).await;
        assert_eq!(vec![4], desired_sizes(&attempts));
    }
}
