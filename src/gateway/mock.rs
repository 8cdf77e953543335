use super::{GatewayError, ScaleGateway, ScaleRequest};
use crate::actor::{self, handle_error};
use act_zero::{Actor, ActorError, ActorResult, Addr, Produces};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Accepts every request after the first `failures` attempts, recording all
/// attempts it sees.
#[derive(Debug, Default)]
pub struct MockScaleGateway {
    failures: usize,
    attempts: Arc<Mutex<Vec<ScaleRequest>>>,
}

impl MockScaleGateway {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            attempts: Default::default(),
        }
    }

    /// Shared view of every request received so far, failed ones included.
    pub fn attempts(&self) -> Arc<Mutex<Vec<ScaleRequest>>> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl Actor for MockScaleGateway {
    async fn started(&mut self, _addr: Addr<Self>) -> ActorResult<()>
    where
        Self: Sized,
    {
        info!("Started MockScaleGateway");

        Produces::ok(())
    }

    async fn error(&mut self, error: ActorError) -> bool {
        handle_error(error)
    }
}

#[async_trait]
impl ScaleGateway for MockScaleGateway {
    async fn scale_stage(&mut self, request: ScaleRequest) -> ActorResult<()> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
            attempts.push(request.clone());
            attempts.len()
        };

        if attempt <= self.failures {
            warn!(attempt, "Rejecting scale request {}", request);

            let error = GatewayError::Rejected {
                request,
                message: format!("attempt {} of {} configured failures", attempt, self.failures),
            };
            return Err(Box::new(actor::Error::from(anyhow::Error::new(error))));
        }

        info!(attempt, "Scaling {}", request);

        Produces::ok(())
    }
}
