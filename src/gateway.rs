mod file;
mod mock;

use act_zero::runtimes::tokio::spawn_actor;
use act_zero::{upcast, Actor, ActorResult, Addr};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config;
use crate::AppConfig;
pub use file::FileScaleGateway;
pub use mock::MockScaleGateway;

/// A capacity change for one stage of a job.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScaleRequest {
    pub job_id: String,
    pub stage: i32,
    pub desired_size: i64,
    pub reason: String,
}

impl fmt::Display for ScaleRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} stage {} -> {} ({})",
            self.job_id, self.stage, self.desired_size, self.reason
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("gateway rejected scaling {request}: {message}")]
    Rejected {
        request: ScaleRequest,
        message: String,
    },
    #[error("failed to persist scaling {request}")]
    Persist {
        request: ScaleRequest,
        source: anyhow::Error,
    },
}

/// The orchestrator endpoint that applies capacity changes.
#[async_trait]
pub trait ScaleGateway: Actor {
    async fn scale_stage(&mut self, request: ScaleRequest) -> ActorResult<()>;
}

pub fn build_from_config(config: AppConfig) -> anyhow::Result<Addr<dyn ScaleGateway>> {
    Ok(match &config.gateway {
        config::Gateway::Mock { failures } => {
            upcast!(spawn_actor(MockScaleGateway::failing(*failures)))
        }
        config::Gateway::File { path } => upcast!(spawn_actor(FileScaleGateway::new(path))),
    })
}
