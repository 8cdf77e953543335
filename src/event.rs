use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{Display, EnumString};

/// Stage id assigned to events that were emitted without a stage.
pub const UNKNOWN_STAGE: i32 = -1;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScalingReason {
    Cpu,
    Memory,
    JvmMemory,
    Network,
    QueueLag,
    QueueProcessed,
    DataDrop,
    UserDefined,
    Rps,
    SourceJobDrop,
    ManagerEvent,
    Clutch,
    ClutchExperimental,
    ClutchRps,
}

/// Metric kinds understood by the controller family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ControllerMetric {
    Cpu,
    Memory,
    Network,
    Lag,
    Drops,
    UserDefined,
    Rps,
    SourceJobDrop,
}

impl ScalingReason {
    /// Maps a signal onto the metric a controller consumes. Mode markers and
    /// manager events have no metric and never reach a controller.
    pub fn controller_metric(self) -> Option<ControllerMetric> {
        match self {
            Self::Cpu => Some(ControllerMetric::Cpu),
            Self::Memory | Self::JvmMemory => Some(ControllerMetric::Memory),
            Self::Network => Some(ControllerMetric::Network),
            Self::QueueLag => Some(ControllerMetric::Lag),
            Self::DataDrop => Some(ControllerMetric::Drops),
            Self::UserDefined => Some(ControllerMetric::UserDefined),
            Self::Rps => Some(ControllerMetric::Rps),
            Self::SourceJobDrop => Some(ControllerMetric::SourceJobDrop),
            Self::QueueProcessed
            | Self::ManagerEvent
            | Self::Clutch
            | Self::ClutchExperimental
            | Self::ClutchRps => None,
        }
    }
}

/// One scaling signal sample for a stage.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScalingEvent {
    pub reason: ScalingReason,
    #[serde(default = "unknown_stage")]
    pub stage: i32,
    pub raw_value: f64,
    pub effective_value: f64,
    pub current_worker_count: i64,
    #[serde(default)]
    pub message: Option<String>,
}

fn unknown_stage() -> i32 {
    UNKNOWN_STAGE
}

impl ScalingEvent {
    pub fn new(
        reason: ScalingReason,
        stage: Option<i32>,
        raw_value: f64,
        effective_value: f64,
        current_worker_count: i64,
    ) -> Self {
        Self {
            reason,
            stage: stage.unwrap_or(UNKNOWN_STAGE),
            raw_value,
            effective_value,
            current_worker_count,
            message: None,
        }
    }
}

impl fmt::Display for ScalingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ScalingEvent ({} stage {} raw {:.2} eff {:.2} workers {})",
            self.reason, self.stage, self.raw_value, self.effective_value, self.current_worker_count
        )
    }
}
