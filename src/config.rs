use crate::actuator::RetryPolicy;
use crate::pipeline::PipelineSettings;
use crate::policy::{ScalerRule, StageSchedulingInfo};
use crate::router::DEFAULT_BUFFER_CAPACITY;
use crate::AppConfig;
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

#[derive(Deserialize, Debug)]
pub struct Config {
    pub job_id: String,
    #[serde(default)]
    pub stages: HashMap<i32, StageSchedulingInfo>,
    #[serde(default)]
    pub rule: Option<ScalerRule>,
    #[serde(default)]
    pub router: Router,
    #[serde(default)]
    pub actuator: Actuator,
    pub gateway: Gateway,
    #[serde(default)]
    pub worker_counts: WorkerCounts,
    #[serde(default)]
    pub toggles: Toggles,
    /// How long the binary keeps scaling after its input ended.
    #[serde(default = "default_shutdown_grace", with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Config {
    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            retry_policy: RetryPolicy {
                backoff_step: self.actuator.backoff_step,
                max_backoff_multiplier: self.actuator.max_backoff_multiplier,
            },
            worker_count_sample_interval: self.router.worker_count_sample_interval,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Router {
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub worker_count_sample_interval: Duration,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            buffer_capacity: default_buffer_capacity(),
            worker_count_sample_interval: default_sample_interval(),
        }
    }
}

fn default_shutdown_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_buffer_capacity() -> usize {
    DEFAULT_BUFFER_CAPACITY
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(5)
}

#[derive(Deserialize, Debug, Clone)]
pub struct Actuator {
    #[serde(default = "default_backoff_step", with = "humantime_serde")]
    pub backoff_step: Duration,
    #[serde(default = "default_max_backoff_multiplier")]
    pub max_backoff_multiplier: u32,
}

impl Default for Actuator {
    fn default() -> Self {
        Self {
            backoff_step: default_backoff_step(),
            max_backoff_multiplier: default_max_backoff_multiplier(),
        }
    }
}

fn default_backoff_step() -> Duration {
    RetryPolicy::default().backoff_step
}

fn default_max_backoff_multiplier() -> u32 {
    RetryPolicy::default().max_backoff_multiplier
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Gateway {
    Mock {
        #[serde(default)]
        failures: usize,
    },
    File {
        path: String,
    },
}

#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WorkerCounts {
    /// Mirrors the worker counts carried by ingested events.
    Shared,
    File {
        path: String,
        #[serde(with = "humantime_serde")]
        poll_interval: Duration,
    },
}

impl Default for WorkerCounts {
    fn default() -> Self {
        Self::Shared
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Toggles {
    #[serde(default = "enabled")]
    pub scale_up_enabled: bool,
    #[serde(default = "enabled")]
    pub scale_down_enabled: bool,
}

impl Default for Toggles {
    fn default() -> Self {
        Self {
            scale_up_enabled: true,
            scale_down_enabled: true,
        }
    }
}

fn enabled() -> bool {
    true
}

pub fn load_config() -> anyhow::Result<AppConfig> {
    let config_path = get_config_path()?;
    let file = File::open(&config_path)
        .with_context(|| format!("Failed to open config file {}", &config_path))?;

    Ok(Arc::new(serde_yaml::from_reader(BufReader::new(file)).with_context(
        || format!("Failed to parse config file {}", &config_path),
    )?))
}

fn get_config_path() -> anyhow::Result<String> {
    use std::env;
    use tracing::info;

    env::var("APP_CONFIG").or_else(|e| {
        info!(
            error = format!("{:?}", e).as_str(),
            "Missing or invalid APP_CONFIG env var, fallback to config.yml"
        );
        Ok("config.yml".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ScalingReason;

    #[test]
    fn test_minimal_config_uses_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let config: Config = serde_yaml::from_str(
            r#"
job_id: job-1
gateway:
  type: mock
"#,
        )?;

        assert_eq!(100, config.router.buffer_capacity);
        assert_eq!(RetryPolicy::default(), config.pipeline_settings().retry_policy);
        assert_eq!(
            Duration::from_secs(5),
            config.pipeline_settings().worker_count_sample_interval
        );
        assert!(matches!(config.gateway, Gateway::Mock { failures: 0 }));
        assert!(matches!(config.worker_counts, WorkerCounts::Shared));
        assert!(config.toggles.scale_up_enabled && config.toggles.scale_down_enabled);
        assert!(config.rule.is_none());
        assert_eq!(Duration::from_secs(5), config.shutdown_grace);

        Ok(())
    }

    #[test]
    fn test_full_config_is_parsed() -> Result<(), Box<dyn std::error::Error>> {
        let config: Config = serde_yaml::from_str(
            r#"
job_id: job-1
stages:
  1:
    number_of_instances: 2
    scaling_policy:
      min: 1
      max: 6
      cooldown_secs: 30
      strategies:
        cpu:
          reason: cpu
          scale_up_above_pct: 75
          scale_down_below_pct: 20
          rolling_count:
            count: 2
            of: 4
rule:
  rule_id: rule-3
  metadata:
    jobmaster.scaler.config: '{"1": {"maxSize": 12}}'
router:
  buffer_capacity: 50
  worker_count_sample_interval: 10s
actuator:
  backoff_step: 500ms
  max_backoff_multiplier: 4
gateway:
  type: file
  path: /tmp/scaling
worker_counts:
  type: file
  path: /tmp/workers.yml
  poll_interval: 2s
toggles:
  scale_down_enabled: false
"#,
        )?;

        let policy = config.stages[&1].scaling_policy.as_ref().unwrap();
        assert_eq!(30, policy.cooldown_secs);
        assert_eq!(4, policy.strategy(ScalingReason::Cpu).unwrap().rolling_count.of);
        assert_eq!(Some("rule-3"), config.rule.as_ref().map(|r| r.rule_id.as_str()));
        assert_eq!(50, config.router.buffer_capacity);
        assert_eq!(
            RetryPolicy {
                backoff_step: Duration::from_millis(500),
                max_backoff_multiplier: 4
            },
            config.pipeline_settings().retry_policy
        );
        assert!(matches!(config.gateway, Gateway::File { .. }));
        assert!(matches!(
            config.worker_counts,
            WorkerCounts::File { poll_interval, .. } if poll_interval == Duration::from_secs(2)
        ));
        assert!(config.toggles.scale_up_enabled);
        assert!(!config.toggles.scale_down_enabled);

        Ok(())
    }
}
