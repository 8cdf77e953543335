use stage_auto_scaler::clock::{Clock, SystemClock};
use stage_auto_scaler::config::load_config;
use stage_auto_scaler::controller::ProportionalControllerFactory;
use stage_auto_scaler::event::ScalingEvent;
use stage_auto_scaler::overrides::EnvPropertySource;
use stage_auto_scaler::router::EventSink;
use stage_auto_scaler::service::{JobAutoScaler, ScalerContext};
use stage_auto_scaler::toggles::SwitchToggles;
use stage_auto_scaler::workers::SharedWorkerCounts;
use stage_auto_scaler::{gateway, workers};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::subscriber::set_global_default;
use tracing::{info, warn};
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

fn init_logging() -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);

    let subscriber = Registry::default()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer);

    set_global_default(subscriber)?;

    Ok(())
}

fn ingest(line: &str, sink: &EventSink, worker_counts: &SharedWorkerCounts) {
    if line.trim().is_empty() {
        return;
    }

    let event: ScalingEvent = match serde_json::from_str(line) {
        Ok(event) => event,
        Err(e) => {
            warn!(line, "Skipping malformed event {:?}", e);
            return;
        }
    };

    if event.current_worker_count >= 0 {
        worker_counts.set(event.stage, event.current_worker_count as usize);
    }

    if let Err(e) = sink.send(event) {
        warn!("Failed to submit event {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging()?;
    let config = load_config()?;

    let shared_worker_counts = SharedWorkerCounts::default();
    let gateway = gateway::build_from_config(Arc::clone(&config))?;
    let worker_counts = workers::build_from_config(Arc::clone(&config), &shared_worker_counts)?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let scaler = JobAutoScaler::new(ScalerContext {
        job_id: config.job_id.clone(),
        stages: config.stages.clone(),
        rule: config.rule.clone(),
        properties: Arc::new(EnvPropertySource),
        gateway,
        worker_counts,
        toggles: Arc::new(SwitchToggles::new(
            config.toggles.scale_up_enabled,
            config.toggles.scale_down_enabled,
        )),
        controller_factory: Arc::new(ProportionalControllerFactory::new(Arc::clone(&clock))),
        clock,
        buffer_capacity: config.router.buffer_capacity,
        settings: config.pipeline_settings(),
    });
    scaler.start();

    let sink = scaler.sink();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    let interrupted = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break true,
            line = lines.next_line() => match line? {
                Some(line) => ingest(&line, &sink, &shared_worker_counts),
                None => break false,
            },
        }
    };

    if !interrupted {
        info!("Event input closed, draining buffered events");
        scaler.drained().await;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => (),
            _ = tokio::time::sleep(config.shutdown_grace) => (),
        }
    }

    scaler.shutdown();
    scaler.stopped().await;

    info!(
        metrics = serde_json::to_string(&scaler.metrics().snapshot())?.as_str(),
        "Job auto scaler stopped"
    );

    Ok(())
}
