//! In-process counters and gauges of one job scaler.

use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge(AtomicI64);

impl Gauge {
    pub fn set(&self, value: i64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub scaler_id: String,
    pub request_metrics_count: u64,
    pub dropped_events_count: u64,
    pub desire_worker_size: BTreeMap<i32, i64>,
}

#[derive(Debug)]
pub struct ScalerMetrics {
    scaler_id: String,
    request_metrics_count: Counter,
    dropped_events_count: Counter,
    desire_worker_size: RwLock<HashMap<i32, Arc<Gauge>>>,
}

impl ScalerMetrics {
    pub fn new(scaler_id: impl Into<String>) -> Self {
        Self {
            scaler_id: scaler_id.into(),
            request_metrics_count: Counter::default(),
            dropped_events_count: Counter::default(),
            desire_worker_size: RwLock::new(HashMap::new()),
        }
    }

    pub fn scaler_id(&self) -> &str {
        &self.scaler_id
    }

    /// Incremented for every event the router pulls from the buffer.
    pub fn request_metrics_count(&self) -> &Counter {
        &self.request_metrics_count
    }

    pub fn dropped_events_count(&self) -> &Counter {
        &self.dropped_events_count
    }

    /// Gauge with the last desired size requested for `stage`, registered on
    /// first use.
    pub fn desire_worker_size(&self, stage: i32) -> Arc<Gauge> {
        if let Some(gauge) = self
            .desire_worker_size
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&stage)
        {
            return Arc::clone(gauge);
        }

        let mut gauges = self
            .desire_worker_size
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gauges.entry(stage).or_insert_with(Default::default))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let desire_worker_size = self
            .desire_worker_size
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(stage, gauge)| (*stage, gauge.value()))
            .collect();

        MetricsSnapshot {
            scaler_id: self.scaler_id.clone(),
            request_metrics_count: self.request_metrics_count.value(),
            dropped_events_count: self.dropped_events_count.value(),
            desire_worker_size,
        }
    }
}
