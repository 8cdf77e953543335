use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::info;

/// Process wide switches that can veto scale ups or scale downs for every
/// stage whose policy allows the autoscale manager to do so. Polled on every
/// decision.
pub trait ScalingToggles: Send + Sync + Debug {
    fn is_scale_up_enabled(&self) -> bool;
    fn is_scale_down_enabled(&self) -> bool;
}

#[derive(Debug)]
pub struct SwitchToggles {
    scale_up: AtomicBool,
    scale_down: AtomicBool,
}

impl SwitchToggles {
    pub fn new(scale_up_enabled: bool, scale_down_enabled: bool) -> Self {
        Self {
            scale_up: AtomicBool::new(scale_up_enabled),
            scale_down: AtomicBool::new(scale_down_enabled),
        }
    }

    pub fn set_scale_up_enabled(&self, enabled: bool) {
        info!(enabled, "Switching scale up");
        self.scale_up.store(enabled, Ordering::SeqCst);
    }

    pub fn set_scale_down_enabled(&self, enabled: bool) {
        info!(enabled, "Switching scale down");
        self.scale_down.store(enabled, Ordering::SeqCst);
    }
}

impl Default for SwitchToggles {
    fn default() -> Self {
        Self::new(true, true)
    }
}

impl ScalingToggles for SwitchToggles {
    fn is_scale_up_enabled(&self) -> bool {
        self.scale_up.load(Ordering::SeqCst)
    }

    fn is_scale_down_enabled(&self) -> bool {
        self.scale_down.load(Ordering::SeqCst)
    }
}
