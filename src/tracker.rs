use crate::policy::RollingCount;
use std::collections::VecDeque;

/// Windowed counter over the last `rolling_count.of` samples of one signal.
///
/// A threshold counts as triggered once at least `rolling_count.count`
/// samples inside the window crossed it.
#[derive(Debug, Clone)]
pub struct RollingThresholdTracker {
    scale_up_above_pct: f64,
    scale_down_below_pct: f64,
    rolling_count: RollingCount,
    window: VecDeque<f64>,
    high_count: usize,
    low_count: usize,
}

impl RollingThresholdTracker {
    pub fn new(scale_up_above_pct: f64, scale_down_below_pct: f64, rolling_count: RollingCount) -> Self {
        let rolling_count = rolling_count.normalized();

        Self {
            scale_up_above_pct,
            scale_down_below_pct,
            rolling_count,
            window: VecDeque::with_capacity(rolling_count.of),
            high_count: 0,
            low_count: 0,
        }
    }

    pub fn add(&mut self, value: f64) {
        if self.window.len() == self.rolling_count.of {
            if let Some(evicted) = self.window.pop_front() {
                if self.is_high(evicted) {
                    self.high_count -= 1;
                }
                if self.is_low(evicted) {
                    self.low_count -= 1;
                }
            }
        }

        if self.is_high(value) {
            self.high_count += 1;
        }
        if self.is_low(value) {
            self.low_count += 1;
        }

        self.window.push_back(value);
    }

    pub fn high_thresh_triggered(&self) -> bool {
        self.high_count >= self.rolling_count.count
    }

    pub fn low_thresh_triggered(&self) -> bool {
        self.low_count >= self.rolling_count.count
    }

    pub fn current_high_count(&self) -> usize {
        self.high_count
    }

    pub fn current_low_count(&self) -> usize {
        self.low_count
    }

    fn is_high(&self, value: f64) -> bool {
        value > self.scale_up_above_pct
    }

    fn is_low(&self, value: f64) -> bool {
        value < self.scale_down_below_pct
    }
}
