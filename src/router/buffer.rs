use super::RouterError;
use crate::event::ScalingEvent;
use crate::metrics::ScalerMetrics;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tracing::warn;

pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

#[derive(Debug)]
struct State {
    events: VecDeque<ScalingEvent>,
    closed: bool,
}

/// Bounded event queue between producers and the router. When full the oldest
/// buffered event is dropped; producers never wait.
#[derive(Debug)]
pub struct EventBuffer {
    capacity: usize,
    state: Mutex<State>,
    notify: Notify,
    emptied: Notify,
    metrics: Arc<ScalerMetrics>,
}

impl EventBuffer {
    pub fn new(capacity: usize, metrics: Arc<ScalerMetrics>) -> Self {
        let capacity = capacity.max(1);

        Self {
            capacity,
            state: Mutex::new(State {
                events: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            emptied: Notify::new(),
            metrics,
        }
    }

    pub fn push(&self, event: ScalingEvent) -> Result<(), RouterError> {
        let dropped = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return Err(RouterError::Closed);
            }

            let dropped = if state.events.len() >= self.capacity {
                state.events.pop_front()
            } else {
                None
            };
            state.events.push_back(event);
            dropped
        };

        if let Some(dropped) = dropped {
            self.metrics.dropped_events_count().increment();
            warn!(capacity = self.capacity, "Event buffer full, dropped oldest {}", dropped);
        }

        self.notify.notify_one();
        Ok(())
    }

    /// Next buffered event, or `None` once the buffer is closed. Buffered
    /// events are abandoned on close.
    pub async fn pull(&self) -> Option<ScalingEvent> {
        loop {
            {
                let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
                if state.closed {
                    return None;
                }
                if let Some(event) = state.events.pop_front() {
                    let emptied = state.events.is_empty();
                    drop(state);

                    if emptied {
                        self.emptied.notify_waiters();
                    }
                    return Some(event);
                }
            }

            self.notify.notified().await;
        }
    }

    /// Resolves once every buffered event was pulled or the buffer closed.
    pub async fn drained(&self) {
        loop {
            let emptied = self.emptied.notified();
            if self.is_empty() || self.is_closed() {
                return;
            }

            emptied.await;
        }
    }

    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = true;
        state.events.clear();
        drop(state);

        self.notify.notify_one();
        self.emptied.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).closed
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
