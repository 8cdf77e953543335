use super::{WorkerCountFeed, WorkerCountStream};
use async_stream::stream;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::trace;

/// In-memory worker counts, updated by whoever observes the job.
#[derive(Debug, Clone, Default)]
pub struct SharedWorkerCounts {
    stages: Arc<Mutex<HashMap<i32, watch::Sender<Option<usize>>>>>,
}

impl SharedWorkerCounts {
    pub fn set(&self, stage: i32, count: usize) {
        trace!(stage, count, "Updating worker count");
        self.sender(stage, |sender| {
            sender.send_replace(Some(count));
        });
    }

    fn sender<R>(&self, stage: i32, f: impl FnOnce(&watch::Sender<Option<usize>>) -> R) -> R {
        let mut stages = self.stages.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = stages
            .entry(stage)
            .or_insert_with(|| watch::channel(None).0);

        f(sender)
    }
}

impl WorkerCountFeed for SharedWorkerCounts {
    fn worker_counts(&self, stage: i32) -> WorkerCountStream {
        let mut receiver = self.sender(stage, |sender| sender.subscribe());

        Box::pin(stream! {
            loop {
                let current = *receiver.borrow_and_update();
                if let Some(count) = current {
                    yield count;
                }

                if receiver.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}
