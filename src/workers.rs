mod file;
mod shared;

use crate::config;
use crate::AppConfig;
use async_stream::stream;
use futures::{Stream, StreamExt};
use std::fmt::Debug;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

pub use file::FileWorkerCountFeed;
pub use shared::SharedWorkerCounts;

pub type WorkerCountStream = Pin<Box<dyn Stream<Item = usize> + Send>>;

/// Live worker counts of a job's stages.
pub trait WorkerCountFeed: Send + Sync + CloneWorkerCountFeed + Debug {
    fn worker_counts(&self, stage: i32) -> WorkerCountStream;
}

pub trait CloneWorkerCountFeed {
    fn clone_boxed(&self) -> Box<dyn WorkerCountFeed>;
}

impl<T> CloneWorkerCountFeed for T
where
    T: WorkerCountFeed + Clone + 'static,
{
    fn clone_boxed(&self) -> Box<dyn WorkerCountFeed> {
        Box::new(self.clone())
    }
}

impl Clone for Box<dyn WorkerCountFeed> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// Emits the latest count at most once per `period`, skipping counts equal to
/// the previously emitted one. Ends once `counts` ended and the last pending
/// count was flushed.
pub fn sample_worker_counts(mut counts: WorkerCountStream, period: Duration) -> WorkerCountStream {
    Box::pin(stream! {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        let mut latest: Option<usize> = None;
        let mut emitted: Option<usize> = None;
        let mut open = true;

        loop {
            let ticked = tokio::select! {
                next = counts.next(), if open => {
                    match next {
                        Some(count) => latest = Some(count),
                        None => open = false,
                    }
                    false
                }
                _ = ticker.tick() => true,
            };

            if !ticked {
                continue;
            }

            if let Some(count) = latest {
                if emitted != Some(count) {
                    emitted = Some(count);
                    yield count;
                }
            }

            if !open {
                break;
            }
        }
    })
}

pub fn build_from_config(
    config: AppConfig,
    shared: &SharedWorkerCounts,
) -> anyhow::Result<Box<dyn WorkerCountFeed>> {
    Ok(match &config.worker_counts {
        config::WorkerCounts::Shared => Box::new(shared.clone()),
        config::WorkerCounts::File {
            path,
            poll_interval,
        } => Box::new(FileWorkerCountFeed::new(path, *poll_interval)),
    })
}
