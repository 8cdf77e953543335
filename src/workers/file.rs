use super::{WorkerCountFeed, WorkerCountStream};
use anyhow::Context;
use async_stream::stream;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Polls a YAML `stage -> worker count` map.
#[derive(Debug, Clone)]
pub struct FileWorkerCountFeed {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileWorkerCountFeed {
    pub fn new(path: impl AsRef<Path>, poll_interval: Duration) -> Self {
        Self {
            path: path.as_ref().into(),
            poll_interval,
        }
    }
}

async fn read_counts(path: &Path) -> anyhow::Result<HashMap<i32, usize>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read worker counts from {}", path.display()))?;

    Ok(serde_yaml::from_str(&content)?)
}

impl WorkerCountFeed for FileWorkerCountFeed {
    fn worker_counts(&self, stage: i32) -> WorkerCountStream {
        let path = self.path.clone();
        let mut interval = tokio::time::interval(self.poll_interval);

        Box::pin(stream! {
            loop {
                interval.tick().await;

                match read_counts(&path).await {
                    Ok(counts) => {
                        if let Some(count) = counts.get(&stage) {
                            yield *count;
                        }
                    }
                    Err(e) => warn!(stage, "Failed to poll worker counts {:?}", e),
                }
            }
        })
    }
}
