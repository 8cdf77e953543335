use super::{GatewayError, ScaleGateway, ScaleRequest};
use crate::actor::{self, handle_error};
use crate::utils::path_append;
use act_zero::{Actor, ActorError, ActorResult, Addr, Produces};
use anyhow::Context;
use async_trait::async_trait;
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::info;

/// Writes the latest request of every stage to `<dir>/<job>-stage-<n>.yml`
/// for an external orchestrator to pick up.
pub struct FileScaleGateway {
    directory_path: PathBuf,
}

impl FileScaleGateway {
    pub fn new(directory_path: impl AsRef<Path>) -> Self {
        Self {
            directory_path: directory_path.as_ref().into(),
        }
    }

    pub fn request_path(&self, job_id: &str, stage: i32) -> PathBuf {
        path_append(
            self.directory_path.join(format!("{}-stage-{}", job_id, stage)),
            ".yml",
        )
    }
}

#[async_trait]
impl Actor for FileScaleGateway {
    #[tracing::instrument(
        name = "FileScaleGateway::started",
        skip(self, _addr),
        fields(path = %self.directory_path.display())
    )]
    async fn started(&mut self, _addr: Addr<Self>) -> ActorResult<()>
    where
        Self: Sized,
    {
        info!("Started");

        Produces::ok(())
    }

    async fn error(&mut self, error: ActorError) -> bool {
        handle_error(error)
    }
}

impl fmt::Display for FileScaleGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileScaleGateway ({})",
            self.directory_path.to_string_lossy()
        )
    }
}

impl fmt::Debug for FileScaleGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[async_trait]
impl ScaleGateway for FileScaleGateway {
    #[tracing::instrument(
        name = "FileScaleGateway::scale_stage",
        skip(self, request),
        fields(job_id = %request.job_id, stage = request.stage)
    )]
    async fn scale_stage(&mut self, request: ScaleRequest) -> ActorResult<()> {
        let path = self.request_path(&request.job_id, request.stage);
        let written = {
            let request = request.clone();
            let path = path.clone();

            tokio::task::spawn_blocking(move || write_request(&path, &request))
                .await
                .context("Request writer panicked")
                .and_then(|result| result)
        };

        if let Err(source) = written {
            let error = GatewayError::Persist { request, source };
            return Err(Box::new(actor::Error::from(anyhow::Error::new(error))));
        }

        info!(desired_size = request.desired_size, "Wrote scale request to {}", path.display());

        Produces::ok(())
    }
}

fn write_request(path: &Path, request: &ScaleRequest) -> anyhow::Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to open {} for writing", path.display()))?;

    serde_yaml::to_writer(BufWriter::new(file), request)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use act_zero::call;
    use act_zero::runtimes::tokio::spawn_actor;
    use std::io::BufReader;

    #[tokio::test]
    async fn test_writes_latest_request_per_stage() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let gateway = FileScaleGateway::new(dir.path());
        let path = gateway.request_path("job-1", 2);
        let addr = spawn_actor(gateway);

        for desired_size in [3, 5] {
            call!(addr.scale_stage(ScaleRequest {
                job_id: "job-1".into(),
                stage: 2,
                desired_size,
                reason: "cpu".into(),
            }))
            .await?;
        }

        let written: ScaleRequest = serde_yaml::from_reader(BufReader::new(File::open(path)?))?;
        assert_eq!(5, written.desired_size);

        Ok(())
    }
}
