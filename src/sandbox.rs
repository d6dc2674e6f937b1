//! Sandbox Runner: one container, end to end
//!
//! Loads an image tarball, runs a single container with the given
//! mounts and limits, races its exit against a wall-clock deadline,
//! collects logs, and tears everything down. The container never gets
//! network access and always runs the image's default command as root.
//!
//! Teardown is unconditional: whatever path the run takes, the container
//! and the loaded image are force-removed; teardown failures are logged
//! and suppressed (the periodic GC sweeps leftovers).

use crate::metrics::{DEFAULT_SAMPLE_INTERVAL, MetricsSampler, MetricsSummary};
use anyhow::{Context, Result, bail};
use bollard::Docker;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, ImportImageOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder, StartContainerOptions,
    StopContainerOptionsBuilder, WaitContainerOptions,
};
use bytes::Bytes;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Grace period a timed-out container gets before the runtime kills it.
const STOP_GRACE_SECONDS: i32 = 10;

/// Extra delay before stopping the sampler, letting it catch the final
/// sample of a container that exited between two ticks.
const SAMPLER_GRACE: Duration = Duration::from_millis(100);

/// One host directory mapped into the container.
#[derive(Debug, Clone)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(host: PathBuf, container: &str) -> Self {
        Self {
            host,
            container: container.to_string(),
            read_only: true,
        }
    }

    pub fn read_write(host: PathBuf, container: &str) -> Self {
        Self {
            host,
            container: container.to_string(),
            read_only: false,
        }
    }

    /// Bind spec in the runtime's `host:container:mode` form. The host
    /// side must be absolute for the daemon to accept it.
    fn bind_spec(&self) -> Result<String> {
        let host = std::path::absolute(&self.host)
            .with_context(|| format!("cannot absolutize mount source {}", self.host.display()))?;
        let mode = if self.read_only { "ro" } else { "rw" };
        Ok(format!("{}:{}:{}", host.display(), self.container, mode))
    }
}

/// Everything needed to run one sandboxed container.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image_tar: PathBuf,
    pub mounts: Vec<Mount>,
    pub mem_limit_bytes: i64,
    pub nano_cpus: i64,
    pub timeout: Duration,
    /// Attach a [`MetricsSampler`] for the lifetime of the container.
    pub sample_metrics: bool,
}

/// What happened inside the sandbox.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Container exit code; `-1` when the deadline fired.
    pub exit_code: i64,
    pub timed_out: bool,
    /// Merged stdout + stderr, lossy UTF-8.
    pub logs: String,
    pub metrics: Option<MetricsSummary>,
    pub wall_time_seconds: f64,
}

/// Run one container to completion (or deadline) and tear it down.
///
/// Orchestration failures (image load, create, wait) bubble up as
/// errors; the caller records them as an `ERROR` verdict. Teardown runs
/// on every path, error or not.
pub async fn run(docker: &Docker, spec: &RunSpec) -> Result<RunOutcome> {
    let mut teardown = Teardown::default();
    let result = run_inner(docker, spec, &mut teardown).await;
    teardown.execute(docker).await;
    result
}

async fn run_inner(docker: &Docker, spec: &RunSpec, teardown: &mut Teardown) -> Result<RunOutcome> {
    let image_ref = load_image(docker, spec).await?;
    teardown.image = Some(image_ref.clone());
    tracing::debug!(image = %image_ref, "image loaded");

    let mut binds = Vec::with_capacity(spec.mounts.len());
    for mount in &spec.mounts {
        binds.push(mount.bind_spec()?);
    }

    let body = ContainerCreateBody {
        image: Some(image_ref.clone()),
        user: Some("root".to_string()),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            binds: Some(binds),
            memory: Some(spec.mem_limit_bytes),
            nano_cpus: Some(spec.nano_cpus),
            ..Default::default()
        }),
        ..Default::default()
    };
    let created = docker
        .create_container(None::<CreateContainerOptions>, body)
        .await
        .context("failed to create container")?;
    let container_id = created.id;
    teardown.container = Some(container_id.clone());

    docker
        .start_container(&container_id, None::<StartContainerOptions>)
        .await
        .context("failed to start container")?;

    let mut sampler = spec
        .sample_metrics
        .then(|| MetricsSampler::start(docker.clone(), &container_id, DEFAULT_SAMPLE_INTERVAL));

    // Race the container's exit against the deadline; whichever fires
    // first wins (the runtime client has no native deadline).
    let started = Instant::now();
    let mut wait_stream = docker.wait_container(&container_id, None::<WaitContainerOptions>);
    let wait_result = tokio::time::timeout(spec.timeout, wait_stream.next()).await;
    let wall_time_seconds = round2(started.elapsed().as_secs_f64());

    // Let the sampler catch the final sample of a fast container.
    tokio::time::sleep(SAMPLER_GRACE).await;
    let metrics = match sampler.as_mut() {
        Some(sampler) => {
            sampler.stop().await;
            Some(sampler.summary())
        }
        None => None,
    };

    let (exit_code, timed_out) = match wait_result {
        Err(_elapsed) => {
            tracing::info!(container = %container_id, "deadline fired, stopping container");
            let options = StopContainerOptionsBuilder::default().t(STOP_GRACE_SECONDS).build();
            if let Err(e) = docker.stop_container(&container_id, Some(options)).await {
                tracing::warn!(container = %container_id, "stop after timeout failed: {e}");
            }
            (-1, true)
        }
        Ok(Some(Ok(response))) => (response.status_code, false),
        // The client reports a non-zero exit as a wait "error" carrying
        // the code.
        Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
            (code, false)
        }
        Ok(Some(Err(e))) => return Err(e).context("failed waiting for container"),
        Ok(None) => bail!("container wait stream ended without a status"),
    };

    // Logs must be read before the container is removed.
    let logs = collect_logs(docker, &container_id).await;

    Ok(RunOutcome {
        exit_code,
        timed_out,
        logs,
        metrics,
        wall_time_seconds,
    })
}

/// Load the tarball and return the image reference reported by the daemon.
async fn load_image(docker: &Docker, spec: &RunSpec) -> Result<String> {
    let bytes = tokio::fs::read(&spec.image_tar)
        .await
        .with_context(|| format!("failed to read image tar {}", spec.image_tar.display()))?;

    let options = ImportImageOptionsBuilder::default().quiet(false).build();
    let mut stream = docker.import_image(options, bollard::body_full(Bytes::from(bytes)), None);

    let mut image_ref = None;
    while let Some(message) = stream.next().await {
        let info = message.context("image load failed")?;
        if let Some(error) = info.error {
            bail!("image load failed: {error}");
        }
        if let Some(line) = info.stream.as_deref() {
            if let Some(loaded) = parse_loaded_image_line(line) {
                image_ref = Some(loaded);
            }
        }
    }
    image_ref.ok_or_else(|| {
        anyhow::anyhow!(
            "daemon did not report a loaded image for {}",
            spec.image_tar.display()
        )
    })
}

/// Parse the daemon's `Loaded image: <ref>` / `Loaded image ID: <id>` line.
fn parse_loaded_image_line(line: &str) -> Option<String> {
    let line = line.trim();
    line.strip_prefix("Loaded image ID: ")
        .or_else(|| line.strip_prefix("Loaded image: "))
        .map(|rest| rest.trim().to_string())
}

async fn collect_logs(docker: &Docker, container_id: &str) -> String {
    let options = LogsOptionsBuilder::default().stdout(true).stderr(true).build();
    let mut stream = docker.logs(container_id, Some(options));
    let mut text = String::new();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(output) => text.push_str(&String::from_utf8_lossy(&output.into_bytes())),
            Err(e) => {
                tracing::warn!(container = %container_id, "log collection failed: {e}");
                if text.is_empty() {
                    text = "failed to collect container logs".to_string();
                }
                break;
            }
        }
    }
    text
}

/// Container and image ids that must not outlive the run.
#[derive(Debug, Default)]
struct Teardown {
    container: Option<String>,
    image: Option<String>,
}

impl Teardown {
    async fn execute(&mut self, docker: &Docker) {
        if let Some(container) = self.container.take() {
            let options = RemoveContainerOptionsBuilder::default().force(true).build();
            if let Err(e) = docker.remove_container(&container, Some(options)).await {
                tracing::warn!(container = %container, "container removal failed: {e}");
            }
        }
        if let Some(image) = self.image.take() {
            let options = RemoveImageOptionsBuilder::default().force(true).build();
            if let Err(e) = docker.remove_image(&image, Some(options), None).await {
                tracing::warn!(image = %image, "image removal failed: {e}");
            }
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
