//! Periodic Docker garbage collection
//!
//! The sandbox force-removes its own container and image on every exit
//! path, but daemon restarts and kill -9 still leak resources. This
//! independent sweeper removes exited containers and old untagged
//! images on a timer; it never touches the queue or the submissions.

use bollard::Docker;
use bollard::query_parameters::{
    ListContainersOptionsBuilder, ListImagesOptionsBuilder, RemoveContainerOptionsBuilder,
    RemoveImageOptionsBuilder,
};
use chrono::Utc;
use std::time::Duration;

/// Default age after which an untagged image is collected.
pub const DEFAULT_IMAGE_MAX_AGE: Duration = Duration::from_secs(24 * 3600);
/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

/// Point-in-time runtime resource counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerStats {
    pub images: usize,
    pub containers: usize,
    pub running_containers: usize,
    pub dangling_images: usize,
}

/// Remove untagged images older than `max_age`. Returns how many went.
pub async fn cleanup_old_images(docker: &Docker, max_age: Duration) -> usize {
    let options = ListImagesOptionsBuilder::default().all(false).build();
    let images = match docker.list_images(Some(options)).await {
        Ok(images) => images,
        Err(e) => {
            tracing::error!("image cleanup failed to list images: {e}");
            return 0;
        }
    };

    let cutoff = Utc::now().timestamp() - max_age.as_secs() as i64;
    let mut removed = 0;
    for image in images {
        if !is_untagged(&image.repo_tags) || image.created >= cutoff {
            continue;
        }
        tracing::info!(image = %image.id, "removing old untagged image");
        let options = RemoveImageOptionsBuilder::default().force(true).build();
        match docker.remove_image(&image.id, Some(options), None).await {
            Ok(_) => removed += 1,
            Err(e) => tracing::warn!(image = %image.id, "failed to remove image: {e}"),
        }
    }
    if removed > 0 {
        tracing::info!(removed, "old image sweep complete");
    }
    removed
}

/// Remove every exited container. Returns how many went.
pub async fn cleanup_exited_containers(docker: &Docker) -> usize {
    let options = ListContainersOptionsBuilder::default().all(true).build();
    let containers = match docker.list_containers(Some(options)).await {
        Ok(containers) => containers,
        Err(e) => {
            tracing::error!("container cleanup failed to list containers: {e}");
            return 0;
        }
    };

    let mut removed = 0;
    for container in containers {
        if !has_exited(container.status.as_deref()) {
            continue;
        }
        let Some(id) = container.id else { continue };
        tracing::info!(container = %id, "removing exited container");
        let options = RemoveContainerOptionsBuilder::default().force(true).build();
        match docker.remove_container(&id, Some(options)).await {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(container = %id, "failed to remove container: {e}"),
        }
    }
    if removed > 0 {
        tracing::info!(removed, "exited container sweep complete");
    }
    removed
}

/// Count images and containers for operator visibility.
pub async fn docker_stats(docker: &Docker) -> Result<DockerStats, bollard::errors::Error> {
    let images = docker
        .list_images(Some(ListImagesOptionsBuilder::default().all(false).build()))
        .await?;
    let all = docker
        .list_containers(Some(ListContainersOptionsBuilder::default().all(true).build()))
        .await?;
    let running = docker
        .list_containers(None::<bollard::query_parameters::ListContainersOptions>)
        .await?;

    Ok(DockerStats {
        dangling_images: images.iter().filter(|i| is_untagged(&i.repo_tags)).count(),
        images: images.len(),
        containers: all.len(),
        running_containers: running.len(),
    })
}

/// Sweep forever. Spawned as an independent task by the binary.
pub async fn run_periodic(docker: Docker, interval: Duration) {
    tracing::info!(?interval, "docker cleanup scheduler started");
    loop {
        cleanup_old_images(&docker, DEFAULT_IMAGE_MAX_AGE).await;
        cleanup_exited_containers(&docker).await;
        match docker_stats(&docker).await {
            Ok(stats) => tracing::debug!(?stats, "cleanup pass complete"),
            Err(e) => tracing::debug!("cleanup pass complete, stats unavailable: {e}"),
        }
        tokio::time::sleep(interval).await;
    }
}

fn is_untagged(repo_tags: &[String]) -> bool {
    repo_tags.is_empty() || repo_tags.iter().any(|t| t.contains("<none>"))
}

/// The daemon reports exited containers with a status line like
/// `Exited (0) 2 hours ago`.
fn has_exited(status: Option<&str>) -> bool {
    status.is_some_and(|s| s.starts_with("Exited"))
}
