//! Container resource metrics sampler
//!
//! A cooperative background task polls the runtime's stats endpoint for
//! one container and records `(cpu %, memory MiB)` per tick. The worker
//! attaches one sampler to each participant run and asks for the peak
//! summary once the container has exited.
//!
//! CPU% is computed from consecutive usage snapshots:
//! `(Δcontainer_cpu / Δsystem_cpu) × online_cpus × 100`, clamped to
//! `[0, 100 × online_cpus]`; a zero delta on either side yields 0. The
//! very first snapshot only seeds the deltas unless it already carries
//! cumulative container CPU, which happens for containers that finish
//! within one sampling interval.

use bollard::Docker;
use bollard::models::ContainerStatsResponse;
use bollard::query_parameters::StatsOptionsBuilder;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default time between two samples.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(200);

/// How long `stop()` waits for the sampler task to drain.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
struct Sample {
    cpu_percent: f64,
    memory_mb: f64,
}

/// Peak resource usage over the sampled window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSummary {
    pub cpu_peak: f64,
    pub memory_peak: f64,
}

/// Background sampler attached to one running container.
///
/// # Examples
///
/// ```rust,ignore
/// use verdict::metrics::{MetricsSampler, DEFAULT_SAMPLE_INTERVAL};
///
/// let mut sampler = MetricsSampler::start(docker.clone(), &container_id, DEFAULT_SAMPLE_INTERVAL);
/// // ... container runs ...
/// sampler.stop().await;
/// let summary = sampler.summary();
/// println!("peak cpu {}%, peak mem {} MiB", summary.cpu_peak, summary.memory_peak);
/// ```
pub struct MetricsSampler {
    samples: Arc<Mutex<Vec<Sample>>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl MetricsSampler {
    /// Spawn the sampling task and return immediately.
    pub fn start(docker: Docker, container_id: &str, interval: Duration) -> Self {
        let samples: Arc<Mutex<Vec<Sample>>> = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let task_samples = Arc::clone(&samples);
        let task_cancel = cancel.clone();
        let container_id = container_id.to_string();
        let handle = tokio::spawn(async move {
            sample_loop(docker, container_id, interval, task_samples, task_cancel).await;
        });

        Self {
            samples,
            cancel,
            handle: Some(handle),
        }
    }

    /// Signal the task to exit and wait up to 2 s for it to drain.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("metrics sampler did not drain within {:?}", STOP_JOIN_TIMEOUT);
            }
        }
    }

    /// Peak summary over everything sampled so far.
    pub fn summary(&self) -> MetricsSummary {
        let samples = self.samples.lock().expect("sampler mutex poisoned");
        summarize(&samples)
    }
}

async fn sample_loop(
    docker: Docker,
    container_id: String,
    interval: Duration,
    samples: Arc<Mutex<Vec<Sample>>>,
    cancel: CancellationToken,
) {
    let mut seeded = false;
    tracing::debug!(container = %short_id(&container_id), "metrics sampling started");

    while !cancel.is_cancelled() {
        let options = StatsOptionsBuilder::default()
            .stream(false)
            .one_shot(false)
            .build();
        match docker.stats(&container_id, Some(options)).next().await {
            Some(Ok(stats)) => {
                if !seeded {
                    seeded = true;
                    // A container that has not been scheduled yet reports
                    // zero cumulative CPU; that snapshot only seeds the
                    // deltas. Short-lived containers already carry usage
                    // on the first read and are recorded immediately.
                    if total_cpu_usage(&stats) == 0 {
                        if tick(&cancel, interval).await {
                            break;
                        }
                        continue;
                    }
                }

                let sample = Sample {
                    cpu_percent: cpu_percent(&stats),
                    memory_mb: memory_mib(&stats),
                };
                samples.lock().expect("sampler mutex poisoned").push(sample);
            }
            Some(Err(e)) if is_not_found(&e) => {
                tracing::debug!(container = %short_id(&container_id), "container gone, sampler exiting");
                break;
            }
            Some(Err(e)) => {
                // Transient stats failures are expected around container
                // shutdown; keep sampling until told to stop.
                tracing::debug!(container = %short_id(&container_id), "stats sample failed: {e}");
            }
            None => break,
        }

        if tick(&cancel, interval).await {
            break;
        }
    }
}

/// Sleep one interval; returns true when cancelled instead.
async fn tick(cancel: &CancellationToken, interval: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(interval) => false,
    }
}

fn total_cpu_usage(stats: &ContainerStatsResponse) -> u64 {
    stats
        .cpu_stats
        .as_ref()
        .and_then(|cpu| cpu.cpu_usage.as_ref())
        .and_then(|usage| usage.total_usage)
        .unwrap_or(0)
}

/// CPU usage percent derived from one stats response (the runtime ships
/// the previous snapshot alongside the current one).
pub fn cpu_percent(stats: &ContainerStatsResponse) -> f64 {
    let cpu = total_cpu_usage(stats);
    let precpu = stats
        .precpu_stats
        .as_ref()
        .and_then(|pre| pre.cpu_usage.as_ref())
        .and_then(|usage| usage.total_usage)
        .unwrap_or(0);
    let system = stats
        .cpu_stats
        .as_ref()
        .and_then(|c| c.system_cpu_usage)
        .unwrap_or(0);
    let presystem = stats
        .precpu_stats
        .as_ref()
        .and_then(|c| c.system_cpu_usage)
        .unwrap_or(0);

    let cpu_delta = cpu.saturating_sub(precpu);
    let system_delta = system.saturating_sub(presystem);
    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }

    let cpus = online_cpus(stats);
    let percent = (cpu_delta as f64 / system_delta as f64) * cpus as f64 * 100.0;
    percent.clamp(0.0, 100.0 * cpus as f64)
}

fn online_cpus(stats: &ContainerStatsResponse) -> u32 {
    let cpu_stats = stats.cpu_stats.as_ref();
    cpu_stats
        .and_then(|c| c.online_cpus)
        .filter(|&n| n > 0)
        .or_else(|| {
            cpu_stats
                .and_then(|c| c.cpu_usage.as_ref())
                .and_then(|usage| usage.percpu_usage.as_ref())
                .map(|per| per.len() as u32)
                .filter(|&n| n > 0)
        })
        .unwrap_or(1)
}

/// Reported memory usage in MiB.
pub fn memory_mib(stats: &ContainerStatsResponse) -> f64 {
    let usage = stats
        .memory_stats
        .as_ref()
        .and_then(|mem| mem.usage)
        .unwrap_or(0);
    usage as f64 / 1024.0 / 1024.0
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// Peak semantics: with ≥2 samples the zero values recorded while the
/// container was still warming up are filtered out before taking the
/// maximum, falling back to the unfiltered maximum when nothing is left.
/// With fewer samples even a zero is the honest answer.
fn summarize(samples: &[Sample]) -> MetricsSummary {
    if samples.is_empty() {
        return MetricsSummary {
            cpu_peak: 0.0,
            memory_peak: 0.0,
        };
    }

    let cpu: Vec<f64> = samples.iter().map(|s| s.cpu_percent).collect();
    let mem: Vec<f64> = samples.iter().map(|s| s.memory_mb).collect();

    let (cpu_peak, memory_peak) = if samples.len() < 2 {
        (max_of(&cpu), max_of(&mem))
    } else {
        (filtered_max(&cpu), filtered_max(&mem))
    };

    MetricsSummary {
        cpu_peak: round2(cpu_peak),
        memory_peak: round2(memory_peak),
    }
}

fn filtered_max(values: &[f64]) -> f64 {
    let positive_max = values
        .iter()
        .copied()
        .filter(|v| *v > 0.0)
        .fold(f64::NEG_INFINITY, f64::max);
    if positive_max.is_finite() {
        positive_max
    } else {
        max_of(values)
    }
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().copied().fold(0.0, f64::max)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use bollard::models::{ContainerCpuStats, ContainerCpuUsage, ContainerMemoryStats};

    fn stats(
        cpu_total: u64,
        precpu_total: u64,
        system: u64,
        presystem: u64,
        online_cpus: Option<u32>,
        memory_usage: u64,
    ) -> ContainerStatsResponse {
        ContainerStatsResponse {
            cpu_stats: Some(ContainerCpuStats {
                cpu_usage: Some(ContainerCpuUsage {
                    total_usage: Some(cpu_total),
                    ..Default::default()
                }),
                system_cpu_usage: Some(system),
                online_cpus,
                ..Default::default()
            }),
            precpu_stats: Some(ContainerCpuStats {
                cpu_usage: Some(ContainerCpuUsage {
                    total_usage: Some(precpu_total),
                    ..Default::default()
                }),
                system_cpu_usage: Some(presystem),
                ..Default::default()
            }),
            memory_stats: Some(ContainerMemoryStats {
                usage: Some(memory_usage),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_cpu_percent_from_deltas() {
        // 50 units of container CPU over 200 units of system CPU on 4
        // cores → 100%.
        let s = stats(150, 100, 1200, 1000, Some(4), 0);
        assert!((cpu_percent(&s) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_cpu_percent_zero_deltas_yield_zero() {
        let same_cpu = stats(100, 100, 2000, 1000, Some(2), 0);
        assert_eq!(cpu_percent(&same_cpu), 0.0);

        let same_system = stats(200, 100, 1000, 1000, Some(2), 0);
        assert_eq!(cpu_percent(&same_system), 0.0);
    }

    #[test]
    fn test_cpu_percent_is_clamped_to_core_count() {
        // Container delta larger than the system delta would read >100%
        // per core; clamp at 100 × online_cpus.
        let s = stats(10_000, 0, 1000, 900, Some(2), 0);
        assert_eq!(cpu_percent(&s), 200.0);
    }

    #[test]
    fn test_online_cpus_falls_back_to_percpu_then_one() {
        let mut s = stats(150, 100, 1200, 1000, None, 0);
        s.cpu_stats.as_mut().unwrap().cpu_usage.as_mut().unwrap().percpu_usage =
            Some(vec![1, 2, 3]);
        // 50/200 × 3 × 100 = 75
        assert!((cpu_percent(&s) - 75.0).abs() < 1e-9);

        let s = stats(150, 100, 1200, 1000, None, 0);
        assert!((cpu_percent(&s) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_memory_reported_in_mib() {
        let s = stats(0, 0, 0, 0, None, 256 * 1024 * 1024);
        assert_eq!(memory_mib(&s), 256.0);
    }

    #[test]
    fn test_summary_with_no_samples_is_zero() {
        let summary = summarize(&[]);
        assert_eq!(summary.cpu_peak, 0.0);
        assert_eq!(summary.memory_peak, 0.0);
    }

    #[test]
    fn test_summary_single_sample_keeps_zeros() {
        let summary = summarize(&[Sample {
            cpu_percent: 0.0,
            memory_mb: 12.5,
        }]);
        assert_eq!(summary.cpu_peak, 0.0);
        assert_eq!(summary.memory_peak, 12.5);
    }

    #[test]
    fn test_summary_filters_warmup_zeros() {
        let samples = [
            Sample { cpu_percent: 0.0, memory_mb: 0.0 },
            Sample { cpu_percent: 42.0, memory_mb: 100.0 },
            Sample { cpu_percent: 37.0, memory_mb: 120.0 },
        ];
        let summary = summarize(&samples);
        assert_eq!(summary.cpu_peak, 42.0);
        assert_eq!(summary.memory_peak, 120.0);
    }

    #[test]
    fn test_summary_all_zero_falls_back_to_unfiltered_max() {
        let samples = [
            Sample { cpu_percent: 0.0, memory_mb: 0.0 },
            Sample { cpu_percent: 0.0, memory_mb: 0.0 },
        ];
        let summary = summarize(&samples);
        assert_eq!(summary.cpu_peak, 0.0);
        assert_eq!(summary.memory_peak, 0.0);
    }

    #[test]
    fn test_summary_rounds_to_two_decimals() {
        let samples = [
            Sample { cpu_percent: 33.333_33, memory_mb: 0.126 },
            Sample { cpu_percent: 66.666_66, memory_mb: 0.124 },
        ];
        let summary = summarize(&samples);
        assert_eq!(summary.cpu_peak, 66.67);
        assert_eq!(summary.memory_peak, 0.13);
    }
}
