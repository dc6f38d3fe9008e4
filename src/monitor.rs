//! System load sampling for dynamic timeout adjustment.
//!
//! When CPU or GPU utilization exceeds a threshold (default 14 %), timeouts
//! are multiplied by 3 to avoid false timeout failures on a busy host. The
//! multiplier is a step function, not continuous, so timeouts don't thrash.
//! Callers read it once per execution.

use std::time::Duration;
use sysinfo::{MINIMUM_CPU_UPDATE_INTERVAL, System};
use tokio::process::Command;

/// Utilization percentage above which the load multiplier kicks in.
pub const DEFAULT_LOAD_THRESHOLD: f32 = 14.0;

/// Multiplier applied to timeouts while the host is loaded.
const LOADED_MULTIPLIER: f64 = 3.0;

/// Timeout for the external GPU utilization query.
const GPU_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Samples CPU/GPU utilization and converts it into a timeout multiplier.
#[derive(Debug, Clone, Default)]
pub struct ResourceMonitor {
    threshold: Option<f32>,
}

impl ResourceMonitor {
    #[must_use]
    pub fn new() -> Self {
        Self { threshold: None }
    }

    /// Override the load threshold (used by tests).
    #[must_use]
    pub fn with_threshold(threshold: f32) -> Self {
        Self {
            threshold: Some(threshold),
        }
    }

    /// Current CPU utilization percentage, averaged over a short window.
    pub async fn cpu_usage(&self) -> f32 {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        // sysinfo needs two refreshes separated by its minimum interval to
        // produce a meaningful delta; pad the window up to ~1s.
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_millis(200))).await;
        sys.refresh_cpu_usage();
        sys.global_cpu_usage()
    }

    /// Current GPU utilization percentage via `nvidia-smi`.
    ///
    /// Returns `None` when the tool is missing, times out, or produces
    /// unparseable output -- GPU absence is not an error.
    pub async fn gpu_usage(&self) -> Option<f32> {
        let query = Command::new("nvidia-smi")
            .args(["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"])
            .output();

        match tokio::time::timeout(GPU_QUERY_TIMEOUT, query).await {
            Ok(Ok(output)) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .next()
                    .and_then(|line| line.trim().parse::<f32>().ok())
            }
            Ok(Ok(_)) | Ok(Err(_)) => {
                tracing::debug!("could not query GPU utilization");
                None
            }
            Err(_) => {
                tracing::debug!("GPU utilization query timed out");
                None
            }
        }
    }

    /// Current (cpu, gpu) utilization. The GPU reading may be absent.
    pub async fn current_load(&self) -> (f32, Option<f32>) {
        let cpu = self.cpu_usage().await;
        let gpu = self.gpu_usage().await;
        (cpu, gpu)
    }

    /// Timeout multiplier based on current load: 3.0 when CPU or GPU exceeds
    /// the threshold, 1.0 otherwise.
    pub async fn timeout_multiplier(&self) -> f64 {
        let threshold = self.threshold.unwrap_or(DEFAULT_LOAD_THRESHOLD);
        let (cpu, gpu) = self.current_load().await;

        if cpu > threshold {
            tracing::info!(cpu, threshold, "CPU load above threshold, applying 3x timeout multiplier");
            return LOADED_MULTIPLIER;
        }

        if let Some(gpu) = gpu {
            if gpu > threshold {
                tracing::info!(gpu, threshold, "GPU load above threshold, applying 3x timeout multiplier");
                return LOADED_MULTIPLIER;
            }
        }

        tracing::debug!(cpu, ?gpu, "system load normal, standard timeouts");
        1.0
    }

    /// Adjust a base timeout by the current load multiplier.
    pub async fn adjust(&self, base_secs: f64) -> f64 {
        let multiplier = self.timeout_multiplier().await;
        let adjusted = base_secs * multiplier;
        if multiplier > 1.0 {
            tracing::info!(base_secs, adjusted, "timeout adjusted for system load");
        }
        adjusted
    }
}
