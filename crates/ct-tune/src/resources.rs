//! Cluster resources, per-trial reservations and worker allocation.

use serde::{Deserialize, Serialize};

use ct_types::{validation_error, TuneResult};

/// Environment variable listing the visible GPU devices.
pub const CUDA_VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

/// Resources available to the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterResources {
    pub num_cpus: f64,
    pub num_gpus: f64,
}

impl ClusterResources {
    /// CPUs from the host's available parallelism, GPUs from `gpus` when
    /// given, else from `CUDA_VISIBLE_DEVICES`.
    pub fn detect(gpus: Option<f64>) -> Self {
        let num_cpus = std::thread::available_parallelism()
            .map(|n| n.get() as f64)
            .unwrap_or(1.0);
        let num_gpus = gpus.unwrap_or_else(|| {
            std::env::var(CUDA_VISIBLE_DEVICES)
                .map(|devices| count_devices(&devices) as f64)
                .unwrap_or(0.0)
        });
        Self { num_cpus, num_gpus }
    }
}

fn count_devices(devices: &str) -> usize {
    devices
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty() && *d != "-1")
        .count()
}

/// Resource reservation of a single trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrialResources {
    /// Number of CPUs per trial (fractional ok).
    pub cpu: f64,
    /// Share of a GPU per trial (0 = no GPU).
    pub gpu: f64,
}

impl Default for TrialResources {
    fn default() -> Self {
        Self { cpu: 2.0, gpu: 0.2 }
    }
}

impl TrialResources {
    pub fn new(cpu: f64, gpu: f64) -> Self {
        Self { cpu, gpu }
    }

    pub fn validate(&self) -> TuneResult<()> {
        if !(self.cpu > 0.0 && self.cpu.is_finite()) {
            return Err(validation_error!("per-trial cpu must be positive, got {}", self.cpu));
        }
        if !(self.gpu >= 0.0 && self.gpu.is_finite()) {
            return Err(validation_error!("per-trial gpu must be non-negative, got {}", self.gpu));
        }
        Ok(())
    }
}

/// Allocation plan: how many trials may hold a reservation at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAllocation {
    /// Total number of worker threads to start.
    pub num_workers: usize,

    /// Effective per-trial reservation.
    pub resources: TrialResources,

    pub cluster: ClusterResources,
}

impl WorkerAllocation {
    /// Concurrency is the number of reservations that fit the cluster,
    /// capped at `max_concurrent`; at least one trial always runs. A GPU
    /// share requested on a host without GPUs is dropped.
    pub fn plan(cluster: ClusterResources, requested: TrialResources, max_concurrent: usize) -> Self {
        let mut resources = requested;
        if resources.gpu > 0.0 && cluster.num_gpus <= 0.0 {
            tracing::warn!(
                "Trials request {} GPU but none are visible; running on CPU only",
                resources.gpu
            );
            resources.gpu = 0.0;
        }

        let cpu_slots = (cluster.num_cpus / resources.cpu).floor() as usize;
        let gpu_slots = if resources.gpu > 0.0 {
            (cluster.num_gpus / resources.gpu + 1e-9).floor() as usize
        } else {
            usize::MAX
        };
        let num_workers = cpu_slots.min(gpu_slots).min(max_concurrent).max(1);

        Self {
            num_workers,
            resources,
            cluster,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_trial_resources() {
        let resources = TrialResources::default();
        assert_eq!(resources.cpu, 2.0);
        assert_eq!(resources.gpu, 0.2);
        assert!(resources.validate().is_ok());
        assert!(TrialResources::new(0.0, 0.0).validate().is_err());
        assert!(TrialResources::new(1.0, -0.5).validate().is_err());
    }

    #[test]
    fn allocation_caps_at_max_concurrent() {
        let cluster = ClusterResources { num_cpus: 32.0, num_gpus: 2.0 };
        let alloc = WorkerAllocation::plan(cluster, TrialResources::new(2.0, 0.2), 4);
        assert_eq!(alloc.num_workers, 4);
    }

    #[test]
    fn allocation_limited_by_resources() {
        let cluster = ClusterResources { num_cpus: 6.0, num_gpus: 1.0 };
        let alloc = WorkerAllocation::plan(cluster, TrialResources::new(2.0, 0.5), 8);
        assert_eq!(alloc.num_workers, 2);

        let alloc = WorkerAllocation::plan(cluster, TrialResources::new(4.0, 0.0), 8);
        assert_eq!(alloc.num_workers, 1);
    }

    #[test]
    fn gpu_request_without_gpus_runs_on_cpu() {
        let cluster = ClusterResources { num_cpus: 8.0, num_gpus: 0.0 };
        let alloc = WorkerAllocation::plan(cluster, TrialResources::new(2.0, 0.2), 4);
        assert_eq!(alloc.resources.gpu, 0.0);
        assert_eq!(alloc.num_workers, 4);
    }

    #[test]
    fn at_least_one_worker() {
        let cluster = ClusterResources { num_cpus: 1.0, num_gpus: 0.0 };
        let alloc = WorkerAllocation::plan(cluster, TrialResources::new(2.0, 0.0), 4);
        assert_eq!(alloc.num_workers, 1);
    }

    #[test]
    fn counts_visible_devices() {
        assert_eq!(count_devices("0,1,2"), 3);
        assert_eq!(count_devices(""), 0);
        assert_eq!(count_devices("-1"), 0);
    }

    #[test]
    fn explicit_gpu_count_wins() {
        assert_eq!(ClusterResources::detect(Some(3.0)).num_gpus, 3.0);
    }
}
