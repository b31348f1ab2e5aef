//! Seams to collaborators that live outside the registry core.

use crate::peer::GpuSpec;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const NVIDIA_SMI_TIMEOUT: Duration = Duration::from_secs(10);

/// Health of processes this node depends on.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// `true` iff every critical process is still alive.
    async fn healthy(&self) -> bool;
}

/// No critical dependencies.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysHealthy;

#[async_trait]
impl HealthCheck for AlwaysHealthy {
    async fn healthy(&self) -> bool {
        true
    }
}

/// A child program that must keep running for the node to be useful.
pub struct CriticalProcess {
    command: String,
    child: Mutex<Child>,
}

impl CriticalProcess {
    /// Start `command` through `sh -c`. The child is killed when this
    /// handle is dropped.
    pub fn spawn(command: &str) -> std::io::Result<Self> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        info!(command, pid = ?child.id(), "started critical process");
        Ok(Self {
            command: command.to_string(),
            child: Mutex::new(child),
        })
    }
}

#[async_trait]
impl HealthCheck for CriticalProcess {
    async fn healthy(&self) -> bool {
        match self.child.lock().await.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                error!(command = %self.command, %status, "critical process exited");
                false
            }
            Err(e) => {
                error!(command = %self.command, error = %e, "failed to poll critical process");
                false
            }
        }
    }
}

/// Local hardware inventory.
#[async_trait]
pub trait HardwareInventory: Send + Sync {
    async fn gpus(&self) -> Vec<GpuSpec>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoHardware;

#[async_trait]
impl HardwareInventory for NoHardware {
    async fn gpus(&self) -> Vec<GpuSpec> {
        Vec::new()
    }
}

/// GPU inventory from `nvidia-smi`. Any failure yields no GPUs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NvidiaSmi;

#[async_trait]
impl HardwareInventory for NvidiaSmi {
    async fn gpus(&self) -> Vec<GpuSpec> {
        let mut command = Command::new("nvidia-smi");
        command
            .args([
                "--query-gpu=name,memory.total,memory.used",
                "--format=csv,noheader,nounits",
            ])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        match tokio::time::timeout(NVIDIA_SMI_TIMEOUT, command.output()).await {
            Ok(Ok(out)) if out.status.success() => {
                parse_gpu_csv(&String::from_utf8_lossy(&out.stdout))
            }
            Ok(Ok(out)) => {
                debug!(status = %out.status, "nvidia-smi failed");
                Vec::new()
            }
            Ok(Err(e)) => {
                debug!(error = %e, "nvidia-smi not available");
                Vec::new()
            }
            Err(_) => {
                warn!(timeout = ?NVIDIA_SMI_TIMEOUT, "nvidia-smi timed out");
                Vec::new()
            }
        }
    }
}

fn parse_gpu_csv(csv: &str) -> Vec<GpuSpec> {
    csv.lines()
        .filter_map(|line| {
            let mut fields = line.split(',').map(str::trim);
            let name = fields.next().filter(|n| !n.is_empty())?;
            let total = fields.next()?.parse().ok()?;
            let used = fields.next()?.parse().ok()?;
            Some(GpuSpec {
                name: name.to_string(),
                total_memory: total,
                used_memory: used,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gpu_csv() {
        let csv = "NVIDIA A100-SXM4-80GB, 81920, 1024\nNVIDIA L4, 23034, 0\n\ngarbage line\n";
        let gpus = parse_gpu_csv(csv);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].name, "NVIDIA A100-SXM4-80GB");
        assert_eq!(gpus[0].total_memory, 81920);
        assert_eq!(gpus[0].used_memory, 1024);
        assert_eq!(gpus[1].name, "NVIDIA L4");
    }

    #[tokio::test]
    async fn test_always_healthy() {
        assert!(AlwaysHealthy.healthy().await);
        assert!(NoHardware.gpus().await.is_empty());
    }

    #[tokio::test]
    async fn test_nvidia_smi_never_fails_the_caller() {
        // Parsed output on GPU hosts, an empty list everywhere else.
        let gpus = NvidiaSmi.gpus().await;
        assert!(gpus.iter().all(|gpu| !gpu.name.is_empty()));
    }

    #[tokio::test]
    async fn test_critical_process_health() {
        let running = CriticalProcess::spawn("sleep 30").unwrap();
        assert!(running.healthy().await);

        let exiting = CriticalProcess::spawn("exit 0").unwrap();
        let mut healthy = true;
        for _ in 0..200 {
            healthy = exiting.healthy().await;
            if !healthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!healthy);
    }
}
