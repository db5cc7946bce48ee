use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::module::ModuleRecovery;
use crate::registry::DeviceRegistry;

/// Capability string a working capture device reports.
const CAPTURE_CAPABILITY: &str = "Video Capture";

/// Probes a device node for the capture capability consumers require.
/// Injected so tests never invoke real system commands.
#[async_trait]
pub trait CapabilityProber: Send + Sync {
    async fn has_capture_capability(&self, path: &Path) -> bool;
}

/// Shells out to `v4l2-ctl --device <path> --info` under a deadline.
/// A timeout or non-zero exit means unhealthy, never an error: a stuck
/// device must not stall the health loop or crash the process.
pub struct V4l2CtlProber {
    timeout: Duration,
}

impl V4l2CtlProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CapabilityProber for V4l2CtlProber {
    async fn has_capture_capability(&self, path: &Path) -> bool {
        let probe = Command::new("v4l2-ctl")
            .arg("--device")
            .arg(path)
            .arg("--info")
            .output();

        match tokio::time::timeout(self.timeout, probe).await {
            Ok(Ok(output)) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).contains(CAPTURE_CAPABILITY)
            }
            Ok(Ok(output)) => {
                warn!(
                    device_path = %path.display(),
                    status = %output.status,
                    "capability probe exited with failure"
                );
                false
            }
            Ok(Err(e)) => {
                warn!(device_path = %path.display(), error = %e, "failed to run capability probe");
                false
            }
            Err(_) => {
                warn!(
                    device_path = %path.display(),
                    timeout_secs = self.timeout.as_secs(),
                    "capability probe timed out"
                );
                false
            }
        }
    }
}

/// Summary of one health-check pass.
#[derive(Debug, Default, Clone)]
pub struct HealthReport {
    pub healthy: usize,
    pub unhealthy: Vec<String>,
}

/// Evaluates capability health for every registered device on a cadence
/// and publishes a snapshot the advertise stream reads. A non-empty
/// unhealthy set hands control to the module recovery controller; the
/// observed corruption is systemic, not per-node.
pub struct HealthChecker {
    registry: Arc<DeviceRegistry>,
    prober: Arc<dyn CapabilityProber>,
    recovery: Arc<ModuleRecovery>,
    interval: Duration,
    snapshot: RwLock<HashMap<String, bool>>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        prober: Arc<dyn CapabilityProber>,
        recovery: Arc<ModuleRecovery>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            prober,
            recovery,
            interval,
            snapshot: RwLock::new(HashMap::new()),
        }
    }

    /// Latest observed health for a device. A device that has never been
    /// checked reports unhealthy rather than guessing.
    pub fn device_health(&self, id: &str) -> bool {
        self.snapshot
            .read()
            .expect("health snapshot lock poisoned")
            .get(id)
            .copied()
            .unwrap_or(false)
    }

    /// Runs one full pass: basic health (node exists and is readable)
    /// plus the capability probe, for every registered device.
    pub async fn check_all(&self) -> HealthReport {
        let devices = self.registry.list();
        let mut snapshot = HashMap::with_capacity(devices.len());
        let mut report = HealthReport::default();

        for device in &devices {
            let healthy = self.registry.basic_health(device)
                && self.prober.has_capture_capability(&device.path).await;

            if healthy {
                report.healthy += 1;
            } else {
                warn!(
                    device_id = %device.id,
                    device_path = %device.path.display(),
                    "device failed health check"
                );
                report.unhealthy.push(device.id.clone());
            }
            snapshot.insert(device.id.clone(), healthy);
        }

        *self
            .snapshot
            .write()
            .expect("health snapshot lock poisoned") = snapshot;
        report
    }

    /// Periodic health loop.
    pub async fn run(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("health check loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.check_all().await;
                    debug!(
                        healthy = report.healthy,
                        unhealthy = report.unhealthy.len(),
                        "health check pass completed"
                    );
                    if !report.unhealthy.is_empty() {
                        warn!(
                            unhealthy = ?report.unhealthy,
                            "unhealthy devices detected, triggering module recovery"
                        );
                        self.recovery.trigger();
                    }
                }
            }
        }
    }
}
