use std::path::Path;
use std::process::Output;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::DEVICE_START_NR;
use crate::registry::DeviceRegistry;

pub const LOOPBACK_MODULE: &str = "v4l2loopback";

/// videodev must be present before the loopback module can load.
const VIDEODEV_MODULE: &str = "videodev";

#[derive(Error, Debug)]
pub enum ModuleError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("`{command}` failed: {output}")]
    CommandFailed { command: String, output: String },
}

/// Parameter set handed to the loopback module. Reloading with the same
/// parameters reproduces the identical device node set, so the registry
/// never needs re-discovery after a recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleParams {
    pub device_count: usize,
    pub max_buffers: u32,
    pub exclusive_caps: bool,
    pub card_label: String,
}

impl ModuleParams {
    pub fn video_numbers(&self) -> Vec<u32> {
        (0..self.device_count as u32)
            .map(|i| DEVICE_START_NR + i)
            .collect()
    }

    /// Renders the modprobe argument list. Per-device parameters are
    /// repeated once per ordinal, matching the module's expectations.
    pub fn modprobe_args(&self) -> Vec<String> {
        let video_nr = self
            .video_numbers()
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let caps = vec![if self.exclusive_caps { "1" } else { "0" }; self.device_count].join(",");
        let labels =
            vec![format!("\"{}\"", self.card_label); self.device_count].join(",");

        vec![
            format!("video_nr={video_nr}"),
            format!("max_buffers={}", self.max_buffers),
            format!("exclusive_caps={caps}"),
            format!("card_label={labels}"),
        ]
    }
}

/// Kernel module control surface, injected so tests never shell out.
#[async_trait]
pub trait ModuleController: Send + Sync {
    async fn load(&self, params: &ModuleParams) -> Result<(), ModuleError>;
    async fn unload(&self) -> Result<(), ModuleError>;
    async fn is_loaded(&self) -> Result<bool, ModuleError>;
}

/// Drives the kernel module through `modprobe`/`lsmod` with explicit
/// deadlines on every invocation.
pub struct ModprobeController {
    timeout: Duration,
}

impl ModprobeController {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn run_command(&self, program: &str, args: &[String]) -> Result<Output, ModuleError> {
        let command = if args.is_empty() {
            program.to_string()
        } else {
            format!("{program} {}", args.join(" "))
        };

        match tokio::time::timeout(self.timeout, Command::new(program).args(args).output()).await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(source)) => Err(ModuleError::Spawn { command, source }),
            Err(_) => Err(ModuleError::Timeout {
                command,
                timeout_secs: self.timeout.as_secs(),
            }),
        }
    }

    async fn modprobe(&self, args: Vec<String>) -> Result<(), ModuleError> {
        let output = self.run_command("modprobe", &args).await?;
        if !output.status.success() {
            return Err(ModuleError::CommandFailed {
                command: format!("modprobe {}", args.join(" ")),
                output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Logs the dmesg tail after a failed load; modprobe error output is
    /// rarely enough to diagnose a module refusing to come up.
    async fn log_dmesg_tail(&self) {
        if let Ok(output) = self.run_command("dmesg", &[]).await {
            let text = String::from_utf8_lossy(&output.stdout);
            let lines: Vec<&str> = text.lines().collect();
            for line in lines.iter().rev().take(10).rev() {
                info!("dmesg: {line}");
            }
        }
    }
}

#[async_trait]
impl ModuleController for ModprobeController {
    async fn load(&self, params: &ModuleParams) -> Result<(), ModuleError> {
        self.modprobe(vec![VIDEODEV_MODULE.to_string()]).await?;

        let mut args = vec![LOOPBACK_MODULE.to_string()];
        args.extend(params.modprobe_args());
        if let Err(e) = self.modprobe(args).await {
            self.log_dmesg_tail().await;
            return Err(e);
        }

        info!(
            module = LOOPBACK_MODULE,
            devices = params.device_count,
            "kernel module loaded"
        );
        Ok(())
    }

    async fn unload(&self) -> Result<(), ModuleError> {
        self.modprobe(vec!["-r".to_string(), LOOPBACK_MODULE.to_string()])
            .await?;
        info!(module = LOOPBACK_MODULE, "kernel module unloaded");
        Ok(())
    }

    async fn is_loaded(&self) -> Result<bool, ModuleError> {
        let output = self.run_command("lsmod", &[]).await?;
        let text = String::from_utf8_lossy(&output.stdout);
        Ok(text
            .lines()
            .any(|line| line.split_whitespace().next() == Some(LOOPBACK_MODULE)))
    }
}

/// Loads the loopback module at startup. An already-loaded module is
/// verified against the expected device set and reloaded on mismatch.
pub async fn ensure_loaded(
    controller: &dyn ModuleController,
    params: &ModuleParams,
    dev_root: &Path,
) -> Result<(), ModuleError> {
    if controller.is_loaded().await? {
        match verify_device_nodes(params, dev_root) {
            Ok(()) => {
                info!("loopback module already loaded with matching configuration");
                return Ok(());
            }
            Err(reason) => {
                warn!(%reason, "loopback module configuration mismatch, reloading");
                if let Err(e) = controller.unload().await {
                    warn!(error = %e, "failed to unload mismatched module, modprobe may handle the reload");
                }
            }
        }
    }

    controller.load(params).await
}

/// Checks that every expected ordinal is backed by a character device.
fn verify_device_nodes(params: &ModuleParams, dev_root: &Path) -> Result<(), String> {
    use std::os::unix::fs::FileTypeExt;

    let mut found = 0;
    for ordinal in params.video_numbers() {
        let path = dev_root.join(format!("video{ordinal}"));
        match std::fs::metadata(&path) {
            Ok(meta) if meta.file_type().is_char_device() => found += 1,
            Ok(_) => return Err(format!("{} is not a character device", path.display())),
            Err(_) => {}
        }
    }

    if found != params.device_count {
        return Err(format!(
            "expected {} devices, found {found}",
            params.device_count
        ));
    }
    Ok(())
}

/// Best-effort module unload on shutdown.
pub async fn cleanup(controller: &dyn ModuleController) {
    match controller.is_loaded().await {
        Ok(false) => info!("loopback module not loaded, nothing to clean up"),
        Ok(true) => {
            if let Err(e) = controller.unload().await {
                warn!(error = %e, "failed to unload loopback module, it may still be in use");
            }
        }
        Err(e) => warn!(error = %e, "failed to check loaded modules during cleanup"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryState {
    Stable,
    Recovering,
}

/// Serializes module reloads behind a single-flight guard. The observed
/// corruption is systemic to the module, so recovery always reloads the
/// whole device set rather than touching individual nodes.
pub struct ModuleRecovery {
    controller: Arc<dyn ModuleController>,
    registry: Arc<DeviceRegistry>,
    params: ModuleParams,
    state: RwLock<RecoveryState>,
    in_flight: AtomicBool,
}

impl ModuleRecovery {
    pub fn new(
        controller: Arc<dyn ModuleController>,
        registry: Arc<DeviceRegistry>,
        params: ModuleParams,
    ) -> Arc<Self> {
        Arc::new(Self {
            controller,
            registry,
            params,
            state: RwLock::new(RecoveryState::Stable),
            in_flight: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> RecoveryState {
        *self.state.read().expect("recovery state lock poisoned")
    }

    /// Dispatches a recovery task unless one is already running; a
    /// concurrent trigger is logged and dropped. Returns whether a new
    /// recovery was started.
    pub fn trigger(self: &Arc<Self>) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("module recovery already in progress, dropping trigger");
            return false;
        }

        *self.state.write().expect("recovery state lock poisoned") = RecoveryState::Recovering;

        let this = self.clone();
        tokio::spawn(async move {
            info!(module = LOOPBACK_MODULE, "module recovery started");
            match this.recover().await {
                Ok(()) => {
                    *this.state.write().expect("recovery state lock poisoned") =
                        RecoveryState::Stable;
                    info!(module = LOOPBACK_MODULE, "module recovery finished");
                }
                Err(e) => {
                    // stay Recovering; the next health check retriggers
                    warn!(error = %e, "module reload failed, recovery will retry on the next health check");
                }
            }
            this.in_flight.store(false, Ordering::SeqCst);
        });
        true
    }

    /// Unload then reload with the original parameter set. The kernel
    /// recreates the nodes with default permissions, so the configured
    /// mode is reapplied after a successful load.
    async fn recover(&self) -> Result<(), ModuleError> {
        if let Err(e) = self.controller.unload().await {
            warn!(error = %e, "module unload failed, attempting reload anyway");
        }
        self.controller.load(&self.params).await?;
        self.registry.apply_permissions();
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeController;
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::atomic::Ordering::SeqCst;

    fn idle_registry() -> Arc<DeviceRegistry> {
        // nothing registered, so recovery has no permissions to restore
        Arc::new(DeviceRegistry::with_dev_root("/nonexistent", 0o666))
    }

    fn params(count: usize) -> ModuleParams {
        ModuleParams {
            device_count: count,
            max_buffers: 2,
            exclusive_caps: true,
            card_label: "Virtual WebCam".to_string(),
        }
    }

    #[test]
    fn modprobe_args_repeat_per_device_parameters() {
        let args = params(3).modprobe_args();
        assert_eq!(
            args,
            vec![
                "video_nr=10,11,12",
                "max_buffers=2",
                "exclusive_caps=1,1,1",
                "card_label=\"Virtual WebCam\",\"Virtual WebCam\",\"Virtual WebCam\"",
            ]
        );
    }

    #[test]
    fn verify_device_nodes_reports_missing_and_wrong_nodes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = verify_device_nodes(&params(2), dir.path()).expect_err("empty tree");
        assert!(err.contains("expected 2 devices, found 0"), "{err}");

        std::fs::write(dir.path().join("video10"), b"").expect("create file");
        let err = verify_device_nodes(&params(1), dir.path()).expect_err("regular file");
        assert!(err.contains("not a character device"), "{err}");
    }

    #[tokio::test]
    async fn ensure_loaded_reloads_on_configuration_mismatch() {
        let controller = FakeController::new(true);
        let dir = tempfile::tempdir().expect("tempdir");

        ensure_loaded(controller.as_ref(), &params(2), dir.path())
            .await
            .expect("ensure_loaded");

        assert_eq!(controller.unloads.load(SeqCst), 1);
        assert_eq!(controller.loads.load(SeqCst), 1);
    }

    #[tokio::test]
    async fn ensure_loaded_loads_when_module_absent() {
        let controller = FakeController::new(false);
        let dir = tempfile::tempdir().expect("tempdir");

        ensure_loaded(controller.as_ref(), &params(2), dir.path())
            .await
            .expect("ensure_loaded");

        assert_eq!(controller.unloads.load(SeqCst), 0);
        assert_eq!(controller.loads.load(SeqCst), 1);
    }

    #[tokio::test]
    async fn recovery_drops_concurrent_triggers() {
        let controller = FakeController::new(true);
        controller.block_unload.store(true, SeqCst);
        let recovery = ModuleRecovery::new(controller.clone(), idle_registry(), params(2));

        assert!(recovery.trigger());
        controller.entered_unload.notified().await;
        assert_eq!(recovery.state(), RecoveryState::Recovering);

        // second trigger while the first is mid-unload is a no-op
        assert!(!recovery.trigger());

        controller.release_unload.notify_one();
        while recovery.state() == RecoveryState::Recovering {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(controller.unloads.load(SeqCst), 1);
        assert_eq!(controller.loads.load(SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_reload_stays_recovering_until_a_retry_succeeds() {
        let controller = FakeController::new(true);
        controller.fail_loads.store(1, SeqCst);
        let recovery = ModuleRecovery::new(controller.clone(), idle_registry(), params(2));

        assert!(recovery.trigger());
        // wait for the failed attempt to release the single-flight guard
        loop {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if recovery.trigger() {
                break;
            }
        }
        // the retry was only accepted because the state stayed Recovering
        // through the failure; wait for it to finish
        while recovery.state() == RecoveryState::Recovering {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(recovery.state(), RecoveryState::Stable);
        assert!(controller.loads.load(SeqCst) >= 2);
    }

    #[tokio::test]
    async fn recovery_restores_device_permissions_after_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        for nr in [10, 11] {
            std::fs::write(dir.path().join(format!("video{nr}")), b"").expect("device node");
        }
        let registry = Arc::new(DeviceRegistry::with_dev_root(dir.path(), 0o640));
        registry.discover(2).expect("discover");

        // reloaded module recreates the nodes with kernel defaults
        let node = dir.path().join("video10");
        std::fs::set_permissions(&node, std::fs::Permissions::from_mode(0o600))
            .expect("set permissions");

        let controller = FakeController::new(true);
        let recovery = ModuleRecovery::new(controller.clone(), registry, params(2));
        assert!(recovery.trigger());
        while recovery.state() == RecoveryState::Recovering {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let mode = std::fs::metadata(&node)
            .expect("metadata")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o640);
    }
}
