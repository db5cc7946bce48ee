use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DaemonArgs;
use crate::health::HealthChecker;
use crate::health::V4l2CtlProber;
use crate::module;
use crate::module::ModprobeController;
use crate::module::ModuleController;
use crate::module::ModuleParams;
use crate::module::ModuleRecovery;
use crate::plugin::VideoDevicePlugin;
use crate::registry::DeviceRegistry;
use crate::system;

/// Application core structure, wiring the registry, health checker,
/// recovery controller and plugin together.
pub struct Application {
    health_checker: Arc<HealthChecker>,
    module_controller: Arc<dyn ModuleController>,
    plugin: Arc<VideoDevicePlugin>,
}

impl Application {
    /// Builds all components and runs the fatal startup sequence: root
    /// check, module load, device discovery and an initial health pass.
    pub async fn build(args: DaemonArgs) -> Result<Self> {
        system::check_root()?;
        system::log_system_info().await;

        let module_controller: Arc<dyn ModuleController> = Arc::new(ModprobeController::new(
            Duration::from_secs(args.module_timeout_secs),
        ));
        let params = ModuleParams {
            device_count: args.max_devices,
            max_buffers: args.max_buffers,
            exclusive_caps: args.exclusive_caps,
            card_label: args.card_label.clone(),
        };

        module::ensure_loaded(module_controller.as_ref(), &params, Path::new("/dev"))
            .await
            .context("failed to load v4l2loopback module")?;

        let registry = Arc::new(DeviceRegistry::new(args.device_perm));
        registry
            .discover(args.max_devices)
            .context("device discovery failed")?;
        tracing::info!(
            devices = registry.count(args.max_devices),
            healthy = registry.is_healthy(args.max_devices),
            "device pool ready"
        );

        let recovery = ModuleRecovery::new(module_controller.clone(), registry.clone(), params);
        let prober = Arc::new(V4l2CtlProber::new(Duration::from_secs(
            args.probe_timeout_secs,
        )));
        let health_checker = Arc::new(HealthChecker::new(
            registry.clone(),
            prober,
            recovery,
            Duration::from_secs(args.health_check_interval_secs),
        ));

        // first pass so the initial advertise reports truthful health
        let report = health_checker.check_all().await;
        tracing::info!(
            healthy = report.healthy,
            unhealthy = report.unhealthy.len(),
            "initial device health"
        );

        let plugin = VideoDevicePlugin::new(registry, health_checker.clone(), &args);

        Ok(Self {
            health_checker,
            module_controller,
            plugin,
        })
    }

    /// Run application, start all tasks and wait for completion.
    pub async fn run(&self) -> Result<()> {
        let mut tasks = Tasks::new();
        tasks.spawn_all_tasks(self).await?;
        tracing::info!("video device plugin is ready");
        tasks.wait_for_completion().await
    }

    /// Final cleanup after every task has been signalled and joined.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("shutting down video device plugin");
        self.plugin.cleanup_socket();
        module::cleanup(self.module_controller.as_ref()).await;
        tracing::info!("shutdown complete");
        Ok(())
    }
}

/// Task manager, responsible for starting and managing all background
/// tasks under one cancellation token.
struct Tasks {
    tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Tasks {
    fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    async fn spawn_all_tasks(&mut self, app: &Application) -> Result<()> {
        // serve the plugin socket before registering so the kubelet can
        // dial straight back
        app.plugin.serve(self.cancellation_token.clone()).await?;
        app.plugin
            .register_with_kubelet()
            .await
            .context("kubelet registration failed at startup")?;

        let health_task = {
            let checker = app.health_checker.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("starting health check task");
                checker.run(token).await;
                tracing::info!("health check task completed");
            })
        };
        self.tasks.push(health_task);

        let monitor_task = {
            let plugin = app.plugin.clone();
            let token = self.cancellation_token.clone();
            tokio::spawn(async move {
                tracing::info!("starting kubelet restart monitor task");
                plugin.monitor_kubelet(token).await;
                tracing::info!("kubelet restart monitor task completed");
            })
        };
        self.tasks.push(monitor_task);

        Ok(())
    }

    /// Wait for tasks to complete or receive a shutdown signal, then
    /// cancel everything and join.
    async fn wait_for_completion(&mut self) -> Result<()> {
        let mut tasks = std::mem::take(&mut self.tasks);

        tokio::select! {
            _ = async {
                while let Some(task) = tasks.pop() {
                    if task.await.is_ok() {
                        return;
                    }
                }
            } => {
                tracing::error!("a task completed unexpectedly");
            }
            _ = shutdown_signal() => {
                tracing::info!("received shutdown signal");
            }
        }

        tracing::info!("cancelling all tasks");
        self.cancellation_token.cancel();
        futures::future::join_all(tasks).await;

        Ok(())
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::error!(error = %e, "failed to install SIGTERM handler");
            return futures::future::pending().await;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
