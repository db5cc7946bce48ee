use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use device_plugin_pb::api::device_plugin_server::DevicePlugin;
use device_plugin_pb::api::device_plugin_server::DevicePluginServer;
use device_plugin_pb::api::registration_client::RegistrationClient;
use device_plugin_pb::api::AllocateRequest;
use device_plugin_pb::api::AllocateResponse;
use device_plugin_pb::api::ContainerAllocateResponse;
use device_plugin_pb::api::ContainerPreferredAllocationResponse;
use device_plugin_pb::api::Device;
use device_plugin_pb::api::DevicePluginOptions;
use device_plugin_pb::api::DeviceSpec;
use device_plugin_pb::api::Empty;
use device_plugin_pb::api::ListAndWatchResponse;
use device_plugin_pb::api::PreStartContainerRequest;
use device_plugin_pb::api::PreStartContainerResponse;
use device_plugin_pb::api::PreferredAllocationRequest;
use device_plugin_pb::api::PreferredAllocationResponse;
use device_plugin_pb::api::RegisterRequest;
use device_plugin_pb::api::API_VERSION;
use device_plugin_pb::api::HEALTHY;
use device_plugin_pb::api::UNHEALTHY;
use futures::Stream;
use hyper_util::rt::TokioIo;
use tokio::net::UnixListener;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::transport::Endpoint;
use tonic::transport::Uri;
use tonic::Request;
use tonic::Response;
use tonic::Result as TonicResult;
use tonic::Status;
use tower::service_fn;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::DaemonArgs;
use crate::health::HealthChecker;
use crate::registry::DeviceRegistry;
use crate::registry::VideoDevice;

/// Environment variable exposing the allocated device path.
pub const VIDEO_DEVICE_ENV: &str = "VIDEO_DEVICE";

/// Cadence of the kubelet restart monitor.
const KUBELET_MONITOR_INTERVAL: Duration = Duration::from_secs(10);

/// Registration client state machine. The kubelet forgets registrations
/// across its own restarts, so the state loops for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegistrationState {
    Unregistered,
    Registered,
}

/// Video device plugin: serves ListAndWatch/Allocate to the kubelet and
/// registers itself over the kubelet's own socket.
pub struct VideoDevicePlugin {
    registry: Arc<DeviceRegistry>,
    health: Arc<HealthChecker>,
    resource_name: String,
    socket_path: PathBuf,
    kubelet_socket: PathBuf,
    registration_timeout: Duration,
    advertise_interval: Duration,
    options: DevicePluginOptions,
}

impl VideoDevicePlugin {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        health: Arc<HealthChecker>,
        args: &DaemonArgs,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            health,
            resource_name: args.resource_name.clone(),
            socket_path: args.socket_path.clone(),
            kubelet_socket: args.kubelet_socket.clone(),
            registration_timeout: Duration::from_secs(args.registration_timeout_secs),
            advertise_interval: Duration::from_secs(args.health_check_interval_secs),
            options: DevicePluginOptions {
                pre_start_required: false,
                get_preferred_allocation_available: false,
            },
        })
    }

    /// Binds the plugin socket (removing any stale one first) and spawns
    /// the gRPC server.
    pub async fn serve(self: &Arc<Self>, token: CancellationToken) -> anyhow::Result<()> {
        if self.socket_path.exists() {
            // stale socket left by a previous run
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("removing stale socket {}", self.socket_path.display()))?;
        }
        if let Some(dir) = self.socket_path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating socket directory {}", dir.display()))?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("binding {}", self.socket_path.display()))?;
        info!(socket = %self.socket_path.display(), "device plugin gRPC server listening");

        let service = VideoDevicePluginService::new(self.clone(), token.clone());
        let server = DevicePluginServer::new(service);

        tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(server)
                .serve_with_incoming_shutdown(
                    tokio_stream::wrappers::UnixListenerStream::new(listener),
                    async move {
                        token.cancelled().await;
                        info!("shutting down device plugin gRPC server");
                    },
                )
                .await;
            if let Err(e) = result {
                error!(error = %e, "device plugin gRPC server failed");
            }
        });

        Ok(())
    }

    /// One-shot registration with the kubelet, bounded by the configured
    /// timeout. Startup treats a failure here as fatal.
    pub async fn register_with_kubelet(&self) -> anyhow::Result<()> {
        let endpoint = self
            .socket_path
            .file_name()
            .and_then(|n| n.to_str())
            .context("plugin socket path has no file name")?
            .to_string();

        info!(
            resource_name = %self.resource_name,
            kubelet_socket = %self.kubelet_socket.display(),
            "registering with kubelet"
        );

        let register = async {
            let channel = uds_channel(&self.kubelet_socket).await?;
            let mut client = RegistrationClient::new(channel);
            let request = RegisterRequest {
                version: API_VERSION.to_string(),
                endpoint,
                resource_name: self.resource_name.clone(),
                options: Some(self.options.clone()),
            };
            client
                .register(Request::new(request))
                .await
                .context("kubelet rejected registration")?;
            anyhow::Ok(())
        };

        match tokio::time::timeout(self.registration_timeout, register).await {
            Ok(Ok(())) => {
                info!("registered with kubelet");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "failed to register with kubelet");
                Err(e)
            }
            Err(_) => Err(anyhow::anyhow!(
                "kubelet registration timed out after {}s",
                self.registration_timeout.as_secs()
            )),
        }
    }

    /// Watches the kubelet socket file and re-registers after a kubelet
    /// restart. Re-registering an already-registered resource name is
    /// harmless, so the loop stays simple.
    pub async fn monitor_kubelet(self: Arc<Self>, token: CancellationToken) {
        self.monitor_kubelet_every(KUBELET_MONITOR_INTERVAL, token)
            .await
    }

    async fn monitor_kubelet_every(
        self: Arc<Self>,
        interval: Duration,
        token: CancellationToken,
    ) {
        let mut state = RegistrationState::Registered;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the interval fires immediately; skip that first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("kubelet restart monitor cancelled");
                    return;
                }
                _ = ticker.tick() => {}
            }

            match state {
                RegistrationState::Registered => {
                    if !self.kubelet_socket.exists() {
                        warn!(
                            kubelet_socket = %self.kubelet_socket.display(),
                            "kubelet socket missing, kubelet may have restarted"
                        );
                        state = RegistrationState::Unregistered;
                    }
                }
                RegistrationState::Unregistered => {
                    if self.kubelet_socket.exists() {
                        info!("kubelet socket is back, re-registering");
                        match self.register_with_kubelet().await {
                            Ok(()) => state = RegistrationState::Registered,
                            Err(e) => {
                                warn!(error = %e, "re-registration failed, will retry")
                            }
                        }
                    }
                }
            }
        }
    }

    /// Removes the plugin socket on clean shutdown.
    pub fn cleanup_socket(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "failed to remove plugin socket"
                );
            }
        }
    }

    /// Full device set with current health. Unhealthy devices are sent
    /// explicitly, never omitted, so the kubelet's accounting stays
    /// consistent.
    fn advertised_devices(&self) -> Vec<Device> {
        self.registry
            .list()
            .into_iter()
            .map(|d| {
                let healthy = self.health.device_health(&d.id);
                Device {
                    id: d.id,
                    health: if healthy { HEALTHY } else { UNHEALTHY }.to_string(),
                    topology: None,
                }
            })
            .collect()
    }

    /// Resolves every requested id before building any response: an
    /// unknown id fails the whole call, never a partial allocation.
    fn allocate_devices(&self, request: &AllocateRequest) -> Result<AllocateResponse, Status> {
        let mut resolved: Vec<Vec<VideoDevice>> =
            Vec::with_capacity(request.container_requests.len());
        for container_req in &request.container_requests {
            let mut devices = Vec::with_capacity(container_req.devices_ids.len());
            for id in &container_req.devices_ids {
                match self.registry.get(id) {
                    Ok(device) => devices.push(device),
                    Err(e) => {
                        error!(device_id = %id, error = %e, "allocate failed");
                        return Err(Status::not_found(e.to_string()));
                    }
                }
            }
            resolved.push(devices);
        }

        let container_responses = resolved
            .into_iter()
            .map(|devices| {
                let mut envs = HashMap::new();
                if let Some(first) = devices.first() {
                    envs.insert(
                        VIDEO_DEVICE_ENV.to_string(),
                        first.path.display().to_string(),
                    );
                }

                let specs = devices
                    .iter()
                    .map(|d| DeviceSpec {
                        // identity mapping: same path inside the container
                        container_path: d.path.display().to_string(),
                        host_path: d.path.display().to_string(),
                        permissions: "rw".to_string(),
                    })
                    .collect();

                for device in &devices {
                    info!(
                        device_id = %device.id,
                        device_path = %device.path.display(),
                        "allocated device"
                    );
                }

                ContainerAllocateResponse {
                    envs,
                    mounts: Vec::new(),
                    devices: specs,
                    annotations: HashMap::new(),
                    cdi_devices: Vec::new(),
                }
            })
            .collect();

        Ok(AllocateResponse {
            container_responses,
        })
    }
}

async fn uds_channel(socket_path: &Path) -> anyhow::Result<Channel> {
    let socket_path = socket_path.to_path_buf();

    // the HTTP URL is a placeholder, the connector dials the unix socket
    let channel = Endpoint::from_static("http://localhost")
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket_path = socket_path.clone();
            async move {
                match UnixStream::connect(socket_path).await {
                    Ok(stream) => Ok(TokioIo::new(stream)),
                    Err(e) => Err(Box::new(e) as Box<dyn std::error::Error + Send + Sync>),
                }
            }
        }))
        .await?;

    Ok(channel)
}

/// gRPC service implementation consumed by the kubelet.
struct VideoDevicePluginService {
    plugin: Arc<VideoDevicePlugin>,
    cancellation_token: CancellationToken,
}

impl VideoDevicePluginService {
    fn new(plugin: Arc<VideoDevicePlugin>, cancellation_token: CancellationToken) -> Self {
        Self {
            plugin,
            cancellation_token,
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for VideoDevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<DevicePluginOptions>> {
        debug!("getting device plugin options");
        Ok(Response::new(self.plugin.options.clone()))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send>>;

    /// Advertise stream: the full device set with truthful health, once
    /// immediately and then on every health-check tick.
    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> TonicResult<Response<Self::ListAndWatchStream>> {
        info!("advertise stream opened");

        let (tx, rx) = mpsc::unbounded_channel();
        let plugin = self.plugin.clone();
        let token = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(plugin.advertise_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("advertise stream stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let devices = plugin.advertised_devices();
                        debug!(device_count = devices.len(), "sending device list");
                        if tx.send(Ok(ListAndWatchResponse { devices })).is_err() {
                            // peer gone; kubelet reconnects with a new stream
                            info!("advertise stream peer disconnected");
                            break;
                        }
                    }
                }
            }
        });

        let stream = tokio_stream::wrappers::UnboundedReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> TonicResult<Response<PreferredAllocationResponse>> {
        let req = request.into_inner();
        debug!("getting preferred device allocation");

        // no placement preference between identical loopback devices
        let container_responses = req
            .container_requests
            .iter()
            .map(|c| ContainerPreferredAllocationResponse {
                device_ids: c.available_device_ids.clone(),
            })
            .collect();

        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    /// Allocation is stateless: the kubelet's device bookkeeping is the
    /// single source of truth, this end only validates and serves.
    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> TonicResult<Response<AllocateResponse>> {
        let req = request.into_inner();
        info!(
            container_requests = req.container_requests.len(),
            "allocate called"
        );

        let response = self.plugin.allocate_devices(&req)?;
        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> TonicResult<Response<PreStartContainerResponse>> {
        debug!("pre-start container called");
        Ok(Response::new(PreStartContainerResponse {}))
    }
}
