//! Generated gRPC bindings for the kubelet device plugin protocol.

pub mod api {
    tonic::include_proto!("v1beta1");

    /// API version sent in registration requests.
    pub const API_VERSION: &str = "v1beta1";

    /// Device health values defined by the device plugin API.
    pub const HEALTHY: &str = "Healthy";
    pub const UNHEALTHY: &str = "Unhealthy";
}
