use std::path::PathBuf;

use anyhow::bail;
use clap::Parser;

/// First loopback ordinal to claim. Ordinals below this are left for
/// physical capture devices the host may already expose.
pub const DEVICE_START_NR: u32 = 10;

/// Hard device limit of the v4l2loopback kernel module.
pub const MODULE_MAX_DEVICES: usize = 8;

#[derive(Parser, Clone, Debug)]
#[command(about = "Kubernetes device plugin exposing v4l2loopback video devices")]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "MAX_DEVICES",
        default_value_t = 8,
        help = "Number of loopback video devices to manage (clamped to the module limit)"
    )]
    pub max_devices: usize,

    #[arg(long, env = "NODE_NAME", help = "Kubernetes node name")]
    pub node_name: String,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        default_value = "/var/lib/kubelet/device-plugins/kubelet.sock",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket"
    )]
    pub kubelet_socket: PathBuf,

    #[arg(
        long,
        env = "RESOURCE_NAME",
        default_value = "v4l2loopback.dev/video-devices",
        help = "Schedulable resource name advertised to the kubelet"
    )]
    pub resource_name: String,

    #[arg(
        long,
        env = "SOCKET_PATH",
        default_value = "/var/lib/kubelet/device-plugins/video-device-plugin.sock",
        value_hint = clap::ValueHint::FilePath,
        help = "Socket this plugin serves its gRPC API on"
    )]
    pub socket_path: PathBuf,

    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(
        long,
        env = "V4L2_MAX_BUFFERS",
        default_value_t = 2,
        help = "Buffer count passed to the loopback module"
    )]
    pub max_buffers: u32,

    #[arg(
        long,
        env = "V4L2_EXCLUSIVE_CAPS",
        default_value_t = true,
        action = clap::ArgAction::Set,
        help = "Report capture capability only while a producer is attached"
    )]
    pub exclusive_caps: bool,

    #[arg(
        long,
        env = "V4L2_CARD_LABEL",
        default_value = "Virtual WebCam",
        help = "Card label given to every loopback device"
    )]
    pub card_label: String,

    #[arg(
        long,
        env = "V4L2_DEVICE_PERM",
        default_value = "0666",
        value_parser = parse_octal_mode,
        help = "Permission bits applied to device nodes at discovery, octal"
    )]
    pub device_perm: u32,

    #[arg(
        long,
        env = "HEALTH_CHECK_INTERVAL",
        default_value_t = 5,
        help = "Health check and advertise cadence in seconds"
    )]
    pub health_check_interval_secs: u64,

    #[arg(
        long,
        env = "CAPABILITY_PROBE_TIMEOUT",
        default_value_t = 3,
        help = "v4l2-ctl capability probe timeout in seconds"
    )]
    pub probe_timeout_secs: u64,

    #[arg(
        long,
        env = "MODULE_TIMEOUT",
        default_value_t = 60,
        help = "Timeout for modprobe load/unload commands in seconds"
    )]
    pub module_timeout_secs: u64,

    #[arg(
        long,
        env = "REGISTRATION_TIMEOUT",
        default_value_t = 10,
        help = "Kubelet registration timeout in seconds"
    )]
    pub registration_timeout_secs: u64,
}

impl DaemonArgs {
    /// Validates identity fields and clamps the device count into the
    /// range the kernel module supports.
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.node_name.is_empty() {
            bail!("NODE_NAME is required");
        }
        if self.resource_name.is_empty() {
            bail!("RESOURCE_NAME is required");
        }
        if self.socket_path.as_os_str().is_empty() {
            bail!("SOCKET_PATH is required");
        }

        if self.max_devices < 1 {
            tracing::warn!(requested = self.max_devices, "MAX_DEVICES below 1, using 1");
            self.max_devices = 1;
        }
        if self.max_devices > MODULE_MAX_DEVICES {
            tracing::warn!(
                requested = self.max_devices,
                limit = MODULE_MAX_DEVICES,
                "MAX_DEVICES exceeds the loopback module limit, clamping"
            );
            self.max_devices = MODULE_MAX_DEVICES;
        }

        Ok(())
    }
}

fn parse_octal_mode(s: &str) -> Result<u32, String> {
    let digits = s.trim_start_matches("0o");
    u32::from_str_radix(digits, 8).map_err(|e| format!("invalid octal mode '{s}': {e}"))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::DaemonArgs;
    use std::path::Path;

    /// Args as they would come out of a default environment, pointed at
    /// a test directory for the sockets.
    pub(crate) fn test_args(dir: &Path) -> DaemonArgs {
        DaemonArgs {
            max_devices: 8,
            node_name: "test-node".to_string(),
            kubelet_socket: dir.join("kubelet.sock"),
            resource_name: "v4l2loopback.dev/video-devices".to_string(),
            socket_path: dir.join("video-device-plugin.sock"),
            log_level: "info".to_string(),
            max_buffers: 2,
            exclusive_caps: true,
            card_label: "Virtual WebCam".to_string(),
            device_perm: 0o666,
            health_check_interval_secs: 5,
            probe_timeout_secs: 3,
            module_timeout_secs: 60,
            registration_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::test_args;
    use super::*;

    #[test]
    fn octal_mode_parses_common_forms() {
        assert_eq!(parse_octal_mode("0666"), Ok(0o666));
        assert_eq!(parse_octal_mode("0o660"), Ok(0o660));
        assert!(parse_octal_mode("rw-rw-rw-").is_err());
    }

    #[test]
    fn validate_clamps_device_count_to_module_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut args = test_args(dir.path());
        args.max_devices = 99;
        args.validate().expect("validate");
        assert_eq!(args.max_devices, MODULE_MAX_DEVICES);

        args.max_devices = 0;
        args.validate().expect("validate");
        assert_eq!(args.max_devices, 1);
    }

    #[test]
    fn validate_rejects_missing_identity_fields() {
        let dir = tempfile::tempdir().expect("tempdir");

        let mut args = test_args(dir.path());
        args.node_name = String::new();
        assert!(args.validate().is_err());

        let mut args = test_args(dir.path());
        args.resource_name = String::new();
        assert!(args.validate().is_err());
    }
}
