//! Startup environment checks and system information logging.

use anyhow::bail;
use tokio::process::Command;
use tracing::info;

/// Module loading and device chmod both need root.
pub fn check_root() -> anyhow::Result<()> {
    // SAFETY: geteuid cannot fail and touches no memory
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("must run as root to manage kernel modules and device nodes (euid {euid})");
    }
    Ok(())
}

/// Logs kernel facts that matter when module loading fails.
pub async fn log_system_info() {
    if let Ok(output) = Command::new("uname").arg("-r").output().await {
        info!(
            kernel = %String::from_utf8_lossy(&output.stdout).trim(),
            "kernel version"
        );
    }
    if let Ok(output) = Command::new("uname").arg("-m").output().await {
        info!(
            arch = %String::from_utf8_lossy(&output.stdout).trim(),
            "architecture"
        );
    }
}
