mod app;
mod config;
mod health;
mod logging;
mod module;
mod plugin;
mod registry;
mod system;

use anyhow::Result;
use clap::Parser;

use crate::app::Application;
use crate::config::DaemonArgs;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let mut args = DaemonArgs::parse();
    logging::init(&args.log_level);
    args.validate()?;

    tracing::info!(
        resource_name = %args.resource_name,
        node_name = %args.node_name,
        max_devices = args.max_devices,
        "Starting video device plugin daemon"
    );

    let app = Application::build(args).await?;

    // shutdown must run even when a task fails after the socket is
    // bound, or the plugin socket and kernel module are left behind
    let result = app.run().await;
    app.shutdown().await?;

    result
}
