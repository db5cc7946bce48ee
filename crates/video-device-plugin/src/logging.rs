//! provides logging helpers

use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// `default_level` comes from LOG_LEVEL; RUST_LOG still overrides it.
pub fn init(default_level: &str) {
    let default_directive = match default_level.to_ascii_lowercase().as_str() {
        "debug" => filter::LevelFilter::DEBUG,
        "warn" => filter::LevelFilter::WARN,
        "error" => filter::LevelFilter::ERROR,
        _ => filter::LevelFilter::INFO,
    };

    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(default_directive.into())
        .from_env_lossy();

    let fmt_layer = layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(env_filter);

    registry().with(fmt_layer).init();
}
