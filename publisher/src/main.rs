//! Publisher service binary.
//!
//! Tails the Postgres replication log of the watched tables and publishes every change on
//! the configured event bus once the initial load was detected.

use telemetry::tracing::init_tracing;

use crate::config::load_publisher_config;
use crate::core::start_publisher;

mod config;
mod core;

fn main() -> anyhow::Result<()> {
    let publisher_config = load_publisher_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(start_publisher(publisher_config))?;

    Ok(())
}
