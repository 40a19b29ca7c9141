//! # Tandem Terminal
//!
//! Starts one terminal process and keeps it running until Ctrl-C.
//!
//! ```text
//! terminal [CONFIG_PATH]
//!
//!   CONFIG_PATH   terminal.toml to load (default: platform config dir)
//!   RUST_LOG      log filter (default: info,tandem=debug)
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use tandem_core::{AppError, Command};
use tandem_sync::{LifecycleListener, TerminalAgent, TerminalConfig};

/// Logs every command outcome on the bus.
struct CommandLog;

impl LifecycleListener for CommandLog {
    fn on_start(&self, actor: &str, command: &Command) {
        debug!(actor, command = %command.name, id = %command.id, "Command started");
    }

    fn on_complete(&self, actor: &str, command: &Command, _result: Option<&serde_json::Value>) {
        debug!(actor, command = %command.name, id = %command.id, "Command completed");
    }

    fn on_error(&self, actor: &str, command: &Command, error: &AppError) {
        warn!(
            actor,
            command = %command.name,
            id = %command.id,
            key = %error.key,
            "Command failed: {}",
            error.message
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = TerminalConfig::load(config_path).context("Failed to load terminal config")?;
    info!(
        device_id = %config.device_id(),
        role = %config.role(),
        servers = config.servers.len(),
        "Configuration loaded"
    );

    let mut agent = TerminalAgent::new(config).context("Invalid terminal config")?;
    let _log = agent.system().add_listener(Arc::new(CommandLog));
    agent.start();

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    info!("Shutdown signal received");

    agent.shutdown().await;
    Ok(())
}

/// Initializes the tracing subscriber for structured logging.
///
/// ## Log Levels
/// - `RUST_LOG=debug` - Show debug messages
/// - `RUST_LOG=tandem_sync=trace` - Trace the runtime only
/// - Default: `info,tandem=debug`
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tandem=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
