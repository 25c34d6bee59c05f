//! membrane-relay binary entry point
//!
//! Hosts a relay device and serves it on the relay socket.
//! Usage: membrane-relay [CONFIG.json]

use std::path::PathBuf;

use anyhow::Context;
use membrane::logging::init_logging;
use membrane::{RelayConfig, RelayDevice, RelayServer};
use tracing::{error, info, warn};

fn run() -> anyhow::Result<()> {
    let config = match std::env::args_os().nth(1).map(PathBuf::from) {
        Some(path) => RelayConfig::from_file(&path)?,
        None => RelayConfig::default(),
    }
    .with_env_overrides();

    let device = RelayDevice::new(&config).context("error creating relay device")?;
    let server = RelayServer::bind(&config.socket_path())
        .with_context(|| format!("error binding {}", config.socket_path().display()))?;

    if let Err(err) = sd_notify::notify(true, &[sd_notify::NotifyState::Ready]) {
        warn!("Error notifying systemd: {err:?}");
    } else {
        info!("Notified systemd that relay is ready");
    }

    server.run(&device).context("relay socket failed")
}

fn main() {
    init_logging("membrane-relay");

    if let Err(e) = run() {
        error!("Fatal error: {e:?}");
        std::process::exit(1);
    }
}
