//! Virtual LAN Peer Agent
//!
//! Joins an overlay group through a rendezvous server:
//! - Loads its configuration from a JSON file
//! - Registers, keeps the control connection alive and reconnects
//! - Relays frames through the server and upgrades to direct links
//! - SIGHUP reloads the configuration, SIGINT/SIGTERM shut down cleanly

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::flag;

use vilan_core::config::DEFAULT_CONFIG_FILE;
use vilan_core::discovery::ProcArpTable;
use vilan_core::probe;
use vilan_core::{
    ConfigStore, ControlSession, FrameContext, JsonFileStore, NullDevice, SessionParts,
    SocketTransport, StateCell, SysLinkSampler,
};

/// How often the main thread checks for signals
const SIGNAL_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Frames retained by the in-process interface for inspection
const DEVICE_RETAIN: usize = 0;

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();

    // --config <path>  Configuration file (default: config_app.json)

    let config_path = parse_arg(&args, "--config")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let store = Arc::new(JsonFileStore::new(&config_path));
    let config = store.load()?;
    config.validate()?;

    log::info!("Virtual LAN agent starting...");
    log::info!("  Config: {}", config_path.display());
    log::info!("  Server: {}:{} ({:?})", config.server_ip, config.server_port, config.server_scheme);
    log::info!("  Group:  {}", config.peer.group_name);
    log::info!("  Peer:   {}", config.peer.name);

    let context = Arc::new(FrameContext::new(Arc::new(StateCell::default())));
    let transport = Arc::new(SocketTransport::new(context.clone(), config.packet_num));
    let session = ControlSession::new(SessionParts {
        store,
        transport,
        context,
        device: Arc::new(NullDevice::recording(DEVICE_RETAIN)),
        probe: probe::from_config(config.probe_addr.as_deref()),
        neighbors: Box::new(ProcArpTable::new()),
        sampler: Box::new(SysLinkSampler::new()),
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    flag::register(SIGINT, shutdown.clone())?;
    flag::register(SIGTERM, shutdown.clone())?;
    let reload = Arc::new(AtomicBool::new(false));
    flag::register(SIGHUP, reload.clone())?;

    session.start()?;

    while !shutdown.load(Ordering::Relaxed) {
        thread::sleep(SIGNAL_POLL_INTERVAL);
        if reload.swap(false, Ordering::Relaxed) {
            log::info!("SIGHUP received, reloading configuration");
            if let Err(e) = session.restart() {
                log::error!("restart failed: {}", e);
            }
        }
    }

    log::info!("Shutting down...");
    session.stop();
    log::info!("Final traffic counters:\n{}", session.stats_report());
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}
