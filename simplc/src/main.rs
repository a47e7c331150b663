use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use simplc::config::Config;
use simplc::modbus::{self, DataStore};
use simplc::opcua::MemoryAddressSpace;
use simplc::{rest, Result, SyncEngine, VariableApi};

/// Simulated PLC exposing its variables over Modbus TCP and REST.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        Config::load(path)
    } else {
        warn!(path = %path.display(), "configuration file not found, starting without variables");
        Ok(Config::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = load_config(&cli.config)?;
    let store = Arc::new(DataStore::new());
    let space = Arc::new(MemoryAddressSpace::new());
    let registry = config.build_registry(store.clone(), space.clone()).await?;
    info!(
        variables = registry.len(),
        slaves = ?store.slaves(),
        "registry ready"
    );

    let engine = SyncEngine::new(registry);
    let _listeners = engine.spawn_listeners();
    let api = VariableApi::new(engine);

    info!(
        url = %config.opcua.url,
        security_policy = ?config.opcua.security_policy,
        nodes = space.nodes().len(),
        "OPC UA address space ready"
    );
    let mut modbus_server = modbus::spawn_tcp_server(config.modbus.socket_addr(), store);
    let mut rest_server = tokio::spawn(rest::serve(config.http.address, api));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("shutting down");
        }
        result = &mut modbus_server => {
            error!(?result, "Modbus server stopped");
        }
        result = &mut rest_server => {
            error!(?result, "REST server stopped");
        }
    }
    modbus_server.abort();
    rest_server.abort();
    Ok(())
}
