//! Water tank with an inlet valve, an outlet valve and a blender.
//!
//! The inlet fills the tank by 10 units per second and the outlet drains it by 5.
//! Valves are driven by level thresholds and can be overridden by writing the
//! coils at slave 0, addresses 0 and 1, or through `PUT /variables/{name}`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

use simplc::config::Config;
use simplc::modbus::{self, DataStore};
use simplc::opcua::MemoryAddressSpace;
use simplc::scheduler::{Activation, Scheduler};
use simplc::{rest, Error, Result, SyncEngine, Value, VariableApi};

const TICK: Duration = Duration::from_millis(100);

async fn read_bool(api: &VariableApi, name: &str) -> Result<bool> {
    Ok(api.read_variable(name).await?.as_bool().unwrap_or_default())
}

async fn read_level(api: &VariableApi) -> Result<f64> {
    Ok(api
        .read_variable("Tank Level")
        .await?
        .as_float()
        .unwrap_or_default())
}

async fn valve_control(api: VariableApi) -> Result<()> {
    let level = read_level(&api).await?;
    let inlet = read_bool(&api, "Inlet Valve").await?;
    let outlet = read_bool(&api, "Outlet Valve").await?;
    if level <= 0.0 && !inlet {
        api.write_variable("Inlet Valve", true).await?;
        api.write_variable("Outlet Valve", false).await?;
        info!("level at lower threshold, filling");
    } else if (50.0..100.0).contains(&level) && !(inlet && outlet) {
        api.write_variable("Inlet Valve", true).await?;
        api.write_variable("Outlet Valve", true).await?;
        info!("level at high threshold, opening both valves");
    } else if level >= 150.0 && inlet {
        api.write_variable("Inlet Valve", false).await?;
        api.write_variable("Outlet Valve", true).await?;
        info!("level at critical threshold, draining");
    }
    Ok(())
}

async fn blender(api: VariableApi) -> Result<()> {
    let level = read_level(&api).await?;
    api.write_variable("Blender", level >= 100.0).await?;
    Ok(())
}

async fn level_sensor(api: VariableApi) -> Result<()> {
    let level = read_level(&api).await?;
    info!(level, "tank level");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = Config::parse(include_str!("tank.yaml"))?;
    let store = Arc::new(DataStore::new());
    let space = Arc::new(MemoryAddressSpace::new());
    let registry = config.build_registry(store.clone(), space).await?;
    let engine = SyncEngine::new(registry);
    let _listeners = engine.spawn_listeners();
    let api = VariableApi::new(engine);

    let scheduler = Scheduler::new(api.clone());
    scheduler.spawn("Valve Control", Activation::Every(TICK), valve_control);
    scheduler.spawn("Blender", Activation::Every(TICK), blender);
    scheduler.spawn("Tank Level Sensor", Activation::Every(Duration::from_secs(1)), level_sensor);

    let last = Arc::new(Mutex::new(Instant::now()));
    scheduler.spawn("Tank Level Simulation", Activation::Every(TICK), move |api: VariableApi| {
        let last = last.clone();
        async move {
            let elapsed = {
                let mut last = last.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(*last).as_secs_f64();
                *last = now;
                elapsed
            };
            let mut level = read_level(&api).await?;
            if read_bool(&api, "Inlet Valve").await? {
                level += 10.0 * elapsed;
            }
            if read_bool(&api, "Outlet Valve").await? {
                level -= 5.0 * elapsed;
            }
            api.write_variable("Tank Level", Value::Float(level)).await?;
            Ok::<_, Error>(())
        }
    });

    let _modbus = modbus::spawn_tcp_server(config.modbus.socket_addr(), store);
    let _rest = tokio::spawn(rest::serve(config.http.address, api));

    tokio::signal::ctrl_c().await?;
    scheduler.shutdown().await;
    Ok(())
}
