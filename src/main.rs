use anyhow::{Context, Result};
use pv_surplus_controller::{config, controller, forecast, hardware, repo, telemetry};
use std::sync::Arc;

use config::Config;
use controller::{Controller, DecisionEngine};
use hardware::DeviceFactory;
use repo::FileStateStore;
use telemetry::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::load()?;
    let _log_guard = init_tracing(&cfg.telemetry);

    let factory = DeviceFactory::new(cfg.hardware.clone());
    let inverter = factory.create_inverter()?;
    let wallbox = factory.create_ev_charger()?;
    let store = Arc::new(FileStateStore::new(cfg.state.path.clone()));
    info!(path = %store.path().display(), "controller state file");
    let forecast = Arc::from(forecast::provider_from_config(&cfg.forecast));
    let sink = Arc::new(telemetry::sink_from_config(&cfg.telemetry).context("opening telemetry sinks")?);

    let mut controller = Controller::new(
        DecisionEngine::from_config(&cfg),
        inverter,
        wallbox,
        forecast,
        store,
        sink,
    );

    if cfg.controller.run_once {
        info!("running a single control tick");
        controller.tick().await?;
        return Ok(());
    }

    info!(
        tick_seconds = cfg.controller.tick_seconds,
        inverter = %cfg.hardware.inverter,
        wallbox = %cfg.hardware.wallbox,
        "starting PV surplus controller"
    );
    controller
        .run(cfg.controller.tick_seconds, telemetry::shutdown_signal())
        .await?;
    info!("shutdown complete");
    Ok(())
}
