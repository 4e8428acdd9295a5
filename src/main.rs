use anyhow::Result;
use sinapsi_alfa::client::AlfaClient;
use sinapsi_alfa::config::Config;
use sinapsi_alfa::driver::{AlfaDriver, CommandRecovery, LogNotifier};
use sinapsi_alfa::registers::{REGISTER_BATCHES, SENSOR_CATALOG, build_sensor_map};
use sinapsi_alfa::watchdog::{FailureTracker, RecoveryAction};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;

    sinapsi_alfa::logging::init_logging(&config.logging)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Sinapsi Alfa driver starting up");

    let sensor_map = build_sensor_map(&SENSOR_CATALOG, &REGISTER_BATCHES)
        .map_err(|e| anyhow::anyhow!("Register map error: {}", e))?;

    let client = AlfaClient::new(&config.device, sensor_map)
        .map_err(|e| anyhow::anyhow!("Failed to create device client: {}", e))?;

    let recovery: Option<Arc<dyn RecoveryAction>> = config
        .failure
        .recovery_command
        .as_deref()
        .map(|cmd| Arc::new(CommandRecovery::new(cmd)) as Arc<dyn RecoveryAction>);

    let tracker = FailureTracker::new(
        &config.device.name,
        &config.device.host,
        config.device.port,
        config.failure.threshold,
        config.failure.notifications_enabled,
        Arc::new(LogNotifier::new()),
        recovery,
    );

    let mut driver = AlfaDriver::new(&config, client, tracker);

    // Ctrl-C / SIGTERM turns into a shutdown request
    let shutdown = driver.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.send(()).ok();
        }
    });

    match driver.run().await {
        Ok(()) => {
            info!("Driver shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!("Driver failed with error: {}", e);
            Err(anyhow::anyhow!("Driver error: {}", e))
        }
    }
}
