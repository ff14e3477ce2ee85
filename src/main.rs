use esp32_thermometer::domain::settings::SettingsService;
use esp32_thermometer::infrastructure::bluetooth::btle::BtleplugTransport;
use esp32_thermometer::infrastructure::bluetooth::SensorService;
use esp32_thermometer::infrastructure::logging;
use esp32_thermometer::presentation::console;
use esp32_thermometer::SensorCommand;
use tokio::sync::mpsc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();

    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logging: {}", e))
        .ok();

    info!("Starting ESP32 Thermometer");
    info!("Settings file: {}", settings_service.path().display());

    let (ble_tx, ble_rx) = mpsc::unbounded_channel();
    let (app_tx, app_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let transport = BtleplugTransport::new(ble_tx.clone()).await?;
    let service = SensorService::new(transport, &settings, ble_tx, app_tx)?;

    let display = tokio::spawn(console::run_display(app_rx));
    let stdin_tx = cmd_tx.clone();
    std::thread::spawn(move || console::read_commands(stdin_tx));

    let ctrl_c_tx = cmd_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = ctrl_c_tx.send(SensorCommand::Shutdown);
        }
    });

    println!("{}", console::HELP);

    if let Err(e) = service.run(ble_rx, cmd_rx).await {
        error!("Sensor service failed: {}", e);
    }

    let _ = display.await;
    info!("Shutting down");
    Ok(())
}
