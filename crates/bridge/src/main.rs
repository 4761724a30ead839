//! Ventilator HL7 Bridge - Main Entry Point

use anyhow::Result;
use bridge::{init_logging, install_metrics, load_config, run};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = load_config()?;

    if let Err(e) = init_logging(&config.log_level, config.log_json) {
        eprintln!("Logging unavailable: {:#}", e);
    }

    info!("=== Ventilator HL7 Bridge v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "Serial {} at {} baud, patient {}",
        config.serial.port, config.serial.baud_rate, config.mapper.patient_id
    );

    if let Some(listen) = &config.metrics_listen {
        install_metrics(listen)?;
    }

    run(config).await
}
