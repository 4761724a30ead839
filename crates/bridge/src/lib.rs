//! Ventilator HL7 Bridge Service
//!
//! Process-level wrapper around the pipeline: loads configuration, sets up
//! logging and the optional Prometheus exporter, and runs the bridge until
//! Ctrl-C.

use anyhow::{Context, Result};
use bridge_pipeline::{BridgeConfig, BridgeEvent, StopOutcome};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// Environment variable naming the configuration file
pub const CONFIG_PATH_ENV: &str = "VENT_BRIDGE_CONFIG";

/// Configuration file used when none is named
pub const DEFAULT_CONFIG_PATH: &str = "vent-bridge.toml";

/// Prefix of override variables, e.g. `VENT_BRIDGE__SERIAL__PORT`
pub const ENV_PREFIX: &str = "VENT_BRIDGE";

/// Shutdown time on top of the send grace before the pipeline is aborted
pub const SHUTDOWN_MARGIN: Duration = Duration::from_secs(5);

/// How long `stop` waits for the pipeline to report its losses and exit
pub fn shutdown_timeout(config: &BridgeConfig) -> Duration {
    config.shutdown_grace() + SHUTDOWN_MARGIN
}

/// Initialize logging
pub fn init_logging(level: &str, json: bool) -> Result<()> {
    let level = Level::from_str(level)
        .with_context(|| format!("unknown log level '{}'", level))?;

    let builder = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true);

    let installed = if json {
        tracing::subscriber::set_global_default(builder.json().finish())
    } else {
        tracing::subscriber::set_global_default(builder.finish())
    };
    installed.context("failed to set tracing subscriber")
}

/// Load configuration from the file named by [`CONFIG_PATH_ENV`] (or the
/// default path, which may be absent) with environment overrides on top.
pub fn load_config() -> Result<BridgeConfig> {
    let (path, required) = match std::env::var_os(CONFIG_PATH_ENV) {
        Some(path) => (PathBuf::from(path), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };
    let env = config::Environment::with_prefix(ENV_PREFIX);
    build_config(&path, required, env)
}

/// Layer `path` and `env` into a validated [`BridgeConfig`]
pub fn build_config(path: &Path, required: bool, env: config::Environment) -> Result<BridgeConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path).required(required))
        .add_source(
            env.prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to read configuration from {}", path.display()))?;

    let config: BridgeConfig = settings
        .try_deserialize()
        .context("invalid configuration")?;
    config.validate()?;
    Ok(config)
}

/// Serve Prometheus metrics on `listen`
pub fn install_metrics(listen: &str) -> Result<()> {
    let addr: SocketAddr = listen
        .parse()
        .with_context(|| format!("invalid metrics address '{}'", listen))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to start Prometheus exporter")?;
    info!("Metrics available on http://{}/metrics", addr);
    Ok(())
}

/// Write one pipeline event as a structured log line
pub fn log_event(event: &BridgeEvent) {
    match serde_json::to_string(event) {
        Ok(json) => info!(target: "vent_bridge::events", kind = event.kind(), "{}", json),
        Err(e) => warn!("Could not serialize {} event: {}", event.kind(), e),
    }
}

/// Run the bridge until Ctrl-C
pub async fn run(config: BridgeConfig) -> Result<()> {
    let timeout = shutdown_timeout(&config);
    let handle = bridge_pipeline::start(config).context("bridge failed to start")?;
    let mut events = handle.subscribe();

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {}", e);
                }
                info!("Shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Event log fell behind, {} events not logged", skipped);
                }
                Err(RecvError::Closed) => {
                    error!("Bridge stopped unexpectedly");
                    break;
                }
            },
        }
    }

    let outcome = handle.stop(timeout).await;
    // Flush what shutdown produced (data loss, final stop)
    while let Ok(event) = events.try_recv() {
        log_event(&event);
    }

    match outcome {
        StopOutcome::Drained => info!("Bridge stopped cleanly"),
        StopOutcome::Forced => warn!("Bridge shutdown forced after {:?}", timeout),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_pipeline::EmitPolicy;
    use hl7_transport::{FileLayout, SinkConfig};
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        config::Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn test_missing_optional_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = build_config(&dir.path().join("absent.toml"), false, env(&[])).unwrap();
        assert_eq!(config, BridgeConfig::default());
    }

    #[test]
    fn test_missing_required_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(build_config(&dir.path().join("absent.toml"), true, env(&[])).is_err());
    }

    #[test]
    fn test_file_then_env_layering() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
emit = "on_new_breath"
queue_capacity = 50

[serial]
port = "/dev/ttyS3"

[sink]
mode = "file"
path = "/var/spool/hl7/out.hl7"
layout = "append"
"#
        )
        .unwrap();

        let config = build_config(
            file.path(),
            true,
            env(&[("VENT_BRIDGE__SERIAL__BAUD_RATE", "9600")]),
        )
        .unwrap();

        assert_eq!(config.serial.port, "/dev/ttyS3");
        assert_eq!(config.serial.baud_rate, 9600);
        assert_eq!(config.queue_capacity, 50);
        assert_eq!(config.emit, EmitPolicy::OnNewBreath);
        match config.sink {
            SinkConfig::File(file) => assert_eq!(file.layout, FileLayout::Append),
            other => panic!("unexpected sink {:?}", other),
        }
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "queue_capacity = 0").unwrap();
        assert!(build_config(file.path(), true, env(&[])).is_err());
    }

    #[test]
    fn test_shutdown_timeout_outlasts_send_grace() {
        let config = BridgeConfig {
            shutdown_grace_ms: 20_000,
            ..Default::default()
        };
        assert_eq!(shutdown_timeout(&config), Duration::from_secs(25));
        assert!(shutdown_timeout(&BridgeConfig::default()) > BridgeConfig::default().shutdown_grace());
    }

    #[test]
    fn test_bad_log_level() {
        assert!(init_logging("loud", false).is_err());
    }

    #[test]
    fn test_bad_metrics_address() {
        assert!(install_metrics("not-an-address").is_err());
    }
}
