//! Start/Stop Handle

use crate::config::{BridgeConfig, ConfigError};
use crate::coordinator::Coordinator;
use crate::events::{BridgeEvent, HealthStatus};
use hl7_transport::MessageSink;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vent_protocol::{LinkOpener, SerialOpener};

/// How `stop` ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The coordinator finished its shutdown within the timeout
    Drained,
    /// The timeout passed and the task was aborted
    Forced,
}

/// A running bridge. Dropping the handle requests shutdown.
pub struct BridgeHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    health: watch::Receiver<HealthStatus>,
    events: broadcast::Sender<BridgeEvent>,
}

impl BridgeHandle {
    /// Current health
    pub fn health(&self) -> HealthStatus {
        *self.health.borrow()
    }

    /// Receiver that is notified on every health change
    pub fn health_watch(&self) -> watch::Receiver<HealthStatus> {
        self.health.clone()
    }

    /// Receive events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Whether the coordinator task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Request shutdown and wait up to `timeout` for it to complete
    pub async fn stop(mut self, timeout: Duration) -> StopOutcome {
        info!("Stopping bridge");
        self.cancel.cancel();

        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(Ok(())) => StopOutcome::Drained,
            Ok(Err(e)) => {
                error!("Bridge task ended abnormally: {}", e);
                StopOutcome::Forced
            }
            Err(_) => {
                warn!("Bridge did not stop within {:?}, aborting", timeout);
                self.task.abort();
                StopOutcome::Forced
            }
        }
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Validate `config` and start the bridge on the configured serial port and sink.
///
/// Must be called from within a tokio runtime.
pub fn start(config: BridgeConfig) -> Result<BridgeHandle, ConfigError> {
    config.validate()?;
    let opener = SerialOpener::new(config.serial.clone());
    let sink = config.sink.build();
    Ok(spawn(config, opener, sink))
}

/// Like [`start`] with a caller-supplied link opener and sink
pub fn start_with<O, S>(config: BridgeConfig, opener: O, sink: S) -> Result<BridgeHandle, ConfigError>
where
    O: LinkOpener + 'static,
    O::Link: 'static,
    S: MessageSink + 'static,
{
    config.validate()?;
    Ok(spawn(config, opener, sink))
}

fn spawn<O, S>(config: BridgeConfig, opener: O, sink: S) -> BridgeHandle
where
    O: LinkOpener + 'static,
    O::Link: 'static,
    S: MessageSink + 'static,
{
    let (events, _) = broadcast::channel(config.event_capacity);
    let (health_tx, health) = watch::channel(HealthStatus::Disconnected);
    let cancel = CancellationToken::new();

    let coordinator = Coordinator::new(
        config,
        opener,
        sink,
        events.clone(),
        health_tx,
        cancel.clone(),
    );
    let task = tokio::spawn(coordinator.run());

    BridgeHandle {
        cancel,
        task,
        health,
        events,
    }
}
