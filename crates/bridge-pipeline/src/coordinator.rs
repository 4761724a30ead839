//! Pipeline Coordinator
//!
//! One cooperative task owns the whole flow: open the link, activate the
//! device, read frames, decode, map and send. Every wait is raced against
//! the shutdown token.

use crate::config::BridgeConfig;
use crate::emission::EmissionGate;
use crate::events::{BridgeEvent, HealthStatus};
use chrono::{DateTime, Utc};
use hl7_encoder::{ObservationMapper, ObservationMessage};
use hl7_transport::{AttemptOutcome, MessageSink, SendOutcome, Sender};
use ring_buffer::RingBuffer;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vent_protocol::{
    activate_mixed_mode, decode_with, DecodeError, FrameReader, LinkOpener, RawFrame, ReadOutcome,
};

/// Why a connected session ended
enum SessionEnd {
    Cancelled,
    LinkLost(String),
}

/// A message waiting for redelivery
struct Pending {
    message: ObservationMessage,
    /// Attempts made so far, across the retry ladder and redelivery
    attempts: u32,
}

pub(crate) struct Coordinator<O: LinkOpener, S: MessageSink> {
    config: BridgeConfig,
    opener: O,
    sender: Sender<S>,
    mapper: ObservationMapper,
    gate: EmissionGate,
    /// Messages waiting for redelivery, oldest first
    queue: RingBuffer<Pending>,
    events: broadcast::Sender<BridgeEvent>,
    health: watch::Sender<HealthStatus>,
    cancel: CancellationToken,
    link_up: bool,
    degraded: bool,
    last_captured: Option<DateTime<Utc>>,
    /// Messages reported lost
    losses: usize,
}

impl<O: LinkOpener, S: MessageSink> Coordinator<O, S> {
    pub(crate) fn new(
        config: BridgeConfig,
        opener: O,
        sink: S,
        events: broadcast::Sender<BridgeEvent>,
        health: watch::Sender<HealthStatus>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sender: Sender::new(sink, config.retry.clone())
                .with_shutdown_grace(config.shutdown_grace()),
            mapper: ObservationMapper::new(config.mapper.clone()),
            gate: EmissionGate::new(config.emit),
            queue: RingBuffer::new(config.queue_capacity),
            config,
            opener,
            events,
            health,
            cancel,
            link_up: false,
            degraded: false,
            last_captured: None,
            losses: 0,
        }
    }

    /// Run until cancelled, then release everything
    pub(crate) async fn run(mut self) {
        info!(
            "Bridge starting: {} -> {}",
            self.opener.describe(),
            self.sender.describe()
        );
        let cancel = self.cancel.clone();
        let mut reconnect = self.config.reconnect.backoff();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = self.opener.open() => opened,
            };

            let delay = match opened {
                Ok(link) => {
                    reconnect.reset();
                    let name = self.opener.describe();
                    info!("Connected to ventilator on {}", name);
                    self.link_up = true;
                    self.emit(BridgeEvent::Connected { link: name });
                    self.update_health();

                    let end = self.session(link).await;
                    self.link_up = false;

                    match end {
                        SessionEnd::Cancelled => break,
                        SessionEnd::LinkLost(reason) => {
                            let delay = reconnect.next_delay();
                            warn!("Serial link lost ({}), reopening in {:?}", reason, delay);
                            metrics::counter!("vent_bridge_link_losses_total").increment(1);
                            self.emit(BridgeEvent::LinkLost {
                                reason,
                                retry_in_ms: delay.as_millis() as u64,
                            });
                            self.update_health();
                            delay
                        }
                    }
                }
                Err(e) => {
                    let delay = reconnect.next_delay();
                    warn!("{}; retrying in {:?}", e, delay);
                    self.emit(BridgeEvent::LinkOpenFailed {
                        link: self.opener.describe(),
                        error: e.to_string(),
                        retry_in_ms: delay.as_millis() as u64,
                    });
                    delay
                }
            };

            if !self.pause(delay).await {
                break;
            }
        }

        self.shutdown().await;
    }

    /// One connected session; returns when the link dies or on shutdown
    async fn session(&mut self, link: O::Link) -> SessionEnd {
        let cancel = self.cancel.clone();
        let write_timeout = self.config.serial.write_timeout();
        let activation_command = activate_mixed_mode();
        let mut reader = FrameReader::new(link, self.config.serial.read_timeout());

        if let Err(e) = reader.send(&activation_command, write_timeout).await {
            return SessionEnd::LinkLost(format!("activation failed: {}", e));
        }
        debug!("Activation command sent");

        let activation_period = self.config.activation_interval();
        let mut activation = interval_at(Instant::now() + activation_period, activation_period);
        activation.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let redelivery_period = self.config.redelivery_interval();
        let mut redelivery = interval_at(Instant::now() + redelivery_period, redelivery_period);
        redelivery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let idle_report = self.config.idle_report();
        let mut last_frame = Instant::now();
        let mut idle_reported = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,

                _ = activation.tick() => {
                    debug!("Resending activation command");
                    if let Err(e) = reader.send(&activation_command, write_timeout).await {
                        return SessionEnd::LinkLost(format!("activation failed: {}", e));
                    }
                }

                _ = redelivery.tick(), if !self.queue.is_empty() => {
                    self.redeliver().await;
                }

                outcome = reader.next_frame() => match outcome {
                    Ok(ReadOutcome::Frame(frame)) => {
                        last_frame = Instant::now();
                        idle_reported = false;
                        metrics::counter!("vent_bridge_frames_total").increment(1);
                        self.handle_frame(frame).await;
                    }
                    Ok(ReadOutcome::Corrupted(corruption)) => {
                        warn!("Corrupt frame dropped: {:?}", corruption.reason);
                        metrics::counter!("vent_bridge_frame_corruptions_total").increment(1);
                        self.emit(BridgeEvent::FrameCorruption { corruption });
                    }
                    Ok(ReadOutcome::Idle) => {
                        let silent = last_frame.elapsed();
                        if !idle_reported && silent >= idle_report {
                            idle_reported = true;
                            info!("No data from ventilator for {:?}", silent);
                            self.emit(BridgeEvent::LinkIdle {
                                silent_ms: silent.as_millis() as u64,
                            });
                        }
                    }
                    Ok(ReadOutcome::EndOfStream) => {
                        return SessionEnd::LinkLost("end of stream".to_string());
                    }
                    Err(e) => return SessionEnd::LinkLost(e.to_string()),
                },
            }
        }
    }

    /// Decode, gate, map and send one frame
    async fn handle_frame(&mut self, frame: RawFrame) {
        let mut snapshot = match decode_with(&frame, &self.config.validity) {
            Ok(snapshot) => snapshot,
            Err(DecodeError::UnsupportedRecordType(record_type)) => {
                warn!("Skipping frame with record type {:#04X}", record_type);
                self.emit(BridgeEvent::UnsupportedRecordType { record_type });
                return;
            }
            Err(e) => {
                warn!("Failed to decode frame: {}", e);
                self.emit(BridgeEvent::DecodeError {
                    error: e.to_string(),
                });
                return;
            }
        };

        // Capture times are non-decreasing across sessions too
        if let Some(last) = self.last_captured {
            if snapshot.captured_at < last {
                debug!("Clamping capture time {} to {}", snapshot.captured_at, last);
                snapshot.captured_at = last;
            }
        }
        self.last_captured = Some(snapshot.captured_at);

        let Some(snapshot) = self.gate.offer(snapshot) else {
            return;
        };
        if !self.mapper.has_observations(&snapshot) {
            debug!("Snapshot has no reportable parameters");
            return;
        }

        let message = self.mapper.map(&snapshot);
        debug!(
            "Message {} mapped with {} observations",
            message.control_id,
            message.len()
        );
        self.emit(BridgeEvent::MessageMapped {
            control_id: message.control_id,
            observations: message.len(),
        });

        self.dispatch(message).await;
    }

    /// Send a fresh message, or queue it behind older ones while degraded
    async fn dispatch(&mut self, message: ObservationMessage) {
        if self.degraded {
            self.enqueue(Pending {
                message,
                attempts: 0,
            });
            return;
        }

        let events = self.events.clone();
        let outcome = self
            .sender
            .send(&message, &self.cancel, |attempt| {
                publish(
                    &events,
                    BridgeEvent::SendAttempt {
                        attempt: attempt.clone(),
                    },
                );
            })
            .await;

        match outcome {
            SendOutcome::Delivered { attempts } => {
                self.emit(BridgeEvent::Delivered {
                    control_id: message.control_id,
                    attempts,
                });
            }
            SendOutcome::Rejected { reason, .. } => {
                self.emit(BridgeEvent::Rejected {
                    control_id: message.control_id,
                    reason,
                });
            }
            SendOutcome::Exhausted { error, attempts } => {
                warn!(
                    "Message {} undeliverable after {} attempts; queueing for redelivery",
                    message.control_id, attempts
                );
                self.degraded = true;
                self.emit(BridgeEvent::SendDegraded {
                    control_id: message.control_id,
                    error: error.to_string(),
                });
                self.update_health();
                self.enqueue(Pending { message, attempts });
            }
            SendOutcome::Cancelled { .. } => {
                warn!("Shutdown interrupted delivery of message {}", message.control_id);
                self.record_loss(message.control_id, "shutdown during delivery");
            }
        }
    }

    fn enqueue(&mut self, pending: Pending) {
        if let Some(dropped) = self.queue.push(pending) {
            let dropped_control_id = dropped.message.control_id;
            warn!(
                "Redelivery queue full ({}), dropped message {}",
                self.queue.capacity(),
                dropped_control_id
            );
            metrics::counter!("vent_bridge_queue_overflows_total").increment(1);
            self.emit(BridgeEvent::QueueOverflow {
                dropped_control_id,
                capacity: self.queue.capacity(),
            });
        }
        metrics::gauge!("vent_bridge_queue_depth").set(self.queue.len() as f64);
    }

    /// One attempt per queued message, oldest first, until one fails
    async fn redeliver(&mut self) {
        let mut redelivered = 0;

        while !self.cancel.is_cancelled() {
            let Some(pending) = self.queue.front() else {
                break;
            };
            let control_id = pending.message.control_id;
            let number = pending.attempts.saturating_add(1);
            let Some(attempt) = self
                .sender
                .attempt_once(&pending.message, number, &self.cancel)
                .await
            else {
                // Left queued; shutdown reports it
                break;
            };
            let outcome = attempt.outcome;
            let reason = attempt.error.clone().unwrap_or_default();
            self.emit(BridgeEvent::SendAttempt { attempt });

            match outcome {
                AttemptOutcome::Delivered => {
                    self.queue.pop_front();
                    redelivered += 1;
                    self.emit(BridgeEvent::Delivered {
                        control_id,
                        attempts: number,
                    });
                }
                AttemptOutcome::Rejected => {
                    self.queue.pop_front();
                    self.emit(BridgeEvent::Rejected { control_id, reason });
                }
                AttemptOutcome::Failed => {
                    if let Some(pending) = self.queue.front_mut() {
                        pending.attempts = number;
                    }
                    break;
                }
            }
        }

        metrics::gauge!("vent_bridge_queue_depth").set(self.queue.len() as f64);

        if self.queue.is_empty() && self.degraded {
            info!("Redelivery queue drained ({} messages), sending recovered", redelivered);
            self.degraded = false;
            self.emit(BridgeEvent::SendRecovered { redelivered });
            self.update_health();
        }
    }

    /// Wait out a reconnect delay; false when shutdown was requested
    async fn pause(&mut self, delay: Duration) -> bool {
        let cancel = self.cancel.clone();
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        let period = self.config.redelivery_interval();
        let mut redelivery = interval_at(Instant::now() + period, period);
        redelivery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                _ = redelivery.tick(), if !self.queue.is_empty() => {
                    self.redeliver().await;
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        let queued: Vec<u64> = self.queue.drain().map(|p| p.message.control_id).collect();
        for control_id in queued {
            warn!("Message {} still queued at shutdown", control_id);
            self.record_loss(control_id, "queued at shutdown");
        }
        metrics::gauge!("vent_bridge_queue_depth").set(0.0);

        let grace = self.config.shutdown_grace();
        if tokio::time::timeout(grace, self.sender.close()).await.is_err() {
            warn!("Sink did not close within {:?}", grace);
        }
        self.link_up = false;
        self.update_health();

        info!("Bridge stopped");
        self.emit(BridgeEvent::Stopped {
            drained: self.losses == 0,
        });
    }

    fn record_loss(&mut self, control_id: u64, reason: &str) {
        self.losses += 1;
        self.emit(BridgeEvent::DataLoss {
            control_id,
            reason: reason.to_string(),
        });
    }

    fn emit(&self, event: BridgeEvent) {
        publish(&self.events, event);
    }

    fn update_health(&self) {
        let status = if !self.link_up {
            HealthStatus::Disconnected
        } else if self.degraded {
            HealthStatus::SendDegraded
        } else {
            HealthStatus::Connected
        };

        self.health.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!("Health {:?} -> {:?}", current, status);
            *current = status;
            true
        });
    }
}

/// Count and broadcast one event; no subscribers is fine
fn publish(events: &broadcast::Sender<BridgeEvent>, event: BridgeEvent) {
    metrics::counter!("vent_bridge_events_total", "kind" => event.kind()).increment(1);
    let _ = events.send(event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hl7_transport::{Delivery, RetryPolicy, TransportError};
    use metrics::{Counter, CounterFn, Gauge, Histogram, Key, KeyName, Metadata, Recorder, SharedString, Unit};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::io::DuplexStream;
    use vent_protocol::{ParameterCode, ParameterSnapshot, ParameterValue, ProtocolError, RecordType};

    struct NoDevice;

    #[async_trait]
    impl LinkOpener for NoDevice {
        type Link = DuplexStream;

        async fn open(&self) -> Result<DuplexStream, ProtocolError> {
            Err(ProtocolError::LinkLost("no device".to_string()))
        }

        fn describe(&self) -> String {
            "none".to_string()
        }
    }

    /// Fails the first `failures` deliveries, then delivers
    struct FlakySink {
        failures: u32,
    }

    #[async_trait]
    impl MessageSink for FlakySink {
        async fn deliver(&mut self, _message: &ObservationMessage) -> Result<Delivery, TransportError> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(TransportError::Closed);
            }
            Ok(Delivery::Delivered)
        }

        fn describe(&self) -> String {
            "flaky".to_string()
        }
    }

    /// Counts `vent_bridge_events_total{kind="send_attempt"}`
    #[derive(Default)]
    struct AttemptEventCounter(Arc<AtomicU64>);

    struct Tally(Arc<AtomicU64>);

    impl CounterFn for Tally {
        fn increment(&self, value: u64) {
            self.0.fetch_add(value, Ordering::Relaxed);
        }

        fn absolute(&self, value: u64) {
            self.0.fetch_max(value, Ordering::Relaxed);
        }
    }

    impl Recorder for AttemptEventCounter {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            let send_attempt = key.name() == "vent_bridge_events_total"
                && key
                    .labels()
                    .any(|label| label.key() == "kind" && label.value() == "send_attempt");
            if send_attempt {
                Counter::from_arc(Arc::new(Tally(self.0.clone())))
            } else {
                Counter::noop()
            }
        }

        fn register_gauge(&self, _: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::noop()
        }

        fn register_histogram(&self, _: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::noop()
        }
    }

    fn coordinator<S: MessageSink>(sink: S) -> (Coordinator<NoDevice, S>, broadcast::Receiver<BridgeEvent>) {
        let config = BridgeConfig {
            retry: RetryPolicy {
                max_retries: 2,
                base_delay_ms: 1,
                max_delay_ms: 1,
                multiplier: 1.0,
                jitter: false,
            },
            ..Default::default()
        };
        let (events, receiver) = broadcast::channel(64);
        let (health, _) = watch::channel(HealthStatus::Disconnected);
        let coordinator = Coordinator::new(config, NoDevice, sink, events, health, CancellationToken::new());
        (coordinator, receiver)
    }

    fn message<S: MessageSink>(coordinator: &Coordinator<NoDevice, S>) -> ObservationMessage {
        let mut snapshot = ParameterSnapshot::new(Utc::now(), RecordType::MixedMode);
        snapshot.insert(ParameterCode::Peep, ParameterValue::Numeric(5.0));
        coordinator.mapper.map(&snapshot)
    }

    fn drain(receiver: &mut broadcast::Receiver<BridgeEvent>) -> Vec<BridgeEvent> {
        let mut events = Vec::new();
        while let Ok(event) = receiver.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_retry_attempts_counted_as_events() {
        let recorder = AttemptEventCounter::default();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let events = metrics::with_local_recorder(&recorder, || {
            runtime.block_on(async {
                let (mut coordinator, mut receiver) = coordinator(FlakySink { failures: 1 });
                let message = message(&coordinator);
                coordinator.dispatch(message).await;
                drain(&mut receiver)
            })
        });

        let attempts = events.iter().filter(|e| e.kind() == "send_attempt").count();
        assert_eq!(attempts, 2);
        assert_eq!(recorder.0.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_redelivery_continues_attempt_count() {
        let (mut coordinator, mut receiver) = coordinator(FlakySink { failures: 4 });
        let message = message(&coordinator);
        let control_id = message.control_id;

        // Three attempts on the retry ladder, then queued
        coordinator.dispatch(message).await;
        assert!(coordinator.degraded);
        assert_eq!(coordinator.queue.front().map(|p| p.attempts), Some(3));

        // Fourth attempt fails, fifth delivers
        coordinator.redeliver().await;
        assert_eq!(coordinator.queue.front().map(|p| p.attempts), Some(4));
        coordinator.redeliver().await;
        assert!(coordinator.queue.is_empty());

        let events = drain(&mut receiver);
        let numbers: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::SendAttempt { attempt } => Some(attempt.attempt),
                _ => None,
            })
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
        assert!(events.iter().any(|e| matches!(
            e,
            BridgeEvent::Delivered { control_id: id, attempts: 5 } if *id == control_id
        )));
        assert!(matches!(events.last(), Some(BridgeEvent::SendRecovered { redelivered: 1 })));
    }

    #[tokio::test]
    async fn test_cancelled_retry_recorded_as_loss() {
        let (mut coordinator, mut receiver) = coordinator(FlakySink { failures: u32::MAX });
        coordinator.cancel.cancel();
        let message = message(&coordinator);
        let control_id = message.control_id;

        coordinator.dispatch(message).await;
        coordinator.shutdown().await;

        let events = drain(&mut receiver);
        let lost: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                BridgeEvent::DataLoss { control_id, .. } => Some(*control_id),
                _ => None,
            })
            .collect();
        assert_eq!(lost, vec![control_id]);
        assert!(matches!(events.last(), Some(BridgeEvent::Stopped { drained: false })));
    }
}
