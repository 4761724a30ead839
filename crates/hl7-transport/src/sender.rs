//! Transport Sender
//!
//! Drives a [`MessageSink`] through bounded retries. A transient failure
//! is retried after a jittered exponential delay until `max_retries` is
//! used up. An explicit rejection ends the send immediately. Once shutdown
//! is requested an attempt already on the wire gets `shutdown_grace` to
//! finish before it is abandoned.

use crate::{Delivery, ExponentialBackoff, MessageSink, TransportError};
use chrono::{DateTime, Utc};
use hl7_encoder::ObservationMessage;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time an in-flight attempt may keep running after shutdown is requested
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Retry settings for one message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
            self.jitter,
        )
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err("retry max_delay_ms must not be below base_delay_ms".to_string());
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err("retry multiplier must be at least 1.0".to_string());
        }
        Ok(())
    }
}

/// How a single attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Delivered,
    Rejected,
    Failed,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Delivered => "delivered",
            AttemptOutcome::Rejected => "rejected",
            AttemptOutcome::Failed => "failed",
        }
    }
}

/// Record of one delivery attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryAttempt {
    pub control_id: u64,
    /// 1-based
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Final result of sending one message
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Delivered { attempts: u32 },
    /// Receiver refused the message; never retried
    Rejected { reason: String, attempts: u32 },
    /// Every attempt failed transiently
    Exhausted { error: TransportError, attempts: u32 },
    /// Shutdown requested between attempts, or the in-flight attempt
    /// outlived the shutdown grace
    Cancelled { attempts: u32 },
}

impl SendOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            SendOutcome::Delivered { attempts }
            | SendOutcome::Rejected { attempts, .. }
            | SendOutcome::Exhausted { attempts, .. }
            | SendOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Sends messages through a sink with retry
pub struct Sender<S: MessageSink> {
    sink: S,
    policy: RetryPolicy,
    shutdown_grace: Duration,
    last_error: Option<TransportError>,
}

impl<S: MessageSink> Sender<S> {
    pub fn new(sink: S, policy: RetryPolicy) -> Self {
        Self {
            sink,
            policy,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            last_error: None,
        }
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn describe(&self) -> String {
        self.sink.describe()
    }

    /// Send with retries. `observe` sees every attempt as it completes.
    pub async fn send<F>(
        &mut self,
        message: &ObservationMessage,
        cancel: &CancellationToken,
        mut observe: F,
    ) -> SendOutcome
    where
        F: FnMut(&DeliveryAttempt) + Send,
    {
        let mut backoff = self.policy.backoff();
        let total_attempts = self.policy.max_retries.saturating_add(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let Some(record) = self.attempt_once(message, attempt, cancel).await else {
                return SendOutcome::Cancelled { attempts: attempt };
            };
            observe(&record);

            match record.outcome {
                AttemptOutcome::Delivered => {
                    return SendOutcome::Delivered { attempts: attempt };
                }
                AttemptOutcome::Rejected => {
                    return SendOutcome::Rejected {
                        reason: record.error.unwrap_or_default(),
                        attempts: attempt,
                    };
                }
                AttemptOutcome::Failed => {}
            }

            if attempt >= total_attempts {
                let error = self.last_error.take().unwrap_or(TransportError::Closed);
                warn!(
                    "Giving up on message {} after {} attempts",
                    message.control_id, attempt
                );
                metrics::counter!("vent_bridge_send_exhausted_total").increment(1);
                return SendOutcome::Exhausted {
                    error,
                    attempts: attempt,
                };
            }

            let delay = backoff.next_delay();
            debug!(
                "Retrying message {} in {:?} (attempt {}/{})",
                message.control_id,
                delay,
                attempt + 1,
                total_attempts
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    return SendOutcome::Cancelled { attempts: attempt };
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Exactly one delivery attempt, no retry. `None` when shutdown was
    /// requested and the attempt did not finish within the grace period.
    pub async fn attempt_once(
        &mut self,
        message: &ObservationMessage,
        attempt: u32,
        cancel: &CancellationToken,
    ) -> Option<DeliveryAttempt> {
        let grace = self.shutdown_grace;
        let deadline = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        };

        let result = tokio::select! {
            result = self.sink.deliver(message) => result,
            _ = deadline => {
                warn!(
                    "Abandoning attempt {} for message {} after {:?} shutdown grace",
                    attempt, message.control_id, grace
                );
                metrics::counter!("vent_bridge_send_attempts_total", "outcome" => "abandoned").increment(1);
                return None;
            }
        };
        let (outcome, error) = match result {
            Ok(Delivery::Delivered) => {
                info!("Message {} delivered", message.control_id);
                (AttemptOutcome::Delivered, None)
            }
            Ok(Delivery::Rejected { reason }) => {
                warn!("Message {} rejected: {}", message.control_id, reason);
                (AttemptOutcome::Rejected, Some(reason))
            }
            Err(e) => {
                warn!(
                    "Attempt {} for message {} failed: {}",
                    attempt, message.control_id, e
                );
                let text = e.to_string();
                self.last_error = Some(e);
                (AttemptOutcome::Failed, Some(text))
            }
        };

        metrics::counter!("vent_bridge_send_attempts_total", "outcome" => outcome.as_str()).increment(1);

        Some(DeliveryAttempt {
            control_id: message.control_id,
            attempt,
            outcome,
            error,
            at: Utc::now(),
        })
    }

    /// Close the underlying sink
    pub async fn close(&mut self) {
        self.sink.close().await;
    }
}
