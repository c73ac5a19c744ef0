//! Message consumption loop.
//!
//! Pulls deliveries from a [`MessageSource`], decodes them and hands the job
//! name to a [`JobHandler`]. Each delivery gets exactly one acknowledge
//! decision:
//!
//! - Undecodable payloads are logged and left unacknowledged, so the broker
//!   redelivers them after the ack deadline
//! - Decoded messages are acknowledged once the handler returns, whether the
//!   job succeeded or failed
//!
//! A failing receive call is retried with exponential backoff. After too many
//! consecutive failures the loop gives up with [`ConsumerError::BrokerUnavailable`]
//! so the process supervisor can restart the service.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::metrics::MetricsCollector;

use super::dispatcher::JobHandler;
use super::job::JobMessage;
use super::queue::{Delivery, MessageSource, QueueError};

/// Errors that stop the consumption loop.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The broker kept failing past the retry ceiling.
    #[error("Broker unavailable after {attempts} consecutive receive failures: {last}")]
    BrokerUnavailable {
        attempts: u32,
        #[source]
        last: QueueError,
    },
}

/// Configuration for the consumption loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Delay after the first failed receive.
    pub initial_backoff: Duration,
    /// Upper bound on the delay between receive attempts.
    pub max_backoff: Duration,
    /// Growth factor applied to the delay after each failure.
    pub backoff_multiplier: f64,
    /// Consecutive receive failures tolerated before giving up.
    pub max_consecutive_failures: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_consecutive_failures: 10,
        }
    }
}

impl ConsumerConfig {
    /// Sets the initial backoff.
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Sets the maximum backoff.
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Sets the failure ceiling. Zero is raised to one.
    pub fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures.max(1);
        self
    }
}

/// What happened to a single delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The job was dispatched and the message acknowledged.
    Acknowledged,
    /// The payload could not be decoded; the broker will redeliver it.
    Unacknowledged,
    /// The job was dispatched but the acknowledge call failed.
    AckFailed,
}

/// Exponential backoff between failed receive calls.
#[derive(Debug)]
struct ReceiveBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    current: Duration,
    failures: u32,
}

impl ReceiveBackoff {
    fn new(config: &ConsumerConfig) -> Self {
        Self {
            initial: config.initial_backoff,
            max: config.max_backoff,
            multiplier: config.backoff_multiplier,
            current: config.initial_backoff,
            failures: 0,
        }
    }

    /// Records a failure and returns the delay before the next attempt.
    fn next_delay(&mut self) -> Duration {
        self.failures += 1;
        let delay = self.current.min(self.max);
        let grown = Duration::from_millis((self.current.as_millis() as f64 * self.multiplier) as u64);
        self.current = grown.min(self.max);
        delay
    }

    fn failures(&self) -> u32 {
        self.failures
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }
}

/// Long-running consumer of scheduler messages.
pub struct Consumer {
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn JobHandler>,
    config: ConsumerConfig,
    shutdown_rx: broadcast::Receiver<()>,
    metrics: MetricsCollector,
}

impl Consumer {
    /// Creates a consumer.
    ///
    /// # Arguments
    ///
    /// * `source` - Subscription to receive from
    /// * `handler` - Handles each decoded job name
    /// * `config` - Receive backoff settings
    /// * `shutdown_rx` - Receiver for the shutdown signal
    pub fn new(
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn JobHandler>,
        config: ConsumerConfig,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            source,
            handler,
            config,
            shutdown_rx,
            metrics: MetricsCollector::new(),
        }
    }

    /// Main consumption loop.
    ///
    /// Runs until a shutdown signal is received or the broker stays
    /// unreachable past the configured failure ceiling.
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        info!("Consumer started");
        let mut backoff = ReceiveBackoff::new(&self.config);

        loop {
            let received = tokio::select! {
                _ = self.shutdown_rx.recv() => break,
                received = self.source.receive() => received,
            };

            match received {
                Ok(deliveries) => {
                    backoff.reset();
                    for delivery in deliveries {
                        self.handle_delivery(delivery).await;
                    }
                }
                Err(e) => {
                    self.metrics.record_receive_error();
                    let delay = backoff.next_delay();

                    if backoff.failures() >= self.config.max_consecutive_failures {
                        error!(
                            error = %e,
                            failures = backoff.failures(),
                            "Broker unreachable, giving up"
                        );
                        return Err(ConsumerError::BrokerUnavailable {
                            attempts: backoff.failures(),
                            last: e,
                        });
                    }

                    warn!(
                        error = %e,
                        failures = backoff.failures(),
                        retry_in_ms = delay.as_millis() as u64,
                        "could not receive messages"
                    );

                    tokio::select! {
                        _ = self.shutdown_rx.recv() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        info!("Consumer stopped");
        Ok(())
    }

    /// Handles a single delivery and acknowledges it when appropriate.
    pub async fn handle_delivery(&self, delivery: Delivery) -> DeliveryOutcome {
        self.metrics.record_message_received();

        let message = match JobMessage::decode(&delivery.data) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.record_undecodable_message();
                warn!(
                    error = %e,
                    message_id = %delivery.id,
                    unparsed = %String::from_utf8_lossy(&delivery.data),
                    "Couldn't decode json"
                );
                return DeliveryOutcome::Unacknowledged;
            }
        };

        debug!(
            message_id = %delivery.id,
            job = %message.job,
            attempt = delivery.delivery_count,
            parsed = ?message,
            "Got message"
        );

        if let Err(e) = self.handler.handle(&message.job).await {
            error!(error = %e, job = %message.job, "Problem running job");
        }

        match self.source.ack(&delivery).await {
            Ok(()) => {
                self.metrics.record_message_acknowledged();
                DeliveryOutcome::Acknowledged
            }
            Err(e) => {
                self.metrics.record_ack_failure();
                error!(
                    error = %e,
                    message_id = %delivery.id,
                    "Failed to acknowledge message"
                );
                DeliveryOutcome::AckFailed
            }
        }
    }
}
