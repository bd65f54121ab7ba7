//! The consumer pipeline: decode → validate → invoke → reply → retry →
//! redeliver → deadletter (spec §4.2).
//!
//! `ConsumerPipeline::process` implements steps 2-9; decoding (step 1) is the
//! transport's job since it owns the wire format, and acking (step 6) is the
//! transport's job since it owns the broker delivery handle. Everything in
//! between — validation, handler invocation, and the two-level retry ladder
//! — lives here so it can be unit-tested without a broker.

pub mod validation;

pub use validation::{NoopValidator, Validator};

use crate::envelope::Envelope;
use crate::retry::RetryStrategy;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Context handed to a consumer's `consume` method (spec §4.2 step 2).
#[derive(Debug, Clone)]
pub struct BehaviorContext {
    /// Full saga state when this message arrived with `headers.saga` set.
    pub saga: Option<serde_json::Value>,
    pub message: serde_json::Value,
    /// The logical type name (last segment of `messageType`), used by saga
    /// handlers to resolve the event binder.
    pub message_type: String,
    pub source_address: String,
    pub destination_address: String,
}

impl BehaviorContext {
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self {
            saga: envelope.headers.saga.clone(),
            message: envelope.message.clone(),
            message_type: envelope.message_type.logical_name().to_string(),
            source_address: envelope.source_address.clone(),
            destination_address: envelope.destination_address.clone(),
        }
    }
}

/// Errors a consumer pipeline can observe (spec §7 kinds 1, 2, 4).
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    /// Permanent: payload failed schema validation. Bypasses retry/redelivery.
    #[error("validation failed: {0:?}")]
    Validation(Vec<String>),
    /// Transient: thrown from user handler code. Eligible for retry/redelivery.
    #[error("handler failed: {0}")]
    Handler(String),
    /// Permanent: event arrived in a state that doesn't accept it.
    #[error("saga cancelled: {0}")]
    SagaCancelled(String),
}

impl ConsumerError {
    /// Permanent faults bypass retry and redelivery entirely (spec §7 kinds 1/4).
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ConsumerError::Validation(_) | ConsumerError::SagaCancelled(_)
        )
    }
}

/// A registered message handler (spec §4.2 step 4).
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one message, optionally returning a value to send back when
    /// the envelope requested a reply (spec §4.2 step 5).
    async fn consume(
        &self,
        ctx: &mut BehaviorContext,
    ) -> Result<Option<serde_json::Value>, ConsumerError>;
}

/// Outcome of running the pipeline on one delivery.
#[derive(Debug)]
pub enum Outcome {
    /// Handler succeeded; caller should ack (and publish `reply`, if any, and
    /// the envelope requested one).
    Success { reply: Option<serde_json::Value> },
    /// Level-1 retry exhausted; redeliver via the delayed exchange.
    Redeliver {
        delay: std::time::Duration,
        next_redelivery_count: u32,
    },
    /// Terminal: enqueue on the error queue and ack the original delivery.
    Deadletter {
        exception: String,
        retry_count: u32,
        permanent: bool,
    },
}

/// One endpoint's fixed policy: handler, optional validator, and the two
/// retry strategies (spec §6 "Per-endpoint options").
pub struct ConsumerPipeline {
    pub endpoint: String,
    pub handler: Arc<dyn MessageHandler>,
    pub validator: Option<Arc<dyn Validator>>,
    pub retry: Option<RetryStrategy>,
    pub redelivery: Option<RetryStrategy>,
}

impl ConsumerPipeline {
    pub fn new(endpoint: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            endpoint: endpoint.into(),
            handler,
            validator: None,
            retry: None,
            redelivery: None,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_retry(mut self, strategy: RetryStrategy) -> Self {
        self.retry = Some(strategy);
        self
    }

    pub fn with_redelivery(mut self, strategy: RetryStrategy) -> Self {
        self.redelivery = Some(strategy);
        self
    }

    /// Run the full pipeline (steps 2-9) on one delivery.
    ///
    /// `current_redelivery` is the envelope's `x-redelivery` counter as
    /// observed by the transport; `supports_delayed` reflects the startup
    /// delayed-plugin probe (spec §4.1 step 3 / §4.2 step 8).
    pub async fn process(
        &self,
        envelope: &Envelope,
        current_redelivery: u32,
        supports_delayed: bool,
    ) -> Outcome {
        let type_name = envelope.message_type.logical_name();

        if let Some(validator) = &self.validator {
            let errors = validator.validate(type_name, &envelope.message);
            if !errors.is_empty() {
                warn!(endpoint = %self.endpoint, ?errors, "validation failed, deadlettering");
                return Outcome::Deadletter {
                    exception: format!("validation failed: {errors:?}"),
                    retry_count: 0,
                    permanent: true,
                };
            }
        }

        let mut ctx = BehaviorContext::from_envelope(envelope);
        let mut attempt = 0u32;
        loop {
            match self.handler.consume(&mut ctx).await {
                Ok(reply) => {
                    debug!(endpoint = %self.endpoint, attempt, "handler succeeded");
                    return Outcome::Success { reply };
                }
                Err(err) if err.is_permanent() => {
                    error!(endpoint = %self.endpoint, error = %err, "permanent fault, deadlettering");
                    return Outcome::Deadletter {
                        exception: err.to_string(),
                        retry_count: attempt,
                        permanent: true,
                    };
                }
                Err(err) => {
                    let next_delay = self
                        .retry
                        .as_ref()
                        .and_then(|r| r.delay_for_attempt(attempt + 1));

                    match next_delay {
                        Some(delay) => {
                            warn!(
                                endpoint = %self.endpoint,
                                attempt,
                                error = %err,
                                "handler failed, retrying"
                            );
                            if !delay.is_zero() {
                                tokio::time::sleep(delay).await;
                            }
                            attempt += 1;
                            continue;
                        }
                        None => {
                            // Level 1 exhausted (or not configured). Try level 2.
                            if let Some(redelivery) = &self.redelivery {
                                if supports_delayed
                                    && current_redelivery < redelivery.max_retries()
                                {
                                    let delay = redelivery
                                        .delay_for_attempt(current_redelivery + 1)
                                        .unwrap_or(std::time::Duration::ZERO);
                                    warn!(
                                        endpoint = %self.endpoint,
                                        current_redelivery,
                                        "retry exhausted, scheduling redelivery"
                                    );
                                    return Outcome::Redeliver {
                                        delay,
                                        next_redelivery_count: current_redelivery + 1,
                                    };
                                }
                                if !supports_delayed {
                                    warn!(
                                        endpoint = %self.endpoint,
                                        "redelivery configured but delayed-message plugin unavailable, deadlettering"
                                    );
                                }
                            }
                            error!(endpoint = %self.endpoint, error = %err, "retries exhausted, deadlettering");
                            return Outcome::Deadletter {
                                exception: err.to_string(),
                                retry_count: attempt,
                                permanent: false,
                            };
                        }
                    }
                }
            }
        }
    }
}

/// Adapts a [`ConsumerPipeline`] to the transport's [`crate::transport::QueueHandler`]
/// port, so a registered endpoint can be handed straight to `Transport::start`
/// (spec §4.5 "consumed by the transport at startup to build topology and
/// attach consumers").
///
/// The envelope's own `x-redelivery` header (spec §3.1/§6) already carries
/// the current redelivery count once the transport round-trips it through a
/// republish, so no separate counter needs to be threaded through here.
pub struct PipelineQueueHandler {
    pipeline: ConsumerPipeline,
    supports_delayed: bool,
}

impl PipelineQueueHandler {
    pub fn new(pipeline: ConsumerPipeline, supports_delayed: bool) -> Self {
        Self {
            pipeline,
            supports_delayed,
        }
    }
}

#[async_trait]
impl crate::transport::QueueHandler for PipelineQueueHandler {
    async fn handle(&self, envelope: &Envelope) -> Outcome {
        self.pipeline
            .process(envelope, envelope.headers.x_redelivery, self.supports_delayed)
            .await
    }
}
