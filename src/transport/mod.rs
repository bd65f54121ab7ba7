//! The broker abstraction (spec §4.1).
//!
//! `Transport` is the port; `amqp` is the reference AMQP 0.9.1 implementation
//! over `lapin`/`deadpool-lapin`; `mock` is an in-memory implementation for
//! tests and for applications that don't need a live broker.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod mock;
pub mod topology;

use crate::consumer::Outcome;
use crate::dlq::DeadLetterRecord;
use crate::envelope::Envelope;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by the transport layer (spec §7 kinds 3, 7, 8).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("request timed out after {0:?}")]
    ReplyTimeout(Duration),
    #[error("no queue bound for endpoint")]
    NoQueueConfigured,
}

/// A handler attached to a queue, producing a pipeline `Outcome` for each
/// delivery. Implemented by `consumer::ConsumerPipeline` (wrapped to track
/// the envelope's `x-redelivery` counter and the delayed-plugin probe
/// result), and consulted by both transport implementations identically.
#[async_trait]
pub trait QueueHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> Outcome;
}

/// Declares the topology and consumer attachment for one receive endpoint
/// (spec §4.1 steps 4-5).
pub struct EndpointBinding {
    pub queue: String,
    /// Logical message type names this endpoint's queue binds exchanges for.
    pub bound_types: Vec<String>,
    pub prefetch: u16,
    pub purge_on_startup: bool,
    pub handler: Arc<dyn QueueHandler>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Declare topology for every registered endpoint and start consuming.
    async fn start(&self, bindings: Vec<EndpointBinding>) -> Result<()>;

    /// Fire-and-forget publish (spec §4.1 "Publish").
    async fn publish(&self, envelope: Envelope) -> Result<()>;

    /// Request/reply publish (spec §4.1 "Request/reply").
    async fn publish_async(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope>;

    /// Enqueue a diagnostic record on the endpoint's error queue (spec §4.2 step 9).
    async fn deadletter(&self, queue: &str, record: DeadLetterRecord) -> Result<()>;

    /// Whether the delayed-message plugin was detected at startup (spec §4.1 step 3).
    fn supports_delayed_redelivery(&self) -> bool;
}
