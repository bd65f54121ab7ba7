//! An in-memory `Transport` for tests and for applications that want this
//! crate with no external broker (mirrors `angzarr::bus::mock::MockEventBus`
//! standing in for `AmqpEventBus`).
//!
//! Dispatch happens in-process and is awaited synchronously rather than
//! fire-and-forget — acceptable for a mock used by tests and by the
//! `InProcess` routing-slip execution mode, not meant to model true
//! asynchronous fanout.

use super::{EndpointBinding, Result, Transport, TransportError};
use crate::consumer::Outcome;
use crate::dlq::DeadLetterRecord;
use crate::envelope::{Envelope, EnvelopeKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

struct Queue {
    handler: Arc<dyn super::QueueHandler>,
}

/// In-memory transport. Routing is by `messageType`'s logical name, exactly
/// as the AMQP transport routes by fanout exchange.
pub struct MockTransport {
    type_to_queues: RwLock<HashMap<String, Vec<String>>>,
    queues: RwLock<HashMap<String, Queue>>,
    error_queues: RwLock<HashMap<String, Vec<DeadLetterRecord>>>,
    published: RwLock<Vec<Envelope>>,
    supports_delayed: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            type_to_queues: RwLock::new(HashMap::new()),
            queues: RwLock::new(HashMap::new()),
            error_queues: RwLock::new(HashMap::new()),
            published: RwLock::new(Vec::new()),
            supports_delayed: true,
        }
    }

    /// Simulate an environment without the delayed-message plugin (spec §4.1 step 3).
    pub fn without_delayed_plugin(mut self) -> Self {
        self.supports_delayed = false;
        self
    }

    /// All envelopes ever handed to `publish`/`publish_async`, in order —
    /// used by tests to assert outbound message ordering (e.g. S1 in spec §8).
    pub async fn published_envelopes(&self) -> Vec<Envelope> {
        self.published.read().await.clone()
    }

    /// Contents of an endpoint's error queue, for asserting S3/S4-shaped scenarios.
    pub async fn error_queue(&self, queue: &str) -> Vec<DeadLetterRecord> {
        self.error_queues
            .read()
            .await
            .get(queue)
            .cloned()
            .unwrap_or_default()
    }

    async fn dispatch_to_queue(&self, queue: &str, mut envelope: Envelope) -> Option<serde_json::Value> {
        loop {
            let handler = {
                let queues = self.queues.read().await;
                match queues.get(queue) {
                    Some(q) => q.handler.clone(),
                    None => {
                        warn!(%queue, "publish to unbound queue, dropping");
                        return None;
                    }
                }
            };

            let current_redelivery = envelope.headers.x_redelivery;
            match handler.handle(&envelope).await {
                Outcome::Success { reply } => return reply,
                Outcome::Redeliver {
                    delay,
                    next_redelivery_count,
                } => {
                    debug!(%queue, next_redelivery_count, ?delay, "redelivering");
                    tokio::time::sleep(delay.min(Duration::from_millis(50))).await;
                    envelope.headers.x_redelivery = next_redelivery_count;
                    let _ = current_redelivery;
                    continue;
                }
                Outcome::Deadletter {
                    exception,
                    retry_count,
                    permanent,
                } => {
                    let record = DeadLetterRecord::new(
                        envelope.clone(),
                        exception,
                        retry_count,
                        current_redelivery,
                        permanent,
                    );
                    self.error_queues
                        .write()
                        .await
                        .entry(queue.to_string())
                        .or_default()
                        .push(record);
                    return None;
                }
            }
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self, bindings: Vec<EndpointBinding>) -> Result<()> {
        let mut type_to_queues = self.type_to_queues.write().await;
        let mut queues = self.queues.write().await;
        for binding in bindings {
            for t in &binding.bound_types {
                type_to_queues
                    .entry(t.clone())
                    .or_default()
                    .push(binding.queue.clone());
            }
            queues.insert(
                binding.queue.clone(),
                Queue {
                    handler: binding.handler,
                },
            );
        }
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        self.published.write().await.push(envelope.clone());
        let queues = self
            .type_to_queues
            .read()
            .await
            .get(envelope.message_type.logical_name())
            .cloned()
            .unwrap_or_default();

        for queue in queues {
            self.dispatch_to_queue(&queue, envelope.clone()).await;
        }
        Ok(())
    }

    async fn publish_async(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        self.published.write().await.push(envelope.clone());
        let queues = self
            .type_to_queues
            .read()
            .await
            .get(envelope.message_type.logical_name())
            .cloned()
            .unwrap_or_default();

        let queue = queues
            .into_iter()
            .next()
            .ok_or(TransportError::NoQueueConfigured)?;

        match tokio::time::timeout(timeout, self.dispatch_to_queue(&queue, envelope.clone())).await
        {
            Ok(Some(value)) => {
                let mut reply = envelope.clone();
                reply.kind = EnvelopeKind::Publish;
                reply.message = value;
                Ok(reply)
            }
            Ok(None) => Err(TransportError::ReplyTimeout(timeout)),
            Err(_) => Err(TransportError::ReplyTimeout(timeout)),
        }
    }

    async fn deadletter(&self, queue: &str, record: DeadLetterRecord) -> Result<()> {
        self.error_queues
            .write()
            .await
            .entry(queue.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    fn supports_delayed_redelivery(&self) -> bool {
        self.supports_delayed
    }
}

#[cfg(test)]
mod tests;
