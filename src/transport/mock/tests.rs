use super::*;
use crate::consumer::{BehaviorContext, ConsumerError, ConsumerPipeline, MessageHandler};
use crate::envelope::Envelope;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};

struct PipelineQueueHandler {
    pipeline: ConsumerPipeline,
    redelivery_counter: std::sync::atomic::AtomicU32,
    supports_delayed: bool,
}

#[async_trait]
impl super::super::QueueHandler for PipelineQueueHandler {
    async fn handle(&self, envelope: &Envelope) -> Outcome {
        let current = self.redelivery_counter.load(Ordering::SeqCst);
        let outcome = self
            .pipeline
            .process(envelope, current, self.supports_delayed)
            .await;
        if let Outcome::Redeliver {
            next_redelivery_count,
            ..
        } = &outcome
        {
            self.redelivery_counter
                .store(*next_redelivery_count, Ordering::SeqCst);
        }
        outcome
    }
}

struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn consume(
        &self,
        ctx: &mut BehaviorContext,
    ) -> Result<Option<serde_json::Value>, ConsumerError> {
        Ok(Some(ctx.message.clone()))
    }
}

struct AlwaysFailHandler {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl MessageHandler for AlwaysFailHandler {
    async fn consume(
        &self,
        _ctx: &mut BehaviorContext,
    ) -> Result<Option<serde_json::Value>, ConsumerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ConsumerError::Handler("nope".to_string()))
    }
}

#[tokio::test]
async fn publish_fans_out_to_all_bound_queues() {
    let transport = MockTransport::new();
    let pipeline = ConsumerPipeline::new("q1", Arc::new(EchoHandler));
    transport
        .start(vec![EndpointBinding {
            queue: "q1".to_string(),
            bound_types: vec!["OrderSubmitted".to_string()],
            prefetch: 1,
            purge_on_startup: false,
            handler: Arc::new(PipelineQueueHandler {
                pipeline,
                redelivery_counter: std::sync::atomic::AtomicU32::new(0),
                supports_delayed: true,
            }),
        }])
        .await
        .unwrap();

    transport
        .publish(Envelope::new_publish(
            "prod",
            "OrderSubmitted",
            "a",
            "b",
            serde_json::json!({"orderId": "A"}),
        ))
        .await
        .unwrap();

    assert_eq!(transport.published_envelopes().await.len(), 1);
    assert!(transport.error_queue("q1").await.is_empty());
}

#[tokio::test]
async fn publish_async_returns_reply_from_echo_handler() {
    let transport = MockTransport::new();
    let pipeline = ConsumerPipeline::new("q1", Arc::new(EchoHandler));
    transport
        .start(vec![EndpointBinding {
            queue: "q1".to_string(),
            bound_types: vec!["ProcessPayment".to_string()],
            prefetch: 1,
            purge_on_startup: false,
            handler: Arc::new(PipelineQueueHandler {
                pipeline,
                redelivery_counter: std::sync::atomic::AtomicU32::new(0),
                supports_delayed: true,
            }),
        }])
        .await
        .unwrap();

    let reply = transport
        .publish_async(
            Envelope::new_publish_async(
                "prod",
                "ProcessPayment",
                "a",
                "b",
                serde_json::json!({"amount": 500}),
                chrono::Duration::seconds(5),
            ),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(reply.message, serde_json::json!({"amount": 500}));
}

#[tokio::test]
async fn publish_async_with_no_bound_queue_errors() {
    let transport = MockTransport::new();
    let result = transport
        .publish_async(
            Envelope::new_publish_async(
                "prod",
                "Unbound",
                "a",
                "b",
                serde_json::json!({}),
                chrono::Duration::seconds(1),
            ),
            Duration::from_millis(50),
        )
        .await;
    assert!(matches!(result, Err(TransportError::NoQueueConfigured)));
}

#[tokio::test]
async fn exhausted_retries_land_on_error_queue() {
    let transport = MockTransport::new();
    let calls = Arc::new(AtomicU32::new(0));
    let pipeline = ConsumerPipeline::new("q1", Arc::new(AlwaysFailHandler { calls }))
        .with_retry(RetryStrategy::Immediate { retries: 1 });
    transport
        .start(vec![EndpointBinding {
            queue: "q1".to_string(),
            bound_types: vec!["OrderSubmitted".to_string()],
            prefetch: 1,
            purge_on_startup: false,
            handler: Arc::new(PipelineQueueHandler {
                pipeline,
                redelivery_counter: std::sync::atomic::AtomicU32::new(0),
                supports_delayed: true,
            }),
        }])
        .await
        .unwrap();

    transport
        .publish(Envelope::new_publish(
            "prod",
            "OrderSubmitted",
            "a",
            "b",
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    let dead = transport.error_queue("q1").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 1);
}

#[tokio::test]
async fn redelivery_loop_eventually_deadletters_when_unsupported() {
    let transport = MockTransport::new().without_delayed_plugin();
    let calls = Arc::new(AtomicU32::new(0));
    let pipeline = ConsumerPipeline::new("q1", Arc::new(AlwaysFailHandler { calls: calls.clone() }))
        .with_redelivery(RetryStrategy::Intervals {
            delays: vec![Duration::from_millis(1)],
        });
    transport
        .start(vec![EndpointBinding {
            queue: "q1".to_string(),
            bound_types: vec!["OrderSubmitted".to_string()],
            prefetch: 1,
            purge_on_startup: false,
            handler: Arc::new(PipelineQueueHandler {
                pipeline,
                redelivery_counter: std::sync::atomic::AtomicU32::new(0),
                supports_delayed: transport.supports_delayed_redelivery(),
            }),
        }])
        .await
        .unwrap();

    transport
        .publish(Envelope::new_publish(
            "prod",
            "OrderSubmitted",
            "a",
            "b",
            serde_json::json!({}),
        ))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let dead = transport.error_queue("q1").await;
    assert_eq!(dead.len(), 1);
}

use crate::retry::RetryStrategy;
