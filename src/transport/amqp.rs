//! The AMQP 0.9.1 `Transport` over `lapin`/`deadpool-lapin` (spec §4.1).
//!
//! Topology: one fanout exchange per logical message type, one durable queue
//! per receive endpoint, one `x-delayed-message` exchange and one `_error`
//! queue per endpoint for level-2 redelivery and deadlettering respectively.
//! Grounded throughout in `angzarr::bus::amqp::AmqpEventBus` — the pooled
//! connection, the reconnect-with-backoff consumer loop, and the
//! publish-with-confirm retry all follow its shape; only the exchange
//! topology and the JSON wire format differ, since this transport fans out
//! per message type rather than routing a single topic exchange by domain.

use super::{EndpointBinding, Result, Transport, TransportError};
use crate::config::BrokerConfig;
use crate::dlq::DeadLetterRecord;
use crate::envelope::{Envelope, EnvelopeKind};
use crate::transport::topology;
use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueuePurgeOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, ExchangeKind,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DIRECT_REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";

fn delayed_exchange_name(queue: &str) -> String {
    format!("delayed.exchange.{queue}")
}

fn error_queue_name(queue: &str) -> String {
    format!("{queue}_error")
}

/// AMQP transport backed by a pooled connection.
pub struct AmqpTransport {
    pool: Pool,
    cluster: String,
    default_timeout: Duration,
    supports_delayed: bool,
    pending_replies: Arc<RwLock<HashMap<String, oneshot::Sender<Envelope>>>>,
}

impl AmqpTransport {
    /// Connect, declare nothing yet (topology is declared per-endpoint in
    /// `start`), and probe whether the delayed-message plugin is installed
    /// (spec §4.1 step 3).
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(10)
            .build()
            .map_err(|e| TransportError::Connection(format!("failed to create pool: {e}")))?;

        let conn = pool
            .get()
            .await
            .map_err(|e| TransportError::Connection(format!("failed to connect: {e}")))?;
        let channel = conn
            .create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("failed to create channel: {e}")))?;

        let supports_delayed = probe_delayed_plugin(&channel).await;
        if !supports_delayed {
            warn!("x-delayed-message plugin not detected; redelivery will deadletter directly");
        }

        info!(url = %config.url, cluster = %config.cluster, supports_delayed, "connected to AMQP broker");

        Ok(Self {
            pool,
            cluster: config.cluster.clone(),
            default_timeout: Duration::from_secs(config.reply_timeout_secs),
            supports_delayed,
            pending_replies: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn channel(&self) -> Result<Channel> {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e: PoolError| TransportError::Connection(format!("pool exhausted: {e}")))?;
        conn.create_channel()
            .await
            .map_err(|e| TransportError::Connection(format!("failed to create channel: {e}")))
    }

    async fn declare_topology(&self, channel: &Channel, binding: &EndpointBinding) -> Result<()> {
        for type_name in &binding.bound_types {
            let exchange = topology::exchange_for_type(&self.cluster, type_name);
            channel
                .exchange_declare(
                    &exchange,
                    ExchangeKind::Fanout,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::Subscribe(format!("declare exchange: {e}")))?;

            channel
                .queue_bind(
                    &binding.queue,
                    &exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::Subscribe(format!("bind queue: {e}")))?;
        }

        channel
            .queue_declare(
                &binding.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("declare queue: {e}")))?;

        if binding.purge_on_startup {
            channel
                .queue_purge(&binding.queue, QueuePurgeOptions::default())
                .await
                .map_err(|e| TransportError::Subscribe(format!("purge queue: {e}")))?;
        }

        channel
            .queue_declare(
                &error_queue_name(&binding.queue),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("declare error queue: {e}")))?;

        if self.supports_delayed {
            let delayed_exchange = delayed_exchange_name(&binding.queue);
            let mut args = FieldTable::default();
            args.insert("x-delayed-type".into(), AMQPValue::LongString("direct".into()));
            channel
                .exchange_declare(
                    &delayed_exchange,
                    ExchangeKind::Custom("x-delayed-message".to_string()),
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    args,
                )
                .await
                .map_err(|e| TransportError::Subscribe(format!("declare delayed exchange: {e}")))?;

            channel
                .queue_bind(
                    &binding.queue,
                    &delayed_exchange,
                    "",
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| TransportError::Subscribe(format!("bind delayed exchange: {e}")))?;
        }

        channel
            .basic_qos(binding.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Subscribe(format!("set prefetch: {e}")))?;

        Ok(())
    }

    /// Republish `envelope` onto the delayed exchange so it reappears on the
    /// original queue after `delay` (spec §4.2 step 8).
    async fn redeliver(&self, queue: &str, mut envelope: Envelope, delay: Duration, next_count: u32) -> Result<()> {
        envelope.headers.x_redelivery = next_count;
        envelope.headers.x_delay = Some(delay.as_millis() as u64);
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| TransportError::Publish(format!("encode for redelivery: {e}")))?;

        let channel = self.channel().await?;
        let mut headers = FieldTable::default();
        headers.insert(
            "x-delay".into(),
            AMQPValue::LongLongInt(delay.as_millis() as i64),
        );
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2)
            .with_headers(headers);

        channel
            .basic_publish(
                &delayed_exchange_name(queue),
                "",
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(format!("redeliver publish: {e}")))?
            .await
            .map_err(|e| TransportError::Publish(format!("redeliver confirm: {e}")))?;
        Ok(())
    }

    async fn consume_loop(
        self: Arc<Self>,
        binding: Arc<EndpointBinding>,
    ) {
        let backoff_builder = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter();
        let mut backoff_iter = backoff_builder.build();

        loop {
            match self.setup_consumer(&binding).await {
                Ok(mut consumer) => {
                    info!(queue = %binding.queue, "consumer connected");
                    backoff_iter = backoff_builder.build();

                    while let Some(delivery) = consumer.next().await {
                        match delivery {
                            Ok(delivery) => self.process_delivery(&binding, delivery).await,
                            Err(e) => {
                                error!(queue = %binding.queue, error = %e, "delivery error, reconnecting");
                                break;
                            }
                        }
                    }
                    info!(queue = %binding.queue, "consumer stream ended, reconnecting");
                }
                Err(e) => {
                    let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                    error!(queue = %binding.queue, error = %e, delay_ms = delay.as_millis() as u64, "failed to set up consumer");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            }

            let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
            tokio::time::sleep(delay).await;
        }
    }

    async fn setup_consumer(&self, binding: &EndpointBinding) -> Result<lapin::Consumer> {
        let channel = self.channel().await?;
        channel
            .basic_qos(binding.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::Subscribe(format!("set prefetch: {e}")))?;

        channel
            .basic_consume(
                &binding.queue,
                &format!("txbus-{}", Uuid::new_v4()),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Subscribe(format!("start consumer: {e}")))
    }

    async fn process_delivery(&self, binding: &EndpointBinding, delivery: lapin::message::Delivery) {
        let envelope: Envelope = match serde_json::from_slice(&delivery.data) {
            Ok(e) => e,
            Err(e) => {
                error!(queue = %binding.queue, error = %e, "malformed envelope, rejecting");
                let _ = delivery.reject(Default::default()).await;
                return;
            }
        };

        if envelope.kind == EnvelopeKind::PublishAsync {
            if let Some(correlation_id) = delivery.properties.correlation_id().as_ref().map(|c| c.to_string()) {
                if let Some(sender) = self.pending_replies.write().await.remove(&correlation_id) {
                    let _ = sender.send(envelope);
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                    return;
                }
            }
        }

        let outcome = binding.handler.handle(&envelope).await;
        match outcome {
            crate::consumer::Outcome::Success { reply } => {
                if let Some(value) = reply {
                    if let Some(reply_to) = delivery.properties.reply_to().clone() {
                        let _ = self
                            .publish_reply(reply_to.as_str(), delivery.properties.correlation_id(), value)
                            .await;
                    }
                }
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
            crate::consumer::Outcome::Redeliver {
                delay,
                next_redelivery_count,
            } => {
                if let Err(e) = self
                    .redeliver(&binding.queue, envelope.clone(), delay, next_redelivery_count)
                    .await
                {
                    error!(queue = %binding.queue, error = %e, "failed to schedule redelivery");
                }
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
            crate::consumer::Outcome::Deadletter {
                exception,
                retry_count,
                permanent,
            } => {
                let record = DeadLetterRecord::new(
                    envelope.clone(),
                    exception,
                    retry_count,
                    envelope.headers.x_redelivery,
                    permanent,
                );
                if let Err(e) = self.deadletter(&binding.queue, record).await {
                    error!(queue = %binding.queue, error = %e, "failed to deadletter");
                }
                let _ = delivery.ack(BasicAckOptions::default()).await;
            }
        }
    }

    async fn publish_reply(
        &self,
        reply_to: &str,
        correlation_id: &Option<lapin::types::ShortString>,
        value: serde_json::Value,
    ) -> Result<()> {
        let payload = serde_json::to_vec(&value)
            .map_err(|e| TransportError::Publish(format!("encode reply: {e}")))?;
        let channel = self.channel().await?;
        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if let Some(cid) = correlation_id {
            properties = properties.with_correlation_id(cid.clone());
        }
        channel
            .basic_publish(
                "",
                reply_to,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(format!("reply publish: {e}")))?;
        Ok(())
    }
}

async fn probe_delayed_plugin(channel: &Channel) -> bool {
    let probe_name = format!("txbus.delayed.probe.{}", Uuid::new_v4());
    let mut args = FieldTable::default();
    args.insert("x-delayed-type".into(), AMQPValue::LongString("direct".into()));

    let declared = channel
        .exchange_declare(
            &probe_name,
            ExchangeKind::Custom("x-delayed-message".to_string()),
            ExchangeDeclareOptions {
                durable: false,
                auto_delete: true,
                ..Default::default()
            },
            args,
        )
        .await
        .is_ok();

    if declared {
        let _ = channel
            .exchange_delete(&probe_name, ExchangeDeleteOptions::default())
            .await;
    }
    declared
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn start(&self, bindings: Vec<EndpointBinding>) -> Result<()> {
        for binding in bindings {
            let channel = self.channel().await?;
            self.declare_topology(&channel, &binding).await?;

            let this = Arc::new(AmqpTransport {
                pool: self.pool.clone(),
                cluster: self.cluster.clone(),
                default_timeout: self.default_timeout,
                supports_delayed: self.supports_delayed,
                pending_replies: self.pending_replies.clone(),
            });
            let binding = Arc::new(binding);
            tokio::spawn(async move {
                this.consume_loop(binding).await;
            });
        }
        Ok(())
    }

    async fn publish(&self, envelope: Envelope) -> Result<()> {
        const MAX_RETRIES: usize = 5;

        let exchange = topology::exchange_for_type(&self.cluster, envelope.message_type.logical_name());
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| TransportError::Publish(format!("encode envelope: {e}")))?;

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(MAX_RETRIES)
            .with_jitter()
            .build();

        let mut last_error = None;
        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            let channel = match self.channel().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(attempt, error = %e, "failed to get channel, retrying");
                    last_error = Some(e);
                    continue;
                }
            };

            let properties = BasicProperties::default()
                .with_content_type("application/json".into())
                .with_delivery_mode(2);

            match channel
                .basic_publish(&exchange, "", BasicPublishOptions::default(), &payload, properties)
                .await
            {
                Ok(confirm) => match confirm.await {
                    Ok(_) => {
                        debug!(exchange = %exchange, "published");
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(attempt, error = %e, "publish confirmation failed, retrying");
                        last_error = Some(TransportError::Publish(e.to_string()));
                    }
                },
                Err(e) => {
                    warn!(attempt, error = %e, "publish failed, retrying");
                    last_error = Some(TransportError::Publish(e.to_string()));
                }
            }
        }

        Err(last_error.unwrap_or(TransportError::Publish("max retries exceeded".to_string())))
    }

    async fn publish_async(&self, envelope: Envelope, timeout: Duration) -> Result<Envelope> {
        let correlation_id = envelope
            .correlation_id
            .clone()
            .ok_or_else(|| TransportError::Publish("publish_async requires a correlation id".to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending_replies
            .write()
            .await
            .insert(correlation_id.clone(), tx);

        let exchange = topology::exchange_for_type(&self.cluster, envelope.message_type.logical_name());
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| TransportError::Publish(format!("encode envelope: {e}")))?;

        let channel = self.channel().await?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_reply_to(DIRECT_REPLY_QUEUE.into())
            .with_correlation_id(correlation_id.clone().into());

        channel
            .basic_publish(&exchange, "", BasicPublishOptions::default(), &payload, properties)
            .await
            .map_err(|e| TransportError::Publish(format!("publish_async: {e}")))?
            .await
            .map_err(|e| TransportError::Publish(format!("publish_async confirm: {e}")))?;

        let effective_timeout = if timeout.is_zero() { self.default_timeout } else { timeout };
        match tokio::time::timeout(effective_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => {
                self.pending_replies.write().await.remove(&correlation_id);
                Err(TransportError::ReplyTimeout(effective_timeout))
            }
        }
    }

    async fn deadletter(&self, queue: &str, record: DeadLetterRecord) -> Result<()> {
        let payload = serde_json::to_vec(&record)
            .map_err(|e| TransportError::Publish(format!("encode dead letter: {e}")))?;
        let channel = self.channel().await?;
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);

        channel
            .basic_publish(
                "",
                &error_queue_name(queue),
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| TransportError::Publish(format!("deadletter publish: {e}")))?
            .await
            .map_err(|e| TransportError::Publish(format!("deadletter confirm: {e}")))?;
        Ok(())
    }

    fn supports_delayed_redelivery(&self) -> bool {
        self.supports_delayed
    }
}
