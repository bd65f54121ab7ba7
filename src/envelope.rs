//! The message envelope: the JSON frame wrapping every message carried by
//! the transport.
//!
//! See spec §3.1 / §6 for the wire shape. Every field here round-trips
//! through `serde_json` untouched; `message` stays a `serde_json::Value` so
//! the envelope itself never needs to know the application's payload types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a publish is fire-and-forget fanout or a point-to-point
/// request expecting a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvelopeKind {
    Publish,
    PublishAsync,
}

/// A colon-delimited message type: `message:<cluster>:<TypeName>`.
///
/// The **last segment** is the logical type name used for dispatch by both
/// the consumer pipeline and the saga runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageType(pub String);

impl MessageType {
    pub fn new(cluster: &str, type_name: &str) -> Self {
        Self(format!("message:{cluster}:{type_name}"))
    }

    /// The logical type name used for dispatch (the last `:`-delimited segment).
    pub fn logical_name(&self) -> &str {
        self.0.rsplit(':').next().unwrap_or(self.0.as_str())
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Headers carried alongside the payload.
///
/// `saga` holds the full saga instance state when the publish originated
/// inside a saga step (spec §3.1); `x_redelivery` and `x_delay` mirror the
/// AMQP delayed-redelivery headers (spec §4.1/§6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Headers {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saga: Option<serde_json::Value>,
    #[serde(rename = "x-redelivery", default)]
    pub x_redelivery: u32,
    #[serde(rename = "x-delay", default, skip_serializing_if = "Option::is_none")]
    pub x_delay: Option<u64>,
}

/// The envelope wrapping every message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: String,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub source_address: String,
    pub destination_address: String,
    pub message_type: MessageType,
    pub message: serde_json::Value,
    pub sent_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub headers: Headers,
    /// AMQP `replyTo`/`correlationId` for request/reply, not part of the
    /// JSON body itself (carried as broker message properties) but tracked
    /// here for the in-process mock transport and for tests.
    #[serde(skip)]
    pub reply_to: Option<String>,
    #[serde(skip)]
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// Build a fire-and-forget publish envelope.
    pub fn new_publish(
        cluster: &str,
        type_name: &str,
        source_address: impl Into<String>,
        destination_address: impl Into<String>,
        message: serde_json::Value,
    ) -> Self {
        Self {
            message_id: Uuid::now_v7().to_string(),
            kind: EnvelopeKind::Publish,
            source_address: source_address.into(),
            destination_address: destination_address.into(),
            message_type: MessageType::new(cluster, type_name),
            message,
            sent_time: Utc::now(),
            expiration_time: None,
            headers: Headers::default(),
            reply_to: None,
            correlation_id: None,
        }
    }

    /// Build a request/reply publish envelope with an expiration deadline.
    pub fn new_publish_async(
        cluster: &str,
        type_name: &str,
        source_address: impl Into<String>,
        destination_address: impl Into<String>,
        message: serde_json::Value,
        timeout: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: Uuid::now_v7().to_string(),
            kind: EnvelopeKind::PublishAsync,
            source_address: source_address.into(),
            destination_address: destination_address.into(),
            message_type: MessageType::new(cluster, type_name),
            message,
            sent_time: now,
            expiration_time: Some(now + timeout),
            headers: Headers::default(),
            reply_to: None,
            correlation_id: Some(Uuid::new_v4().to_string()),
        }
    }

    /// Attach saga state to the headers (the "ship state in headers" shortcut
    /// from spec §9 — the repository remains authoritative, see
    /// `saga::repository` docs for the precedence rule).
    pub fn with_saga_header(mut self, saga: &serde_json::Value) -> Self {
        self.headers.saga = Some(saga.clone());
        self
    }

    pub fn with_redelivery(mut self, count: u32) -> Self {
        self.headers.x_redelivery = count;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_logical_name_is_last_segment() {
        let mt = MessageType::new("prod", "OrderSubmitted");
        assert_eq!(mt.0, "message:prod:OrderSubmitted");
        assert_eq!(mt.logical_name(), "OrderSubmitted");
    }

    #[test]
    fn envelope_round_trips_through_json() {
        let env = Envelope::new_publish(
            "prod",
            "OrderSubmitted",
            "queue://source",
            "queue://dest",
            serde_json::json!({"orderId": "A", "total": 10000}),
        );
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.message_id, env.message_id);
        assert_eq!(back.message_type, env.message_type);
        assert_eq!(back.message, env.message);
        assert_eq!(back.sent_time, env.sent_time);
    }

    #[test]
    fn publish_async_sets_expiration_and_correlation_id() {
        let env = Envelope::new_publish_async(
            "prod",
            "ProcessPayment",
            "a",
            "b",
            serde_json::json!({}),
            chrono::Duration::seconds(10),
        );
        assert!(env.expiration_time.is_some());
        assert!(env.correlation_id.is_some());
        assert_eq!(env.kind, EnvelopeKind::PublishAsync);
    }
}
