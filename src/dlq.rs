//! Dead-letter records (spec §4.2 step 9, §7 kind 1/4).
//!
//! Diagnostic record enqueued on `<Q>_error` once retry and redelivery are
//! exhausted (or redelivery is unavailable). Grounded in the shape of
//! `angzarr::dlq::AngzarrDeadLetter`, trimmed to what the consumer pipeline
//! actually needs: headers, payload, host info, exception, retry counters.

use crate::envelope::Envelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A dead letter enqueued on an endpoint's error queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// The original envelope, byte-identical to what was received (spec invariant 5).
    pub envelope: Envelope,
    /// Host/process that observed the failure.
    pub host: String,
    /// The exception/error message from the last failed attempt.
    pub exception: String,
    /// Number of level-1 retry attempts made before deadlettering.
    pub retry_count: u32,
    /// Number of level-2 redeliveries made before deadlettering.
    pub redelivery_count: u32,
    /// Whether this was a permanent fault (validation, saga-cancelled) rather
    /// than exhausted retries.
    pub permanent: bool,
    pub occurred_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(
        envelope: Envelope,
        exception: impl Into<String>,
        retry_count: u32,
        redelivery_count: u32,
        permanent: bool,
    ) -> Self {
        Self {
            envelope,
            host: hostname(),
            exception: exception.into(),
            retry_count,
            redelivery_count,
            permanent,
            occurred_at: Utc::now(),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string())
}
