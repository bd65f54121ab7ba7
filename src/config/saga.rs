//! Per-saga configuration (spec §6 "Per-saga options").

use serde::Deserialize;
use std::time::Duration;

/// Saga archive/retry policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Move finalized instances to the archive store instead of deleting them.
    pub auto_archive: bool,
    /// TTL applied to archived instances, in seconds. Drives
    /// `saga::repository::SagaRepository::archive_expired`, which every
    /// backend implements; the host application spawns
    /// `saga::repository::spawn_archive_sweep` with this value (via
    /// [`SagaConfig::archive_ttl`]) to actually run the sweep on an
    /// interval. `None` means archived instances are kept indefinitely.
    pub archive_ttl_secs: Option<u64>,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub retry_exponential_backoff: bool,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            auto_archive: true,
            archive_ttl_secs: None,
            retry_attempts: 5,
            retry_delay_ms: 50,
            retry_exponential_backoff: true,
        }
    }
}

impl SagaConfig {
    pub fn archive_ttl(&self) -> Option<Duration> {
        self.archive_ttl_secs.map(Duration::from_secs)
    }
}
