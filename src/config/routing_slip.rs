//! Routing slip module configuration (spec §6 "Routing slip module options").

use serde::Deserialize;

/// Forward execution mode: run activities in-process or dispatch them onto
/// per-activity queues (spec §4.4 "Distributed execution mode").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    InProcess,
    Distributed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutingSlipConfig {
    pub execution_mode: ExecutionMode,
    pub queue_prefix: String,
    pub auto_provision_queues: bool,
}

impl Default for RoutingSlipConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::InProcess,
            queue_prefix: "routing_slip".to_string(),
            auto_provision_queues: true,
        }
    }
}
