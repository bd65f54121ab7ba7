//! The routing slip executor (spec §4.4): forward execution of a linear
//! itinerary of compensable activities, LIFO compensation on fault, and
//! lifecycle events.
//!
//! Grounded in `angzarr::orchestration::saga`'s retry-wrapped-step shape for
//! the overall "run a chain of operations, unwind on failure" structure, but
//! the itinerary/activity/compensation-log vocabulary here is specific to
//! this module and has no equivalent in the teacher.

pub mod activity;
pub mod distributed;
pub mod executor;

pub use activity::{Activity, ActivityFactory, ActivityOutcome, CompensateContext, ExecuteContext};
pub use executor::{RoutingSlipExecutor, RoutingSlipSubscriber};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One step in a routing slip's itinerary (spec §3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItineraryStep {
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub args: serde_json::Value,
}

impl ItineraryStep {
    pub fn new(name: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            address: None,
            args,
        }
    }
}

/// An in-flight or completed itinerary revision requested by an activity
/// (spec §9 Open Question: "reviseItinerary fully wired"). The revised
/// steps are spliced in immediately after the activity that requested them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItineraryRevision {
    pub insert_next: Vec<ItineraryStep>,
}

/// One entry in `activityLogs` (spec §3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityLog {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub duration: std::time::Duration,
    #[serde(default)]
    pub compensation_log: Option<serde_json::Value>,
}

/// One entry in `compensateLogs` (spec §3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensateLog {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

/// One entry in `activityExceptions` (spec §3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityException {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// A routing slip: itinerary, running variables, and accumulated logs
/// (spec §3.3).
///
/// Invariant: `activityLogs.len() <= current itinerary index`; once
/// compensation begins, no further forward execution occurs on this slip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingSlip {
    pub tracking_number: String,
    pub create_timestamp: DateTime<Utc>,
    pub itinerary: Vec<ItineraryStep>,
    #[serde(default)]
    pub variables: serde_json::Value,
    #[serde(default)]
    pub activity_logs: Vec<ActivityLog>,
    #[serde(default)]
    pub compensate_logs: Vec<CompensateLog>,
    #[serde(default)]
    pub activity_exceptions: Vec<ActivityException>,
}

impl RoutingSlip {
    pub fn new(tracking_number: impl Into<String>, itinerary: Vec<ItineraryStep>) -> Self {
        Self {
            tracking_number: tracking_number.into(),
            create_timestamp: Utc::now(),
            itinerary,
            variables: serde_json::Value::Object(Default::default()),
            activity_logs: Vec::new(),
            compensate_logs: Vec::new(),
            activity_exceptions: Vec::new(),
        }
    }

    pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = variables;
        self
    }
}

/// Terminal outcome of a single forward-execution run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlipOutcome {
    Completed,
    Faulted,
    Terminated,
}
