//! `Activity`: a unit of work in a routing slip, with an `execute` entry
//! point and an optional `compensate` entry point (spec §4.4, glossary).

use super::ItineraryRevision;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Context handed to `Activity::execute` (spec §4.4 step 2).
pub struct ExecuteContext {
    pub tracking_number: String,
    pub args: serde_json::Value,
    pub variables: serde_json::Value,
}

impl ExecuteContext {
    pub fn completed(&self, log: Option<serde_json::Value>) -> ActivityOutcome {
        ActivityOutcome::Complete { variables: None, log }
    }

    pub fn completed_with_variables(
        &self,
        variables: serde_json::Value,
        log: Option<serde_json::Value>,
    ) -> ActivityOutcome {
        ActivityOutcome::Complete {
            variables: Some(variables),
            log,
        }
    }

    pub fn revise_itinerary(&self, revision: ItineraryRevision) -> ActivityOutcome {
        ActivityOutcome::ReviseItinerary(revision)
    }

    pub fn faulted(&self, error: impl Into<String>) -> ActivityOutcome {
        ActivityOutcome::Fault(error.into())
    }

    pub fn terminated(&self) -> ActivityOutcome {
        ActivityOutcome::Terminate
    }
}

/// Context handed to `Activity::compensate` (spec §4.4 "Compensation").
pub struct CompensateContext {
    pub tracking_number: String,
    pub compensation_log: Option<serde_json::Value>,
    pub variables: serde_json::Value,
}

/// What an activity's `execute` call resolves to (spec §4.4 step 3).
#[derive(Debug, Clone)]
pub enum ActivityOutcome {
    /// Completed; variables, if present, are merged into the slip (last
    /// writer wins); `log` is stashed for `compensate` to use later.
    Complete {
        variables: Option<serde_json::Value>,
        log: Option<serde_json::Value>,
    },
    /// Splice `revision.insert_next` into the itinerary immediately after
    /// this step, then continue forward execution as if this step had
    /// completed (with no variables merged and no compensation log).
    ReviseItinerary(ItineraryRevision),
    /// Fault with the given error; triggers compensation.
    Fault(String),
    /// Stop without compensating.
    Terminate,
}

/// A unit of work in a routing slip (spec §4.4, glossary "Activity").
#[async_trait]
pub trait Activity: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, ctx: ExecuteContext) -> ActivityOutcome;

    /// Whether this activity implements compensation. The executor only
    /// calls `compensate` for activities where this returns `true` (spec
    /// §4.4 "if it implements compensation").
    fn has_compensation(&self) -> bool {
        false
    }

    /// Undo this activity's effects. Only called when `has_compensation()`
    /// is `true`. Returning `Err` is logged and does not stop the
    /// compensation run from continuing with earlier steps.
    async fn compensate(&self, _ctx: CompensateContext) -> Result<(), String> {
        Ok(())
    }
}

/// Resolves activities by name (spec §4.4 step 1, replacing the source's
/// reflective decorator registration with explicit registration at
/// startup, spec §9 "Decorators → static registration").
#[derive(Default, Clone)]
pub struct ActivityFactory {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, activity: Arc<dyn Activity>) -> &mut Self {
        self.activities.insert(activity.name().to_string(), activity);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Activity>> {
        self.activities.get(name).cloned()
    }
}
