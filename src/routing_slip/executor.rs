//! The forward-execution / compensation loop (spec §4.4).

use super::activity::{ActivityFactory, ActivityOutcome, CompensateContext, ExecuteContext};
use super::{ActivityException, ActivityLog, CompensateLog, RoutingSlip, SlipOutcome};
use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Lifecycle subscriber (spec §4.4 "Events"). All methods default to
/// no-ops so an implementer only overrides what it cares about.
/// Deliberately synchronous: the spec requires subscriber failures never
/// affect execution, which a panic-catching boundary can only guarantee
/// for plain function calls, not arbitrary awaited futures.
pub trait RoutingSlipSubscriber: Send + Sync {
    fn on_completed(&self, _slip: &RoutingSlip) {}
    fn on_faulted(&self, _slip: &RoutingSlip) {}
    fn on_compensation_failed(&self, _slip: &RoutingSlip, _failures: usize) {}
    fn on_activity_completed(&self, _slip: &RoutingSlip, _activity: &str) {}
    fn on_activity_faulted(&self, _slip: &RoutingSlip, _activity: &str, _error: &str) {}
    fn on_activity_compensated(&self, _slip: &RoutingSlip, _activity: &str, _success: bool) {}
    fn on_terminated(&self, _slip: &RoutingSlip) {}
}

/// Runs routing slips forward through their itinerary, compensating in
/// reverse on fault (spec §4.4).
#[derive(Default)]
pub struct RoutingSlipExecutor {
    factory: ActivityFactory,
    subscribers: Vec<Arc<dyn RoutingSlipSubscriber>>,
}

impl RoutingSlipExecutor {
    pub fn new(factory: ActivityFactory) -> Self {
        Self {
            factory,
            subscribers: Vec::new(),
        }
    }

    pub fn subscribe(&mut self, subscriber: Arc<dyn RoutingSlipSubscriber>) -> &mut Self {
        self.subscribers.push(subscriber);
        self
    }

    fn notify(&self, f: impl Fn(&dyn RoutingSlipSubscriber)) {
        for subscriber in &self.subscribers {
            if std::panic::catch_unwind(AssertUnwindSafe(|| f(subscriber.as_ref()))).is_err() {
                error!("routing slip subscriber panicked, continuing");
            }
        }
    }

    /// Run `slip` forward to completion, fault, or termination.
    pub async fn execute(&self, mut slip: RoutingSlip) -> (RoutingSlip, SlipOutcome) {
        let mut i = 0usize;
        loop {
            if i >= slip.itinerary.len() {
                info!(tracking_number = %slip.tracking_number, "routing slip completed");
                self.notify(|s| s.on_completed(&slip));
                return (slip, SlipOutcome::Completed);
            }

            let step = slip.itinerary[i].clone();
            let Some(activity) = self.factory.resolve(&step.name) else {
                let error = format!("no activity registered for {}", step.name);
                warn!(tracking_number = %slip.tracking_number, activity = %step.name, "unknown activity, faulting");
                slip.activity_exceptions.push(ActivityException {
                    name: step.name.clone(),
                    timestamp: Utc::now(),
                    error: error.clone(),
                });
                self.notify(|s| s.on_activity_faulted(&slip, &step.name, &error));
                self.run_compensation(&mut slip).await;
                self.notify(|s| s.on_faulted(&slip));
                return (slip, SlipOutcome::Faulted);
            };

            let ctx = ExecuteContext {
                tracking_number: slip.tracking_number.clone(),
                args: step.args.clone(),
                variables: slip.variables.clone(),
            };

            let start = Instant::now();
            let outcome = AssertUnwindSafe(activity.execute(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| ActivityOutcome::Fault(format!("activity {} panicked", step.name)));

            match outcome {
                ActivityOutcome::Complete { variables, log } => {
                    slip.activity_logs.push(ActivityLog {
                        name: step.name.clone(),
                        timestamp: Utc::now(),
                        duration: start.elapsed(),
                        compensation_log: log,
                    });
                    if let Some(vars) = variables {
                        merge_variables(&mut slip.variables, vars);
                    }
                    self.notify(|s| s.on_activity_completed(&slip, &step.name));
                    i += 1;
                }
                ActivityOutcome::ReviseItinerary(revision) => {
                    slip.activity_logs.push(ActivityLog {
                        name: step.name.clone(),
                        timestamp: Utc::now(),
                        duration: start.elapsed(),
                        compensation_log: None,
                    });
                    self.notify(|s| s.on_activity_completed(&slip, &step.name));
                    let insert_at = i + 1;
                    for (offset, revised_step) in revision.insert_next.into_iter().enumerate() {
                        slip.itinerary.insert(insert_at + offset, revised_step);
                    }
                    i += 1;
                }
                ActivityOutcome::Fault(error) => {
                    warn!(tracking_number = %slip.tracking_number, activity = %step.name, %error, "activity faulted");
                    slip.activity_exceptions.push(ActivityException {
                        name: step.name.clone(),
                        timestamp: Utc::now(),
                        error: error.clone(),
                    });
                    self.notify(|s| s.on_activity_faulted(&slip, &step.name, &error));
                    self.run_compensation(&mut slip).await;
                    self.notify(|s| s.on_faulted(&slip));
                    return (slip, SlipOutcome::Faulted);
                }
                ActivityOutcome::Terminate => {
                    info!(tracking_number = %slip.tracking_number, activity = %step.name, "activity terminated the slip");
                    self.notify(|s| s.on_terminated(&slip));
                    return (slip, SlipOutcome::Terminated);
                }
            }
        }
    }

    /// Iterate `activityLogs` in reverse, compensating each completed
    /// activity that implements compensation (spec §4.4 "Compensation").
    async fn run_compensation(&self, slip: &mut RoutingSlip) {
        let logs = slip.activity_logs.clone();
        let mut failures = 0usize;

        for log in logs.into_iter().rev() {
            let Some(activity) = self.factory.resolve(&log.name) else {
                continue;
            };
            if !activity.has_compensation() {
                continue;
            }

            let ctx = CompensateContext {
                tracking_number: slip.tracking_number.clone(),
                compensation_log: log.compensation_log.clone(),
                variables: slip.variables.clone(),
            };
            let result = AssertUnwindSafe(activity.compensate(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(format!("compensate for {} panicked", log.name)));

            let success = result.is_ok();
            if let Err(error) = &result {
                failures += 1;
                error!(tracking_number = %slip.tracking_number, activity = %log.name, %error, "compensation failed");
            }
            slip.compensate_logs.push(CompensateLog {
                name: log.name.clone(),
                timestamp: Utc::now(),
                success,
                error: result.err(),
            });
            self.notify(|s| s.on_activity_compensated(slip, &log.name, success));
        }

        if failures > 0 {
            self.notify(|s| s.on_compensation_failed(slip, failures));
        }
    }
}

/// Merge `incoming` into `target` object-wise, last writer wins (spec §4.4
/// step 3 "Complete").
fn merge_variables(target: &mut serde_json::Value, incoming: serde_json::Value) {
    match (target, incoming) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(incoming_map)) => {
            for (key, value) in incoming_map {
                target_map.insert(key, value);
            }
        }
        (target_slot, incoming_value) => {
            *target_slot = incoming_value;
        }
    }
}
