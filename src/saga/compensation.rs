//! Running a saga instance's compensation log (spec §4.3 "Compensation"):
//! walk `compensation_activities` LIFO, invoking each bound `compensate`
//! closure, logging and continuing past any individual failure rather than
//! aborting the run.
//!
//! Grounded in `utils::saga_compensation::process_revocation_flags`'s
//! "continue processing other flags even if one fails" pattern.

use super::{StateMachineDefinition, SagaInstance};
use tracing::{error, info, warn};

/// Run every registered compensation activity for `instance`, most recent
/// first, marking the instance as compensating for the duration of the run.
pub async fn run(definition: &dyn StateMachineDefinition, instance: &mut SagaInstance) {
    instance.compensating = true;
    let activities = std::mem::take(&mut instance.compensation_activities);
    let mut failures = 0usize;

    for activity in activities.into_iter().rev() {
        let Some(binder) = definition.binder(&activity.event_name) else {
            warn!(
                saga = %definition.name(),
                event = %activity.event_name,
                "no binder found for compensation activity, skipping"
            );
            continue;
        };
        let Some(compensate) = &binder.compensate else {
            continue;
        };

        info!(
            saga = %definition.name(),
            event = %activity.event_name,
            state = %activity.state_name,
            "running compensation activity"
        );
        // Deliberately not re-pushed on success or failure: a compensation
        // activity runs at most once per failure episode.
        if let Err(reason) = compensate(instance, &activity.compensation_data).await {
            error!(
                saga = %definition.name(),
                event = %activity.event_name,
                %reason,
                "compensation activity failed, continuing with the rest of the log"
            );
            failures += 1;
        }
    }

    if failures > 0 {
        error!(saga = %definition.name(), %instance.correlation_id, failures, "some compensation activities failed");
    }
    instance.compensating = false;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saga::{CompensationActivity, EventBinder, SagaInstance};
    use std::collections::HashSet;
    use std::sync::Arc;

    struct FakeDefinition {
        binders: std::collections::HashMap<String, EventBinder>,
    }

    impl StateMachineDefinition for FakeDefinition {
        fn name(&self) -> &str {
            "fake-saga"
        }
        fn cluster(&self) -> &str {
            "test"
        }
        fn correlate(&self, _event_name: &str, _message: &serde_json::Value) -> Option<String> {
            None
        }
        fn binder(&self, event_name: &str) -> Option<&EventBinder> {
            self.binders.get(event_name)
        }
    }

    #[tokio::test]
    async fn compensations_run_in_reverse_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut binders = std::collections::HashMap::new();

        for name in ["First", "Second"] {
            let order = order.clone();
            let name_owned = name.to_string();
            let mut binder = EventBinder::new(name);
            binder.predecessors = HashSet::new();
            binder.compensate = Some(Arc::new(move |_instance, _data| {
                let order = order.clone();
                let name_owned = name_owned.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(name_owned);
                    Ok(())
                })
            }));
            binders.insert(name.to_string(), binder);
        }

        let definition = FakeDefinition { binders };
        let mut instance = SagaInstance::new("order-1");
        instance.compensation_activities = vec![
            CompensationActivity {
                event_name: "First".to_string(),
                state_name: "A".to_string(),
                compensation_data: serde_json::json!({}),
                timestamp: chrono::Utc::now(),
                seq: 0,
            },
            CompensationActivity {
                event_name: "Second".to_string(),
                state_name: "B".to_string(),
                compensation_data: serde_json::json!({}),
                timestamp: chrono::Utc::now(),
                seq: 1,
            },
        ];

        run(&definition, &mut instance).await;

        assert_eq!(*order.lock().unwrap(), vec!["Second", "First"]);
        assert!(instance.compensation_activities.is_empty());
        assert!(!instance.compensating);
    }

    #[tokio::test]
    async fn missing_binder_is_skipped_not_fatal() {
        let definition = FakeDefinition {
            binders: std::collections::HashMap::new(),
        };
        let mut instance = SagaInstance::new("order-1");
        instance.compensation_activities = vec![CompensationActivity {
            event_name: "Vanished".to_string(),
            state_name: "A".to_string(),
            compensation_data: serde_json::json!({}),
            timestamp: chrono::Utc::now(),
            seq: 0,
        }];

        run(&definition, &mut instance).await;
        assert!(!instance.compensating);
    }
}
