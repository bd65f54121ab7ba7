//! End-to-end saga runtime tests driven entirely through the public API:
//! a compiled `StateMachineDefinition`, an `InMemorySagaRepository`, and a
//! `MockTransport`, wired together the way an application would at startup.

use std::collections::HashMap as StdHashMap;
use std::sync::Arc;

use txbus::consumer::MessageHandler;
use txbus::saga::repository::InMemorySagaRepository;
use txbus::saga::{
    CompensationActivity, EventBinder, SagaHandler, SagaRepository, StateMachineBuilder,
    StateMachineDefinition, WhenBuilder,
};
use txbus::transport::mock::MockTransport;
use txbus::BehaviorContext;

type CorrelateFn = Arc<dyn Fn(&serde_json::Value) -> Option<String> + Send + Sync>;

/// A two-step shipment saga: `OrderPlaced` starts it and requests a carrier
/// pickup; `PickupConfirmed` finalizes it; `PickupFailed` drives it into
/// `Failed`, which triggers compensation of the pickup request.
struct ShipmentSaga {
    correlators: StdHashMap<String, CorrelateFn>,
    workflow: StdHashMap<String, EventBinder>,
}

fn correlate_by_order_id(msg: &serde_json::Value) -> Option<String> {
    msg.get("orderId").and_then(|v| v.as_str()).map(str::to_string)
}

impl ShipmentSaga {
    fn new() -> Self {
        let builder = StateMachineBuilder::new()
            .event("OrderPlaced", correlate_by_order_id)
            .event("PickupConfirmed", correlate_by_order_id)
            .event("PickupFailed", correlate_by_order_id)
            .initially(
                "OrderPlaced",
                WhenBuilder::new("OrderPlaced")
                    .then(|instance, msg| {
                        instance.data = msg.clone();
                    })
                    .publish_async("RequestPickup", |instance, _msg| {
                        serde_json::json!({ "orderId": instance.correlation_id })
                    })
                    .compensate(|instance, _data| {
                        let id = instance.correlation_id.clone();
                        async move {
                            tracing::info!(order = %id, "cancelling pickup request");
                            Ok(())
                        }
                    })
                    .transition_to("AwaitingPickup"),
            )
            .during(
                "AwaitingPickup",
                vec![
                    WhenBuilder::new("PickupConfirmed")
                        .transition_to("Delivered")
                        .finalize(),
                    WhenBuilder::new("PickupFailed").transition_to("Failed"),
                ],
            );
        let (correlators, workflow) = builder.build();
        Self { correlators, workflow }
    }
}

impl StateMachineDefinition for ShipmentSaga {
    fn name(&self) -> &str {
        "shipment-saga"
    }

    fn cluster(&self) -> &str {
        "test"
    }

    fn correlate(&self, event_name: &str, message: &serde_json::Value) -> Option<String> {
        self.correlators.get(event_name).and_then(|f| f(message))
    }

    fn binder(&self, event_name: &str) -> Option<&EventBinder> {
        self.workflow.get(event_name)
    }
}

fn ctx_for(event_name: &str, message: serde_json::Value) -> BehaviorContext {
    BehaviorContext {
        saga: None,
        message,
        message_type: event_name.to_string(),
        source_address: "test://source".to_string(),
        destination_address: "test://dest".to_string(),
    }
}

fn handler() -> (SagaHandler, Arc<InMemorySagaRepository>, Arc<MockTransport>) {
    let repo = Arc::new(InMemorySagaRepository::new());
    let transport = Arc::new(MockTransport::new());
    let definition: Arc<dyn StateMachineDefinition> = Arc::new(ShipmentSaga::new());
    let handler = SagaHandler::new(definition, repo.clone(), transport.clone());
    (handler, repo, transport)
}

#[tokio::test]
async fn full_happy_path_creates_publishes_and_finalizes() {
    let (handler, repo, transport) = handler();

    let mut placed = ctx_for("OrderPlaced", serde_json::json!({"orderId": "SHIP-1"}));
    handler.consume(&mut placed).await.unwrap();

    let stored = repo.find_by_correlation_id("SHIP-1").await.unwrap().unwrap();
    assert_eq!(stored.current_state, "AwaitingPickup");
    assert_eq!(stored.version, 1);

    let published = transport.published_envelopes().await;
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].message_type.logical_name(), "RequestPickup");

    let mut confirmed = ctx_for("PickupConfirmed", serde_json::json!({"orderId": "SHIP-1"}));
    handler.consume(&mut confirmed).await.unwrap();

    assert!(
        repo.find_by_correlation_id("SHIP-1").await.unwrap().is_none(),
        "finalized, non-archiving sagas are deleted"
    );
}

#[tokio::test]
async fn failure_path_triggers_compensation_and_clears_log() {
    let (handler, repo, _transport) = handler();

    let mut placed = ctx_for("OrderPlaced", serde_json::json!({"orderId": "SHIP-2"}));
    handler.consume(&mut placed).await.unwrap();

    let mut failed = ctx_for("PickupFailed", serde_json::json!({"orderId": "SHIP-2"}));
    handler.consume(&mut failed).await.unwrap();

    let stored = repo.find_by_correlation_id("SHIP-2").await.unwrap().unwrap();
    assert_eq!(stored.current_state, "Failed");
    assert!(
        stored.compensation_activities.is_empty(),
        "compensation runs and clears the activity log once executed"
    );
    assert!(!stored.compensating);
}

#[tokio::test]
async fn uncorrelated_event_is_rejected() {
    let (handler, _repo, _transport) = handler();

    let mut ctx = ctx_for("OrderPlaced", serde_json::json!({"total": 500}));
    let result = handler.consume(&mut ctx).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn optimistic_concurrency_rejects_stale_version() {
    let repo = Arc::new(InMemorySagaRepository::new());

    let mut instance = txbus::SagaInstance::new("SHIP-3");
    instance.compensation_activities.push(CompensationActivity {
        event_name: "OrderPlaced".to_string(),
        state_name: "AwaitingPickup".to_string(),
        compensation_data: serde_json::json!({}),
        timestamp: chrono::Utc::now(),
        seq: 0,
    });
    repo.save(&instance).await.unwrap();

    // Simulate a concurrent writer: save the same pre-bump instance twice.
    let err = repo.save(&instance).await.unwrap_err();
    assert!(matches!(err, txbus::saga::RepositoryError::VersionConflict { .. }));
}
