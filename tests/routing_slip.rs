//! End-to-end routing slip executor tests: a multi-step itinerary run
//! through `RoutingSlipExecutor` with activities registered the way an
//! application wires them up at startup, exercising the forward loop,
//! itinerary revision, and LIFO compensation on fault.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use txbus::routing_slip::{
    Activity, ActivityFactory, ActivityOutcome, CompensateContext, ExecuteContext, ItineraryStep,
    RoutingSlip, RoutingSlipExecutor, RoutingSlipSubscriber, SlipOutcome,
};

struct ReserveInventory {
    compensated: Arc<AtomicUsize>,
}

#[async_trait]
impl Activity for ReserveInventory {
    fn name(&self) -> &str {
        "ReserveInventory"
    }

    async fn execute(&self, ctx: ExecuteContext) -> ActivityOutcome {
        let sku = ctx.args.get("sku").and_then(|v| v.as_str()).unwrap_or("unknown");
        ctx.completed_with_variables(
            serde_json::json!({ "reservedSku": sku }),
            Some(serde_json::json!({ "sku": sku })),
        )
    }

    fn has_compensation(&self) -> bool {
        true
    }

    async fn compensate(&self, _ctx: CompensateContext) -> Result<(), String> {
        self.compensated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ProcessPayment {
    should_fault: bool,
    compensated: Arc<AtomicUsize>,
}

#[async_trait]
impl Activity for ProcessPayment {
    fn name(&self) -> &str {
        "ProcessPayment"
    }

    async fn execute(&self, ctx: ExecuteContext) -> ActivityOutcome {
        if self.should_fault {
            return ctx.faulted("card declined");
        }
        ctx.completed(None)
    }

    fn has_compensation(&self) -> bool {
        true
    }

    async fn compensate(&self, _ctx: CompensateContext) -> Result<(), String> {
        self.compensated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ShipOrder;

#[async_trait]
impl Activity for ShipOrder {
    fn name(&self) -> &str {
        "ShipOrder"
    }

    async fn execute(&self, ctx: ExecuteContext) -> ActivityOutcome {
        ctx.completed(None)
    }
}

#[derive(Default)]
struct RecordingSubscriber {
    completions: AtomicUsize,
    faults: AtomicUsize,
}

impl RoutingSlipSubscriber for RecordingSubscriber {
    fn on_activity_completed(&self, _slip: &RoutingSlip, _activity: &str) {
        self.completions.fetch_add(1, Ordering::SeqCst);
    }

    fn on_activity_faulted(&self, _slip: &RoutingSlip, _activity: &str, _error: &str) {
        self.faults.fetch_add(1, Ordering::SeqCst);
    }
}

fn order_slip() -> RoutingSlip {
    RoutingSlip::new(
        "TRACK-1",
        vec![
            ItineraryStep::new("ReserveInventory", serde_json::json!({"sku": "WIDGET-1"})),
            ItineraryStep::new("ProcessPayment", serde_json::json!({"amount": 4999})),
            ItineraryStep::new("ShipOrder", serde_json::json!({})),
        ],
    )
}

#[tokio::test]
async fn full_itinerary_completes_and_merges_variables() {
    let compensated = Arc::new(AtomicUsize::new(0));
    let mut factory = ActivityFactory::new();
    factory.register(Arc::new(ReserveInventory {
        compensated: compensated.clone(),
    }));
    factory.register(Arc::new(ProcessPayment {
        should_fault: false,
        compensated: compensated.clone(),
    }));
    factory.register(Arc::new(ShipOrder));

    let mut executor = RoutingSlipExecutor::new(factory);
    let subscriber = Arc::new(RecordingSubscriber::default());
    executor.subscribe(subscriber.clone());

    let (slip, outcome) = executor.execute(order_slip()).await;

    assert_eq!(outcome, SlipOutcome::Completed);
    assert_eq!(slip.activity_logs.len(), 3);
    assert!(slip.compensate_logs.is_empty());
    assert_eq!(
        slip.variables.get("reservedSku").and_then(|v| v.as_str()),
        Some("WIDGET-1")
    );
    assert_eq!(subscriber.completions.load(Ordering::SeqCst), 3);
    assert_eq!(compensated.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn fault_compensates_completed_steps_in_reverse_and_preserves_activity_log() {
    let compensated = Arc::new(AtomicUsize::new(0));
    let mut factory = ActivityFactory::new();
    factory.register(Arc::new(ReserveInventory {
        compensated: compensated.clone(),
    }));
    factory.register(Arc::new(ProcessPayment {
        should_fault: true,
        compensated: compensated.clone(),
    }));
    factory.register(Arc::new(ShipOrder));

    let mut executor = RoutingSlipExecutor::new(factory);
    let subscriber = Arc::new(RecordingSubscriber::default());
    executor.subscribe(subscriber.clone());

    let (slip, outcome) = executor.execute(order_slip()).await;

    assert_eq!(outcome, SlipOutcome::Faulted);
    // The fault happens on step 2 (ProcessPayment); only ReserveInventory
    // completed beforehand, so activityLogs reflects exactly that step and
    // survives the compensation run untouched.
    assert_eq!(slip.activity_logs.len(), 1);
    assert_eq!(slip.activity_logs[0].name, "ReserveInventory");
    assert_eq!(slip.compensate_logs.len(), 1);
    assert_eq!(slip.compensate_logs[0].name, "ReserveInventory");
    assert!(slip.compensate_logs[0].success);
    assert_eq!(slip.activity_exceptions.len(), 1);
    assert_eq!(slip.activity_exceptions[0].name, "ProcessPayment");
    assert_eq!(subscriber.faults.load(Ordering::SeqCst), 1);
    assert_eq!(compensated.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn unknown_activity_faults_immediately_with_no_compensation() {
    let factory = ActivityFactory::new();
    let executor = RoutingSlipExecutor::new(factory);

    let (slip, outcome) = executor
        .execute(RoutingSlip::new(
            "TRACK-2",
            vec![ItineraryStep::new("Nonexistent", serde_json::json!({}))],
        ))
        .await;

    assert_eq!(outcome, SlipOutcome::Faulted);
    assert!(slip.activity_logs.is_empty());
    assert_eq!(slip.activity_exceptions.len(), 1);
    assert!(slip.compensate_logs.is_empty());
}

struct SplitShipment;

#[async_trait]
impl Activity for SplitShipment {
    fn name(&self) -> &str {
        "SplitShipment"
    }

    async fn execute(&self, ctx: ExecuteContext) -> ActivityOutcome {
        ctx.revise_itinerary(txbus::routing_slip::ItineraryRevision {
            insert_next: vec![
                ItineraryStep::new("ShipPartialA", serde_json::json!({})),
                ItineraryStep::new("ShipPartialB", serde_json::json!({})),
            ],
        })
    }
}

struct ShipPartial;

#[async_trait]
impl Activity for ShipPartial {
    fn name(&self) -> &str {
        "ShipPartialA"
    }

    async fn execute(&self, ctx: ExecuteContext) -> ActivityOutcome {
        ctx.completed(None)
    }
}

#[tokio::test]
async fn revise_itinerary_splices_steps_in_immediately_after_the_requesting_activity() {
    let mut factory = ActivityFactory::new();
    factory.register(Arc::new(SplitShipment));
    // Both injected steps resolve to the same stubbed activity so this test
    // only needs one registration; the itinerary still carries two entries.
    factory.register(Arc::new(ShipPartial));

    let executor = RoutingSlipExecutor::new(factory);
    let slip = RoutingSlip::new(
        "TRACK-3",
        vec![ItineraryStep::new("SplitShipment", serde_json::json!({}))],
    );

    let (slip, outcome) = executor.execute(slip).await;

    assert_eq!(outcome, SlipOutcome::Faulted, "ShipPartialB has no registered activity and faults");
    assert_eq!(slip.itinerary.len(), 3);
    assert_eq!(slip.itinerary[1].name, "ShipPartialA");
    assert_eq!(slip.itinerary[2].name, "ShipPartialB");
    // SplitShipment and ShipPartialA both completed before the fault on the
    // unregistered ShipPartialB step.
    assert_eq!(slip.activity_logs.len(), 2);
    assert_eq!(slip.activity_logs[0].name, "SplitShipment");
    assert_eq!(slip.activity_logs[1].name, "ShipPartialA");
    assert_eq!(slip.activity_exceptions[0].name, "ShipPartialB");
}
