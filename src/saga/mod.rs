//! The saga state machine runtime (spec §4.3): event correlation, state
//! transitions, persistence with optimistic concurrency, and transactional
//! dispatch of follow-up messages.
//!
//! Grounded in `angzarr::orchestration::saga`'s shape (a context type, a
//! retry-aware execution function, a registry consulted by the transport)
//! but replacing its two-phase gRPC/local saga dispatch with the spec's
//! single-event state-machine execution (11 steps, see `SagaHandler::handle_event`).

pub mod compensation;
pub mod registry;
pub mod repository;

pub use registry::SagaRegistry;
pub use repository::{RepositoryError, SagaQuery, SagaRepository};

use crate::consumer::{BehaviorContext, ConsumerError, MessageHandler};
use crate::envelope::Envelope;
use crate::transport::Transport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// The state every saga instance starts in before its first transition.
pub const INITIALLY: &str = "Initially";
/// The state a saga instance is moved to once `Finalize()` has run.
pub const FINALIZE: &str = "Finalize";

/// One entry in a saga's compensation log (spec §3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationActivity {
    pub event_name: String,
    pub state_name: String,
    pub compensation_data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Monotonic ordering key, supplementing the spec's timestamp-only
    /// ordering so replays can assert order without relying on clock
    /// resolution (grounded in `angzarr`'s habit of stamping sequence
    /// numbers on everything ordered, e.g. `EventPage.sequence`).
    pub seq: u64,
}

/// A saga instance (spec §3.2). `data` is the bag of arbitrary user-defined
/// fields: event binders read/write overlapping keys dynamically and the
/// wire transport round-trips through `Value` regardless, so a typed
/// generic parameter would buy nothing here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SagaInstance {
    pub correlation_id: String,
    pub current_state: String,
    pub version: i64,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub compensation_activities: Vec<CompensationActivity>,
    /// Whether a compensation run is currently in flight for this instance
    /// (spec §4.3: "if the binder has a registered compensation and the
    /// instance is not already compensating").
    #[serde(default)]
    pub compensating: bool,
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl SagaInstance {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            current_state: INITIALLY.to_string(),
            version: 0,
            data: serde_json::Value::Object(Default::default()),
            compensation_activities: Vec::new(),
            compensating: false,
            archived_at: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.current_state == FINALIZE
    }
}

/// Errors the saga runtime can raise, surfaced to the consumer pipeline
/// through `ConsumerError` (spec §7 kinds 2, 3, 4).
#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("no event binder registered for {0}")]
    UnknownEvent(String),
    #[error("event {event} not accepted in state {state}")]
    Cancelled { event: String, state: String },
    #[error("could not correlate event {0} to a saga instance")]
    Uncorrelated(String),
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("transport error: {0}")]
    Transport(String),
}

type ThenFn = Arc<dyn Fn(&mut SagaInstance, &serde_json::Value) + Send + Sync>;
type PublishBuilderFn = Arc<dyn Fn(&SagaInstance, &serde_json::Value) -> serde_json::Value + Send + Sync>;
type CompensateFn = Arc<
    dyn Fn(&mut SagaInstance, &serde_json::Value) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send>>
        + Send
        + Sync,
>;
type CorrelateFn = Arc<dyn Fn(&serde_json::Value) -> Option<String> + Send + Sync>;

/// What to publish when a `when` chain's `PublishAsync` step runs.
#[derive(Clone)]
pub struct PublishSpec {
    pub message_type: String,
    pub builder: PublishBuilderFn,
}

/// The compiled behavior for one event in one (or more) states: the
/// `Then`/`PublishAsync`/`Compensate`/`TransitionTo`/`Finalize` chain from
/// spec §4.3, plus the set of predecessor states it is valid from.
#[derive(Clone)]
pub struct EventBinder {
    pub event_name: String,
    /// Whether this binder is reachable from `INITIALLY` (registered via
    /// `StateMachineBuilder::initially`).
    pub initial: bool,
    /// States (other than `INITIALLY`) this event is accepted in.
    pub predecessors: HashSet<String>,
    pub then: Option<ThenFn>,
    pub publish: Option<PublishSpec>,
    pub compensate: Option<CompensateFn>,
    pub transition_to: Option<String>,
    pub finalize: bool,
}

impl EventBinder {
    pub(crate) fn new(event_name: impl Into<String>) -> Self {
        Self {
            event_name: event_name.into(),
            initial: false,
            predecessors: HashSet::new(),
            then: None,
            publish: None,
            compensate: None,
            transition_to: None,
            finalize: false,
        }
    }
}

/// Fluent builder for one `when` chain, handed back by
/// `StateMachineBuilder::initially`/`during`.
pub struct WhenBuilder {
    binder: EventBinder,
}

impl WhenBuilder {
    pub fn new(event_name: impl Into<String>) -> Self {
        Self {
            binder: EventBinder::new(event_name),
        }
    }

    pub fn then(mut self, f: impl Fn(&mut SagaInstance, &serde_json::Value) + Send + Sync + 'static) -> Self {
        self.binder.then = Some(Arc::new(f));
        self
    }

    pub fn publish_async(
        mut self,
        message_type: impl Into<String>,
        builder: impl Fn(&SagaInstance, &serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        self.binder.publish = Some(PublishSpec {
            message_type: message_type.into(),
            builder: Arc::new(builder),
        });
        self
    }

    pub fn compensate<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(&mut SagaInstance, &serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.binder.compensate = Some(Arc::new(move |instance, data| Box::pin(f(instance, data))));
        self
    }

    pub fn transition_to(mut self, state: impl Into<String>) -> Self {
        self.binder.transition_to = Some(state.into());
        self
    }

    pub fn finalize(mut self) -> Self {
        self.binder.finalize = true;
        self
    }
}

/// Builds the two compiled maps a `StateMachineDefinition` exposes:
/// `events[name] -> correlation selector` and `workflow[name] -> binder`
/// (spec §4.3 "Definition surface").
#[derive(Default)]
pub struct StateMachineBuilder {
    correlators: std::collections::HashMap<String, CorrelateFn>,
    workflow: std::collections::HashMap<String, EventBinder>,
}

impl StateMachineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event's correlation selector: `(message) -> CorrelationId`.
    pub fn event(
        mut self,
        name: impl Into<String>,
        selector: impl Fn(&serde_json::Value) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.correlators.insert(name.into(), Arc::new(selector));
        self
    }

    /// Register the `when` chain run when this event starts a new instance.
    pub fn initially(mut self, event_name: impl Into<String>, when: WhenBuilder) -> Self {
        let mut binder = when.binder;
        binder.event_name = event_name.into();
        binder.initial = true;
        self.workflow.insert(binder.event_name.clone(), binder);
        self
    }

    /// Register the `when` chains accepted while in `state`.
    pub fn during(mut self, state: impl Into<String>, whens: Vec<WhenBuilder>) -> Self {
        let state = state.into();
        for when in whens {
            let event_name = when.binder.event_name.clone();
            self.workflow
                .entry(event_name)
                .and_modify(|existing| {
                    existing.predecessors.insert(state.clone());
                })
                .or_insert_with(|| {
                    let mut binder = when.binder.clone_shell();
                    binder.predecessors.insert(state.clone());
                    binder
                });
        }
        self
    }

    pub fn build(self) -> (
        std::collections::HashMap<String, CorrelateFn>,
        std::collections::HashMap<String, EventBinder>,
    ) {
        (self.correlators, self.workflow)
    }
}

impl EventBinder {
    /// Clone everything but reuse the same closures (used when the same
    /// event is registered `during` more than one state).
    fn clone_shell(&self) -> Self {
        self.clone()
    }
}

/// A compiled saga definition: states, correlators, and the workflow map
/// (spec §4.3 "Definition surface"). Object-safe so the registry can hold
/// heterogeneous saga types behind `Arc<dyn StateMachineDefinition>`.
pub trait StateMachineDefinition: Send + Sync {
    /// Saga type name, used for routing and diagnostics.
    fn name(&self) -> &str;
    /// Broker cluster namespace this saga's messages belong to.
    fn cluster(&self) -> &str;
    /// Resolve the correlation id for an event, or `None` if uncorrelatable.
    fn correlate(&self, event_name: &str, message: &serde_json::Value) -> Option<String>;
    /// The compiled binder for an event, or `None` if this saga doesn't
    /// declare it.
    fn binder(&self, event_name: &str) -> Option<&EventBinder>;
    /// Whether a state counts as a terminal failure path that should trigger
    /// compensation (Open Question resolution, spec §9: "run on transition
    /// into any state named `Failed`", overridable per saga).
    fn is_failure_state(&self, state: &str) -> bool {
        state == "Failed"
    }
    /// Called once a saga instance reaches `FINALIZE`, before archive/delete.
    fn on_finalized(&self, _instance: &SagaInstance) {}
    /// Whether a finalized instance is archived (soft-deleted) rather than
    /// hard-deleted (spec §4.3 step 11, §6 "autoArchive").
    fn auto_archive(&self) -> bool {
        false
    }
}

static COMPENSATION_SEQ: AtomicU64 = AtomicU64::new(0);

/// Wires one `StateMachineDefinition` to a repository and transport and
/// implements the `MessageHandler` port so the consumer pipeline can invoke
/// it like any other endpoint handler.
pub struct SagaHandler {
    definition: Arc<dyn StateMachineDefinition>,
    repository: Arc<dyn SagaRepository>,
    transport: Arc<dyn Transport>,
}

impl SagaHandler {
    pub fn new(
        definition: Arc<dyn StateMachineDefinition>,
        repository: Arc<dyn SagaRepository>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            definition,
            repository,
            transport,
        }
    }

    /// Execute the 11-step single-event flow from spec §4.3.
    async fn handle_event(
        &self,
        ctx: &mut BehaviorContext,
    ) -> Result<Option<serde_json::Value>, SagaError> {
        let event_name = ctx.message_type.clone();

        // Step 2: resolve binder.
        let binder = self
            .definition
            .binder(&event_name)
            .cloned()
            .ok_or_else(|| SagaError::UnknownEvent(event_name.clone()))?;

        // Step 3: resolve the instance: header seed, repository load, or fresh.
        let correlation_id = self
            .definition
            .correlate(&event_name, &ctx.message)
            .or_else(|| {
                ctx.saga
                    .as_ref()
                    .and_then(|v| v.get("correlationId").and_then(|c| c.as_str()))
                    .map(|s| s.to_string())
            })
            .ok_or_else(|| SagaError::Uncorrelated(event_name.clone()))?;

        let stored = self.repository.find_by_correlation_id(&correlation_id).await?;
        let header: Option<SagaInstance> = ctx
            .saga
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        // Open Question resolution (spec §9): repository is authoritative
        // whenever it has a row; the header only seeds a brand-new instance.
        let mut instance = match (stored, header) {
            (Some(s), _) => s,
            (None, Some(h)) => h,
            (None, None) if binder.initial => SagaInstance::new(correlation_id.clone()),
            (None, None) => {
                return Err(SagaError::Cancelled {
                    event: event_name,
                    state: INITIALLY.to_string(),
                })
            }
        };

        // Step 5: transition guard.
        if instance.current_state == INITIALLY {
            if !binder.initial {
                return Err(SagaError::Cancelled {
                    event: event_name,
                    state: instance.current_state,
                });
            }
        } else if !binder.predecessors.contains(&instance.current_state) {
            return Err(SagaError::Cancelled {
                event: event_name,
                state: instance.current_state,
            });
        }

        // Step 6: Then.
        if let Some(then) = &binder.then {
            then(&mut instance, &ctx.message);
        }

        // Step 7: TransitionTo.
        if let Some(state) = &binder.transition_to {
            instance.current_state = state.clone();
        }

        // Step 8: persist before publishing.
        let new_version = self.repository.save(&instance).await?;
        instance.version = new_version;
        debug!(saga = %self.definition.name(), %correlation_id, version = new_version, state = %instance.current_state, "saga instance persisted");

        // Step 9: PublishAsync, carrying post-save state in headers.
        if let Some(publish) = &binder.publish {
            let payload = (publish.builder)(&instance, &ctx.message);
            let saga_header = serde_json::to_value(&instance)
                .map_err(|e| SagaError::Transport(format!("encode saga header: {e}")))?;
            let envelope = Envelope::new_publish(
                self.definition.cluster(),
                &publish.message_type,
                format!("saga://{}", self.definition.name()),
                ctx.destination_address.clone(),
                payload,
            )
            .with_saga_header(&saga_header);

            self.transport
                .publish(envelope)
                .await
                .map_err(|e| SagaError::Transport(e.to_string()))?;
        }

        // Step 10: register compensation.
        if binder.compensate.is_some() && !instance.compensating {
            instance.compensation_activities.push(CompensationActivity {
                event_name: event_name.clone(),
                state_name: instance.current_state.clone(),
                compensation_data: ctx.message.clone(),
                timestamp: Utc::now(),
                seq: COMPENSATION_SEQ.fetch_add(1, Ordering::Relaxed),
            });
        }

        // Trigger compensation on transition into a failure state.
        if self.definition.is_failure_state(&instance.current_state)
            && !instance.compensating
            && !instance.compensation_activities.is_empty()
        {
            warn!(saga = %self.definition.name(), %correlation_id, state = %instance.current_state, "entering failure state, running compensation");
            compensation::run(self.definition.as_ref(), &mut instance).await;
            let new_version = self.repository.save(&instance).await?;
            instance.version = new_version;
        }

        // Step 11: finalize.
        if binder.finalize {
            instance.current_state = FINALIZE.to_string();
            self.definition.on_finalized(&instance);
            // Persist the FINALIZE state itself before archiving/deleting, so an
            // archived row reflects CurrentState = FINALIZE (spec §3.2) rather
            // than whatever TransitionTo target step 8 last saved.
            let new_version = self.repository.save(&instance).await?;
            instance.version = new_version;
            if self.definition.auto_archive() {
                self.repository.archive(&correlation_id).await?;
            } else {
                self.repository.delete(&correlation_id).await?;
            }
            info!(saga = %self.definition.name(), %correlation_id, "saga finalized");
        }

        Ok(None)
    }
}

#[async_trait]
impl MessageHandler for SagaHandler {
    async fn consume(
        &self,
        ctx: &mut BehaviorContext,
    ) -> Result<Option<serde_json::Value>, ConsumerError> {
        self.handle_event(ctx).await.map_err(|e| match e {
            SagaError::UnknownEvent(_) | SagaError::Cancelled { .. } | SagaError::Uncorrelated(_) => {
                error!(error = %e, "saga cancelled");
                ConsumerError::SagaCancelled(e.to_string())
            }
            SagaError::Repository(RepositoryError::VersionConflict { .. }) => {
                ConsumerError::Handler(e.to_string())
            }
            other => ConsumerError::Handler(other.to_string()),
        })
    }
}
