//! The fluent registration/configurator (spec §4.5): records the
//! application's intent — consumers, sagas, receive endpoints — without
//! executing any of it. `BusRegistry::build_bindings` is the only place
//! the recorded maps are read, once the transport has connected and its
//! delayed-plugin probe result is known.
//!
//! Grounded in `angzarr::facade::EventedBuilder`'s shape: a plain builder
//! that accumulates handlers via `with_*`/fluent methods and hands back a
//! runnable thing, rather than the source's DI-container-driven
//! registration (out of scope per spec §1, see spec §9 "Decorators ->
//! static registration" for the same replacement pattern applied to
//! activities).

use crate::consumer::{ConsumerPipeline, MessageHandler, PipelineQueueHandler, Validator};
use crate::retry::RetryStrategy;
use crate::saga::{SagaHandler, SagaRepository, StateMachineDefinition};
use crate::transport::{EndpointBinding, Transport};
use std::collections::HashMap;
use std::sync::Arc;

/// Errors raised compiling a [`BusRegistry`] into runnable bindings.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("endpoint {0} has no handler registered")]
    MissingHandler(String),
}

/// One `ReceiveEndpoint(queue, e => ...)` registration (spec §4.5, §6
/// "Configuration surface"). Built fluently, then folded into an
/// [`EndpointBinding`] by [`BusRegistry::build_bindings`].
pub struct EndpointConfig {
    queue: String,
    bound_types: Vec<String>,
    handler: Option<Arc<dyn MessageHandler>>,
    validator: Option<Arc<dyn Validator>>,
    retry: Option<RetryStrategy>,
    redelivery: Option<RetryStrategy>,
    prefetch: u16,
    purge_on_startup: bool,
}

impl EndpointConfig {
    fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            bound_types: Vec::new(),
            handler: None,
            validator: None,
            retry: None,
            redelivery: None,
            prefetch: 16,
            purge_on_startup: false,
        }
    }

    /// Bind one more logical message type's exchange to this endpoint's queue.
    pub fn consumes(mut self, message_type: impl Into<String>) -> Self {
        self.bound_types.push(message_type.into());
        self
    }

    pub fn handler(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn Validator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Level-1 in-memory retry (spec §4.2 step 7).
    pub fn use_message_retry(mut self, strategy: RetryStrategy) -> Self {
        self.retry = Some(strategy);
        self
    }

    /// Level-2 delayed redelivery (spec §4.2 step 8).
    pub fn use_delayed_redelivery(mut self, strategy: RetryStrategy) -> Self {
        self.redelivery = Some(strategy);
        self
    }

    pub fn prefetch_count(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn purge_on_startup(mut self, purge: bool) -> Self {
        self.purge_on_startup = purge;
        self
    }
}

/// Records `AddConsumer`, `AddSagaStateMachine`, and `UsingBroker`
/// registrations (spec §4.5) into three in-memory maps: `consumers`,
/// `messagesToEndpoint`, and `endpoints` — read exactly once, by
/// [`BusRegistry::build_bindings`], when the transport starts.
#[derive(Default)]
pub struct BusRegistry {
    cluster: String,
    host: String,
    endpoints: HashMap<String, EndpointConfig>,
    messages_to_endpoint: HashMap<String, String>,
}

impl BusRegistry {
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            host: String::new(),
            endpoints: HashMap::new(),
            messages_to_endpoint: HashMap::new(),
        }
    }

    /// `UsingBroker(clusterName, cfg => cfg.Host(...).ReceiveEndpoint(...))`.
    /// `configure` runs against `&mut self` so endpoints registered inside it
    /// land in the same maps as top-level `receive_endpoint` calls.
    pub fn using_broker(mut self, host: impl Into<String>, configure: impl FnOnce(&mut Self)) -> Self {
        self.host = host.into();
        configure(&mut self);
        self
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `AddConsumer<T>()` plus its `ReceiveEndpoint` wiring collapsed into
    /// one call: register a plain consumer bound to one or more message
    /// types on its own queue.
    pub fn add_consumer(
        &mut self,
        queue: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        configure: impl FnOnce(EndpointConfig) -> EndpointConfig,
    ) -> &mut Self {
        self.receive_endpoint(queue, move |e| configure(e).handler(handler))
    }

    /// `AddSagaStateMachine<M, S>()`: wire a saga definition to a
    /// repository and the transport it publishes follow-up messages
    /// through, and bind it to the queue that receives every event it
    /// declares a binder for.
    pub fn add_saga_state_machine(
        &mut self,
        queue: impl Into<String>,
        definition: Arc<dyn StateMachineDefinition>,
        repository: Arc<dyn SagaRepository>,
        publish_transport: Arc<dyn Transport>,
        event_names: &[&str],
        configure: impl FnOnce(EndpointConfig) -> EndpointConfig,
    ) -> &mut Self {
        let handler = Arc::new(SagaHandler::new(definition, repository, publish_transport));
        self.receive_endpoint(queue, move |e| {
            let mut e = configure(e).handler(handler);
            for name in event_names {
                e = e.consumes(*name);
            }
            e
        })
    }

    /// `ReceiveEndpoint(queue, e => ...)`: the lowest-level registration
    /// primitive; `add_consumer`/`add_saga_state_machine` are sugar over it.
    pub fn receive_endpoint(
        &mut self,
        queue: impl Into<String>,
        configure: impl FnOnce(EndpointConfig) -> EndpointConfig,
    ) -> &mut Self {
        let queue = queue.into();
        let endpoint = configure(EndpointConfig::new(queue.clone()));
        for t in &endpoint.bound_types {
            self.messages_to_endpoint.insert(t.clone(), queue.clone());
        }
        self.endpoints.insert(queue, endpoint);
        self
    }

    /// The endpoint a given logical message type currently routes to, if any.
    pub fn endpoint_for_message(&self, message_type: &str) -> Option<&str> {
        self.messages_to_endpoint.get(message_type).map(String::as_str)
    }

    /// Compile every recorded registration into [`EndpointBinding`]s ready
    /// for `Transport::start` (spec §4.1 steps 4-5, §4.5 "consumed by the
    /// transport at startup"). Takes the already-connected transport so the
    /// delayed-plugin probe result (spec §4.1 step 3) is baked into every
    /// endpoint's pipeline before it ever sees a delivery.
    pub fn build_bindings(self, transport: &dyn Transport) -> Result<Vec<EndpointBinding>, RegistrationError> {
        let supports_delayed = transport.supports_delayed_redelivery();
        let mut bindings = Vec::with_capacity(self.endpoints.len());

        for (queue, endpoint) in self.endpoints {
            let handler = endpoint
                .handler
                .ok_or_else(|| RegistrationError::MissingHandler(queue.clone()))?;
            let mut pipeline = ConsumerPipeline::new(queue.clone(), handler);
            if let Some(validator) = endpoint.validator {
                pipeline = pipeline.with_validator(validator);
            }
            if let Some(retry) = endpoint.retry {
                pipeline = pipeline.with_retry(retry);
            }
            if let Some(redelivery) = endpoint.redelivery {
                pipeline = pipeline.with_redelivery(redelivery);
            }

            bindings.push(EndpointBinding {
                queue,
                bound_types: endpoint.bound_types,
                prefetch: endpoint.prefetch,
                purge_on_startup: endpoint.purge_on_startup,
                handler: Arc::new(PipelineQueueHandler::new(pipeline, supports_delayed)),
            });
        }

        Ok(bindings)
    }
}
