//! Routes an inbound event to the saga(s) that declare a binder for it
//! (spec §4.3 step 1: "identify event"), by the event's logical type name.
//!
//! One cluster can host more than one saga type; an event belongs to
//! exactly one saga definition in this implementation (the spec does not
//! describe fan-out of one event across multiple saga types, so a second
//! registration for the same event name replaces the first rather than
//! silently running both).

use super::{SagaHandler, SagaRepository, StateMachineDefinition};
use crate::transport::Transport;
use std::collections::HashMap;
use std::sync::Arc;

/// A compiled collection of saga definitions, each wrapped in a
/// `SagaHandler` ready to be bound to a consumer endpoint.
#[derive(Default)]
pub struct SagaRegistry {
    handlers: HashMap<String, Arc<SagaHandler>>,
}

impl SagaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a saga definition, wiring it to the given repository and
    /// transport, and bind it to every event name it declares a binder for.
    pub fn register(
        &mut self,
        definition: Arc<dyn StateMachineDefinition>,
        repository: Arc<dyn SagaRepository>,
        transport: Arc<dyn Transport>,
        event_names: &[&str],
    ) {
        let handler = Arc::new(SagaHandler::new(definition, repository, transport));
        for event_name in event_names {
            self.handlers.insert(event_name.to_string(), handler.clone());
        }
    }

    pub fn handler_for(&self, event_name: &str) -> Option<Arc<SagaHandler>> {
        self.handlers.get(event_name).cloned()
    }

    pub fn registered_events(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}
