//! txbus - distributed transaction coordination bus.
//!
//! A library embedded in application processes that delivers typed messages
//! over a message broker and orchestrates long-running workflows using two
//! complementary patterns: sagas (correlated state machines driven by
//! events) and routing slips (linear itineraries of compensable activities).
//!
//! The crate is organized leaves-first, the way `angzarr` is:
//! [`envelope`] and [`retry`] have no internal dependencies; [`transport`]
//! depends on them; [`consumer`] depends on `transport`'s wire types;
//! [`saga`] and [`routing_slip`] depend on `consumer` and `transport`;
//! [`registration`] and [`config`] sit on top, wiring the rest together at
//! startup.

pub mod config;
pub mod consumer;
pub mod dlq;
pub mod envelope;
pub mod registration;
pub mod retry;
pub mod routing_slip;
pub mod saga;
pub mod transport;

pub use config::{BusConfig, ConfigError};
pub use consumer::{BehaviorContext, ConsumerError, ConsumerPipeline, MessageHandler};
pub use envelope::{Envelope, EnvelopeKind, Headers, MessageType};
pub use registration::{BusRegistry, RegistrationError};
pub use retry::RetryStrategy;
pub use routing_slip::{Activity, RoutingSlip, RoutingSlipExecutor};
pub use saga::{SagaHandler, SagaInstance, StateMachineDefinition};
pub use transport::{Transport, TransportError};
