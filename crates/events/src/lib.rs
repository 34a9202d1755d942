//! Contact command messaging mechanics.
//!
//! - `command`: command kinds, their fixed routing keys and queue names
//! - `envelope`: the wire envelope carried by the broker
//! - `topology`: exchange/queue/binding declarations
//! - `dead_letter`: failure-sink records
//! - `bus`: the broker abstraction (publish, subscribe, ack/nack)
//! - `in_memory_bus`: a direct-exchange broker for tests/dev

pub mod bus;
pub mod command;
pub mod dead_letter;
pub mod envelope;
pub mod in_memory_bus;
pub mod topology;

pub use bus::{Acknowledger, Broker, BrokerError, Delivery, Subscription};
pub use command::{CommandKind, ContactCommand, DeleteContact, EXCHANGE};
pub use dead_letter::{BodyEncoding, FailedCommand, FailureKind};
pub use envelope::{CommandEnvelope, EnvelopeError};
pub use in_memory_bus::InMemoryBroker;
pub use topology::{BindingSpec, DeadLetterTarget, ExchangeKind, ExchangeSpec, QueueSpec, Topology};
