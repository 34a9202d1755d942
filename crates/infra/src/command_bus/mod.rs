//! Infrastructure broker implementations.
//!
//! The broker abstraction lives in `contacts-events` as pure mechanics (with
//! an in-memory implementation). This module provides the AMQP-backed one.

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

#[cfg(feature = "rabbitmq")]
pub use rabbitmq::RabbitMqBroker;
