//! Infrastructure layer: store adapters, broker, consumer tier, config.

pub mod command_bus;
pub mod config;
pub mod consumer;
pub mod failure_sink;
pub mod producer;
pub mod retry;
pub mod store;
pub mod workers;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, PipelineConfig};
pub use consumer::{CommandConsumer, Outcome};
pub use failure_sink::{replay_failed, ReplayReport};
pub use producer::{CommandPublisher, PublishError, PublishReceipt};
pub use retry::{FailureClass, RetryDecision, RetryPolicy};
pub use store::{ApplyOutcome, ContactStore, InMemoryContactStore, PostgresContactStore, StoreError};
pub use workers::{CommandWorker, WorkerHandle, WorkerStats};
