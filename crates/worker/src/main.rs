use std::sync::Arc;

use anyhow::Context;

use contacts_infra::command_bus::RabbitMqBroker;
use contacts_infra::{PipelineConfig, PostgresContactStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    contacts_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    let database_url = config.require_database_url()?;

    let store = PostgresContactStore::connect(database_url, config.db_max_connections)
        .await
        .context("failed to connect to Postgres")?;
    let broker = RabbitMqBroker::connect(config.amqp_url.clone())
        .await
        .context("failed to connect to RabbitMQ")?;

    let workers = contacts_worker::start(Arc::new(store), Arc::new(broker), config.prefetch).await?;
    tracing::info!(workers = workers.len(), prefetch = config.prefetch, "contact workers running");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested, draining workers");

    contacts_worker::shutdown(workers, config.shutdown_grace).await;
    Ok(())
}
