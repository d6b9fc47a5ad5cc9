mod amqp;
mod config;
mod error;
mod kafka;
mod message;
mod pipes;
mod storage;
mod worker;

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use crate::amqp::AmqpConnector;
use crate::config::{Args, Config};
use crate::kafka::RdKafkaPublisher;
use crate::pipes::PipeTable;
use crate::storage::RedisSpillStore;
use crate::worker::BridgeWorker;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("fatal error: {:#}", err);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "rmq_kafka_bridge=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = Config::load(&args)?;
    let pipes: Arc<[pipes::Pipe]> =
        PipeTable::load(std::path::Path::new(&cfg.kafka.pipes_config))?
            .pipes()
            .to_vec()
            .into();

    let storage = Arc::new(RedisSpillStore::connect(&cfg.storage_dsn).await?);
    let kafka = Arc::new(RdKafkaPublisher::new(&cfg.kafka.brokers, cfg.kafka.max_retry)?);

    let worker = Arc::new(BridgeWorker::new(
        kafka.clone(),
        storage.clone(),
        cfg.worker.cache_size,
        cfg.worker.cache_flush_timeout,
        cfg.worker.storage_max_errors,
    ));

    let delivery_worker = worker.clone();
    let handler: amqp::DeliveryHandler = Arc::new(move |body, pipe| {
        let worker = delivery_worker.clone();
        Box::pin(async move { worker.on_delivery(body, pipe.kafka_topic).await })
    });

    let connector = Arc::new(AmqpConnector::new(cfg.rabbit_dsn.clone(), pipes, handler));
    connector.connect().await?;

    let tick_worker = worker.clone();
    let cycle_timeout = cfg.worker.cycle_timeout;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cycle_timeout);
        loop {
            interval.tick().await;
            tick_worker.tick().await;
        }
    });

    let drain_worker = worker.clone();
    let storage_read_timeout = cfg.worker.storage_read_timeout;
    let drain_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(storage_read_timeout);
        loop {
            interval.tick().await;
            drain_worker.drain_spill().await;
        }
    });
    worker.set_drain_ticker(drain_handle).await;

    tracing::info!("bridge running, awaiting shutdown signal");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, draining");

    worker.close().await?;
    connector.close().await?;

    tracing::info!("bridge shut down cleanly");
    Ok(())
}
