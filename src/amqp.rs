use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use backoff::future::retry;
use backoff::ExponentialBackoff;
use futures_util::stream::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::AmqpError;
use crate::pipes::Pipe;

/// A delivery handler gets the raw body and the pipe it arrived through, and
/// decides whether the delivery should be acked (`Ok`) or nacked with
/// requeue (`Err`). It never blocks on network I/O — in this system it only
/// enqueues into the Bridge Worker's in-memory buffer.
pub type DeliveryHandler =
    Arc<dyn Fn(Vec<u8>, Pipe) -> Pin<Box<dyn Future<Output = Result<(), ()>> + Send>> + Send + Sync>;

enum State {
    Disconnected,
    Connecting,
    Topology,
    Consuming,
    Closing,
}

/// Owns one logical AMQP connection, declares topology for the whole Pipe
/// Table, runs one consumer task per pipe, and reconnects transparently on
/// peer-initiated close.
pub struct AmqpConnector {
    dsn: String,
    pipes: Arc<[Pipe]>,
    handler: DeliveryHandler,
    connection: Mutex<Option<Connection>>,
    consumer_tasks: Mutex<Vec<JoinHandle<()>>>,
    watcher_task: Mutex<Option<JoinHandle<()>>>,
    closing: Arc<std::sync::atomic::AtomicBool>,
}

impl AmqpConnector {
    pub fn new(dsn: impl Into<String>, pipes: Arc<[Pipe]>, handler: DeliveryHandler) -> Self {
        Self {
            dsn: dsn.into(),
            pipes,
            handler,
            connection: Mutex::new(None),
            consumer_tasks: Mutex::new(Vec::new()),
            watcher_task: Mutex::new(None),
            closing: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    /// Connects, declares topology, and starts consumers for every pipe.
    /// Completes once consumption is underway; a background task then
    /// watches for peer-initiated close and drives reconnection.
    pub async fn connect(self: &Arc<Self>) -> Result<(), AmqpError> {
        self.establish().await?;
        self.spawn_watcher().await;
        Ok(())
    }

    async fn establish(&self) -> Result<(), AmqpError> {
        let mut state = State::Connecting;
        loop {
            state = match state {
                State::Connecting => {
                    let conn = Connection::connect(&self.dsn, ConnectionProperties::default())
                        .await
                        .map_err(AmqpError::Connection)?;
                    *self.connection.lock().await = Some(conn);
                    State::Topology
                }
                State::Topology => {
                    self.declare_and_consume().await?;
                    State::Consuming
                }
                State::Consuming => return Ok(()),
                State::Disconnected | State::Closing => unreachable!(),
            };
        }
    }

    async fn declare_and_consume(&self) -> Result<(), AmqpError> {
        let guard = self.connection.lock().await;
        let conn = guard.as_ref().expect("connection established before topology");

        let mut tasks = Vec::with_capacity(self.pipes.len());
        for pipe in self.pipes.iter() {
            let channel = conn.create_channel().await.map_err(AmqpError::Connection)?;

            channel
                .exchange_declare(
                    &pipe.rabbit_exchange_name,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: !pipe.rabbit_transient_exchange,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|source| AmqpError::Topology {
                    pipe: pipe.rabbit_queue_name.clone(),
                    source,
                })?;

            channel
                .queue_declare(
                    &pipe.rabbit_queue_name,
                    QueueDeclareOptions {
                        durable: pipe.rabbit_durable_queue,
                        auto_delete: pipe.rabbit_auto_delete_queue,
                        exclusive: false,
                        nowait: true,
                        ..QueueDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|source| AmqpError::Topology {
                    pipe: pipe.rabbit_queue_name.clone(),
                    source,
                })?;

            for routing_key in &pipe.rabbit_routing_keys {
                channel
                    .queue_bind(
                        &pipe.rabbit_queue_name,
                        &pipe.rabbit_exchange_name,
                        routing_key,
                        QueueBindOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|source| AmqpError::Topology {
                        pipe: pipe.rabbit_queue_name.clone(),
                        source,
                    })?;
            }

            let consumer_tag = format!("{}_consumer", pipe.rabbit_queue_name);
            let mut consumer = channel
                .basic_consume(
                    &pipe.rabbit_queue_name,
                    &consumer_tag,
                    BasicConsumeOptions {
                        no_ack: false,
                        exclusive: false,
                        ..BasicConsumeOptions::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|source| AmqpError::Topology {
                    pipe: pipe.rabbit_queue_name.clone(),
                    source,
                })?;

            let handler = self.handler.clone();
            let pipe_for_task = pipe.clone();
            info!(queue = %pipe.rabbit_queue_name, "consuming");
            tasks.push(tokio::spawn(async move {
                while let Some(delivery) = consumer.next().await {
                    let delivery = match delivery {
                        Ok(d) => d,
                        Err(err) => {
                            error!(error = %err, "amqp delivery error");
                            continue;
                        }
                    };
                    let outcome = (handler)(delivery.data.clone(), pipe_for_task.clone()).await;
                    let ack_result = match outcome {
                        Ok(()) => delivery.ack(BasicAckOptions { multiple: false }).await,
                        Err(()) => {
                            delivery
                                .nack(BasicNackOptions {
                                    multiple: false,
                                    requeue: true,
                                })
                                .await
                        }
                    };
                    if let Err(err) = ack_result {
                        error!(error = %err, "failed to ack/nack amqp delivery");
                    }
                }
            }));
        }

        *self.consumer_tasks.lock().await = tasks;
        Ok(())
    }

    async fn spawn_watcher(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let status_ok = {
                    let guard = this.connection.lock().await;
                    guard.as_ref().map(|c| c.status().connected()).unwrap_or(false)
                };
                if !status_ok {
                    if this.closing.load(std::sync::atomic::Ordering::SeqCst) {
                        return;
                    }
                    warn!("amqp connection lost, reconnecting");
                    this.reconnect().await;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });
        *self.watcher_task.lock().await = Some(handle);
    }

    async fn reconnect(self: &Arc<Self>) {
        let backoff = ExponentialBackoff {
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        let result = retry(backoff, || async {
            self.establish()
                .await
                .map_err(backoff::Error::transient)
        })
        .await;
        match result {
            Ok(()) => info!("amqp reconnected"),
            Err(err) => error!(error = ?err, "amqp reconnect loop gave up unexpectedly"),
        }
    }

    /// Stops consumers and closes the connection. Idempotent.
    pub async fn close(&self) -> Result<(), AmqpError> {
        self.closing.store(true, std::sync::atomic::Ordering::SeqCst);

        for task in self.consumer_tasks.lock().await.drain(..) {
            task.abort();
        }
        if let Some(task) = self.watcher_task.lock().await.take() {
            task.abort();
        }

        if let Some(conn) = self.connection.lock().await.take() {
            conn.close(0, "shutting down")
                .await
                .map_err(AmqpError::Connection)?;
        }
        Ok(())
    }
}
