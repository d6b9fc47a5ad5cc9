use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{StorageError, StoreError};
use crate::kafka::{KafkaPublisher, PublishOutcome};
use crate::message::BridgeMessage;
use crate::storage::SpillStore;

struct WorkerState {
    buffer: Vec<BridgeMessage>,
    last_flush: Instant,
    closed: bool,
}

/// The heart of the bridge: an in-memory batch buffer, periodic/threshold
/// flush to Kafka, spill fallback on publish failure, and periodic replay
/// from the spill store.
pub struct BridgeWorker {
    state: Mutex<WorkerState>,
    kafka: Arc<dyn KafkaPublisher>,
    storage: Arc<dyn SpillStore>,
    drain_ticker: Mutex<Option<JoinHandle<()>>>,
    cache_size: usize,
    cache_flush_timeout: Duration,
    storage_max_errors: u32,
}

impl BridgeWorker {
    pub fn new(
        kafka: Arc<dyn KafkaPublisher>,
        storage: Arc<dyn SpillStore>,
        cache_size: usize,
        cache_flush_timeout: Duration,
        storage_max_errors: u32,
    ) -> Self {
        Self {
            state: Mutex::new(WorkerState {
                buffer: Vec::new(),
                last_flush: Instant::now(),
                closed: false,
            }),
            kafka,
            storage,
            drain_ticker: Mutex::new(None),
            cache_size,
            cache_flush_timeout,
            storage_max_errors,
        }
    }

    /// Records the handle of the task driving `drain_spill()` so `close()`
    /// can stop it. Owned outside the state lock since it is per-task, not
    /// shared mutable state.
    pub async fn set_drain_ticker(&self, handle: JoinHandle<()>) {
        *self.drain_ticker.lock().await = Some(handle);
    }

    /// The AMQP delivery callback. Never awaits a network call while the
    /// lock is held.
    pub async fn on_delivery(&self, body: Vec<u8>, topic: String) -> Result<(), ()> {
        let msg = BridgeMessage::new(body, topic);
        let mut state = self.state.lock().await;
        debug!(id = %msg.id, topic = %msg.topic, "buffered delivery");
        state.buffer.push(msg);
        Ok(())
    }

    /// Periodic self-driven operation. Flushes the buffer into an
    /// independent publish task when either threshold is crossed.
    pub async fn tick(self: &Arc<Self>) {
        let snapshot = {
            let mut state = self.state.lock().await;
            let should_flush = !state.buffer.is_empty()
                && (state.buffer.len() >= self.cache_size
                    || state.last_flush.elapsed() >= self.cache_flush_timeout);
            if !should_flush {
                return;
            }
            state.last_flush = Instant::now();
            std::mem::take(&mut state.buffer)
        };

        let worker = self.clone();
        tokio::spawn(async move { worker.publish_batch(snapshot).await });
    }

    /// Publishes every message in `snapshot`, in order. Transient Kafka
    /// failures spill; permanent failures and unserializable messages are
    /// dropped; spill-append failures re-enqueue for the next cycle.
    async fn publish_batch(self: Arc<Self>, snapshot: Vec<BridgeMessage>) {
        for msg in snapshot {
            match self.kafka.publish(&msg).await {
                PublishOutcome::Ok => {}
                PublishOutcome::Permanent(err) => {
                    warn!(id = %msg.id, topic = %msg.topic, error = %err, "dropping message after permanent kafka error");
                }
                PublishOutcome::Retriable(_) => match self.store_message(&msg).await {
                    Ok(()) => {}
                    Err(StoreError::Put(err)) => {
                        warn!(id = %msg.id, error = %err, "spill append failed, re-enqueuing");
                        self.re_enqueue(msg).await;
                    }
                    Err(StoreError::Marshal(err)) => {
                        warn!(id = %msg.id, error = %err, "dropping unserializable message");
                    }
                },
            }
        }
    }

    async fn re_enqueue(&self, msg: BridgeMessage) {
        self.state.lock().await.buffer.push(msg);
    }

    /// Serializes `msg` and appends it to the spill store.
    async fn store_message(&self, msg: &BridgeMessage) -> Result<(), StoreError> {
        let record = msg.encode()?;
        self.storage.append(record).await?;
        Ok(())
    }

    /// Invoked on each drain-ticker fire. Pops records from the spill store
    /// and routes recovered messages back into the buffer, bounded by a
    /// consecutive-error budget that resets on any success.
    pub async fn drain_spill(&self) {
        let mut consecutive_errors: u32 = 0;
        loop {
            if consecutive_errors >= self.storage_max_errors {
                warn!(
                    consecutive_errors,
                    "drain cycle aborted, storage_max_errors exceeded"
                );
                return;
            }

            match self.storage.pop().await {
                Ok(None) => return,
                Ok(Some(record)) => match BridgeMessage::decode(&record) {
                    Ok(msg) => {
                        consecutive_errors = 0;
                        debug!(id = %msg.id, topic = %msg.topic, "replayed from spill store");
                        self.state.lock().await.buffer.push(msg);
                    }
                    Err(err) => {
                        consecutive_errors += 1;
                        warn!(error = %err, "dropping undecodable spill record");
                    }
                },
                Err(StorageError::Io(err)) => {
                    consecutive_errors += 1;
                    warn!(error = %err, "spill read error during drain");
                }
                Err(StorageError::Closed) => {
                    warn!("drain attempted after spill store was closed");
                    return;
                }
            }
        }
    }

    /// Orderly shutdown: stop the drain ticker, persist every resident
    /// buffer entry best-effort, then close the spill store. Only called
    /// once, by the supervisor.
    pub async fn close(&self) -> Result<(), StorageError> {
        if let Some(handle) = self.drain_ticker.lock().await.take() {
            handle.abort();
        }

        let mut state = self.state.lock().await;
        state.closed = true;
        for msg in state.buffer.drain(..) {
            if let Err(err) = self.store_message(&msg).await {
                warn!(id = %msg.id, error = %err, "failed to persist buffered message on shutdown");
            }
        }

        self.storage.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::fake::ScriptedKafkaPublisher;
    use crate::kafka::PublishOutcome as PO;
    use crate::storage::fake::{AlwaysFailingSpillStore, FakeSpillStore};

    fn kafka_error(retriable: bool, msg: &str) -> PO {
        if retriable {
            PO::Retriable(crate::error::KafkaPublishError::Retriable(msg.to_string()))
        } else {
            PO::Permanent(crate::error::KafkaPublishError::Permanent(msg.to_string()))
        }
    }

    #[tokio::test]
    async fn happy_path_batches_by_size() {
        let kafka = Arc::new(ScriptedKafkaPublisher::always_ok());
        let storage = Arc::new(FakeSpillStore::new());
        let worker = Arc::new(BridgeWorker::new(
            kafka.clone(),
            storage.clone(),
            3,
            Duration::from_secs(3600),
            10,
        ));

        for i in 0..3 {
            worker
                .on_delivery(format!("msg-{i}").into_bytes(), "t".to_string())
                .await
                .unwrap();
        }
        worker.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(kafka.call_count(), 3);
        assert_eq!(kafka.published().await.len(), 3);
        assert_eq!(storage.len().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn time_based_flush() {
        let kafka = Arc::new(ScriptedKafkaPublisher::always_ok());
        let storage = Arc::new(FakeSpillStore::new());
        let worker = Arc::new(BridgeWorker::new(
            kafka.clone(),
            storage.clone(),
            1000,
            Duration::from_millis(100),
            10,
        ));

        worker
            .on_delivery(b"one".to_vec(), "t".to_string())
            .await
            .unwrap();

        worker.tick().await;
        assert_eq!(kafka.call_count(), 0, "should not flush before timeout");

        tokio::time::advance(Duration::from_millis(150)).await;
        worker.tick().await;
        tokio::task::yield_now().await;

        assert_eq!(kafka.call_count(), 1);
    }

    #[tokio::test]
    async fn transient_kafka_failure_spills_then_drains_and_republishes() {
        let kafka = Arc::new(ScriptedKafkaPublisher::new(vec![kafka_error(true, "timeout")]));
        let storage = Arc::new(FakeSpillStore::new());
        let worker = Arc::new(BridgeWorker::new(
            kafka.clone(),
            storage.clone(),
            1,
            Duration::from_secs(3600),
            10,
        ));

        worker
            .on_delivery(b"payload".to_vec(), "orders".to_string())
            .await
            .unwrap();
        worker.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(storage.len().await, 1, "should have spilled after retriable failure");

        worker.drain_spill().await;
        assert_eq!(storage.len().await, 0, "drain should have popped the record back in");

        worker.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kafka.call_count(), 2, "should have republished after replay");
        assert_eq!(kafka.published().await.len(), 1);
    }

    #[tokio::test]
    async fn permanent_kafka_failure_drops_without_spilling() {
        let kafka = Arc::new(ScriptedKafkaPublisher::new(vec![kafka_error(false, "unknown topic")]));
        let storage = Arc::new(FakeSpillStore::new());
        let worker = Arc::new(BridgeWorker::new(
            kafka.clone(),
            storage.clone(),
            1,
            Duration::from_secs(3600),
            10,
        ));

        worker
            .on_delivery(b"payload".to_vec(), "orders".to_string())
            .await
            .unwrap();
        worker.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(storage.len().await, 0);
        assert_eq!(kafka.published().await.len(), 0);
    }

    #[tokio::test]
    async fn spill_append_failure_re_enqueues_for_next_flush() {
        let kafka = Arc::new(ScriptedKafkaPublisher::new(vec![kafka_error(true, "timeout")]));
        let storage = Arc::new(AlwaysFailingSpillStore);
        let worker = Arc::new(BridgeWorker::new(
            kafka.clone(),
            storage.clone(),
            1,
            Duration::from_secs(3600),
            10,
        ));

        worker
            .on_delivery(b"payload".to_vec(), "orders".to_string())
            .await
            .unwrap();
        worker.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let state = worker.state.lock().await;
        assert_eq!(state.buffer.len(), 1, "failed spill append should re-enqueue the message");
    }

    #[tokio::test]
    async fn shutdown_preserves_buffer() {
        let kafka = Arc::new(ScriptedKafkaPublisher::always_ok());
        let storage = Arc::new(FakeSpillStore::new());
        let worker = Arc::new(BridgeWorker::new(
            kafka.clone(),
            storage.clone(),
            1000,
            Duration::from_secs(3600),
            10,
        ));

        for i in 0..5 {
            worker
                .on_delivery(format!("msg-{i}").into_bytes(), "t".to_string())
                .await
                .unwrap();
        }

        worker.close().await.unwrap();
        assert_eq!(storage.len().await, 5);
        assert_eq!(kafka.call_count(), 0, "close() must not publish, only spill");
    }

    #[tokio::test]
    async fn drain_error_budget_bounded_and_resets_on_success() {
        let kafka = Arc::new(ScriptedKafkaPublisher::always_ok());
        let storage = Arc::new(FakeSpillStore::new());
        storage
            .append(BridgeMessage::new(b"good".to_vec(), "t".to_string()).encode().unwrap())
            .await
            .unwrap();

        // 3 errors, then the one real record (resets the counter), then 5
        // more errors. With a budget of 5 the drain must abort on the
        // second run of errors, proving the reset actually happened —
        // a budget that never reset would have aborted during the first
        // run of 3 and never reached the record at all.
        storage.queue_pop_errors(3).await;
        storage.queue_pop_passthrough(1).await;
        storage.queue_pop_errors(5).await;

        let worker = Arc::new(BridgeWorker::new(kafka, storage.clone(), 10, Duration::from_secs(3600), 5));

        worker.drain_spill().await;

        let state = worker.state.lock().await;
        assert_eq!(state.buffer.len(), 1, "the real record between the two error runs should have been replayed");
    }
}
