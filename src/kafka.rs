use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::ClientConfig;
use tracing::{error, info, warn};

use crate::error::{ConfigError, KafkaPublishError};
use crate::message::BridgeMessage;

/// Outcome of a single publish attempt. The caller decides whether to
/// retry, spill, or drop based on this, never on the raw producer error.
#[derive(Debug, Clone)]
pub enum PublishOutcome {
    Ok,
    Retriable(KafkaPublishError),
    Permanent(KafkaPublishError),
}

#[async_trait]
pub trait KafkaPublisher: Send + Sync {
    async fn publish(&self, message: &BridgeMessage) -> PublishOutcome;
}

/// `rdkafka`-backed publisher. One producer instance is shared across all
/// pipes; the topic comes from `BridgeMessage::topic` on every call.
pub struct RdKafkaPublisher {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl RdKafkaPublisher {
    pub fn new(brokers: &str, max_retries: u32) -> Result<Self, ConfigError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("acks", "all")
            .set("message.send.max.retries", max_retries.to_string())
            .set("compression.type", "snappy")
            .create()
            .map_err(|e| ConfigError::InvalidStorageDsn(format!("kafka producer: {e}")))?;

        Ok(Self {
            producer,
            send_timeout: Duration::from_secs(10),
        })
    }

    /// Classifies a send failure as retriable (network blip, queue full,
    /// broker not available) or permanent (message too large, unknown
    /// topic, authorization failure).
    fn classify(err: &KafkaError) -> PublishOutcome {
        let msg = err.to_string();
        match err.rdkafka_error_code() {
            Some(
                RDKafkaErrorCode::MessageSizeTooLarge
                | RDKafkaErrorCode::UnknownTopicOrPartition
                | RDKafkaErrorCode::TopicAuthorizationFailed
                | RDKafkaErrorCode::InvalidMessage
                | RDKafkaErrorCode::InvalidMessageSize,
            ) => PublishOutcome::Permanent(KafkaPublishError::Permanent(msg)),
            Some(
                RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::NotEnoughReplicas
                | RDKafkaErrorCode::NotEnoughReplicasAfterAppend
                | RDKafkaErrorCode::BrokerNotAvailable
                | RDKafkaErrorCode::NetworkException
                | RDKafkaErrorCode::QueueFull,
            ) => PublishOutcome::Retriable(KafkaPublishError::Retriable(msg)),
            _ => PublishOutcome::Retriable(KafkaPublishError::Retriable(msg)),
        }
    }
}

#[async_trait]
impl KafkaPublisher for RdKafkaPublisher {
    async fn publish(&self, message: &BridgeMessage) -> PublishOutcome {
        let record = FutureRecord::to(&message.topic)
            .key(&message.id.to_string())
            .payload(&message.body);

        match self
            .producer
            .send(record, Timeout::After(self.send_timeout))
            .await
        {
            Ok(_) => {
                info!(topic = %message.topic, id = %message.id, "published");
                PublishOutcome::Ok
            }
            Err((err, _owned_msg)) => {
                let outcome = Self::classify(&err);
                match &outcome {
                    PublishOutcome::Permanent(e) => {
                        error!(topic = %message.topic, id = %message.id, error = %e, "dropping message, permanent kafka error");
                    }
                    PublishOutcome::Retriable(e) => {
                        warn!(topic = %message.topic, id = %message.id, error = %e, "retriable kafka error");
                    }
                    PublishOutcome::Ok => unreachable!(),
                }
                outcome
            }
        }
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Publisher double that plays back a scripted sequence of outcomes,
    /// falling back to `Ok` once the script is exhausted.
    pub struct ScriptedKafkaPublisher {
        script: Mutex<Vec<PublishOutcome>>,
        published: Mutex<Vec<BridgeMessage>>,
        calls: AtomicUsize,
    }

    impl ScriptedKafkaPublisher {
        pub fn new(script: Vec<PublishOutcome>) -> Self {
            Self {
                script: Mutex::new(script),
                published: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn always_ok() -> Self {
            Self::new(Vec::new())
        }

        pub async fn published(&self) -> Vec<BridgeMessage> {
            self.published.lock().await.clone()
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl KafkaPublisher for ScriptedKafkaPublisher {
        async fn publish(&self, message: &BridgeMessage) -> PublishOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().await;
            let outcome = if script.is_empty() {
                PublishOutcome::Ok
            } else {
                script.remove(0)
            };
            if matches!(outcome, PublishOutcome::Ok) {
                self.published.lock().await.push(message.clone());
            }
            outcome
        }
    }
}
