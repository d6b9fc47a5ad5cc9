use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One in-flight message travelling from an AMQP delivery to a Kafka topic.
///
/// `id` exists only for log correlation and round-trip testing; the spill
/// store does not key by it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeMessage {
    pub id: Uuid,
    pub body: Vec<u8>,
    pub topic: String,
}

impl BridgeMessage {
    pub fn new(body: Vec<u8>, topic: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            body,
            topic: topic.into(),
        }
    }

    /// Encodes this message as a self-describing spill record.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decodes a spill record produced by `encode`.
    pub fn decode(record: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(record)
    }
}

impl std::fmt::Display for BridgeMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{id: {}, topic: {}}}", self.id, self.topic)
    }
}
