use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// One routing rule: an AMQP (exchange, queue, routing-keys) tuple mapped to
/// a Kafka topic. Loaded once at startup and immutable thereafter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Pipe {
    pub kafka_topic: String,
    pub rabbit_exchange_name: String,
    pub rabbit_routing_keys: Vec<String>,
    pub rabbit_queue_name: String,
    #[serde(default)]
    pub rabbit_durable_queue: bool,
    #[serde(default)]
    pub rabbit_auto_delete_queue: bool,
    #[serde(default)]
    pub rabbit_transient_exchange: bool,
}

impl Pipe {
    fn validate(&self, index: usize) -> Result<(), ConfigError> {
        if self.kafka_topic.is_empty() {
            return Err(ConfigError::PipeMissingField {
                index,
                field: "kafka_topic",
            });
        }
        if self.rabbit_exchange_name.is_empty() {
            return Err(ConfigError::PipeMissingField {
                index,
                field: "rabbit_exchange_name",
            });
        }
        if self.rabbit_queue_name.is_empty() {
            return Err(ConfigError::PipeMissingField {
                index,
                field: "rabbit_queue_name",
            });
        }
        if self.rabbit_routing_keys.is_empty() {
            return Err(ConfigError::PipeMissingField {
                index,
                field: "rabbit_routing_keys",
            });
        }
        Ok(())
    }
}

/// The full, immutable set of pipes loaded at startup.
#[derive(Debug, Clone)]
pub struct PipeTable {
    pipes: Vec<Pipe>,
}

impl PipeTable {
    /// Parses and validates a pipe table document (YAML array of records).
    /// Rejects records with missing required fields and duplicate
    /// `rabbit_queue_name` values.
    pub fn parse(document: &str) -> Result<Self, ConfigError> {
        let pipes: Vec<Pipe> = serde_yaml::from_str(document)?;

        let mut seen_queues = HashSet::with_capacity(pipes.len());
        for (index, pipe) in pipes.iter().enumerate() {
            pipe.validate(index)?;
            if !seen_queues.insert(pipe.rabbit_queue_name.clone()) {
                return Err(ConfigError::DuplicateQueue(pipe.rabbit_queue_name.clone()));
            }
        }

        Ok(Self { pipes })
    }

    /// Reads the pipe table document from disk, then parses it.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::PipesRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    pub fn pipes(&self) -> &[Pipe] {
        &self.pipes
    }

    pub fn len(&self) -> usize {
        self.pipes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }
}
