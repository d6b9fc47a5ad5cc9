use thiserror::Error;

/// Errors raised while loading or validating the pipe table and the rest of
/// the process configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("failed to read pipe table at {path}: {source}")]
    PipesRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse pipe table: {0}")]
    PipesParse(#[from] serde_yaml::Error),
    #[error("pipe #{index} is missing required field: {field}")]
    PipeMissingField { index: usize, field: &'static str },
    #[error("duplicate rabbit_queue_name in pipe table: {0}")]
    DuplicateQueue(String),
    #[error("unknown spill store scheme: {0}")]
    UnknownStorage(String),
    #[error("invalid storage dsn: {0}")]
    InvalidStorageDsn(String),
    #[error("worker.storage_read_timeout must be at least 2x worker.cycle_timeout")]
    InvalidDrainInterval,
}

/// Errors surfaced by the persistent spill store. `pop` returning "no more
/// records" is represented as `Ok(None)`, never as a variant here.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("spill store io error: {0}")]
    Io(String),
    #[error("spill store is closed")]
    Closed,
}

/// Errors surfaced by the Kafka publisher for a single publish attempt.
#[derive(Debug, Error, Clone)]
pub enum KafkaPublishError {
    #[error("retriable kafka error: {0}")]
    Retriable(String),
    #[error("permanent kafka error: {0}")]
    Permanent(String),
}

/// Errors raised by the AMQP connector.
#[derive(Debug, Error)]
pub enum AmqpError {
    #[error("amqp connection error: {0}")]
    Connection(#[from] lapin::Error),
    #[error("amqp topology declaration failed for pipe {pipe}: {source}")]
    Topology {
        pipe: String,
        #[source]
        source: lapin::Error,
    },
}

/// Result of `BridgeWorker::store_message`: distinguishes an unserializable
/// message (drop it) from a store that refused the write (re-enqueue it).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to marshal message for spill: {0}")]
    Marshal(#[from] serde_json::Error),
    #[error("failed to put message to spill store: {0}")]
    Put(#[from] StorageError),
}
