//! Error types for the stream processor
//!
//! Errors are grouped by the component that raises them. Per-record errors
//! ([`DecodeError`], [`WindowError::LateEvent`]) never cross a tick boundary;
//! they are counted and logged. Source, sink and checkpoint errors decide
//! whether a tick aborts or the engine halts, see [`ProcessorError::is_fatal`].

use thiserror::Error;

/// Main processor error type
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Source read errors
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Sink delivery errors
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    /// Checkpoint persistence errors
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Aggregation errors
    #[error("aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    /// Configuration errors
    #[error("configuration error: {source}")]
    Configuration {
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A worker task panicked or was cancelled
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    /// Generic error for unexpected conditions
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ProcessorError {
    /// Whether this error must halt the engine instead of aborting one tick
    pub fn is_fatal(&self) -> bool {
        match self {
            ProcessorError::Source(err) => err.is_fatal(),
            ProcessorError::Sink(_) => false,
            ProcessorError::Checkpoint(err) => err.is_integrity_violation(),
            ProcessorError::Aggregation(_) => false,
            ProcessorError::Configuration { .. } => true,
            ProcessorError::Worker(_) => true,
            ProcessorError::Unexpected(_) => true,
        }
    }
}

/// Per-record decoding errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload violates the transaction schema
    #[error("malformed record at {position}: {reason}")]
    Malformed { position: String, reason: String },

    /// `type` is neither ORDER nor RETURN
    #[error("unknown transaction type '{value}' at {position}")]
    UnknownType { position: String, value: String },
}

impl DecodeError {
    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            DecodeError::Malformed { .. } => "malformed",
            DecodeError::UnknownType { .. } => "unknown_type",
        }
    }
}

/// Window assignment errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WindowError {
    /// Event arrived after its window was already closed by the watermark
    #[error("late event: event time {event_time} falls in window ending {window_end}, watermark is {watermark}")]
    LateEvent {
        event_time: i64,
        window_end: i64,
        watermark: i64,
    },

    /// Window size is invalid
    #[error("invalid window size: {size}ms, must be greater than 0")]
    InvalidWindowSize { size: u64 },
}

/// Aggregation computation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    /// Mean requested over zero samples
    #[error("division by zero in {operation}")]
    DivisionByZero { operation: String },

    /// Accumulators with different shapes cannot be merged
    #[error("cannot merge accumulator for {left} into {right}")]
    IncompatibleMerge { left: String, right: String },
}

/// Source read errors
#[derive(Error, Debug)]
pub enum SourceError {
    /// Transient failure, retried with backoff
    #[error("transient source failure: {message}")]
    Transient { message: String },

    /// Requested offsets are no longer available
    #[error("data loss on partition {partition}: expected offset {expected}, earliest available {available}")]
    DataLoss {
        partition: u32,
        expected: i64,
        available: i64,
    },

    /// Retries exhausted with `fail_on_data_loss` enabled
    #[error("source unavailable after {attempts} attempts: {message}")]
    Exhausted { attempts: u32, message: String },

    /// I/O error reading the source
    #[error("source I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the message-queue client
    #[error("source client error: {message}")]
    Client { message: String },
}

impl SourceError {
    /// Whether a retry might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Transient { .. } | SourceError::Io(_))
    }

    /// Fatal source errors halt the engine
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SourceError::DataLoss { .. } | SourceError::Exhausted { .. } | SourceError::Client { .. }
        )
    }
}

/// Sink delivery errors
#[derive(Error, Debug)]
pub enum SinkError {
    /// Write to a destination failed
    #[error("write to sink '{sink}' failed: {reason}")]
    Write { sink: String, reason: String },

    /// Record could not be serialized
    #[error("serialization for sink '{sink}' failed: {reason}")]
    Serialization { sink: String, reason: String },

    /// Retries exhausted for a durable destination
    #[error("sink '{sink}' failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        sink: String,
        attempts: u32,
        last_error: String,
    },
}

/// Checkpoint persistence errors
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// I/O error reading or writing checkpoint files
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Part could not be encoded or decoded
    #[error("checkpoint serialization failed for namespace '{namespace}': {reason}")]
    Serialization { namespace: String, reason: String },

    /// Commit manifest unreadable
    #[error("checkpoint manifest {path} is corrupt: {reason}")]
    Corrupt { path: String, reason: String },

    /// Manifest references a part that is missing or does not match its digest
    #[error("torn checkpoint {trigger_id} in namespace '{namespace}': {reason}")]
    Torn {
        trigger_id: u64,
        namespace: String,
        reason: String,
    },

    /// Checkpoint was produced under an incompatible configuration
    #[error("checkpoint namespace '{namespace}' is incompatible with the current configuration: {reason}")]
    Incompatible { namespace: String, reason: String },
}

impl CheckpointError {
    /// Integrity violations are fatal; plain I/O failures during a commit
    /// only abort the tick.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            CheckpointError::Corrupt { .. }
                | CheckpointError::Torn { .. }
                | CheckpointError::Incompatible { .. }
        )
    }
}

/// Result type alias for processor operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Result type alias for decoding
pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Result type alias for aggregation operations
pub type AggregationResult<T> = std::result::Result<T, AggregationError>;

/// Result type alias for source operations
pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Result type alias for sink operations
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Result type alias for checkpoint operations
pub type CheckpointResult<T> = std::result::Result<T, CheckpointError>;

impl From<figment::Error> for ProcessorError {
    fn from(err: figment::Error) -> Self {
        ProcessorError::Configuration {
            source: Box::new(err),
        }
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        ProcessorError::Unexpected(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_display() {
        let err = DecodeError::Malformed {
            position: "0@3".to_string(),
            reason: "missing field `timestamp`".to_string(),
        };
        assert!(err.to_string().contains("malformed record at 0@3"));
        assert_eq!(err.kind(), "malformed");
    }

    #[test]
    fn test_late_event_display() {
        let err = WindowError::LateEvent {
            event_time: 1000,
            window_end: 60_000,
            watermark: 60_000,
        };
        assert!(err.to_string().contains("late event"));
    }

    #[test]
    fn test_source_error_classification() {
        let transient = SourceError::Transient {
            message: "broker down".to_string(),
        };
        assert!(transient.is_retryable());
        assert!(!transient.is_fatal());

        let loss = SourceError::DataLoss {
            partition: 0,
            expected: 10,
            available: 20,
        };
        assert!(!loss.is_retryable());
        assert!(ProcessorError::from(loss).is_fatal());
    }

    #[test]
    fn test_checkpoint_io_error_is_not_fatal() {
        let io = CheckpointError::Io {
            path: "/tmp/x".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        assert!(!ProcessorError::from(io).is_fatal());

        let torn = CheckpointError::Torn {
            trigger_id: 3,
            namespace: "global_kpi".to_string(),
            reason: "missing part".to_string(),
        };
        assert!(ProcessorError::from(torn).is_fatal());
    }

    #[test]
    fn test_sink_error_never_fatal() {
        let err: ProcessorError = SinkError::RetriesExhausted {
            sink: "global_kpi".to_string(),
            attempts: 3,
            last_error: "EIO".to_string(),
        }
        .into();
        assert!(!err.is_fatal());
    }
}
