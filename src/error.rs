use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Crate-wide error type. Variants map to the error kinds in the design doc
/// (transient infrastructure, message-local validity, configuration invariant,
/// cancellation) rather than to library boundaries, except where `#[from]`
/// needs a concrete source type.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("bus error: {0}")]
    Bus(String),

    #[error("clickhouse error: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("parsing error: {0}")]
    Parsing(String),

    #[error("routing error: {0}")]
    Routing(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("quota reached: {0}")]
    QuotaReached(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        PipelineError::Config(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        PipelineError::Validation(msg.into())
    }

    pub fn parsing<S: Into<String>>(msg: S) -> Self {
        PipelineError::Parsing(msg.into())
    }

    pub fn routing<S: Into<String>>(msg: S) -> Self {
        PipelineError::Routing(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        PipelineError::NotFound(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        PipelineError::Internal(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        PipelineError::Timeout(msg.into())
    }

    pub fn bus<S: Into<String>>(msg: S) -> Self {
        PipelineError::Bus(msg.into())
    }

    /// True when the error is known-transient and safe to retry with backoff.
    pub fn is_retriable(&self) -> bool {
        match self {
            PipelineError::Timeout(_) => true,
            PipelineError::Kafka(_) => true,
            PipelineError::Bus(_) => true,
            PipelineError::ClickHouse(_) => true,
            PipelineError::Cancelled => false,
            PipelineError::Validation(_)
            | PipelineError::Parsing(_)
            | PipelineError::Config(_)
            | PipelineError::QuotaReached(_)
            | PipelineError::NotFound(_) => false,
            _ => false,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}
