//! Kafka ingestion: a batched, at-least-once consumer (manual offset commit)
//! feeding a processor that validates, deduplicates, and republishes onto the
//! message bus.

pub mod consumer;
pub mod ingestor;
pub mod processor;

pub use consumer::KafkaConsumer;
pub use ingestor::Ingestor;
pub use processor::MessageProcessor;
