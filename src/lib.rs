//! Streaming ETL pipeline engine: Kafka ingestion, an optional windowed
//! join, a NATS JetStream bus, and a ClickHouse sink, all supervised by a
//! per-pipeline orchestrator.
//!
//! ```text
//! ┌──────────┐    ┌───────────┐    ┌──────────────┐    ┌──────┐    ┌────────────┐
//! │  Kafka   │───▶│ Ingestor  │───▶│ NATS JetStream│───▶│ Join │───▶│ ClickHouse │
//! │  topics  │    │(processor)│    │     bus       │    │(opt) │    │    sink    │
//! └──────────┘    └───────────┘    └──────────────┘    └──────┘    └────────────┘
//!                        │                                              │
//!                        └──────────────────── DLQ subject ◀────────────┘
//! ```
//!
//! The [`orchestrator`] module owns the pipeline's lifecycle; everything
//! else is a building block it wires together.

pub mod bus;
pub mod config;
pub mod dlq;
pub mod error;
pub mod fingerprint;
pub mod join;
pub mod kafka;
pub mod metadata;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod retry;
pub mod runner;
pub mod schema;
pub mod sink;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
