//! Data model shared across the ingestor, join worker, sink, and orchestrator:
//! in-flight records, bus messages, DLQ envelopes, and pipeline health.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A record fetched from Kafka, still owned by the consumer's batch slice.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub headers: HashMap<String, Vec<u8>>,
    pub arrival_time: DateTime<Utc>,
}

/// A message ready to publish on the bus, derived from a `Record`.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    pub data: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl BusMessage {
    pub fn dedup_id(&self) -> Option<&str> {
        self.headers.get("Nats-Msg-Id").map(|s| s.as_str())
    }
}

/// Role that diverted a record to the dead-letter subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlqRole {
    Ingestor,
    Join,
    Sink,
}

impl std::fmt::Display for DlqRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DlqRole::Ingestor => write!(f, "ingestor"),
            DlqRole::Join => write!(f, "join"),
            DlqRole::Sink => write!(f, "sink"),
        }
    }
}

/// Kind of failure recorded alongside a DLQ envelope. Carried as a string in
/// the wire envelope but kept closed here so callers can match exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqErrorKind {
    ValidateSchema,
    DeduplicateData,
    CoerceColumn,
    JoinWindowExpired,
    PublishFailed,
    Other,
}

impl std::fmt::Display for DlqErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DlqErrorKind::ValidateSchema => "validate_schema",
            DlqErrorKind::DeduplicateData => "deduplicate_data",
            DlqErrorKind::CoerceColumn => "coerce_column",
            DlqErrorKind::JoinWindowExpired => "join_window_expired",
            DlqErrorKind::PublishFailed => "publish_failed",
            DlqErrorKind::Other => "other",
        };
        write!(f, "{}", s)
    }
}

/// Structured failure envelope written to a pipeline's DLQ subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEnvelope {
    pub role: DlqRole,
    pub error: String,
    /// base64-encoded original payload.
    pub payload: String,
    pub ts: DateTime<Utc>,
}

impl DlqEnvelope {
    pub fn new(role: DlqRole, kind: DlqErrorKind, detail: &str, original_payload: &[u8]) -> Self {
        use base64::Engine;
        Self {
            role,
            error: format!("{}: {}", kind, detail),
            payload: base64::engine::general_purpose::STANDARD.encode(original_payload),
            ts: Utc::now(),
        }
    }
}

/// Overall pipeline status, written to the metadata store alongside its config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PipelineStatus {
    Pending,
    Running,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineHealth {
    pub pipeline_id: String,
    pub overall_status: PipelineStatus,
    pub updated_at: DateTime<Utc>,
}

impl PipelineHealth {
    pub fn new(pipeline_id: impl Into<String>, status: PipelineStatus) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            overall_status: status,
            updated_at: Utc::now(),
        }
    }
}
