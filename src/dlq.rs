//! Dead-letter publishing: every component that drops a message-local-invalid
//! record (the ingestor's processor, the join worker, the sink) routes it
//! through here instead of constructing a `BusMessage` by hand.

use std::sync::Arc;

use crate::bus::BusClient;
use crate::error::Result;
use crate::metrics;
use crate::model::{BusMessage, DlqEnvelope, DlqErrorKind, DlqRole};

/// The DLQ stream name and its single subject share this name across every
/// pipeline component, so ingestor/join/sink all land in the same stream.
pub fn dlq_subject(pipeline_id: &str) -> String {
    format!("dlq-{}", pipeline_id)
}

pub struct DlqPublisher {
    bus: Arc<BusClient>,
    subject: String,
}

impl DlqPublisher {
    pub fn new(bus: Arc<BusClient>, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }

    pub async fn publish(
        &self,
        role: DlqRole,
        kind: DlqErrorKind,
        detail: &str,
        original_payload: &[u8],
    ) -> Result<()> {
        metrics::inc_dlq_write(&role.to_string(), &kind.to_string());
        let envelope = DlqEnvelope::new(role, kind, detail, original_payload);
        let data = serde_json::to_vec(&envelope)?;
        let msg = BusMessage {
            subject: self.subject.clone(),
            data,
            headers: Default::default(),
        };
        self.bus.publish_sync(&msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dlq_subject_is_namespaced_by_pipeline() {
        assert_eq!(dlq_subject("orders-pipeline"), "dlq-orders-pipeline");
    }

    #[test]
    fn envelope_base64_round_trips_original_payload() {
        use base64::Engine;
        let envelope = DlqEnvelope::new(DlqRole::Sink, DlqErrorKind::CoerceColumn, "bad column", b"raw-bytes");
        assert_eq!(envelope.role.to_string(), "sink");
        let decoded = base64::engine::general_purpose::STANDARD.decode(&envelope.payload).unwrap();
        assert_eq!(decoded, b"raw-bytes");
    }
}
