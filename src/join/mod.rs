//! Windowed stream join: correlates records arriving on two subjects by a
//! shared join key, emitting a merged record once both sides have arrived,
//! or dead-lettering whichever side is still pending once its window expires.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bus::BusClient;
use crate::config::{JoinConfig, PipelineConfig};
use crate::dlq::{dlq_subject, DlqPublisher};
use crate::error::Result;
use crate::metrics;
use crate::model::{BusMessage, DlqErrorKind, DlqRole};

struct PendingRecord {
    value: Value,
    msg: async_nats::jetstream::Message,
    arrived_at: Instant,
}

/// Holds unmatched left/right records keyed by the join key until their
/// counterpart arrives or the window expires.
struct JoinState {
    left_pending: HashMap<String, PendingRecord>,
    right_pending: HashMap<String, PendingRecord>,
}

impl JoinState {
    fn new() -> Self {
        Self {
            left_pending: HashMap::new(),
            right_pending: HashMap::new(),
        }
    }
}

pub struct JoinWorker {
    bus: Arc<BusClient>,
    dlq: DlqPublisher,
    config: JoinConfig,
    sweep_interval: Duration,
}

impl JoinWorker {
    pub fn new(pipeline: &PipelineConfig, bus: Arc<BusClient>) -> Result<Self> {
        let config = pipeline
            .join
            .clone()
            .ok_or_else(|| crate::error::PipelineError::config("join worker requires a join config"))?;
        let dlq = DlqPublisher::new(bus.clone(), dlq_subject(&pipeline.pipeline_id));
        Ok(Self {
            bus,
            dlq,
            config,
            sweep_interval: pipeline.stream_sizing.drain_poll_interval,
        })
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let left_consumer = self
            .bus
            .durable_consumer(
                &self.config.left.source_stream_id,
                &format!("join-left-{}", self.config.sink_stream_id),
                &self.config.left.source_subject,
            )
            .await?;
        let right_consumer = self
            .bus
            .durable_consumer(
                &self.config.right.source_stream_id,
                &format!("join-right-{}", self.config.sink_stream_id),
                &self.config.right.source_subject,
            )
            .await?;

        let mut state = JoinState::new();
        let mut last_sweep = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let left_batch = self.bus.fetch_batch(&left_consumer, 64, Duration::from_millis(500)).await?;
            for msg in left_batch {
                self.ingest_side(&mut state, true, msg).await?;
            }

            let right_batch = self.bus.fetch_batch(&right_consumer, 64, Duration::from_millis(500)).await?;
            for msg in right_batch {
                self.ingest_side(&mut state, false, msg).await?;
            }

            if last_sweep.elapsed() >= self.sweep_interval {
                self.sweep_expired(&mut state).await?;
                last_sweep = Instant::now();
            }
        }
    }

    /// Buffering a record in memory is not a durable outcome, so the message
    /// is only acked once it has either been merged into a durably-published
    /// join output or dead-lettered; a crash while merely buffered simply
    /// redelivers it.
    async fn ingest_side(&self, state: &mut JoinState, is_left: bool, msg: async_nats::jetstream::Message) -> Result<()> {
        let payload = msg.payload.to_vec();

        let value: Value = match serde_json::from_slice(&payload) {
            Ok(v) => v,
            Err(e) => {
                self.dlq
                    .publish(DlqRole::Join, DlqErrorKind::Other, &format!("invalid JSON: {}", e), &payload)
                    .await?;
                let _ = msg.ack().await;
                return Ok(());
            }
        };

        let key = match lookup_key(&value, &self.config.join_key_path) {
            Some(k) => k,
            None => {
                self.dlq
                    .publish(
                        DlqRole::Join,
                        DlqErrorKind::Other,
                        &format!("join_key_path '{}' not present", self.config.join_key_path),
                        &payload,
                    )
                    .await?;
                let _ = msg.ack().await;
                return Ok(());
            }
        };

        let record = PendingRecord {
            value,
            msg,
            arrived_at: Instant::now(),
        };

        let (own_pending, other_pending) = if is_left {
            (&mut state.left_pending, &mut state.right_pending)
        } else {
            (&mut state.right_pending, &mut state.left_pending)
        };

        if let Some(other) = other_pending.remove(&key) {
            let (left, right) = if is_left { (&record, &other) } else { (&other, &record) };
            self.emit_joined(left, right).await?;
            let _ = record.msg.ack().await;
            let _ = other.msg.ack().await;
        } else {
            own_pending.insert(key, record);
        }

        Ok(())
    }

    async fn emit_joined(&self, left: &PendingRecord, right: &PendingRecord) -> Result<()> {
        let merged = serde_json::json!({
            "left": left.value,
            "right": right.value,
        });
        let msg = BusMessage {
            subject: self.config.sink_subject.clone(),
            data: serde_json::to_vec(&merged)?,
            headers: Default::default(),
        };
        self.bus.publish_sync(&msg).await?;
        metrics::inc_batch_flushed("join", "ok");
        metrics::inc_records_committed("join", 1);
        Ok(())
    }

    /// Dead-letters any pending record older than the join window on either
    /// side, since its counterpart is no longer expected to arrive.
    async fn sweep_expired(&self, state: &mut JoinState) -> Result<()> {
        let window = self.config.window;

        let expired_left: Vec<String> = state
            .left_pending
            .iter()
            .filter(|(_, r)| r.arrived_at.elapsed() >= window)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired_left {
            if let Some(record) = state.left_pending.remove(&key) {
                let payload = record.msg.payload.to_vec();
                self.dlq
                    .publish(DlqRole::Join, DlqErrorKind::JoinWindowExpired, "left side unmatched", &payload)
                    .await?;
                let _ = record.msg.ack().await;
            }
        }

        let expired_right: Vec<String> = state
            .right_pending
            .iter()
            .filter(|(_, r)| r.arrived_at.elapsed() >= window)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired_right {
            if let Some(record) = state.right_pending.remove(&key) {
                let payload = record.msg.payload.to_vec();
                self.dlq
                    .publish(DlqRole::Join, DlqErrorKind::JoinWindowExpired, "right side unmatched", &payload)
                    .await?;
                let _ = record.msg.ack().await;
            }
        }

        Ok(())
    }
}

fn lookup_key(value: &Value, path: &str) -> Option<String> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    match current {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_key_resolves_nested_scalar() {
        let value = serde_json::json!({"order": {"id": "abc"}});
        assert_eq!(lookup_key(&value, "order.id"), Some("abc".to_string()));
    }

    #[test]
    fn lookup_key_rejects_missing_path() {
        let value = serde_json::json!({"order": {}});
        assert_eq!(lookup_key(&value, "order.id"), None);
    }

    #[test]
    fn lookup_key_rejects_non_scalar() {
        let value = serde_json::json!({"order": {"id": {"nested": true}}});
        assert_eq!(lookup_key(&value, "order.id"), None);
    }
}
