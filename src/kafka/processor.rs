//! Turns raw Kafka records into bus messages: schema validation, dedup-key
//! resolution (bus header preferred, KV bucket fallback), subject routing,
//! and DLQ fan-out for anything that fails validation or dedup resolution.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::bus::{headers_with_dedup_id, BusClient, PendingAck};
use crate::config::TopicConfig;
use crate::dlq::DlqPublisher;
use crate::error::Result;
use crate::fingerprint::{dedup_bucket_name, subject_bucket};
use crate::metrics;
use crate::model::{BusMessage, DlqErrorKind, DlqRole, Record};
use crate::schema::SchemaValidator;

/// Number of KV buckets a topic's fallback dedup state is sharded across
/// (SPEC_FULL.md §6: `<topic>_<fnv32(key) mod 1024>`).
const DEDUP_BUCKET_MODULUS: u32 = 1024;

/// Fixed TTL for the per-topic dedup KV bucket fallback (SPEC_FULL.md §6).
/// Independent of the topic's configurable `deduplication.window`, which
/// governs only the bus-level `Nats-Msg-Id` header dedup.
const DEDUP_BUCKET_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of preparing one record: either it is ready to publish, it was a
/// duplicate and silently dropped, or it failed a message-local check and
/// must be DLQ'd with the given kind. Infra failures (bus unreachable, KV
/// access failure) are never represented here — they propagate as `Err` so
/// `process_batch` fails the whole batch instead of DLQ'ing it.
enum PrepareOutcome {
    Published(PendingAck),
    Deduplicated,
    Rejected { kind: DlqErrorKind, detail: String },
}

/// Hash-keyed subject fan-out is opt-in: both must be set, read once at
/// construction since they describe process-wide deployment topology, not
/// per-message state.
struct HashFanout {
    prefix: String,
    subject_count: u64,
}

pub struct MessageProcessor {
    bus: Arc<BusClient>,
    dlq: DlqPublisher,
    validator: Arc<dyn SchemaValidator>,
    topic: TopicConfig,
    hash_fanout: Option<HashFanout>,
}

impl MessageProcessor {
    pub fn new(bus: Arc<BusClient>, dlq: DlqPublisher, validator: Arc<dyn SchemaValidator>, topic: TopicConfig) -> Self {
        let hash_fanout = match (std::env::var("SUBJECT_PREFIX"), std::env::var("SUBJECT_COUNT")) {
            (Ok(prefix), Ok(count)) => count.parse::<u64>().ok().filter(|n| *n > 0).map(|subject_count| HashFanout { prefix, subject_count }),
            _ => None,
        };

        Self {
            bus,
            dlq,
            validator,
            topic,
            hash_fanout,
        }
    }

    /// Validates, deduplicates, and republishes every record in `records`.
    /// Records that fail validation or dedup-key resolution are routed to
    /// the DLQ and otherwise skipped; this never fails the batch, since
    /// message-local-validity failures must not block offset commit. Any
    /// other preparation failure (bus unreachable, KV access failure) is
    /// infra-level and propagates with `?`, so the batch is not committed
    /// and Kafka redelivers it.
    pub async fn process_batch(&self, records: &[Record]) -> Result<()> {
        let mut acks: Vec<PendingAck> = Vec::with_capacity(records.len());

        for record in records {
            match self.process_one(record).await? {
                PrepareOutcome::Published(ack) => acks.push(ack),
                PrepareOutcome::Deduplicated => {}
                PrepareOutcome::Rejected { kind, detail } => {
                    self.dlq.publish(DlqRole::Ingestor, kind, &detail, &record.value).await?;
                }
            }
        }

        metrics::inc_batch_flushed("ingestor", "ok");
        metrics::inc_records_committed("ingestor", acks.len() as u64);
        self.bus.wait_for_async_acks(acks).await
    }

    async fn process_one(&self, record: &Record) -> Result<PrepareOutcome> {
        let body: Value = match serde_json::from_slice(&record.value) {
            Ok(v) => v,
            Err(e) => {
                return Ok(PrepareOutcome::Rejected {
                    kind: DlqErrorKind::ValidateSchema,
                    detail: format!("invalid JSON: {}", e),
                })
            }
        };

        if let Err(detail) = self.validator.validate(&self.topic.name, &body) {
            return Ok(PrepareOutcome::Rejected { kind: DlqErrorKind::ValidateSchema, detail });
        }

        // Resolved once per record: both routing and dedup consult the same key.
        let dedup_key = match self.resolve_dedup_key(&body, record) {
            Ok(k) => k,
            Err(detail) => return Ok(PrepareOutcome::Rejected { kind: DlqErrorKind::DeduplicateData, detail }),
        };

        if let Some(key) = &dedup_key {
            if self.topic.deduplication.enabled {
                let seen = self.already_seen(key).await?;
                if seen {
                    metrics::inc_dedup_hit("kv_bucket");
                    return Ok(PrepareOutcome::Deduplicated);
                }
                self.mark_seen(key).await?;
            }
        }

        let subject = self.route_subject(record.partition, dedup_key.as_deref());
        let headers = headers_with_dedup_id(dedup_key.as_deref());

        let msg = BusMessage {
            subject,
            data: record.value.clone(),
            headers,
        };

        let ack = self.bus.publish_async(&msg).await?;
        Ok(PrepareOutcome::Published(ack))
    }

    fn resolve_dedup_key(&self, body: &Value, record: &Record) -> std::result::Result<Option<String>, String> {
        let Some(path) = &self.topic.deduplication.key_path else {
            return Ok(record.key.as_ref().map(|k| String::from_utf8_lossy(k).into_owned()));
        };

        let mut current = body;
        for segment in path.split('.') {
            current = current
                .as_object()
                .and_then(|o| o.get(segment))
                .ok_or_else(|| format!("dedup key_path '{}' not present in record", path))?;
        }

        match current {
            Value::String(s) => Ok(Some(s.clone())),
            Value::Number(n) => Ok(Some(n.to_string())),
            _ => Err(format!("dedup key_path '{}' did not resolve to a scalar", path)),
        }
    }

    fn route_subject(&self, partition: i32, dedup_key: Option<&str>) -> String {
        route_subject(&self.topic, self.hash_fanout.as_ref(), partition, dedup_key)
    }

    async fn already_seen(&self, key: &str) -> Result<bool> {
        let bucket_name = dedup_bucket_name(&self.topic.name, key.as_bytes(), DEDUP_BUCKET_MODULUS);
        let store = self.bus.kv_open_or_create(&bucket_name, DEDUP_BUCKET_TTL).await?;
        Ok(self.bus.kv_get(&store, key).await?.is_some())
    }

    async fn mark_seen(&self, key: &str) -> Result<()> {
        let bucket_name = dedup_bucket_name(&self.topic.name, key.as_bytes(), DEDUP_BUCKET_MODULUS);
        let store = self.bus.kv_open_or_create(&bucket_name, DEDUP_BUCKET_TTL).await?;
        self.bus.kv_put(&store, key, b"1").await
    }
}

/// Subject selection, in priority order: replica fan-out by partition, then
/// dedup-key hash fan-out (only when both `SUBJECT_PREFIX` and
/// `SUBJECT_COUNT` are configured and dedup is enabled for this topic), then
/// the topic's fixed output subject. Free function so routing can be tested
/// without a live bus connection.
fn route_subject(topic: &TopicConfig, hash_fanout: Option<&HashFanout>, partition: i32, dedup_key: Option<&str>) -> String {
    if topic.fans_out() {
        return format!("{}.{}", topic.output_stream_id, partition);
    }

    if topic.deduplication.enabled {
        if let (Some(fanout), Some(key)) = (hash_fanout, dedup_key) {
            let bucket = subject_bucket(key.as_bytes(), fanout.subject_count);
            return format!("{}.{}", fanout.prefix, bucket);
        }
    }

    topic.output_stream_subject.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupConfig, InitialOffset};

    fn topic(replicas: u32, dedup_enabled: bool) -> TopicConfig {
        TopicConfig {
            name: "orders".to_string(),
            consumer_group: "orders-cg".to_string(),
            initial_offset: InitialOffset::Earliest,
            deduplication: DedupConfig {
                enabled: dedup_enabled,
                key_path: Some("order_id".to_string()),
                window: Duration::from_secs(300),
            },
            replicas,
            output_stream_id: "orders-stream".to_string(),
            output_stream_subject: "orders.events".to_string(),
        }
    }

    #[test]
    fn fixed_subject_when_no_fanout_configured() {
        let topic = topic(1, false);
        assert_eq!(route_subject(&topic, None, 3, Some("k1")), "orders.events");
    }

    #[test]
    fn replica_fanout_wins_over_hash_fanout() {
        let topic = topic(3, true);
        let fanout = HashFanout { prefix: "orders.shard".to_string(), subject_count: 8 };
        assert_eq!(route_subject(&topic, Some(&fanout), 2, Some("k1")), "orders-stream.2");
    }

    #[test]
    fn hash_fanout_routes_by_dedup_key_not_partition() {
        let topic = topic(1, true);
        let fanout = HashFanout { prefix: "orders.shard".to_string(), subject_count: 8 };
        let a = route_subject(&topic, Some(&fanout), 0, Some("same-key"));
        let b = route_subject(&topic, Some(&fanout), 7, Some("same-key"));
        assert_eq!(a, b);
        assert!(a.starts_with("orders.shard."));
    }

    #[test]
    fn hash_fanout_requires_dedup_enabled() {
        let topic = topic(1, false);
        let fanout = HashFanout { prefix: "orders.shard".to_string(), subject_count: 8 };
        assert_eq!(route_subject(&topic, Some(&fanout), 0, Some("k1")), "orders.events");
    }

    #[test]
    fn hash_fanout_requires_a_resolved_dedup_key() {
        let topic = topic(1, true);
        let fanout = HashFanout { prefix: "orders.shard".to_string(), subject_count: 8 };
        assert_eq!(route_subject(&topic, Some(&fanout), 0, None), "orders.events");
    }
}
