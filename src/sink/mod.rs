//! ClickHouse sink: pulls merged/transformed records off the bus, builds a
//! columnar batch, deduplicates in-batch by fingerprint, and bulk-inserts.
//! A failed insert is retried a bounded number of times before falling back
//! to per-row DLQ so one bad batch doesn't wedge the whole sink.

pub mod columns;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use clickhouse::Client;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::bus::BusClient;
use crate::config::{PipelineConfig, SinkConfig};
use crate::dlq::{dlq_subject, DlqPublisher};
use crate::error::{PipelineError, Result};
use crate::fingerprint::record_fingerprint;
use crate::metrics;
use crate::retry::retry_fixed;
use crate::sink::columns::BatchBuilder;

pub struct Sink {
    bus: Arc<BusClient>,
    dlq: DlqPublisher,
    ch: Client,
    config: SinkConfig,
}

impl Sink {
    pub fn new(pipeline: &PipelineConfig, bus: Arc<BusClient>) -> Self {
        let ch = Client::default()
            .with_url(&pipeline.sink.clickhouse_url)
            .with_database(&pipeline.sink.database)
            .with_compression(clickhouse::Compression::Lz4);
        let dlq = DlqPublisher::new(bus.clone(), dlq_subject(&pipeline.pipeline_id));
        Self {
            bus,
            dlq,
            ch,
            config: pipeline.sink.clone(),
        }
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let consumer = self
            .bus
            .durable_consumer(&self.config.sink_stream_id, "sink", &self.config.sink_subject)
            .await?;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let messages = self
                .bus
                .fetch_batch(&consumer, self.config.batch_max, self.config.flush_interval)
                .await?;

            if messages.is_empty() {
                continue;
            }

            let mut builder = BatchBuilder::new(self.config.columns.clone());
            let mut seen_fingerprints = HashSet::new();
            let mut acceptable = Vec::with_capacity(messages.len());

            for msg in &messages {
                let value: Value = match serde_json::from_slice(&msg.payload) {
                    Ok(v) => v,
                    Err(e) => {
                        self.dlq
                            .publish(
                                crate::model::DlqRole::Sink,
                                crate::model::DlqErrorKind::Other,
                                &format!("invalid JSON: {}", e),
                                &msg.payload,
                            )
                            .await?;
                        let _ = msg.ack().await;
                        continue;
                    }
                };

                let dedup_id = msg
                    .headers
                    .as_ref()
                    .and_then(|h| h.get("Nats-Msg-Id"))
                    .and_then(|v| v.first())
                    .map(|s| s.as_str().to_string());
                let fingerprint = record_fingerprint(dedup_id.as_deref(), &msg.payload);
                if !seen_fingerprints.insert(fingerprint) {
                    metrics::inc_dedup_hit("in_batch_fingerprint");
                    let _ = msg.ack().await;
                    continue;
                }

                match builder.push_row(&value) {
                    Ok(()) => acceptable.push(msg),
                    Err(detail) => {
                        self.dlq
                            .publish(crate::model::DlqRole::Sink, crate::model::DlqErrorKind::CoerceColumn, &detail, &msg.payload)
                            .await?;
                        let _ = msg.ack().await;
                    }
                }
            }

            if builder.is_empty() {
                continue;
            }

            match self.insert_with_retry(&builder, cancel).await {
                Ok(()) => {
                    metrics::inc_batch_flushed("sink", "ok");
                    metrics::inc_records_committed("sink", acceptable.len() as u64);
                    for msg in acceptable {
                        let _ = msg.ack().await;
                    }
                }
                Err(e) => {
                    metrics::inc_batch_flushed("sink", "failed");
                    tracing::error!(error = %e, "sink insert failed after retries, dead-lettering batch");
                    for msg in acceptable {
                        self.dlq
                            .publish(
                                crate::model::DlqRole::Sink,
                                crate::model::DlqErrorKind::Other,
                                &e.to_string(),
                                &msg.payload,
                            )
                            .await?;
                        let _ = msg.ack().await;
                    }
                }
            }
        }
    }

    async fn insert_with_retry(&self, builder: &BatchBuilder, cancel: &CancellationToken) -> Result<()> {
        let body = rows_as_jsoneachrow(builder);
        let sql = format!("INSERT INTO {} FORMAT JSONEachRow", self.config.table);

        retry_fixed(self.config.insert_retries, Duration::from_millis(200), cancel, || {
            let sql = sql.clone();
            let body = body.clone();
            async move {
                self.ch
                    .query(&sql)
                    .bind(body)
                    .execute()
                    .await
                    .map_err(PipelineError::from)
            }
        })
        .await
    }
}

fn rows_as_jsoneachrow(builder: &BatchBuilder) -> String {
    let columns = builder.columns();
    let rows = builder.len();
    let mut lines = Vec::with_capacity(rows);

    for row_idx in 0..rows {
        let mut obj = Map::new();
        for col in columns {
            obj.insert(col.name.clone(), col.values[row_idx].clone());
        }
        lines.push(Value::Object(obj).to_string());
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ColumnMapping, ColumnType};
    use serde_json::json;

    #[test]
    fn jsoneachrow_serializes_one_line_per_row() {
        let mappings = vec![ColumnMapping {
            source_field: "id".into(),
            column_name: "id".into(),
            column_type: ColumnType::Int64,
            nullable: false,
        }];
        let mut builder = BatchBuilder::new(mappings);
        builder.push_row(&json!({"id": 1})).unwrap();
        builder.push_row(&json!({"id": 2})).unwrap();

        let body = rows_as_jsoneachrow(&builder);
        assert_eq!(body.lines().count(), 2);
    }
}
