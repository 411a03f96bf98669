//! Ties a `KafkaConsumer` to a `MessageProcessor`: the batched poll/process/
//! commit loop that the runner wrapper drives under a cancellation token.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::bus::BusClient;
use crate::config::{IngestorConfig, PipelineConfig};
use crate::dlq::{dlq_subject, DlqPublisher};
use crate::error::{PipelineError, Result};
use crate::kafka::consumer::KafkaConsumer;
use crate::kafka::processor::MessageProcessor;
use crate::retry::retry_fixed;
use crate::schema::SchemaValidator;

/// Bound on the final drain poll once shutdown has been requested. Short by
/// design (§5: "fresh short-bounded context... consumer batch drain on
/// shutdown") — this is a best-effort mop-up, not a second poll cycle.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Ingestor {
    consumer: KafkaConsumer,
    processor: MessageProcessor,
    batch_max: usize,
    flush_interval: Duration,
    process_retries: u32,
    commit_retries: u32,
    retry_delay: Duration,
}

impl Ingestor {
    pub fn new(
        pipeline: &PipelineConfig,
        topic_name: &str,
        bus: Arc<BusClient>,
        validator: Arc<dyn SchemaValidator>,
    ) -> Result<Self> {
        let ingestor_cfg: &IngestorConfig = &pipeline.ingestor;
        let topic = ingestor_cfg.topic(topic_name)?.clone();

        let consumer = KafkaConsumer::new(&pipeline.pipeline_id, ingestor_cfg, topic.clone())?;
        let dlq = DlqPublisher::new(bus.clone(), dlq_subject(&pipeline.pipeline_id));
        let processor = MessageProcessor::new(bus, dlq, validator, topic);

        Ok(Self {
            consumer,
            processor,
            batch_max: ingestor_cfg.batch_max,
            flush_interval: ingestor_cfg.flush_interval,
            process_retries: ingestor_cfg.process_retries,
            commit_retries: ingestor_cfg.commit_retries,
            retry_delay: ingestor_cfg.retry_delay,
        })
    }

    /// Runs the poll/process/commit loop until `cancel` fires. Each batch is
    /// processed and its publishes acked before the Kafka offsets backing it
    /// are committed, so a crash between publish and commit only risks a
    /// redundant republish, never a silent drop.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let (records, tpl) = tokio::select! {
                res = self.consumer.poll_batch(self.batch_max, self.flush_interval) => res?,
                _ = cancel.cancelled() => break,
            };

            if records.is_empty() {
                continue;
            }

            retry_fixed(self.process_retries, self.retry_delay, cancel, || {
                self.processor.process_batch(&records)
            })
            .await?;

            retry_fixed(self.commit_retries, self.retry_delay, cancel, || async {
                self.consumer.commit(&tpl)
            })
            .await?;
        }

        self.drain_on_shutdown().await;
        Ok(())
    }

    /// Runs once `cancel` has fired: whatever already arrived locally but
    /// never made it into a polled batch gets one short, independent
    /// attempt at processing and committing, so a shutdown racing the poll
    /// loop doesn't silently drop it. Uses a fresh token so this pass isn't
    /// itself short-circuited by the cancellation that triggered it;
    /// failures are logged, never propagated — shutdown must still
    /// complete.
    async fn drain_on_shutdown(&self) {
        let drain_cancel = CancellationToken::new();

        let (records, tpl) = match self.consumer.poll_batch(self.batch_max, SHUTDOWN_DRAIN_TIMEOUT).await {
            Ok(batch) => batch,
            Err(e) => {
                tracing::warn!(topic = self.topic_name(), error = %e, "shutdown drain poll failed");
                return;
            }
        };

        if records.is_empty() {
            return;
        }

        tracing::info!(topic = self.topic_name(), count = records.len(), "draining in-flight batch on shutdown");

        if let Err(e) = retry_fixed(self.process_retries, self.retry_delay, &drain_cancel, || {
            self.processor.process_batch(&records)
        })
        .await
        {
            tracing::warn!(topic = self.topic_name(), error = %e, "shutdown drain process failed");
            return;
        }

        if let Err(e) = retry_fixed(self.commit_retries, self.retry_delay, &drain_cancel, || async {
            self.consumer.commit(&tpl)
        })
        .await
        {
            tracing::warn!(topic = self.topic_name(), error = %e, "shutdown drain commit failed");
        }
    }

    pub fn topic_name(&self) -> &str {
        &self.consumer.topic().name
    }
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor").field("topic", &self.topic_name()).finish()
    }
}

/// Returns a config error up front when the named topic isn't declared,
/// instead of discovering it mid-run (spec: fail-fast topic lookup).
pub fn require_topic<'a>(ingestor: &'a IngestorConfig, name: &str) -> Result<&'a crate::config::TopicConfig> {
    ingestor
        .topic(name)
        .map_err(|_| PipelineError::config(format!("ingestor references undeclared topic '{}'", name)))
}
