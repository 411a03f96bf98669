//! Batched Kafka consumer: polls `rdkafka`, accumulates records, and leaves
//! commit timing to the caller so the processor can apply the bus publish
//! before any offset is made durable.

use std::time::Duration;

use chrono::Utc;
use rdkafka::client::ClientContext;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{ClientConfig, Offset, TopicPartitionList};

use crate::config::{InitialOffset, IngestorConfig, KafkaAuth, KafkaAuthMechanism, TopicConfig};
use crate::error::{PipelineError, Result};
use crate::model::Record;

struct PipelineConsumerContext {
    pipeline_id: String,
}

impl ClientContext for PipelineConsumerContext {}

impl ConsumerContext for PipelineConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        tracing::info!(pipeline_id = %self.pipeline_id, ?rebalance, "kafka pre-rebalance");
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        tracing::info!(pipeline_id = %self.pipeline_id, ?rebalance, "kafka post-rebalance");
    }
}

type PipelineStreamConsumer = StreamConsumer<PipelineConsumerContext>;

pub struct KafkaConsumer {
    consumer: PipelineStreamConsumer,
    topic: TopicConfig,
}

impl KafkaConsumer {
    pub fn new(pipeline_id: &str, ingestor: &IngestorConfig, topic: TopicConfig) -> Result<Self> {
        let brokers = ingestor.brokers.join(",");
        let offset_reset = match topic.initial_offset {
            InitialOffset::Earliest => "earliest",
            InitialOffset::Latest => "latest",
        };

        let mut client_config = ClientConfig::new();
        client_config
            .set("group.id", &topic.consumer_group)
            .set("bootstrap.servers", &brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", offset_reset)
            .set("session.timeout.ms", "6000")
            .set("max.poll.interval.ms", "300000")
            .set_log_level(RDKafkaLogLevel::Info);

        apply_auth(&mut client_config, &ingestor.auth);

        let context = PipelineConsumerContext {
            pipeline_id: pipeline_id.to_string(),
        };

        let consumer: PipelineStreamConsumer = client_config
            .create_with_context(context)
            .map_err(|e| PipelineError::config(format!("failed to create kafka consumer: {}", e)))?;

        consumer
            .subscribe(&[&topic.name])
            .map_err(|e| PipelineError::config(format!("failed to subscribe to topic '{}': {}", topic.name, e)))?;

        Ok(Self { consumer, topic })
    }

    /// Blocks for at most `max_wait` collecting up to `max_batch` records.
    /// Returns early once `max_batch` is reached or a message arrives after
    /// the wait has already elapsed once.
    pub async fn poll_batch(&self, max_batch: usize, max_wait: Duration) -> Result<(Vec<Record>, TopicPartitionList)> {
        let mut records = Vec::with_capacity(max_batch);
        let mut tpl = TopicPartitionList::new();
        let deadline = tokio::time::Instant::now() + max_wait;

        while records.len() < max_batch {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(msg)) => {
                    let record = Record {
                        topic: msg.topic().to_string(),
                        partition: msg.partition(),
                        offset: msg.offset(),
                        key: msg.key().map(|k| k.to_vec()),
                        value: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
                        headers: Default::default(),
                        arrival_time: Utc::now(),
                    };
                    tpl.add_partition_offset(msg.topic(), msg.partition(), Offset::Offset(msg.offset() + 1))
                        .map_err(|e| PipelineError::internal(format!("failed to track offset: {}", e)))?;
                    records.push(record);
                }
                Ok(Err(e)) => return Err(PipelineError::Kafka(e)),
                Err(_) => break,
            }
        }

        Ok((records, tpl))
    }

    pub fn commit(&self, tpl: &TopicPartitionList) -> Result<()> {
        if tpl.count() == 0 {
            return Ok(());
        }
        self.consumer
            .commit(tpl, CommitMode::Sync)
            .map_err(|e| PipelineError::internal(format!("failed to commit offsets: {}", e)))
    }

    pub fn topic(&self) -> &TopicConfig {
        &self.topic
    }
}

fn apply_auth(client_config: &mut ClientConfig, auth: &KafkaAuth) {
    match auth.mechanism {
        KafkaAuthMechanism::None => {
            // No SASL mechanism: root-only or mutual TLS is still possible,
            // but rdkafka defaults security.protocol to PLAINTEXT, which
            // would silently disable it unless we set SSL explicitly here.
            if auth.tls_enabled {
                client_config.set("security.protocol", "SSL");
            }
        }
        KafkaAuthMechanism::Plain | KafkaAuthMechanism::ScramSha256 | KafkaAuthMechanism::ScramSha512 => {
            let mechanism = match auth.mechanism {
                KafkaAuthMechanism::Plain => "PLAIN",
                KafkaAuthMechanism::ScramSha256 => "SCRAM-SHA-256",
                KafkaAuthMechanism::ScramSha512 => "SCRAM-SHA-512",
                _ => unreachable!(),
            };
            client_config.set("security.protocol", "SASL_SSL");
            client_config.set("sasl.mechanism", mechanism);
            if let Some(u) = &auth.username {
                client_config.set("sasl.username", u);
            }
            if let Some(p) = &auth.password {
                client_config.set("sasl.password", p);
            }
        }
        KafkaAuthMechanism::Gssapi => {
            client_config.set("security.protocol", "SASL_PLAINTEXT");
            client_config.set("sasl.mechanism", "GSSAPI");
            if let Some(service) = &auth.kerberos_service_name {
                client_config.set("sasl.kerberos.service.name", service);
            }
            if let Some(keytab) = &auth.kerberos_keytab {
                client_config.set("sasl.kerberos.keytab", keytab);
            }
        }
    }

    if auth.tls_enabled {
        if let Some(ca) = &auth.tls_ca_cert {
            client_config.set("ssl.ca.location", ca);
        }
        if let Some(cert) = &auth.tls_client_cert {
            client_config.set("ssl.certificate.location", cert);
        }
        if let Some(key) = &auth.tls_client_key {
            client_config.set("ssl.key.location", key);
        }
    }
}
