//! Pipeline metadata store: a KV bucket mapping `pipeline_id` to its
//! persisted component envelope, plus a separate health record, so the
//! orchestrator can recover what it knows about a pipeline after a restart
//! without re-deriving it from scratch.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bus::BusClient;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::model::{PipelineHealth, PipelineStatus};

const METADATA_BUCKET: &str = "pipeline_metadata";
const METADATA_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

fn health_key(pipeline_id: &str) -> String {
    format!("{}::health", pipeline_id)
}

/// The kind of component a persisted component entry describes. Matches the
/// wire vocabulary in SPEC_FULL.md §6, not this crate's internal module
/// names (`ingestor`/`join`/`sink`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    KafkaSource,
    Joiner,
    ClickhouseSink,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentEntry {
    pub component_id: String,
    pub component_kind: ComponentKind,
    pub config: Value,
}

/// The wire-level envelope persisted under `pipeline_id` in the metadata KV
/// bucket (SPEC_FULL.md §6): a flat component list plus a downstream map,
/// rather than a verbatim dump of this crate's own `PipelineConfig`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedPipeline {
    pub components: Vec<ComponentEntry>,
    pub output_maps: std::collections::HashMap<String, Vec<String>>,
}

impl PersistedPipeline {
    /// Derives the persisted envelope from a live `PipelineConfig`: one
    /// `kafka-source` entry per topic, an optional `joiner` entry, one
    /// `clickhouse-sink` entry, wired together by `output_maps` in the same
    /// shape the orchestrator's own stream wiring uses (§4.8 step 5: join
    /// enabled routes ingestor output through the joiner, otherwise straight
    /// to the sink).
    pub fn from_config(config: &PipelineConfig) -> Result<Self> {
        let sink_id = "sink".to_string();
        let mut components = Vec::with_capacity(config.ingestor.topics.len() + 2);
        let mut output_maps = std::collections::HashMap::new();

        let downstream_of_sources = if config.join.is_some() {
            "join".to_string()
        } else {
            sink_id.clone()
        };

        for topic in &config.ingestor.topics {
            components.push(ComponentEntry {
                component_id: topic.name.clone(),
                component_kind: ComponentKind::KafkaSource,
                config: serde_json::to_value(topic)?,
            });
            output_maps.insert(topic.name.clone(), vec![downstream_of_sources.clone()]);
        }

        if let Some(join) = &config.join {
            components.push(ComponentEntry {
                component_id: "join".to_string(),
                component_kind: ComponentKind::Joiner,
                config: serde_json::to_value(join)?,
            });
            output_maps.insert("join".to_string(), vec![sink_id.clone()]);
        }

        components.push(ComponentEntry {
            component_id: sink_id,
            component_kind: ComponentKind::ClickhouseSink,
            config: serde_json::to_value(&config.sink)?,
        });

        Ok(Self { components, output_maps })
    }
}

#[derive(Clone)]
pub struct MetadataStore {
    bus: Arc<BusClient>,
}

impl MetadataStore {
    pub fn new(bus: Arc<BusClient>) -> Self {
        Self { bus }
    }

    /// Persists the pipeline's component envelope and its initial health
    /// status. The envelope is derived from `config`, not a verbatim dump of
    /// it, per the wire shape in SPEC_FULL.md §6.
    pub async fn put(&self, pipeline_id: &str, config: &PipelineConfig, status: PipelineStatus) -> Result<()> {
        let store = self.bus.kv_open_or_create(METADATA_BUCKET, METADATA_TTL).await?;
        let envelope = PersistedPipeline::from_config(config)?;
        let data = serde_json::to_vec(&envelope)?;
        self.bus.kv_put(&store, pipeline_id, &data).await?;
        self.put_health(pipeline_id, status).await
    }

    pub async fn get(&self, pipeline_id: &str) -> Result<Option<PersistedPipeline>> {
        let store = self.bus.kv_open_or_create(METADATA_BUCKET, METADATA_TTL).await?;
        match self.bus.kv_get(&store, pipeline_id).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Writes just the `PipelineHealth` status record, without touching the
    /// stored config. Used for transitions (pause/resume/drain/watcher
    /// restart) that don't change the pipeline's definition.
    pub async fn put_health(&self, pipeline_id: &str, status: PipelineStatus) -> Result<()> {
        let store = self.bus.kv_open_or_create(METADATA_BUCKET, METADATA_TTL).await?;
        let health = PipelineHealth::new(pipeline_id, status);
        let data = serde_json::to_vec(&health)?;
        self.bus.kv_put(&store, &health_key(pipeline_id), &data).await
    }

    pub async fn get_health(&self, pipeline_id: &str) -> Result<Option<PipelineHealth>> {
        let store = self.bus.kv_open_or_create(METADATA_BUCKET, METADATA_TTL).await?;
        match self.bus.kv_get(&store, &health_key(pipeline_id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::*;
    use std::collections::HashMap as Map;

    #[test]
    fn health_key_is_namespaced_apart_from_the_config_key() {
        let key = health_key("orders-pipeline");
        assert_eq!(key, "orders-pipeline::health");
        assert_ne!(key, "orders-pipeline");
    }

    fn topic(name: &str) -> TopicConfig {
        TopicConfig {
            name: name.to_string(),
            consumer_group: format!("{}-cg", name),
            initial_offset: InitialOffset::Earliest,
            deduplication: DedupConfig::default(),
            replicas: 1,
            output_stream_id: format!("{}-stream", name),
            output_stream_subject: format!("{}.events", name),
        }
    }

    fn sink() -> SinkConfig {
        SinkConfig {
            clickhouse_url: "tcp://localhost:9000".to_string(),
            database: "default".to_string(),
            table: "orders".to_string(),
            columns: vec![],
            batch_max: 1000,
            flush_interval: Duration::from_millis(1000),
            insert_retries: 3,
            sink_stream_id: "sink-stream".to_string(),
            sink_subject: "sink.rows".to_string(),
        }
    }

    fn config_without_join() -> PipelineConfig {
        PipelineConfig {
            pipeline_id: "orders-pipeline".to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            ingestor: IngestorConfig {
                brokers: vec!["localhost:9092".to_string()],
                auth: KafkaAuth::default(),
                topics: vec![topic("orders")],
                batch_max: 1000,
                flush_interval: Duration::from_millis(1000),
                process_retries: 3,
                commit_retries: 3,
                retry_delay: Duration::from_millis(200),
            },
            join: None,
            filter: None,
            transform: None,
            sink: sink(),
            mapper: Map::new(),
            stream_sizing: StreamSizingConfig::default(),
        }
    }

    #[test]
    fn persisted_pipeline_routes_source_straight_to_sink_without_join() {
        let envelope = PersistedPipeline::from_config(&config_without_join()).unwrap();
        let kinds: Vec<_> = envelope.components.iter().map(|c| c.component_kind).collect();
        assert_eq!(kinds, vec![ComponentKind::KafkaSource, ComponentKind::ClickhouseSink]);
        assert_eq!(envelope.output_maps.get("orders"), Some(&vec!["sink".to_string()]));
    }

    #[test]
    fn persisted_pipeline_routes_source_through_join_when_configured() {
        let mut config = config_without_join();
        config.join = Some(JoinConfig {
            left: JoinSourceConfig {
                source_stream_id: "orders-stream".to_string(),
                source_subject: "orders.events".to_string(),
                orientation: JoinOrientation::Left,
            },
            right: JoinSourceConfig {
                source_stream_id: "shipments-stream".to_string(),
                source_subject: "shipments.events".to_string(),
                orientation: JoinOrientation::Right,
            },
            join_key_path: "order_id".to_string(),
            window: Duration::from_secs(60),
            sink_stream_id: "sink-stream".to_string(),
            sink_subject: "sink.rows".to_string(),
        });

        let envelope = PersistedPipeline::from_config(&config).unwrap();
        assert_eq!(envelope.output_maps.get("orders"), Some(&vec!["join".to_string()]));
        assert_eq!(envelope.output_maps.get("join"), Some(&vec!["sink".to_string()]));
        assert!(envelope.components.iter().any(|c| c.component_kind == ComponentKind::Joiner));
    }
}
