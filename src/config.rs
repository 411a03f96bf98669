//! Pipeline configuration: one declared pipeline's sources, optional
//! join/filter/transform, and sink, plus stream sizing/TTL knobs. Immutable
//! for the lifetime of a run (§3 of the design doc).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialOffset {
    Earliest,
    Latest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DedupConfig {
    pub enabled: bool,
    pub key_path: Option<String>,
    #[serde(with = "humantime_serde_secs", default = "default_dedup_window")]
    pub window: Duration,
}

fn default_dedup_window() -> Duration {
    Duration::from_secs(300)
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_path: None,
            window: default_dedup_window(),
        }
    }
}

/// Per-topic ingestor configuration (§3: "Per-topic config").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TopicConfig {
    pub name: String,
    pub consumer_group: String,
    #[serde(default = "default_initial_offset")]
    pub initial_offset: InitialOffset,
    #[serde(default)]
    pub deduplication: DedupConfig,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    pub output_stream_id: String,
    pub output_stream_subject: String,
}

fn default_initial_offset() -> InitialOffset {
    InitialOffset::Earliest
}

fn default_replicas() -> u32 {
    1
}

impl TopicConfig {
    pub fn fans_out(&self) -> bool {
        self.replicas > 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct KafkaAuth {
    #[serde(default)]
    pub mechanism: KafkaAuthMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
    pub kerberos_keytab: Option<String>,
    pub kerberos_realm: Option<String>,
    pub kerberos_service_name: Option<String>,
    pub krb5_config_path: Option<String>,
    pub tls_client_cert: Option<String>,
    pub tls_client_key: Option<String>,
    pub tls_ca_cert: Option<String>,
    #[serde(default)]
    pub tls_enabled: bool,
}

impl Default for KafkaAuth {
    fn default() -> Self {
        Self {
            mechanism: KafkaAuthMechanism::None,
            username: None,
            password: None,
            kerberos_keytab: None,
            kerberos_realm: None,
            kerberos_service_name: None,
            krb5_config_path: None,
            tls_client_cert: None,
            tls_client_key: None,
            tls_ca_cert: None,
            tls_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KafkaAuthMechanism {
    #[default]
    None,
    Plain,
    ScramSha256,
    ScramSha512,
    Gssapi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct IngestorConfig {
    pub brokers: Vec<String>,
    #[serde(default)]
    pub auth: KafkaAuth,
    pub topics: Vec<TopicConfig>,
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    #[serde(with = "humantime_serde_millis", default = "default_flush_interval")]
    pub flush_interval: Duration,
    #[serde(default = "default_process_retries")]
    pub process_retries: u32,
    #[serde(default = "default_commit_retries")]
    pub commit_retries: u32,
    #[serde(with = "humantime_serde_millis", default = "default_retry_delay")]
    pub retry_delay: Duration,
}

fn default_batch_max() -> usize {
    1000
}
fn default_flush_interval() -> Duration {
    Duration::from_millis(1000)
}
fn default_process_retries() -> u32 {
    3
}
fn default_commit_retries() -> u32 {
    3
}
fn default_retry_delay() -> Duration {
    Duration::from_millis(200)
}

impl IngestorConfig {
    pub fn topic(&self, name: &str) -> Result<&TopicConfig> {
        self.topics
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| PipelineError::config(format!("unknown topic '{}'", name)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinOrientation {
    Left,
    Right,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JoinSourceConfig {
    pub source_stream_id: String,
    pub source_subject: String,
    pub orientation: JoinOrientation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JoinConfig {
    pub left: JoinSourceConfig,
    pub right: JoinSourceConfig,
    pub join_key_path: String,
    #[serde(with = "humantime_serde_secs", default = "default_join_window")]
    pub window: Duration,
    pub sink_stream_id: String,
    pub sink_subject: String,
}

fn default_join_window() -> Duration {
    Duration::from_secs(60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FilterConfig {
    /// Expression-language filter is an external collaborator (out of
    /// scope); only the reference to it is carried here.
    pub expression: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TransformConfig {
    /// Expression-language transform is an external collaborator (out of
    /// scope); only the reference to it is carried here.
    pub expression: String,
}

/// One destination column: ClickHouse column name, declared type, and the
/// JSON field path in the inbound message it is sourced from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ColumnMapping {
    pub source_field: String,
    pub column_name: String,
    pub column_type: ColumnType,
    #[serde(default)]
    pub nullable: bool,
}

/// The ClickHouse type universe the sink's columnar batch builder supports
/// (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ColumnType {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    Bool,
    String,
    FixedString { length: usize },
    DateTime,
    DateTime64 { precision: u8 },
    Uuid,
    LowCardinalityString,
    Array { element: Box<ColumnType> },
    Map { value: Box<ColumnType> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SinkConfig {
    pub clickhouse_url: String,
    pub database: String,
    pub table: String,
    pub columns: Vec<ColumnMapping>,
    #[serde(default = "default_batch_max")]
    pub batch_max: usize,
    #[serde(with = "humantime_serde_millis", default = "default_flush_interval")]
    pub flush_interval: Duration,
    #[serde(default = "default_sink_retries")]
    pub insert_retries: u32,
    pub sink_stream_id: String,
    pub sink_subject: String,
}

fn default_sink_retries() -> u32 {
    3
}

/// Field list per source used by the schema mapper/validator (§3: "mapper").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MapperFieldConfig {
    pub field_path: String,
    pub required: bool,
    pub field_type: MapperFieldType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapperFieldType {
    String,
    Integer,
    Float,
    Bool,
    Object,
    Array,
    Any,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct StreamSizingConfig {
    #[serde(with = "humantime_serde_secs", default = "default_watcher_interval")]
    pub watcher_interval: Duration,
    #[serde(with = "humantime_serde_secs", default = "default_restart_delay")]
    pub watcher_restart_delay: Duration,
    #[serde(with = "humantime_serde_secs", default = "default_drain_interval")]
    pub drain_poll_interval: Duration,
}

fn default_watcher_interval() -> Duration {
    Duration::from_secs(5)
}
fn default_restart_delay() -> Duration {
    Duration::from_secs(5)
}
fn default_drain_interval() -> Duration {
    Duration::from_secs(2)
}

impl Default for StreamSizingConfig {
    fn default() -> Self {
        Self {
            watcher_interval: default_watcher_interval(),
            watcher_restart_delay: default_restart_delay(),
            drain_poll_interval: default_drain_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineConfig {
    pub pipeline_id: String,
    pub nats_url: String,
    pub ingestor: IngestorConfig,
    pub join: Option<JoinConfig>,
    pub filter: Option<FilterConfig>,
    pub transform: Option<TransformConfig>,
    pub sink: SinkConfig,
    #[serde(default)]
    pub mapper: HashMap<String, Vec<MapperFieldConfig>>,
    #[serde(default)]
    pub stream_sizing: StreamSizingConfig,
}

impl PipelineConfig {
    /// Loads the declared file, then layers environment overrides on top:
    /// `SIEM_ETL_*` is the current prefix, `ETL_*` is accepted for
    /// backward compatibility with older deployments.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file_format = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => config::FileFormat::Yaml,
            _ => config::FileFormat::Toml,
        };

        let builder = config::Config::builder()
            .add_source(config::File::from(path).format(file_format))
            .add_source(config::Environment::with_prefix("ETL").separator("__"))
            .add_source(config::Environment::with_prefix("SIEM_ETL").separator("__"));

        let loaded = builder
            .build()
            .map_err(|e| PipelineError::config(format!("failed to load config: {}", e)))?;

        let config: PipelineConfig = loaded
            .try_deserialize()
            .map_err(|e| PipelineError::config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validates referential integrity between declared components. Spec §7:
    /// configuration-invariant errors are fatal at setup, never retried.
    pub fn validate(&self) -> Result<()> {
        if self.ingestor.topics.is_empty() {
            return Err(PipelineError::config("pipeline must declare at least one topic"));
        }

        let mut seen_names = std::collections::HashSet::new();
        for topic in &self.ingestor.topics {
            if !seen_names.insert(topic.name.as_str()) {
                return Err(PipelineError::config(format!(
                    "duplicate topic name '{}'",
                    topic.name
                )));
            }
            if topic.deduplication.enabled && topic.deduplication.key_path.is_none() {
                return Err(PipelineError::config(format!(
                    "topic '{}' enables deduplication without a key_path",
                    topic.name
                )));
            }
        }

        if let Some(join) = &self.join {
            let stream_ids: Vec<&str> = self
                .ingestor
                .topics
                .iter()
                .map(|t| t.output_stream_id.as_str())
                .collect();
            if !stream_ids.contains(&join.left.source_stream_id.as_str()) {
                return Err(PipelineError::config(format!(
                    "join left source stream '{}' is not produced by any topic",
                    join.left.source_stream_id
                )));
            }
            if !stream_ids.contains(&join.right.source_stream_id.as_str()) {
                return Err(PipelineError::config(format!(
                    "join right source stream '{}' is not produced by any topic",
                    join.right.source_stream_id
                )));
            }
        }

        for col in &self.sink.columns {
            if col.column_name.is_empty() {
                return Err(PipelineError::config("sink column mapping with empty column_name"));
            }
        }

        Ok(())
    }
}

/// Minimal humantime-like (de)serializers so duration fields can be written
/// as plain integers (seconds/millis) in TOML/YAML without pulling in a
/// dedicated humantime dependency for a handful of fields.
mod humantime_serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod humantime_serde_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> PipelineConfig {
        PipelineConfig {
            pipeline_id: "pl-1".into(),
            nats_url: "nats://localhost:4222".into(),
            ingestor: IngestorConfig {
                brokers: vec!["localhost:9092".into()],
                auth: KafkaAuth::default(),
                topics: vec![TopicConfig {
                    name: "orders".into(),
                    consumer_group: "pl-1-orders".into(),
                    initial_offset: InitialOffset::Earliest,
                    deduplication: DedupConfig::default(),
                    replicas: 1,
                    output_stream_id: "pl-1-orders".into(),
                    output_stream_subject: "pl-1-orders".into(),
                }],
                batch_max: default_batch_max(),
                flush_interval: default_flush_interval(),
                process_retries: default_process_retries(),
                commit_retries: default_commit_retries(),
                retry_delay: default_retry_delay(),
            },
            join: None,
            filter: None,
            transform: None,
            sink: SinkConfig {
                clickhouse_url: "tcp://localhost:9000".into(),
                database: "default".into(),
                table: "orders".into(),
                columns: vec![ColumnMapping {
                    source_field: "id".into(),
                    column_name: "id".into(),
                    column_type: ColumnType::Int64,
                    nullable: false,
                }],
                batch_max: default_batch_max(),
                flush_interval: default_flush_interval(),
                insert_retries: default_sink_retries(),
                sink_stream_id: "pl-1-sink".into(),
                sink_subject: "pl-1-sink".into(),
            },
            mapper: HashMap::new(),
            stream_sizing: StreamSizingConfig::default(),
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn rejects_duplicate_topic_names() {
        let mut cfg = sample_config();
        let dup = cfg.ingestor.topics[0].clone();
        cfg.ingestor.topics.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_dedup_enabled_without_key_path() {
        let mut cfg = sample_config();
        cfg.ingestor.topics[0].deduplication = DedupConfig {
            enabled: true,
            key_path: None,
            window: Duration::from_secs(10),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_join_referencing_unknown_stream() {
        let mut cfg = sample_config();
        cfg.join = Some(JoinConfig {
            left: JoinSourceConfig {
                source_stream_id: "does-not-exist".into(),
                source_subject: "does-not-exist".into(),
                orientation: JoinOrientation::Left,
            },
            right: JoinSourceConfig {
                source_stream_id: "pl-1-orders".into(),
                source_subject: "pl-1-orders".into(),
                orientation: JoinOrientation::Right,
            },
            join_key_path: "id".into(),
            window: Duration::from_secs(60),
            sink_stream_id: "pl-1-sink".into(),
            sink_subject: "pl-1-sink".into(),
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = sample_config();
        let toml_str = toml::to_string(&cfg).expect("serialize");
        let parsed: PipelineConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.pipeline_id, cfg.pipeline_id);
        assert_eq!(parsed.ingestor.topics.len(), cfg.ingestor.topics.len());
    }
}
