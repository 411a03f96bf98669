//! End-to-end config loading: parses a full pipeline definition from a TOML
//! fixture on disk, the same path `etl-pipeline run --config` exercises.

use std::io::Write;

use streaming_etl_pipeline::config::PipelineConfig;

fn write_fixture(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().expect("create temp file");
    file.write_all(contents.as_bytes()).expect("write fixture");
    file
}

const VALID_PIPELINE: &str = r#"
pipeline_id = "orders-pipeline"
nats_url = "nats://localhost:4222"

[ingestor]
brokers = ["localhost:9092"]

[[ingestor.topics]]
name = "orders"
consumer_group = "orders-pipeline-orders"
output_stream_id = "orders-pipeline-orders"
output_stream_subject = "orders-pipeline.orders"

[ingestor.topics.deduplication]
enabled = true
key_path = "order_id"
window = 300

[sink]
clickhouse_url = "tcp://localhost:9000"
database = "default"
table = "orders"
sink_stream_id = "orders-pipeline-sink"
sink_subject = "orders-pipeline.sink"

[[sink.columns]]
source_field = "order_id"
column_name = "order_id"
nullable = false
[sink.columns.column_type]
kind = "string"
"#;

#[test]
fn loads_and_validates_a_well_formed_pipeline() {
    let fixture = write_fixture(VALID_PIPELINE);
    let config = PipelineConfig::load(fixture.path()).expect("config should load and validate");
    assert_eq!(config.pipeline_id, "orders-pipeline");
    assert_eq!(config.ingestor.topics.len(), 1);
    assert!(config.ingestor.topics[0].deduplication.enabled);
}

#[test]
fn rejects_pipeline_with_no_topics() {
    let fixture = write_fixture(
        r#"
pipeline_id = "empty-pipeline"
nats_url = "nats://localhost:4222"

[ingestor]
brokers = ["localhost:9092"]
topics = []

[sink]
clickhouse_url = "tcp://localhost:9000"
database = "default"
table = "orders"
sink_stream_id = "empty-sink"
sink_subject = "empty.sink"
columns = []
"#,
    );

    let result = PipelineConfig::load(fixture.path());
    assert!(result.is_err());
}

#[test]
fn rejects_malformed_toml() {
    let fixture = write_fixture("this is not valid toml {{{");
    let result = PipelineConfig::load(fixture.path());
    assert!(result.is_err());
}
