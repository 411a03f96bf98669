//! Message bus client: a thin facade over `async_nats`'s JetStream API
//! covering exactly the operations the ingestor, join worker, and sink need
//! (stream/consumer provisioning, sync/async publish with bounded pending
//! acks, and a KV bucket for dedup state and pipeline metadata).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, consumer::pull::Config as PullConfig, stream::Config as StreamConfig};
use async_nats::jetstream::kv::Store as KvStore;
use async_nats::jetstream::Context as JsContext;
use futures::StreamExt;
use tokio::sync::Semaphore;

use crate::error::{PipelineError, Result};
use crate::model::BusMessage;

/// Bounds how many unacknowledged async publishes may be outstanding at
/// once, so a slow or unreachable bus applies backpressure instead of
/// letting the ack queue grow without limit.
const DEFAULT_MAX_PENDING_ACKS: usize = 512;

pub struct BusClient {
    js: JsContext,
    pending: Arc<Semaphore>,
}

impl BusClient {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| PipelineError::bus(format!("failed to connect to bus at {}: {}", url, e)))?;
        let js = jetstream::new(client);
        Ok(Self {
            js,
            pending: Arc::new(Semaphore::new(DEFAULT_MAX_PENDING_ACKS)),
        })
    }

    /// Idempotently creates (or reuses) a stream covering `subjects`.
    pub async fn ensure_stream(&self, stream_id: &str, subjects: Vec<String>) -> Result<()> {
        let config = StreamConfig {
            name: stream_id.to_string(),
            subjects,
            ..Default::default()
        };
        self.js
            .get_or_create_stream(config)
            .await
            .map_err(|e| PipelineError::bus(format!("ensure_stream({}): {}", stream_id, e)))?;
        Ok(())
    }

    /// Idempotently creates (or reuses) a durable pull consumer bound to
    /// `filter_subject` on `stream_id`.
    pub async fn durable_consumer(
        &self,
        stream_id: &str,
        durable_name: &str,
        filter_subject: &str,
    ) -> Result<jetstream::consumer::PullConsumer> {
        let stream = self
            .js
            .get_stream(stream_id)
            .await
            .map_err(|e| PipelineError::bus(format!("get_stream({}): {}", stream_id, e)))?;

        let config = PullConfig {
            durable_name: Some(durable_name.to_string()),
            filter_subject: filter_subject.to_string(),
            ..Default::default()
        };

        stream
            .get_or_create_consumer(durable_name, config)
            .await
            .map_err(|e| PipelineError::bus(format!("durable_consumer({}): {}", durable_name, e)))
    }

    /// Publishes and waits for the bus to acknowledge durable persistence.
    /// Used where a downstream worker cannot progress (commit an offset,
    /// evict a join window) until the publish is known-durable.
    pub async fn publish_sync(&self, msg: &BusMessage) -> Result<()> {
        let mut headers = async_nats::HeaderMap::new();
        for (k, v) in &msg.headers {
            headers.insert(k.as_str(), v.as_str());
        }
        let ack = self
            .js
            .publish_with_headers(msg.subject.clone(), headers, msg.data.clone().into())
            .await
            .map_err(|e| PipelineError::bus(format!("publish({}): {}", msg.subject, e)))?;
        ack.await
            .map_err(|e| PipelineError::bus(format!("publish ack({}): {}", msg.subject, e)))?;
        Ok(())
    }

    /// Publishes without waiting for the ack, bounded by the semaphore so at
    /// most `DEFAULT_MAX_PENDING_ACKS` publishes are in flight. Returns a
    /// future the caller can await later (e.g. a batch boundary) via
    /// `wait_for_async_acks`.
    pub async fn publish_async(&self, msg: &BusMessage) -> Result<PendingAck> {
        let permit = self
            .pending
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PipelineError::internal("bus publish semaphore closed"))?;

        let mut headers = async_nats::HeaderMap::new();
        for (k, v) in &msg.headers {
            headers.insert(k.as_str(), v.as_str());
        }
        let ack_future = self
            .js
            .publish_with_headers(msg.subject.clone(), headers, msg.data.clone().into())
            .await
            .map_err(|e| PipelineError::bus(format!("publish({}): {}", msg.subject, e)))?;

        Ok(PendingAck {
            subject: msg.subject.clone(),
            ack_future,
            _permit: permit,
        })
    }

    /// Awaits every outstanding async publish ack, surfacing the first
    /// failure encountered.
    pub async fn wait_for_async_acks(&self, acks: Vec<PendingAck>) -> Result<()> {
        for pending in acks {
            pending
                .ack_future
                .await
                .map_err(|e| PipelineError::bus(format!("publish ack({}): {}", pending.subject, e)))?;
        }
        Ok(())
    }

    /// Opens (creating if absent) the KV bucket used for dedup state or
    /// pipeline metadata, with `ttl` applied to every entry.
    pub async fn kv_open_or_create(&self, bucket: &str, ttl: Duration) -> Result<KvStore> {
        let config = jetstream::kv::Config {
            bucket: bucket.to_string(),
            max_age: ttl,
            ..Default::default()
        };
        self.js
            .create_key_value(config)
            .await
            .map_err(|e| PipelineError::bus(format!("kv_open_or_create({}): {}", bucket, e)))
    }

    pub async fn kv_get(&self, store: &KvStore, key: &str) -> Result<Option<Vec<u8>>> {
        store
            .get(key)
            .await
            .map_err(|e| PipelineError::bus(format!("kv_get({}): {}", key, e)))
            .map(|v| v.map(|b| b.to_vec()))
    }

    pub async fn kv_put(&self, store: &KvStore, key: &str, value: &[u8]) -> Result<()> {
        store
            .put(key, value.to_vec().into())
            .await
            .map_err(|e| PipelineError::bus(format!("kv_put({}): {}", key, e)))?;
        Ok(())
    }

    /// Number of messages still pending acknowledgement for `consumer`, used
    /// by the orchestrator's drain monitor to decide when a pause is safe.
    pub async fn stream_pending(&self, consumer: &jetstream::consumer::PullConsumer) -> Result<u64> {
        let info = consumer
            .cached_info();
        Ok(info.num_pending + info.num_ack_pending as u64)
    }

    /// Pulls up to `batch` messages, waiting at most `expires` for the
    /// first one. Used by the join worker and sink's pull loops.
    pub async fn fetch_batch(
        &self,
        consumer: &jetstream::consumer::PullConsumer,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<jetstream::Message>> {
        let mut messages = consumer
            .batch()
            .max_messages(batch)
            .expires(expires)
            .messages()
            .await
            .map_err(|e| PipelineError::bus(format!("fetch_batch: {}", e)))?;

        let mut out = Vec::with_capacity(batch);
        while let Some(next) = messages.next().await {
            match next {
                Ok(m) => out.push(m),
                Err(e) => return Err(PipelineError::bus(format!("fetch_batch message: {}", e))),
            }
        }
        Ok(out)
    }
}

/// An in-flight async publish ack, still holding its pending-acks permit.
pub struct PendingAck {
    subject: String,
    ack_future: jetstream::context::PublishAckFuture,
    _permit: tokio::sync::OwnedSemaphorePermit,
}

/// Builds the `Nats-Msg-Id` + freeform header map for a message carrying a
/// dedup id, falling back to no dedup header when `dedup_id` is `None`.
pub fn headers_with_dedup_id(dedup_id: Option<&str>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(id) = dedup_id {
        headers.insert("Nats-Msg-Id".to_string(), id.to_string());
    }
    headers
}
