//! Per-pipeline orchestrator: owns at most one non-empty pipeline's worker
//! set, drives its state machine (Empty → Provisioning → Running →
//! (Paused | Stopping) → Stopped | Failed), and runs the Runner Watcher that
//! restarts a crashed component after a fixed delay.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::BusClient;
use crate::config::PipelineConfig;
use crate::dlq::dlq_subject;
use crate::error::{PipelineError, Result};
use crate::join::JoinWorker;
use crate::kafka::Ingestor;
use crate::metadata::MetadataStore;
use crate::metrics;
use crate::model::PipelineStatus;
use crate::runner::{Component, IngestorRunner, JoinRunner, SinkRunner};
use crate::schema::{SchemaValidator, StructuralValidator};
use crate::sink::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrchestratorState {
    Empty,
    Provisioning,
    Running,
    /// Ingestors have been told to stop; waiting for the sink-drain monitor
    /// to observe an empty backlog before flipping to `Paused`.
    Pausing,
    Paused,
    Stopping,
    Stopped,
    Failed,
}

/// Identifies one durable consumer whose pending count must reach zero
/// before a pause is considered fully drained.
struct DrainTarget {
    stream_id: String,
    durable_name: String,
    filter_subject: String,
}

struct Inner {
    state: OrchestratorState,
    pipeline_id: Option<String>,
    drain_targets: Vec<DrainTarget>,
}

type Components = Arc<AsyncMutex<Vec<Box<dyn Component>>>>;

/// Owns the lifecycle of a single pipeline. One orchestrator instance
/// manages one pipeline at a time; attempting to provision a second while
/// the first is non-Empty is a quota violation.
pub struct Orchestrator {
    bus: Arc<BusClient>,
    metadata: MetadataStore,
    inner: Arc<Mutex<Inner>>,
    components: Components,
    watcher: AsyncMutex<Option<JoinHandle<()>>>,
    watcher_cancel: Mutex<Option<CancellationToken>>,
    drain_cancel: Mutex<Option<CancellationToken>>,
}

impl Orchestrator {
    pub fn new(bus: Arc<BusClient>) -> Self {
        let metadata = MetadataStore::new(bus.clone());
        Self {
            bus,
            metadata,
            inner: Arc::new(Mutex::new(Inner {
                state: OrchestratorState::Empty,
                pipeline_id: None,
                drain_targets: Vec::new(),
            })),
            components: Arc::new(AsyncMutex::new(Vec::new())),
            watcher: AsyncMutex::new(None),
            watcher_cancel: Mutex::new(None),
            drain_cancel: Mutex::new(None),
        }
    }

    /// Provisions and starts every declared component for `config`. Fails
    /// fast (no components started) if this orchestrator already owns a
    /// non-Empty pipeline, enforcing the one-pipeline-per-orchestrator quota.
    pub async fn provision(&self, config: PipelineConfig) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != OrchestratorState::Empty {
                return Err(PipelineError::QuotaReached(format!(
                    "orchestrator already owns pipeline '{}'",
                    inner.pipeline_id.clone().unwrap_or_default()
                )));
            }
            inner.state = OrchestratorState::Provisioning;
            inner.pipeline_id = Some(config.pipeline_id.clone());
        }

        config.validate()?;
        self.metadata.put(&config.pipeline_id, &config, PipelineStatus::Pending).await?;

        if let Err(e) = self.ensure_infrastructure(&config).await {
            self.fail(&config.pipeline_id);
            return Err(e);
        }

        let validator: Arc<dyn SchemaValidator> = Arc::new(StructuralValidator::new(config.mapper.clone()));
        let mut components: Vec<Box<dyn Component>> = Vec::new();

        for topic in &config.ingestor.topics {
            match Ingestor::new(&config, &topic.name, self.bus.clone(), validator.clone()) {
                Ok(ingestor) => components.push(Box::new(IngestorRunner::new(
                    format!("ingestor:{}", topic.name),
                    ingestor,
                ))),
                Err(e) => {
                    self.fail(&config.pipeline_id);
                    return Err(e);
                }
            }
        }

        if config.join.is_some() {
            match JoinWorker::new(&config, self.bus.clone()) {
                Ok(worker) => components.push(Box::new(JoinRunner::new("join", worker))),
                Err(e) => {
                    self.fail(&config.pipeline_id);
                    return Err(e);
                }
            }
        }

        components.push(Box::new(SinkRunner::new("sink", Sink::new(&config, self.bus.clone()))));

        for component in &mut components {
            component.start().await?;
        }

        *self.components.lock().await = components;

        {
            let mut inner = self.inner.lock();
            inner.state = OrchestratorState::Running;
        }
        self.metadata.put(&config.pipeline_id, &config, PipelineStatus::Running).await?;

        self.start_watcher(config).await;
        Ok(())
    }

    async fn ensure_infrastructure(&self, config: &PipelineConfig) -> Result<()> {
        for topic in &config.ingestor.topics {
            self.bus
                .ensure_stream(&topic.output_stream_id, vec![topic.output_stream_subject.clone()])
                .await?;
        }
        if let Some(join) = &config.join {
            self.bus
                .ensure_stream(&join.sink_stream_id, vec![join.sink_subject.clone()])
                .await?;
        }
        self.bus
            .ensure_stream(&config.sink.sink_stream_id, vec![config.sink.sink_subject.clone()])
            .await?;
        let dlq = dlq_subject(&config.pipeline_id);
        self.bus.ensure_stream(&dlq, vec![dlq.clone()]).await?;

        let mut targets = vec![DrainTarget {
            stream_id: config.sink.sink_stream_id.clone(),
            durable_name: "sink".to_string(),
            filter_subject: config.sink.sink_subject.clone(),
        }];
        if let Some(join) = &config.join {
            targets.push(DrainTarget {
                stream_id: join.left.source_stream_id.clone(),
                durable_name: format!("join-left-{}", join.sink_stream_id),
                filter_subject: join.left.source_subject.clone(),
            });
            targets.push(DrainTarget {
                stream_id: join.right.source_stream_id.clone(),
                durable_name: format!("join-right-{}", join.sink_stream_id),
                filter_subject: join.right.source_subject.clone(),
            });
        }
        self.inner.lock().drain_targets = targets;

        Ok(())
    }

    fn fail(&self, pipeline_id: &str) {
        let mut inner = self.inner.lock();
        inner.state = OrchestratorState::Failed;
        drop(inner);
        tracing::error!(pipeline_id, "pipeline provisioning failed");
    }

    /// Pauses intake immediately (only ingestors actually stop; join and
    /// sink `pause()` calls are no-ops) and spawns a background monitor that
    /// polls every `DrainTarget`'s pending count down to zero before the
    /// pipeline is considered fully `Paused`.
    pub async fn pause(&self) -> Result<()> {
        let (pipeline_id, targets, poll_interval) = {
            let mut inner = self.inner.lock();
            if inner.state != OrchestratorState::Running {
                return Err(PipelineError::internal("pause requires a running pipeline"));
            }
            inner.state = OrchestratorState::Pausing;
            let pipeline_id = inner.pipeline_id.clone().unwrap_or_default();
            let targets: Vec<(String, String, String)> = inner
                .drain_targets
                .iter()
                .map(|t| (t.stream_id.clone(), t.durable_name.clone(), t.filter_subject.clone()))
                .collect();
            (pipeline_id, targets, Duration::from_secs(1))
        };

        let mut components = self.components.lock().await;
        for component in components.iter_mut() {
            component.pause().await?;
        }
        drop(components);

        let cancel = CancellationToken::new();
        *self.drain_cancel.lock() = Some(cancel.clone());

        let bus = self.bus.clone();
        let metadata = self.metadata.clone();
        let inner = self.inner.clone();
        let drain_cancel = cancel.clone();

        tokio::spawn(async move {
            loop {
                if drain_cancel.is_cancelled() {
                    return;
                }

                let mut all_drained = true;
                for (stream_id, durable_name, filter_subject) in &targets {
                    match bus.durable_consumer(stream_id, durable_name, filter_subject).await {
                        Ok(consumer) => match bus.stream_pending(&consumer).await {
                            Ok(0) => {}
                            Ok(_) => all_drained = false,
                            Err(e) => {
                                tracing::warn!(error = %e, durable_name, "drain monitor: pending check failed");
                                all_drained = false;
                            }
                        },
                        Err(e) => {
                            tracing::warn!(error = %e, durable_name, "drain monitor: consumer lookup failed");
                            all_drained = false;
                        }
                    }
                }

                if all_drained {
                    let mut guard = inner.lock();
                    if guard.state == OrchestratorState::Pausing {
                        guard.state = OrchestratorState::Paused;
                    }
                    drop(guard);
                    if let Err(e) = metadata.put_health(&pipeline_id, PipelineStatus::Paused).await {
                        tracing::error!(error = %e, pipeline_id, "failed to persist paused health");
                    }
                    return;
                }

                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = drain_cancel.cancelled() => return,
                }
            }
        });

        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if inner.state != OrchestratorState::Paused && inner.state != OrchestratorState::Pausing {
                return Err(PipelineError::internal("resume requires a paused pipeline"));
            }
            inner.state = OrchestratorState::Running;
        }

        if let Some(cancel) = self.drain_cancel.lock().take() {
            cancel.cancel();
        }

        let mut components = self.components.lock().await;
        for component in components.iter_mut() {
            component.resume().await?;
        }
        Ok(())
    }

    /// Shuts down the orchestrator's owned pipeline. `pipeline_id` must
    /// match the one currently provisioned; a mismatch (including shutting
    /// down an already-empty orchestrator) is reported as not-found rather
    /// than silently tearing down whatever happens to be running (§4.8:
    /// "Mismatched pipeline_id yields not found").
    pub async fn shutdown(&self, pipeline_id: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            match &inner.pipeline_id {
                Some(owned) if owned == pipeline_id => {}
                _ => return Err(PipelineError::not_found(format!("pipeline '{}' not found", pipeline_id))),
            }
            inner.state = OrchestratorState::Stopping;
        }

        if let Some(cancel) = self.drain_cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(cancel) = self.watcher_cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(handle) = self.watcher.lock().await.take() {
            let _ = handle.await;
        }

        let mut components = self.components.lock().await;
        for component in components.iter_mut() {
            component.shutdown().await?;
        }
        components.clear();

        let mut inner = self.inner.lock();
        inner.state = OrchestratorState::Stopped;
        inner.pipeline_id = None;
        inner.drain_targets.clear();
        Ok(())
    }

    /// Periodically checks whether any component has exited and restarts it
    /// after `watcher_restart_delay`. Runs until `shutdown` cancels it.
    async fn start_watcher(&self, config: PipelineConfig) {
        let cancel = CancellationToken::new();
        *self.watcher_cancel.lock() = Some(cancel.clone());

        let interval = config.stream_sizing.watcher_interval;
        let restart_delay = config.stream_sizing.watcher_restart_delay;
        let components = self.components.clone();
        let watcher_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = watcher_cancel.cancelled() => return,
                }

                let mut components = components.lock().await;
                for component in components.iter_mut() {
                    if component.done() {
                        tracing::warn!(component = component.name(), "component exited, restarting after delay");
                        tokio::select! {
                            _ = tokio::time::sleep(restart_delay) => {}
                            _ = watcher_cancel.cancelled() => return,
                        }
                        metrics::inc_component_restart(component.name());
                        if let Err(e) = component.start().await {
                            tracing::error!(component = component.name(), error = %e, "failed to restart component");
                        }
                    }
                }
            }
        });

        *self.watcher.lock().await = Some(handle);
    }
}
