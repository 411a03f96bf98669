//! Uniform lifecycle wrapper the orchestrator holds over ingestor/join/sink
//! workers as trait objects, so it never needs to downcast to know which
//! kind of worker it is supervising.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::join::JoinWorker;
use crate::kafka::Ingestor;
use crate::sink::Sink;

#[async_trait]
pub trait Component: Send + Sync {
    /// Human-readable identity used in logs and the Runner Watcher.
    fn name(&self) -> &str;

    /// Starts the component's background task. Calling this twice without an
    /// intervening `shutdown` is a caller error the implementation need not
    /// guard against.
    async fn start(&mut self) -> Result<()>;

    /// Signals cancellation and waits for the background task to exit.
    async fn shutdown(&mut self) -> Result<()>;

    /// Pauses consumption without tearing down the task. Default no-op for
    /// components that only support stop/start.
    async fn pause(&mut self) -> Result<()> {
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    /// True once the background task has exited, whether cleanly or not.
    fn done(&self) -> bool;
}

enum RunnerState {
    Idle,
    Running {
        cancel: CancellationToken,
        handle: JoinHandle<Result<()>>,
    },
    Finished,
}

pub struct IngestorRunner {
    name: String,
    ingestor: Arc<Ingestor>,
    state: RunnerState,
}

impl IngestorRunner {
    pub fn new(name: impl Into<String>, ingestor: Ingestor) -> Self {
        Self {
            name: name.into(),
            ingestor: Arc::new(ingestor),
            state: RunnerState::Idle,
        }
    }
}

#[async_trait]
impl Component for IngestorRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        let cancel = CancellationToken::new();
        let ingestor = self.ingestor.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { ingestor.run(&task_cancel).await });
        self.state = RunnerState::Running { cancel, handle };
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let RunnerState::Running { cancel, handle } = std::mem::replace(&mut self.state, RunnerState::Finished) {
            cancel.cancel();
            let _ = handle.await;
        }
        self.state = RunnerState::Finished;
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        if let RunnerState::Running { cancel, handle } = std::mem::replace(&mut self.state, RunnerState::Idle) {
            cancel.cancel();
            let _ = handle.await;
        }
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        if matches!(self.state, RunnerState::Idle) {
            self.start().await?;
        }
        Ok(())
    }

    fn done(&self) -> bool {
        matches!(self.state, RunnerState::Finished)
            || matches!(&self.state, RunnerState::Running { handle, .. } if handle.is_finished())
    }
}

pub struct JoinRunner {
    name: String,
    worker: Arc<JoinWorker>,
    state: RunnerState,
}

impl JoinRunner {
    pub fn new(name: impl Into<String>, worker: JoinWorker) -> Self {
        Self {
            name: name.into(),
            worker: Arc::new(worker),
            state: RunnerState::Idle,
        }
    }
}

#[async_trait]
impl Component for JoinRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        let cancel = CancellationToken::new();
        let worker = self.worker.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(&task_cancel).await });
        self.state = RunnerState::Running { cancel, handle };
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let RunnerState::Running { cancel, handle } = std::mem::replace(&mut self.state, RunnerState::Finished) {
            cancel.cancel();
            let _ = handle.await;
        }
        self.state = RunnerState::Finished;
        Ok(())
    }

    // Pause is a no-op for the join worker: it keeps consuming both input
    // streams until externally drained, it does not stop on pipeline pause.

    fn done(&self) -> bool {
        matches!(self.state, RunnerState::Finished)
            || matches!(&self.state, RunnerState::Running { handle, .. } if handle.is_finished())
    }
}

pub struct SinkRunner {
    name: String,
    sink: Arc<Sink>,
    state: RunnerState,
}

impl SinkRunner {
    pub fn new(name: impl Into<String>, sink: Sink) -> Self {
        Self {
            name: name.into(),
            sink: Arc::new(sink),
            state: RunnerState::Idle,
        }
    }
}

#[async_trait]
impl Component for SinkRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<()> {
        let cancel = CancellationToken::new();
        let sink = self.sink.clone();
        let task_cancel = cancel.clone();
        let handle = tokio::spawn(async move { sink.run(&task_cancel).await });
        self.state = RunnerState::Running { cancel, handle };
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let RunnerState::Running { cancel, handle } = std::mem::replace(&mut self.state, RunnerState::Finished) {
            cancel.cancel();
            let _ = handle.await;
        }
        self.state = RunnerState::Finished;
        Ok(())
    }

    // Pause is a no-op for the sink: it keeps flushing batches until
    // externally drained, it does not stop on pipeline pause.

    fn done(&self) -> bool {
        matches!(self.state, RunnerState::Finished)
            || matches!(&self.state, RunnerState::Running { handle, .. } if handle.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Stands in for a runner that never overrides `pause`/`resume`, to pin
    /// down the trait's default no-op semantics (what `JoinRunner` and
    /// `SinkRunner` now rely on).
    struct NeverPauses {
        running: AtomicBool,
    }

    #[async_trait]
    impl Component for NeverPauses {
        fn name(&self) -> &str {
            "never-pauses"
        }

        async fn start(&mut self) -> Result<()> {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn done(&self) -> bool {
            !self.running.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn default_pause_and_resume_do_not_touch_running_state() {
        let mut component = NeverPauses { running: AtomicBool::new(false) };
        component.start().await.unwrap();
        assert!(!component.done());

        component.pause().await.unwrap();
        assert!(!component.done(), "default pause must be a no-op");

        component.resume().await.unwrap();
        assert!(!component.done(), "default resume must be a no-op");
    }
}
