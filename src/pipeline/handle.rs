use super::coordinator::{Channels, Coordinator, PipelineContext};
use super::status::{PipelineState, PipelineStatus, StatusBoard};
use super::PipelineError;
use crate::config::Config;
use crate::event::SourcePosition;
use crate::schema::SchemaRegistry;
use crate::sequencer::SequenceAssigner;
use crate::source::SourceConnector;
use crate::storage::{CheckpointManager, OffsetStore, TargetStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, Instrument};
use uuid::Uuid;

/// One source-to-target replication pipeline, ready to start.
pub struct Pipeline {
    config: Arc<Config>,
    connector: Arc<dyn SourceConnector>,
    store: Arc<dyn TargetStore>,
    offsets: Arc<dyn OffsetStore>,
    registry: Arc<SchemaRegistry>,
    instance_id: Uuid,
}

impl Pipeline {
    pub fn new(
        config: Config,
        connector: Arc<dyn SourceConnector>,
        store: Arc<dyn TargetStore>,
        offsets: Arc<dyn OffsetStore>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            connector,
            store,
            offsets,
            registry: Arc::new(SchemaRegistry::new()),
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Start ingesting on the current runtime.
    pub fn spawn(self) -> PipelineHandle {
        let board = Arc::new(StatusBoard::new(self.instance_id, self.registry.clone()));
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(PipelineState::Initializing);
        let (checkpoint_tx, checkpoint_rx) = watch::channel(None);

        let ctx = PipelineContext {
            instance_id: self.instance_id,
            config: self.config,
            registry: self.registry,
            assigner: SequenceAssigner::new(),
        };
        let checkpoints = CheckpointManager::new(self.offsets, self.instance_id);
        let coordinator = Coordinator::new(
            ctx,
            self.connector,
            self.store,
            checkpoints,
            Channels {
                board: board.clone(),
                cancel: cancel.clone(),
                state: state_tx,
                checkpoint: checkpoint_tx,
            },
        );

        let span = info_span!("pipeline", instance = %self.instance_id);
        let task = tokio::spawn(coordinator.run().instrument(span));

        PipelineHandle {
            board,
            cancel,
            state: state_rx,
            checkpoint: checkpoint_rx,
            task,
        }
    }
}

/// Control surface of a spawned pipeline.
pub struct PipelineHandle {
    board: Arc<StatusBoard>,
    cancel: CancellationToken,
    state: watch::Receiver<PipelineState>,
    checkpoint: watch::Receiver<Option<SourcePosition>>,
    task: JoinHandle<Result<(), PipelineError>>,
}

impl PipelineHandle {
    pub fn instance_id(&self) -> Uuid {
        self.board.instance_id()
    }

    pub fn board(&self) -> Arc<StatusBoard> {
        self.board.clone()
    }

    pub fn status(&self) -> PipelineStatus {
        self.board.snapshot()
    }

    pub fn state(&self) -> PipelineState {
        *self.state.borrow()
    }

    pub fn last_acknowledged(&self) -> Option<SourcePosition> {
        self.checkpoint.borrow().clone()
    }

    /// Wait until the checkpoint covers `position`.
    ///
    /// Fails early if the pipeline stops or faults first.
    pub async fn wait_for_checkpoint(
        &self,
        position: &SourcePosition,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        let reached = |c: &Option<SourcePosition>| c.as_ref().is_some_and(|c| c >= position);
        let mut checkpoint = self.checkpoint.clone();
        let mut state = self.state.clone();

        let wait = async {
            tokio::select! {
                _ = async { checkpoint.wait_for(reached).await.map(|_| ()) } => {}
                _ = async { state.wait_for(|s| s.is_terminal()).await.map(|_| ()) } => {}
            }
        };
        let _ = tokio::time::timeout(timeout, wait).await;

        if reached(&*self.checkpoint.borrow()) {
            return Ok(());
        }
        match self.state() {
            state if state.is_terminal() => Err(PipelineError::NotRunning(state)),
            _ => Err(PipelineError::WaitTimeout(format!("checkpoint {}", position))),
        }
    }

    pub async fn wait_for_state(
        &self,
        target: PipelineState,
        timeout: Duration,
    ) -> Result<(), PipelineError> {
        let mut state = self.state.clone();
        let waited = tokio::time::timeout(timeout, async {
            state.wait_for(|s| *s == target).await.map(|_| ())
        })
        .await;
        match waited {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PipelineError::NotRunning(self.state())),
            Err(_) => Err(PipelineError::WaitTimeout(format!("state {}", target))),
        }
    }

    /// Resolve once the pipeline has stopped or faulted.
    pub async fn stopped(&self) -> PipelineState {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| s.is_terminal()).await;
        self.state()
    }

    /// Request a graceful stop. Buffered rows are flushed before the task ends.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> Result<(), PipelineError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(PipelineError::Task(e.to_string())),
        }
    }
}
