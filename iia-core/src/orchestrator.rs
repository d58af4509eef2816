use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::state::StateHub;
use crate::worker::{self, Command};
use crate::{
    Conflict, Engine, GenerationExecutor, GenerationRequest, LoadRequest, ModelLifecycleManager,
    ModelStatus, OrchestratorState, StateStream,
};

/// Explicitly owned composition of the lifecycle manager, the generation executor and the
/// engine worker thread. Hosts construct one and share it (e.g. behind an `Arc`).
///
/// Dropping the orchestrator stops the worker, which frees any loaded model before it
/// exits. `Drop` joins the worker thread, so it blocks until an in-flight load or
/// generation returns. Inside an async runtime, call [`shutdown`](Self::shutdown) first;
/// once it returns the worker has drained and the join is immediate.
pub struct Orchestrator {
    hub: Arc<StateHub>,
    inbox: mpsc::UnboundedSender<Command>,
    lifecycle: ModelLifecycleManager,
    executor: GenerationExecutor,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Moves `engine` onto a dedicated worker thread. The initial state is
    /// `(Unloaded, Idle)`.
    pub fn new<E: Engine>(engine: E) -> io::Result<Self> {
        let hub = Arc::new(StateHub::new());
        let (inbox, rx) = mpsc::unbounded_channel();
        let worker = worker::spawn(engine, hub.clone(), rx)?;
        Ok(Self {
            lifecycle: ModelLifecycleManager::new(hub.clone(), inbox.clone()),
            executor: GenerationExecutor::new(hub.clone(), inbox.clone()),
            hub,
            inbox,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn lifecycle(&self) -> &ModelLifecycleManager {
        &self.lifecycle
    }

    pub fn executor(&self) -> &GenerationExecutor {
        &self.executor
    }

    pub fn load(&self, request: LoadRequest) -> Result<ModelStatus, Conflict> {
        self.lifecycle.load(request)
    }

    pub fn check_load(&self) -> Result<(), Conflict> {
        self.lifecycle.check_load()
    }

    pub async fn unload(&self) {
        self.lifecycle.unload().await
    }

    pub fn submit(&self, request: GenerationRequest) -> Result<(), Conflict> {
        self.executor.submit(request)
    }

    pub fn snapshot(&self) -> OrchestratorState {
        self.hub.snapshot()
    }

    pub fn subscribe(&self) -> StateStream {
        self.hub.subscribe()
    }

    /// Host stop signal: waits for any in-flight work, frees the model and stops the
    /// worker. Later `load`/`submit` calls are rejected with [`Conflict::ShutDown`].
    pub async fn shutdown(&self) {
        self.unload().await;
        self.stop_worker();
    }

    fn stop_worker(&self) {
        self.hub.transition(|ledger| {
            if !ledger.shut_down {
                ledger.shut_down = true;
                if self.inbox.send(Command::Shutdown).is_err() {
                    warn!("engine worker already gone");
                }
            }
        });
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.stop_worker();
        if let Some(worker) = self.worker.lock().take() {
            if worker.join().is_err() {
                warn!("engine worker panicked");
            }
        }
        info!("orchestrator stopped");
    }
}
