use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{GenerationResult, GenerationStatus, ModelStatus};

/// Combined snapshot of both sub-machines, as rendered by the overlay and notification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrchestratorState {
    /// Incremented on every published transition.
    pub revision: u64,
    pub model: ModelStatus,
    pub generation: GenerationStatus,
}

impl OrchestratorState {
    /// Whether a `submit` issued now would be admitted.
    pub fn can_generate(&self) -> bool {
        self.model.is_ready() && !self.generation.is_running()
    }

    pub fn latest_result(&self) -> Option<&Arc<GenerationResult>> {
        match &self.generation {
            GenerationStatus::Succeeded(result) => Some(result),
            _ => None,
        }
    }

    /// The most recent failure visible in either sub-machine.
    pub fn last_error(&self) -> Option<String> {
        match (&self.generation, &self.model) {
            (GenerationStatus::Failed(reason), _) => Some(reason.to_string()),
            (_, ModelStatus::LoadFailed(reason)) => Some(reason.to_string()),
            _ => None,
        }
    }
}

/// Mutable bookkeeping guarded together with the published snapshot.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    state: OrchestratorState,
    dirty: bool,
    pub(crate) unload_pending: usize,
    pub(crate) shut_down: bool,
}

impl Ledger {
    pub(crate) fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub(crate) fn set_model(&mut self, status: ModelStatus) {
        self.state.model = status;
        self.dirty = true;
    }

    pub(crate) fn set_generation(&mut self, status: GenerationStatus) {
        self.state.generation = status;
        self.dirty = true;
    }
}

#[derive(Default)]
struct Inner {
    ledger: Ledger,
    observers: Vec<mpsc::UnboundedSender<OrchestratorState>>,
}

/// Single writer-side owner of the observable state.
///
/// Every mutation happens inside [`StateHub::transition`], which publishes the resulting
/// snapshot to all observers before releasing the lock, so delivery order is transition
/// order.
#[derive(Default)]
pub(crate) struct StateHub {
    inner: Mutex<Inner>,
}

impl StateHub {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn snapshot(&self) -> OrchestratorState {
        self.inner.lock().ledger.state.clone()
    }

    pub(crate) fn subscribe(&self) -> StateStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        // Cannot fail: the receiver is alive.
        let _ = tx.send(inner.ledger.state.clone());
        inner.observers.push(tx);
        StateStream { rx }
    }

    pub(crate) fn transition<T>(&self, f: impl FnOnce(&mut Ledger) -> T) -> T {
        let mut inner = self.inner.lock();
        let out = f(&mut inner.ledger);
        if inner.ledger.dirty {
            inner.ledger.dirty = false;
            inner.ledger.state.revision += 1;
            let snapshot = inner.ledger.state.clone();
            debug!(
                revision = snapshot.revision,
                model = ?snapshot.model,
                generation = %snapshot.generation,
                "state transition"
            );
            inner
                .observers
                .retain(|observer| observer.send(snapshot.clone()).is_ok());
        }
        out
    }
}

/// Ordered stream of snapshots: the state at subscription time, then every transition.
pub struct StateStream {
    rx: mpsc::UnboundedReceiver<OrchestratorState>,
}

impl StateStream {
    /// Next snapshot, or `None` once the orchestrator is gone.
    pub async fn next(&mut self) -> Option<OrchestratorState> {
        self.rx.recv().await
    }

    /// Next snapshot if one is already queued.
    pub fn try_next(&mut self) -> Option<OrchestratorState> {
        self.rx.try_recv().ok()
    }

    /// Skips snapshots until one satisfies `predicate`.
    pub async fn wait_for(
        &mut self,
        mut predicate: impl FnMut(&OrchestratorState) -> bool,
    ) -> Option<OrchestratorState> {
        while let Some(state) = self.next().await {
            if predicate(&state) {
                return Some(state);
            }
        }
        None
    }
}
