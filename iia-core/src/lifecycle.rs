use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::state::{Ledger, StateHub};
use crate::worker::{Command, EngineSlot};
use crate::{Conflict, Engine, GenerationStatus, LoadFailure, LoadRequest, ModelStatus};

/// Owns whether a model is loaded. Serializes load and unload against every other
/// engine call by routing them through the worker inbox.
#[derive(Clone)]
pub struct ModelLifecycleManager {
    hub: Arc<StateHub>,
    inbox: mpsc::UnboundedSender<Command>,
}

impl ModelLifecycleManager {
    pub(crate) fn new(hub: Arc<StateHub>, inbox: mpsc::UnboundedSender<Command>) -> Self {
        Self { hub, inbox }
    }

    /// Starts loading `request`. On admission the status is `Loading` before this returns;
    /// completion is observed through the state stream.
    ///
    /// A model that is already `Ready` is freed on the worker before the new one loads.
    pub fn load(&self, request: LoadRequest) -> Result<ModelStatus, Conflict> {
        self.hub.transition(|ledger| {
            admit_load(ledger)?;
            info!(model = %request.model_path.display(), threads = request.threads, "load requested");
            self.inbox
                .send(Command::Load(request))
                .map_err(|_| Conflict::ShutDown)?;
            ledger.set_model(ModelStatus::Loading);
            ledger.set_generation(GenerationStatus::Idle);
            Ok(ModelStatus::Loading)
        })
    }

    /// Reports whether [`load`](Self::load) would currently be admitted, without changing
    /// any state. Callers that prepare files for a load use this to back off early.
    pub fn check_load(&self) -> Result<(), Conflict> {
        self.hub.transition(|ledger| admit_load(ledger))
    }

    /// Releases the loaded model. Waits for an in-flight generation (or load) to finish
    /// rather than interrupting it. A no-op when nothing is loaded.
    pub async fn unload(&self) {
        if let Some(done) = self.request_unload() {
            let _ = done.await;
        }
    }

    /// Blocking form of [`unload`](Self::unload) for callers outside an async runtime.
    ///
    /// # Panics
    ///
    /// Panics when called from within an asynchronous execution context.
    pub fn unload_blocking(&self) {
        if let Some(done) = self.request_unload() {
            let _ = done.blocking_recv();
        }
    }

    fn request_unload(&self) -> Option<oneshot::Receiver<()>> {
        self.hub.transition(|ledger| {
            if ledger.shut_down {
                return None;
            }
            let (tx, rx) = oneshot::channel();
            self.inbox.send(Command::Unload(tx)).ok()?;
            ledger.unload_pending += 1;
            Some(rx)
        })
    }
}

fn admit_load(ledger: &Ledger) -> Result<(), Conflict> {
    if ledger.shut_down {
        return Err(Conflict::ShutDown);
    }
    if ledger.unload_pending > 0 {
        return Err(Conflict::UnloadPending);
    }
    if ledger.state().model.is_loading() {
        return Err(Conflict::AlreadyLoading);
    }
    if ledger.state().generation.is_running() {
        return Err(Conflict::GenerationRunning);
    }
    Ok(())
}

pub(crate) fn run_load<E: Engine>(slot: &mut EngineSlot<E>, hub: &StateHub, request: LoadRequest) {
    release(slot);

    let outcome = match request.validate() {
        Err(failure) => Err(failure),
        Ok(()) => {
            let loaded = slot
                .guarded("load", |engine| {
                    engine.load_model(&request.model_path, request.vae_path(), request.threads)
                })
                .unwrap_or(false);
            slot.loaded = loaded;
            if loaded {
                Ok(())
            } else {
                Err(LoadFailure::EngineRejected)
            }
        }
    };

    let status = match outcome {
        Ok(()) => {
            info!(model = %request.model_path.display(), "model ready");
            ModelStatus::Ready
        }
        Err(failure) => {
            warn!(model = %request.model_path.display(), "load failed: {failure}");
            ModelStatus::LoadFailed(failure)
        }
    };
    hub.transition(|ledger| ledger.set_model(status));
}

/// Handles an explicit unload (`done` is set) or the teardown release.
pub(crate) fn run_unload<E: Engine>(
    slot: &mut EngineSlot<E>,
    hub: &StateHub,
    done: Option<oneshot::Sender<()>>,
) {
    let freed = release(slot);
    hub.transition(|ledger| {
        if done.is_some() {
            ledger.unload_pending = ledger.unload_pending.saturating_sub(1);
        }
        if freed || ledger.state().model != ModelStatus::Unloaded {
            ledger.set_model(ModelStatus::Unloaded);
            ledger.set_generation(GenerationStatus::Idle);
        }
    });
    if let Some(done) = done {
        let _ = done.send(());
    }
}

/// Frees the handle if one is live. Returns whether a free happened.
fn release<E: Engine>(slot: &mut EngineSlot<E>) -> bool {
    if !slot.loaded {
        return false;
    }
    slot.guarded("free", |engine| engine.free_model());
    slot.loaded = false;
    info!("model memory freed");
    true
}
