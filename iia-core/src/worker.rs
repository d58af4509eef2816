use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::state::StateHub;
use crate::{executor, lifecycle, Engine, GenerationRequest, LoadRequest};

/// Work items for the engine thread, consumed strictly in admission order.
pub(crate) enum Command {
    Load(LoadRequest),
    Generate(Arc<GenerationRequest>),
    Unload(oneshot::Sender<()>),
    Shutdown,
}

/// The engine plus whether it currently holds a model handle. Lives on the worker thread
/// only.
pub(crate) struct EngineSlot<E> {
    pub(crate) engine: E,
    pub(crate) loaded: bool,
}

impl<E: Engine> EngineSlot<E> {
    /// Runs an engine call, turning a panic inside the engine into `None`.
    pub(crate) fn guarded<T>(&mut self, what: &str, call: impl FnOnce(&mut E) -> T) -> Option<T> {
        match catch_unwind(AssertUnwindSafe(|| call(&mut self.engine))) {
            Ok(value) => Some(value),
            Err(_) => {
                error!("engine panicked during {what}");
                None
            }
        }
    }
}

pub(crate) fn spawn<E: Engine>(
    engine: E,
    hub: Arc<StateHub>,
    inbox: mpsc::UnboundedReceiver<Command>,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("iia-engine".to_string())
        .spawn(move || run(EngineSlot { engine, loaded: false }, &hub, inbox))
}

fn run<E: Engine>(
    mut slot: EngineSlot<E>,
    hub: &StateHub,
    mut inbox: mpsc::UnboundedReceiver<Command>,
) {
    debug!("engine worker started");
    while let Some(command) = inbox.blocking_recv() {
        match command {
            Command::Load(request) => lifecycle::run_load(&mut slot, hub, request),
            Command::Generate(request) => executor::run_generation(&mut slot, hub, request),
            Command::Unload(done) => lifecycle::run_unload(&mut slot, hub, Some(done)),
            Command::Shutdown => break,
        }
    }
    // Teardown always releases the handle, whichever way the loop ended.
    lifecycle::run_unload(&mut slot, hub, None);
    hub.transition(|ledger| ledger.shut_down = true);
    debug!("engine worker stopped");
}
