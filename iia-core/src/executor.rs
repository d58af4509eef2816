use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::state::StateHub;
use crate::worker::{Command, EngineSlot};
use crate::{
    Conflict, Engine, GenerationFailure, GenerationRequest, GenerationResult, GenerationStatus,
};

/// Accepts one generation at a time and runs it on the engine worker.
#[derive(Clone)]
pub struct GenerationExecutor {
    hub: Arc<StateHub>,
    inbox: mpsc::UnboundedSender<Command>,
}

impl GenerationExecutor {
    pub(crate) fn new(hub: Arc<StateHub>, inbox: mpsc::UnboundedSender<Command>) -> Self {
        Self { hub, inbox }
    }

    /// Admits `request` if a model is `Ready` and nothing is running. On admission the
    /// generation status is `Running` before this returns, so a racing second submit is
    /// rejected. Requests are never queued.
    pub fn submit(&self, request: GenerationRequest) -> Result<(), Conflict> {
        self.hub.transition(|ledger| {
            if ledger.shut_down {
                return Err(Conflict::ShutDown);
            }
            if ledger.unload_pending > 0 {
                return Err(Conflict::UnloadPending);
            }
            if !ledger.state().model.is_ready() {
                return Err(Conflict::ModelNotReady);
            }
            if ledger.state().generation.is_running() {
                return Err(Conflict::GenerationRunning);
            }
            let request = Arc::new(request);
            self.inbox
                .send(Command::Generate(request.clone()))
                .map_err(|_| Conflict::ShutDown)?;
            ledger.set_generation(GenerationStatus::Running(request));
            Ok(())
        })
    }
}

pub(crate) fn run_generation<E: Engine>(
    slot: &mut EngineSlot<E>,
    hub: &StateHub,
    request: Arc<GenerationRequest>,
) {
    info!(
        width = request.width,
        height = request.height,
        steps = request.steps,
        seed = request.seed,
        "generation started"
    );
    let status = match generate(slot, &request) {
        Ok(result) => {
            info!(width = result.width, height = result.height, "generation finished");
            GenerationStatus::Succeeded(Arc::new(result))
        }
        Err(failure) => {
            warn!("generation failed: {failure}");
            GenerationStatus::Failed(failure)
        }
    };
    hub.transition(|ledger| ledger.set_generation(status));
}

fn generate<E: Engine>(
    slot: &mut EngineSlot<E>,
    request: &GenerationRequest,
) -> Result<GenerationResult, GenerationFailure> {
    if !slot.loaded {
        return Err(GenerationFailure::Engine("no model loaded".to_string()));
    }
    request.check_positive()?;

    let buffer = slot
        .guarded("txt2img", |engine| engine.txt2img(request))
        .unwrap_or_else(|| Err(GenerationFailure::Engine("engine panicked".to_string())))?;

    if buffer.is_empty() {
        return Err(GenerationFailure::EmptyOutput);
    }
    if buffer.len() != request.expected_len() {
        return Err(GenerationFailure::Engine(format!(
            "engine returned {} bytes for a {}x{} image",
            buffer.len(),
            request.width,
            request.height
        )));
    }
    Ok(GenerationResult {
        width: request.width,
        height: request.height,
        buffer,
    })
}
