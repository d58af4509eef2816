use std::path::Path;

use crate::{GenerationFailure, GenerationRequest};

/// Call boundary to the native image-synthesis engine.
///
/// The orchestrator drives an engine from one dedicated worker thread, one call at a
/// time, so implementations need no internal locking. A failed call is an ordinary
/// return value.
///
/// `free_model` must be a no-op when nothing is loaded. The orchestrator calls it exactly
/// once per successful `load_model`, including at teardown.
pub trait Engine: Send + 'static {
    /// Loads the model at `model_path`. `vae_path` of `None` selects the engine default.
    fn load_model(&mut self, model_path: &Path, vae_path: Option<&Path>, threads: usize) -> bool;

    /// Runs one text-to-image synthesis. On success returns `width * height * 3` RGB bytes.
    /// A `seed` of [`crate::RANDOM_SEED`] lets the engine choose.
    fn txt2img(&mut self, request: &GenerationRequest) -> Result<Vec<u8>, GenerationFailure>;

    fn free_model(&mut self);
}

impl<E: Engine + ?Sized> Engine for Box<E> {
    fn load_model(&mut self, model_path: &Path, vae_path: Option<&Path>, threads: usize) -> bool {
        (**self).load_model(model_path, vae_path, threads)
    }

    fn txt2img(&mut self, request: &GenerationRequest) -> Result<Vec<u8>, GenerationFailure> {
        (**self).txt2img(request)
    }

    fn free_model(&mut self) {
        (**self).free_model()
    }
}
