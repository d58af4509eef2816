//! Engine stand-in for the server's unit tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use iia_core::{Engine, GenerationFailure, GenerationRequest, OrchestratorState, StateStream};
use parking_lot::Mutex;

/// Accepts any readable model file and returns a flat grey image.
#[derive(Default)]
pub struct FakeEngine {
    load_delay: Duration,
    loaded: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Contents of every model file the engine was asked to load, in order.
    pub fn loaded(&self) -> Arc<Mutex<Vec<Vec<u8>>>> {
        self.loaded.clone()
    }
}

impl Engine for FakeEngine {
    fn load_model(&mut self, model_path: &Path, _vae: Option<&Path>, _threads: usize) -> bool {
        let Ok(bytes) = std::fs::read(model_path) else {
            return false;
        };
        self.loaded.lock().push(bytes);
        std::thread::sleep(self.load_delay);
        true
    }

    fn txt2img(&mut self, request: &GenerationRequest) -> Result<Vec<u8>, GenerationFailure> {
        Ok(vec![128; request.expected_len()])
    }

    fn free_model(&mut self) {}
}

pub fn model_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

pub async fn wait_for(
    stream: &mut StateStream,
    pred: impl FnMut(&OrchestratorState) -> bool,
) -> OrchestratorState {
    tokio::time::timeout(Duration::from_secs(5), stream.wait_for(pred))
        .await
        .expect("timed out waiting for state")
        .expect("state stream closed")
}
